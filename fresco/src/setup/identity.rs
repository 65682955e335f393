use super::{SetupSizes, Transformation};
use crate::error::Result;
use crate::response::{Response, ResponseType, SizeVector};

/// Passes trial vectors to the apparatus unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoTransformation {
    ctrl: SizeVector,
    daq: SizeVector,
}

impl NoTransformation {
    #[must_use]
    pub const fn new(ctrl: SizeVector, daq: SizeVector) -> Self {
        Self { ctrl, daq }
    }
}

fn copy_into(src: &Response, dst: &mut Response) {
    for ty in ResponseType::ALL {
        for (d, s) in dst.get_mut(ty).iter_mut().zip(src.get(ty)) {
            *d = *s;
        }
    }
}

impl Transformation for NoTransformation {
    fn name(&self) -> &'static str {
        "NoTransformation"
    }

    fn sizes(&self) -> SetupSizes {
        SetupSizes {
            trial: self.ctrl,
            out: self.daq,
            ctrl: self.ctrl,
            daq: self.daq,
        }
    }

    fn trial_to_ctrl(&self, trial: &Response, ctrl: &mut Response) -> Result<()> {
        copy_into(trial, ctrl);
        Ok(())
    }

    fn daq_to_out(&self, daq: &Response, out: &mut Response) -> Result<()> {
        copy_into(daq, out);
        Ok(())
    }
}
