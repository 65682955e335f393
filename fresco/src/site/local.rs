//! Sites whose apparatus runs in this process.

use nalgebra::DMatrix;

use super::{ExperimentalSite, SiteState};
use crate::control::{ExperimentalControl, SessionState};
use crate::error::Result;
use crate::response::{MatrixKind, SizeVector};
use crate::setup::ExperimentalSetup;
use crate::trace::info;

/// What a [`LocalSite`] drives.
pub enum SiteBackend {
    /// A setup that owns its control.
    Setup(ExperimentalSetup),
    /// A bare control; trial and output sizes are its command and
    /// measurement sizes.
    Control(Box<dyn ExperimentalControl>),
}

/// A site without a network hop. Also the backend of an actor.
pub struct LocalSite {
    state: SiteState,
    backend: SiteBackend,
}

impl LocalSite {
    #[must_use]
    pub fn new(tag: u32, backend: SiteBackend) -> Self {
        Self {
            state: SiteState::new(tag),
            backend,
        }
    }

    pub const fn backend(&self) -> &SiteBackend {
        &self.backend
    }

    /// State of the control behind the site.
    pub fn control_state(&self) -> Option<SessionState> {
        match &self.backend {
            SiteBackend::Setup(setup) => setup.control().map(|c| c.state()),
            SiteBackend::Control(control) => Some(control.state()),
        }
    }
}

impl ExperimentalSite for LocalSite {
    fn site_state(&self) -> &SiteState {
        &self.state
    }

    fn site_state_mut(&mut self) -> &mut SiteState {
        &mut self.state
    }

    fn size_backend(&mut self, trial: SizeVector, out: SizeVector) -> Result<()> {
        match &mut self.backend {
            SiteBackend::Setup(setup) => {
                setup.set_size(trial, out)?;
                setup.setup_control()?;
            }
            SiteBackend::Control(control) => {
                if control.state() == SessionState::Idle {
                    control.open()?;
                }
                control.setup(trial, out)?;
            }
        }
        info!(tag = self.state.tag(), %trial, %out, "site sized");
        Ok(())
    }

    fn send_trial(&mut self) -> Result<()> {
        let trial = self.state.trial();
        match &mut self.backend {
            SiteBackend::Setup(setup) => setup.set_trial_response(trial),
            SiteBackend::Control(control) => control.set_trial_response(trial),
        }
    }

    fn pull_output(&mut self) -> Result<()> {
        match &mut self.backend {
            SiteBackend::Setup(setup) => {
                let out = setup.acquire()?;
                self.state.out_mut().clone_from(out);
            }
            SiteBackend::Control(control) => {
                control.execute()?;
                control.get_daq_response(self.state.out_mut())?;
            }
        }
        Ok(())
    }

    fn commit_backend(&mut self) -> Result<()> {
        match &mut self.backend {
            SiteBackend::Setup(setup) => setup.commit_state(),
            SiteBackend::Control(control) => control.commit_state(),
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        info!(tag = self.state.tag(), commits = self.state.commit_tag(), "site shutting down");
        match &mut self.backend {
            SiteBackend::Setup(setup) => setup.shutdown(),
            SiteBackend::Control(control) => control.shutdown(),
        }
    }

    fn matrix(&mut self, kind: MatrixKind) -> Result<Option<DMatrix<f64>>> {
        match &mut self.backend {
            SiteBackend::Setup(setup) => setup.matrix(kind),
            SiteBackend::Control(control) => control.matrix(kind),
        }
    }
}
