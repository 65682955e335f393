//! Client side of a distributed site.
//!
//! With a local setup the shadow transforms trials itself and ships
//! actuator commands to a control-only actor. Without one it ships trial
//! vectors to an actor that owns the setup.

use nalgebra::DMatrix;

use super::{ExperimentalSite, SiteState};
use crate::config::ConfigError;
use crate::control::{ExperimentalControl, RemoteControl};
use crate::error::Result;
use crate::net::Channel;
use crate::protocol::ReturnCode;
use crate::response::{MatrixKind, Response, SizeVector};
use crate::session::{Session, SessionConfig};
use crate::setup::ExperimentalSetup;
use crate::trace::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShadowConfig {
    /// Site tag announced at `open`; the actor must serve the same tag.
    pub tag: u32,
    pub session: SessionConfig,
}

/// A site whose apparatus sits behind an actor.
///
/// Dropping a shadow whose session is still live sends `DIE`.
pub struct ShadowSite<C: Channel> {
    state: SiteState,
    control: RemoteControl<C>,
    setup: Option<ExperimentalSetup>,
    daq: Response,
}

impl<C: Channel> ShadowSite<C> {
    /// Opens a session over `channel`.
    ///
    /// # Errors
    ///
    /// Fails if the handshake fails or the actor speaks another protocol
    /// version.
    pub fn connect(channel: C, config: &ShadowConfig) -> Result<Self> {
        let session = Session::new(channel, &config.session)?;
        let mut control = RemoteControl::new(session, config.tag);
        control.open()?;
        info!(tag = config.tag, "shadow connected");
        Ok(Self {
            state: SiteState::new(config.tag),
            control,
            setup: None,
            daq: Response::new(),
        })
    }

    /// Transforms locally with `setup` and ships actuator commands.
    ///
    /// # Errors
    ///
    /// Fails if `setup` owns a control; the actor is the control.
    pub fn with_setup(mut self, setup: ExperimentalSetup) -> Result<Self> {
        if setup.has_control() {
            return Err(ConfigError::Invalid(
                "a shadow's setup cannot own a control".to_owned(),
            )
            .into());
        }
        self.setup = Some(setup);
        Ok(self)
    }

    /// Code of the last reply from the actor.
    pub const fn last_status(&self) -> Option<ReturnCode> {
        self.control.last_status()
    }

    pub const fn control(&self) -> &RemoteControl<C> {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut RemoteControl<C> {
        &mut self.control
    }

    /// Ends the session without shutting the actor's backend down.
    ///
    /// # Errors
    ///
    /// Fails if the session is already closed.
    pub fn die(&mut self) -> Result<()> {
        self.control.die()
    }
}

impl<C: Channel> ExperimentalSite for ShadowSite<C> {
    fn site_state(&self) -> &SiteState {
        &self.state
    }

    fn site_state_mut(&mut self) -> &mut SiteState {
        &mut self.state
    }

    fn size_backend(&mut self, trial: SizeVector, out: SizeVector) -> Result<()> {
        match &mut self.setup {
            Some(setup) => {
                let active = setup.set_size(trial, out)?;
                self.control.setup(active.ctrl, active.daq)?;
                self.daq = Response::zeros(active.daq);
            }
            None => self.control.setup(trial, out)?,
        }
        Ok(())
    }

    fn send_trial(&mut self) -> Result<()> {
        let trial = self.state.trial();
        match &mut self.setup {
            Some(setup) => {
                let ctrl = setup.transf_trial_response(trial)?;
                self.control.set_trial_response(ctrl)
            }
            None => self.control.set_trial_response(trial),
        }
    }

    fn pull_output(&mut self) -> Result<()> {
        self.control.execute()?;
        match &mut self.setup {
            Some(setup) => {
                self.control.get_daq_response(&mut self.daq)?;
                let out = setup.transf_daq_response(&self.daq)?;
                self.state.out_mut().clone_from(out);
            }
            None => self.control.get_daq_response(self.state.out_mut())?,
        }
        Ok(())
    }

    fn commit_backend(&mut self) -> Result<()> {
        self.control.commit_state()
    }

    fn shutdown(&mut self) -> Result<()> {
        self.control.shutdown()
    }

    fn matrix(&mut self, kind: MatrixKind) -> Result<Option<DMatrix<f64>>> {
        let Some(k) = self.control.matrix(kind)? else {
            return Ok(None);
        };
        match &self.setup {
            Some(setup) => setup.to_basic(k).map(Some),
            None => Ok(Some(k)),
        }
    }
}
