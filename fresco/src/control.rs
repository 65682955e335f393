//! Experimental controls.
//!
//! A control drives the apparatus: it takes actuator commands, reports
//! measurements and enforces the session state machine. [`LocalControl`]
//! talks to a [`Hardware`] backend in-process; [`RemoteControl`] speaks the
//! wire protocol to an actor that owns the backend.

pub mod local;
pub mod remote;
pub mod springs;
pub mod state;

use std::time::Duration;

use nalgebra::DMatrix;

use crate::error::Result;
use crate::response::{MatrixKind, Response, SizeVector};

pub use local::{Hardware, LocalControl, Readiness};
pub use remote::RemoteControl;
pub use springs::SimulatedSprings;
pub use state::{Operation, SessionState, StateMachine};

/// How a control waits for the apparatus to reach a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// Poll back to back until the backend reports ready.
    #[default]
    Blocking,
    /// Sleep `interval` between polls and give up after `timeout`.
    Polling { interval: Duration, timeout: Duration },
}

/// The control seam between a setup and the apparatus.
///
/// Every method moves or checks the control's [`SessionState`].
pub trait ExperimentalControl: Send {
    /// Connects to the apparatus.
    ///
    /// # Errors
    ///
    /// Fails if the control is not idle or the connection fails.
    fn open(&mut self) -> Result<()>;

    /// Fixes the command and measurement sizes for the session.
    ///
    /// # Errors
    ///
    /// Fails if the control is not opened or rejects the sizes.
    fn setup(&mut self, ctrl: SizeVector, daq: SizeVector) -> Result<()>;

    /// Commands the apparatus toward `ctrl`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeMismatch`](crate::Error::SizeMismatch) unless
    /// `ctrl` matches the negotiated command sizes exactly.
    fn set_trial_response(&mut self, ctrl: &Response) -> Result<()>;

    /// Waits for the apparatus and acquires measurements. A no-op if the
    /// current measurements were already acquired.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Timeout`](crate::Error::Timeout) if the
    /// apparatus does not settle in time.
    fn execute(&mut self) -> Result<()>;

    /// Copies the last acquired measurements into `daq`.
    ///
    /// An empty `daq` takes the negotiated sizes.
    ///
    /// # Errors
    ///
    /// Fails unless measurements are available, or with
    /// [`Error::SizeMismatch`](crate::Error::SizeMismatch) if `daq` is sized
    /// differently from the negotiated measurements.
    fn get_daq_response(&mut self, daq: &mut Response) -> Result<()>;

    /// Accepts the current step.
    ///
    /// # Errors
    ///
    /// Fails if there is an unacquired trial pending.
    fn commit_state(&mut self) -> Result<()>;

    /// Disconnects. Later calls fail with
    /// [`Error::SessionClosed`](crate::Error::SessionClosed).
    ///
    /// # Errors
    ///
    /// Fails if the control is already closed.
    fn shutdown(&mut self) -> Result<()>;

    fn state(&self) -> SessionState;

    /// Negotiated `(ctrl, daq)` sizes, once `setup` succeeded.
    fn sizes(&self) -> Option<(SizeVector, SizeVector)>;

    /// A matrix of the apparatus in command coordinates, if it has one.
    ///
    /// # Errors
    ///
    /// Fails on a transport error.
    fn matrix(&mut self, kind: MatrixKind) -> Result<Option<DMatrix<f64>>> {
        let _ = kind;
        Ok(None)
    }
}
