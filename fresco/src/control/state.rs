//! Session state machine shared by every control.

use std::fmt;

use crate::error::{Error, Result};
use crate::trace::{debug, warn};

/// Where a control is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Opened,
    SizeNegotiated,
    Ready,
    TrialSet,
    DaqAvailable,
    Shutdown,
    Failed,
}

impl SessionState {
    /// False for the terminal states.
    pub const fn is_live(self) -> bool {
        !matches!(self, Self::Shutdown | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Opened => "opened",
            Self::SizeNegotiated => "size-negotiated",
            Self::Ready => "ready",
            Self::TrialSet => "trial-set",
            Self::DaqAvailable => "daq-available",
            Self::Shutdown => "shut down",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Operations that move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Open,
    Setup,
    SetTrialResponse,
    Execute,
    GetDaqResponse,
    CommitState,
    Shutdown,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Setup => "setup",
            Self::SetTrialResponse => "setTrialResponse",
            Self::Execute => "execute",
            Self::GetDaqResponse => "getDaqResponse",
            Self::CommitState => "commitState",
            Self::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

/// Checked transitions between [`SessionState`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachine {
    state: SessionState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }

    pub const fn state(&self) -> SessionState {
        self.state
    }

    pub const fn is_live(&self) -> bool {
        self.state.is_live()
    }

    /// The state `op` leads to, without moving.
    ///
    /// # Errors
    ///
    /// [`Error::SessionClosed`] in a terminal state and
    /// [`Error::InvalidState`] if `op` is not legal from the current state.
    pub fn check(&self, op: Operation) -> Result<SessionState> {
        use Operation as Op;
        use SessionState as S;

        let next = match (self.state, op) {
            (S::Shutdown | S::Failed, _) => return Err(Error::SessionClosed),
            (_, Op::Shutdown) => S::Shutdown,
            (S::Idle, Op::Open) => S::Opened,
            (S::Opened, Op::Setup) => S::SizeNegotiated,
            (S::Ready | S::TrialSet | S::DaqAvailable, Op::SetTrialResponse) => S::TrialSet,
            (S::TrialSet | S::DaqAvailable, Op::Execute)
            | (S::DaqAvailable, Op::GetDaqResponse) => S::DaqAvailable,
            (S::Ready | S::DaqAvailable, Op::CommitState) => S::Ready,
            (state, op) => return Err(Error::InvalidState { state, op }),
        };
        Ok(next)
    }

    /// Performs the transition for `op`.
    ///
    /// # Errors
    ///
    /// Same as [`StateMachine::check`]; the state is unchanged on error.
    pub fn apply(&mut self, op: Operation) -> Result<SessionState> {
        let next = self.check(op)?;
        if op == Operation::SetTrialResponse && self.state == SessionState::TrialSet {
            warn!("trial response overwritten before its daq response was fetched");
        }
        if next != self.state {
            debug!(from = %self.state, to = %next, %op, "state transition");
        }
        self.state = next;
        Ok(next)
    }

    /// Completes `setup` once the backend is configured.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] unless sizes were just negotiated.
    pub fn mark_ready(&mut self) -> Result<()> {
        match self.state {
            SessionState::SizeNegotiated => {
                self.state = SessionState::Ready;
                Ok(())
            }
            state if state.is_live() => Err(Error::InvalidState {
                state,
                op: Operation::Setup,
            }),
            _ => Err(Error::SessionClosed),
        }
    }

    /// Moves a live machine to [`SessionState::Failed`].
    pub fn fail(&mut self) {
        if self.state.is_live() {
            warn!(from = %self.state, "session failed");
            self.state = SessionState::Failed;
        }
    }

    /// Fails the machine if `err` leaves the session unusable, then hands
    /// the error back.
    ///
    /// Transport, codec, hardware and timeout errors are fatal. Size, limit
    /// and state errors leave the state unchanged.
    pub fn absorb(&mut self, err: Error) -> Error {
        if err.is_transport() || matches!(err, Error::Hardware(_) | Error::Timeout) {
            self.fail();
        }
        err
    }
}
