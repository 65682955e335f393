//! In-process control over a hardware backend.

use std::thread;

use minstant::Instant;
use nalgebra::DMatrix;

use super::{ExecMode, ExperimentalControl, Operation, SessionState, StateMachine};
use crate::error::{Error, Result};
use crate::response::{MatrixKind, Response, SizeRole, SizeVector};
use crate::trace::{debug, info, trace};

/// Whether the apparatus reached the last command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Pending,
}

/// An opaque apparatus driver: a vendor SDK, a simulator or a test stub.
///
/// Backends see sizes and vectors in command coordinates. They never see
/// session state; [`LocalControl`] guarantees the call order.
pub trait Hardware: Send {
    /// # Errors
    ///
    /// Fails if the apparatus cannot be reached.
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::SizeMismatch`] if the apparatus cannot serve these sizes.
    fn configure(&mut self, ctrl: SizeVector, daq: SizeVector) -> Result<()>;

    /// Sends one command.
    ///
    /// # Errors
    ///
    /// Fails if the command is rejected.
    fn command(&mut self, ctrl: &Response) -> Result<()>;

    /// Reports whether the last command has been reached.
    ///
    /// # Errors
    ///
    /// Fails if the apparatus faulted.
    fn poll(&mut self) -> Result<Readiness> {
        Ok(Readiness::Ready)
    }

    /// Reads measurements into `daq`, which is sized to the daq sizes.
    ///
    /// # Errors
    ///
    /// Fails if the measurements cannot be read.
    fn acquire(&mut self, daq: &mut Response) -> Result<()>;

    /// # Errors
    ///
    /// Fails if the apparatus cannot accept the step.
    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    /// # Errors
    ///
    /// Fails if the disconnect is not clean.
    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    fn matrix(&self, kind: MatrixKind) -> Option<DMatrix<f64>> {
        let _ = kind;
        None
    }
}

/// A control driving a [`Hardware`] backend in this process.
pub struct LocalControl<H> {
    hardware: H,
    machine: StateMachine,
    mode: ExecMode,
    sizes: Option<(SizeVector, SizeVector)>,
    daq: Response,
    polls: u32,
}

impl<H: Hardware> LocalControl<H> {
    #[must_use]
    pub fn new(hardware: H, mode: ExecMode) -> Self {
        Self {
            hardware,
            machine: StateMachine::new(),
            mode,
            sizes: None,
            daq: Response::new(),
            polls: 0,
        }
    }

    /// Polls the last `execute` spent waiting for the apparatus.
    pub const fn last_polls(&self) -> u32 {
        self.polls
    }

    pub const fn hardware(&self) -> &H {
        &self.hardware
    }

    pub const fn mode(&self) -> ExecMode {
        self.mode
    }

    fn negotiated(&self) -> Result<(SizeVector, SizeVector)> {
        self.sizes.ok_or(Error::NotConfigured("control sizes"))
    }

    /// Runs `f` on the backend, failing the session on fatal errors.
    fn guarded<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        f(self).map_err(|e| self.machine.absorb(e))
    }

    fn wait_ready(&mut self) -> Result<()> {
        self.polls = 0;
        match self.mode {
            ExecMode::Blocking => loop {
                self.polls = self.polls.saturating_add(1);
                if self.hardware.poll()? == Readiness::Ready {
                    return Ok(());
                }
                thread::yield_now();
            },
            ExecMode::Polling { interval, timeout } => {
                let deadline = Instant::now() + timeout;
                loop {
                    self.polls = self.polls.saturating_add(1);
                    if self.hardware.poll()? == Readiness::Ready {
                        trace!(polls = self.polls, "apparatus ready");
                        return Ok(());
                    }
                    if Instant::now() >= deadline {
                        debug!(polls = self.polls, ?timeout, "apparatus did not settle");
                        return Err(Error::Timeout);
                    }
                    thread::sleep(interval);
                }
            }
        }
    }
}

impl<H: Hardware> ExperimentalControl for LocalControl<H> {
    fn open(&mut self) -> Result<()> {
        self.machine.check(Operation::Open)?;
        self.guarded(|c| c.hardware.connect())?;
        self.machine.apply(Operation::Open)?;
        Ok(())
    }

    fn setup(&mut self, ctrl: SizeVector, daq: SizeVector) -> Result<()> {
        self.machine.check(Operation::Setup)?;
        self.guarded(|c| c.hardware.configure(ctrl, daq))?;
        self.machine.apply(Operation::Setup)?;
        self.sizes = Some((ctrl, daq));
        self.daq = Response::zeros(daq);
        self.machine.mark_ready()?;
        info!(%ctrl, %daq, "local control configured");
        Ok(())
    }

    fn set_trial_response(&mut self, ctrl: &Response) -> Result<()> {
        self.machine.check(Operation::SetTrialResponse)?;
        let (size_ctrl, _) = self.negotiated()?;
        ctrl.check_sizes(size_ctrl, SizeRole::Ctrl)?;
        self.guarded(|c| c.hardware.command(ctrl))?;
        self.machine.apply(Operation::SetTrialResponse)?;
        Ok(())
    }

    fn execute(&mut self) -> Result<()> {
        if self.machine.check(Operation::Execute)? == self.machine.state() {
            return Ok(());
        }
        let (_, size_daq) = self.negotiated()?;
        self.guarded(|c| {
            c.wait_ready()?;
            c.daq.resize(size_daq);
            c.hardware.acquire(&mut c.daq)?;
            c.daq
                .check_sizes(size_daq, SizeRole::Daq)
                .map_err(|e| Error::Hardware(e.to_string()))
        })?;
        self.machine.apply(Operation::Execute)?;
        Ok(())
    }

    fn get_daq_response(&mut self, daq: &mut Response) -> Result<()> {
        self.machine.check(Operation::GetDaqResponse)?;
        let (_, size_daq) = self.negotiated()?;
        daq.fill_from(&self.daq, size_daq, SizeRole::Daq)?;
        self.machine.apply(Operation::GetDaqResponse)?;
        Ok(())
    }

    fn commit_state(&mut self) -> Result<()> {
        self.machine.check(Operation::CommitState)?;
        self.guarded(|c| c.hardware.commit())?;
        self.machine.apply(Operation::CommitState)?;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.machine.check(Operation::Shutdown)?;
        let result = self.hardware.disconnect();
        self.machine.apply(Operation::Shutdown)?;
        info!("local control shut down");
        result
    }

    fn state(&self) -> SessionState {
        self.machine.state()
    }

    fn sizes(&self) -> Option<(SizeVector, SizeVector)> {
        self.sizes
    }

    fn matrix(&mut self, kind: MatrixKind) -> Result<Option<DMatrix<f64>>> {
        if !self.machine.is_live() {
            return Err(Error::SessionClosed);
        }
        Ok(self.hardware.matrix(kind))
    }
}
