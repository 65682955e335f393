//! Simulated apparatus: one linear spring per displacement channel.

use nalgebra::{DMatrix, DVector};

use super::local::{Hardware, Readiness};
use crate::error::{Error, Result};
use crate::response::{MatrixKind, Response, ResponseType, SizeRole, SizeVector};
use crate::trace::trace;

/// Stub hardware whose measured force is `k · d` per channel.
///
/// Measured displacement, velocity, acceleration and time echo the command.
/// It can report [`Readiness::Pending`] for a fixed number of polls after
/// every command.
#[derive(Debug, Clone)]
pub struct SimulatedSprings {
    stiffness: Vec<f64>,
    pending_polls: usize,
    remaining: usize,
    command: Response,
    commits: u64,
    acquisitions: u64,
}

impl SimulatedSprings {
    #[must_use]
    pub fn new(stiffness: Vec<f64>) -> Self {
        Self {
            stiffness,
            pending_polls: 0,
            remaining: 0,
            command: Response::new(),
            commits: 0,
            acquisitions: 0,
        }
    }

    /// Report pending this many times after each command.
    #[must_use]
    pub const fn with_pending_polls(mut self, polls: usize) -> Self {
        self.pending_polls = polls;
        self
    }

    pub fn stiffness(&self) -> &[f64] {
        &self.stiffness
    }

    pub const fn commits(&self) -> u64 {
        self.commits
    }

    pub const fn acquisitions(&self) -> u64 {
        self.acquisitions
    }
}

impl Hardware for SimulatedSprings {
    fn configure(&mut self, ctrl: SizeVector, daq: SizeVector) -> Result<()> {
        let springs = self.stiffness.len();
        if ctrl[ResponseType::Disp] != springs {
            let mut expected = ctrl;
            expected.set(ResponseType::Disp, springs);
            return Err(Error::SizeMismatch {
                role: SizeRole::Ctrl,
                expected,
                actual: ctrl,
            });
        }
        if daq[ResponseType::Force] > springs {
            let mut expected = daq;
            expected.set(ResponseType::Force, springs);
            return Err(Error::SizeMismatch {
                role: SizeRole::Daq,
                expected,
                actual: daq,
            });
        }
        self.command = Response::zeros(ctrl);
        Ok(())
    }

    fn command(&mut self, ctrl: &Response) -> Result<()> {
        self.command.clone_from(ctrl);
        self.remaining = self.pending_polls;
        Ok(())
    }

    fn poll(&mut self) -> Result<Readiness> {
        if self.remaining > 0 {
            self.remaining -= 1;
            return Ok(Readiness::Pending);
        }
        Ok(Readiness::Ready)
    }

    fn acquire(&mut self, daq: &mut Response) -> Result<()> {
        for ty in ResponseType::ALL {
            let out = daq.get_mut(ty);
            if ty == ResponseType::Force {
                let disp = self.command.disp();
                for ((f, k), d) in out.iter_mut().zip(&self.stiffness).zip(disp) {
                    *f = k * d;
                }
            } else {
                let src = self.command.get(ty);
                for (dst, v) in out.iter_mut().zip(src) {
                    *dst = *v;
                }
            }
        }
        self.acquisitions += 1;
        trace!(force = ?daq.force(), "springs measured");
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.commits += 1;
        Ok(())
    }

    fn matrix(&self, kind: MatrixKind) -> Option<DMatrix<f64>> {
        match kind {
            MatrixKind::InitialStiffness | MatrixKind::TangentStiffness => Some(
                DMatrix::from_diagonal(&DVector::from_column_slice(&self.stiffness)),
            ),
            MatrixKind::Damping | MatrixKind::Mass => None,
        }
    }
}
