//! Experimental sites: what a finite-element element talks to.
//!
//! A site takes trial vectors in the element's basic system and hands back
//! measured output vectors. Measurements are pulled at most once per trial:
//! the first read after `set_trial_response` goes to the backend, later
//! reads return the cached output. A trial the backend refuses leaves the
//! previous trial in place and blocks reads and commits until another trial
//! is accepted.

pub mod local;
pub mod shadow;

use nalgebra::DMatrix;

use crate::error::{Error, Result};
use crate::response::{MatrixKind, Response, ResponseType, SizeRole, SizeVector};
use crate::trace::{trace, warn};

pub use local::{LocalSite, SiteBackend};
pub use shadow::{ShadowConfig, ShadowSite};

/// Bookkeeping shared by every site.
#[derive(Debug, Clone, Default)]
pub struct SiteState {
    tag: u32,
    size_trial: SizeVector,
    size_out: SizeVector,
    configured: bool,
    trial: Response,
    staged: Response,
    rejected: bool,
    out: Response,
    daq_flag: bool,
    commit_tag: u64,
}

impl SiteState {
    #[must_use]
    pub fn new(tag: u32) -> Self {
        Self {
            tag,
            ..Self::default()
        }
    }

    pub const fn tag(&self) -> u32 {
        self.tag
    }

    /// `(trial, out)` sizes, once the site is sized.
    pub const fn sizes(&self) -> Option<(SizeVector, SizeVector)> {
        if self.configured {
            Some((self.size_trial, self.size_out))
        } else {
            None
        }
    }

    /// Last trial handed to the site.
    pub const fn trial(&self) -> &Response {
        &self.trial
    }

    /// Last output pulled from the backend.
    pub const fn out(&self) -> &Response {
        &self.out
    }

    /// Output buffer for backends to fill.
    pub fn out_mut(&mut self) -> &mut Response {
        &mut self.out
    }

    /// Whether the output matches the current trial.
    pub const fn daq_flag(&self) -> bool {
        self.daq_flag
    }

    /// Whether the backend refused the last trial.
    pub const fn trial_rejected(&self) -> bool {
        self.rejected
    }

    /// Number of committed steps.
    pub const fn commit_tag(&self) -> u64 {
        self.commit_tag
    }

    fn resize(&mut self, trial: SizeVector, out: SizeVector) {
        self.size_trial = trial;
        self.size_out = out;
        self.trial = Response::zeros(trial);
        self.staged = Response::zeros(trial);
        self.out = Response::zeros(out);
        self.rejected = false;
        self.daq_flag = false;
        self.configured = true;
    }
}

/// The site façade.
///
/// Implementors provide the backend hooks; the provided methods enforce
/// sizes, track the daq flag and count commits.
pub trait ExperimentalSite: Send {
    fn site_state(&self) -> &SiteState;

    fn site_state_mut(&mut self) -> &mut SiteState;

    /// Sizes the backend for the given site sizes.
    ///
    /// # Errors
    ///
    /// Fails if the backend rejects the sizes.
    fn size_backend(&mut self, trial: SizeVector, out: SizeVector) -> Result<()>;

    /// Sends the stored trial to the backend.
    ///
    /// # Errors
    ///
    /// Fails if the backend rejects the trial.
    fn send_trial(&mut self) -> Result<()>;

    /// Pulls measurements into the output buffer of the site state.
    ///
    /// # Errors
    ///
    /// Fails if the backend cannot produce measurements.
    fn pull_output(&mut self) -> Result<()>;

    /// # Errors
    ///
    /// Fails if the backend refuses the commit.
    fn commit_backend(&mut self) -> Result<()>;

    /// # Errors
    ///
    /// Fails if the backend is already closed.
    fn shutdown(&mut self) -> Result<()>;

    /// A matrix of the apparatus in the basic system, if it has one.
    ///
    /// # Errors
    ///
    /// Fails if the backend fails.
    fn matrix(&mut self, kind: MatrixKind) -> Result<Option<DMatrix<f64>>>;

    fn tag(&self) -> u32 {
        self.site_state().tag()
    }

    /// # Errors
    ///
    /// Fails if the backend rejects the sizes; the site stays unsized.
    fn set_size(&mut self, trial: SizeVector, out: SizeVector) -> Result<()> {
        self.size_backend(trial, out)?;
        self.site_state_mut().resize(trial, out);
        Ok(())
    }

    /// Stores a trial and forwards it.
    ///
    /// If the backend refuses the trial the previous one is restored and
    /// the site refuses reads and commits until a trial is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeMismatch`] unless every vector has exactly the
    /// site's trial size, or the backend's error if it refuses the trial.
    fn set_trial_response(&mut self, trial: &Response) -> Result<()> {
        let (size_trial, _) = self
            .site_state()
            .sizes()
            .ok_or(Error::NotConfigured("site sizes"))?;
        trial.check_sizes(size_trial, SizeRole::Trial)?;
        let state = self.site_state_mut();
        state.staged.clone_from(trial);
        std::mem::swap(&mut state.trial, &mut state.staged);
        state.daq_flag = false;
        match self.send_trial() {
            Ok(()) => {
                self.site_state_mut().rejected = false;
                Ok(())
            }
            Err(e) => {
                let state = self.site_state_mut();
                std::mem::swap(&mut state.trial, &mut state.staged);
                state.rejected = true;
                warn!(tag = state.tag, error = %e, "trial rejected");
                Err(e)
            }
        }
    }

    /// Pulls measurements for the current trial unless already pulled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrialRejected`] after a refused trial, or fails if
    /// the backend cannot produce measurements.
    fn check_daq_response(&mut self) -> Result<()> {
        if self.site_state().rejected {
            return Err(Error::TrialRejected);
        }
        if self.site_state().daq_flag {
            trace!(tag = self.tag(), "daq already pulled");
            return Ok(());
        }
        self.pull_output()?;
        self.site_state_mut().daq_flag = true;
        Ok(())
    }

    /// Copies the measured output into `out`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeMismatch`] if `out` is already sized to
    /// something other than the site's output size. Otherwise see
    /// [`check_daq_response`](Self::check_daq_response).
    fn get_daq_response(&mut self, out: &mut Response) -> Result<()> {
        let (_, size_out) = self
            .site_state()
            .sizes()
            .ok_or(Error::NotConfigured("site sizes"))?;
        if out.sizes() != SizeVector::ZERO {
            out.check_sizes(size_out, SizeRole::Output)?;
        }
        self.check_daq_response()?;
        out.clone_from(&self.site_state().out);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`Error::TrialRejected`] after a refused trial, or fails if
    /// the backend refuses the commit.
    fn commit_state(&mut self) -> Result<()> {
        if self.site_state().rejected {
            return Err(Error::TrialRejected);
        }
        self.commit_backend()?;
        self.site_state_mut().commit_tag += 1;
        Ok(())
    }

    /// One measured output vector.
    ///
    /// # Errors
    ///
    /// See [`check_daq_response`](Self::check_daq_response).
    fn response(&mut self, ty: ResponseType) -> Result<&[f64]> {
        self.check_daq_response()?;
        Ok(self.site_state().out.get(ty))
    }

    /// # Errors
    ///
    /// See [`check_daq_response`](Self::check_daq_response).
    fn disp(&mut self) -> Result<&[f64]> {
        self.response(ResponseType::Disp)
    }

    /// # Errors
    ///
    /// See [`check_daq_response`](Self::check_daq_response).
    fn vel(&mut self) -> Result<&[f64]> {
        self.response(ResponseType::Vel)
    }

    /// # Errors
    ///
    /// See [`check_daq_response`](Self::check_daq_response).
    fn accel(&mut self) -> Result<&[f64]> {
        self.response(ResponseType::Accel)
    }

    /// # Errors
    ///
    /// See [`check_daq_response`](Self::check_daq_response).
    fn force(&mut self) -> Result<&[f64]> {
        self.response(ResponseType::Force)
    }

    /// # Errors
    ///
    /// See [`check_daq_response`](Self::check_daq_response).
    fn time(&mut self) -> Result<&[f64]> {
        self.response(ResponseType::Time)
    }

    fn trial_disp(&self) -> &[f64] {
        self.site_state().trial.disp()
    }

    fn trial_vel(&self) -> &[f64] {
        self.site_state().trial.vel()
    }

    fn trial_accel(&self) -> &[f64] {
        self.site_state().trial.accel()
    }

    fn trial_force(&self) -> &[f64] {
        self.site_state().trial.force()
    }

    fn trial_time(&self) -> &[f64] {
        self.site_state().trial.time()
    }

    fn commit_tag(&self) -> u64 {
        self.site_state().commit_tag
    }
}
