//! Experimental setups.
//!
//! A setup sits between a site and its control. It maps trial vectors in
//! the element's basic system to actuator commands and maps measurements
//! back:
//!
//! ```text
//! trial ─ trial factors ─ transform ─ ctrl factors ─ ctrl limits ─> control
//! out <─ out factors ─ inverse transform ─ daq limits ─ daq factors ─ daq
//! ```
//!
//! Every buffer is owned by the setup and reused across steps.

pub mod identity;
pub mod two_actuators;

use nalgebra::DMatrix;

use crate::catalog::{CatalogError, ControlPointCatalog};
use crate::control::{ExperimentalControl, SessionState};
use crate::error::{Error, Result};
use crate::response::{MatrixKind, Response, ResponseType, SizeRole, SizeVector};
use crate::trace::{debug, info};

pub use identity::NoTransformation;
pub use two_actuators::{ActuatorSide, Geometry, TwoActuators2d};

/// Sizes on both sides of a transformation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupSizes {
    pub trial: SizeVector,
    pub out: SizeVector,
    pub ctrl: SizeVector,
    pub daq: SizeVector,
}

/// Geometry between the element's basic system and the actuators.
///
/// Both directions write only the vectors that are non-empty in the
/// destination; disabled response types are left alone.
pub trait Transformation: Send {
    fn name(&self) -> &'static str;

    /// Full sizes; sites may disable response types but never resize them.
    fn sizes(&self) -> SetupSizes;

    /// Maps trial vectors to actuator commands.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Geometry`] if the trial has no actuator solution.
    fn trial_to_ctrl(&self, trial: &Response, ctrl: &mut Response) -> Result<()>;

    /// Maps measurements to output vectors.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Geometry`] if the measurements are inconsistent
    /// with the geometry.
    fn daq_to_out(&self, daq: &Response, out: &mut Response) -> Result<()>;

    /// Map from basic displacements to actuator displacements, used to
    /// bring matrices measured at the actuators back to the basic system.
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        None
    }
}

/// A transformation plus the catalogs, factors and control around it.
pub struct ExperimentalSetup {
    transformation: Box<dyn Transformation>,
    ctrl_points: ControlPointCatalog,
    daq_points: ControlPointCatalog,
    trial_factors: [f64; ResponseType::COUNT],
    out_factors: [f64; ResponseType::COUNT],
    control: Option<Box<dyn ExperimentalControl>>,
    active: Option<SetupSizes>,
    trial: Response,
    ctrl: Response,
    daq: Response,
    out: Response,
}

impl ExperimentalSetup {
    pub fn new(transformation: impl Transformation + 'static) -> Self {
        Self {
            transformation: Box::new(transformation),
            ctrl_points: ControlPointCatalog::new(),
            daq_points: ControlPointCatalog::new(),
            trial_factors: [1.0; ResponseType::COUNT],
            out_factors: [1.0; ResponseType::COUNT],
            control: None,
            active: None,
            trial: Response::new(),
            ctrl: Response::new(),
            daq: Response::new(),
            out: Response::new(),
        }
    }

    /// Attaches the command-side control points.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeMismatch`] if a response type the catalog
    /// declares has a different count than the transformation commands.
    pub fn with_ctrl_points(mut self, points: ControlPointCatalog) -> Result<Self> {
        let expected = self.transformation.sizes().ctrl;
        check_catalog(&points, expected, SizeRole::Ctrl)?;
        self.ctrl_points = points;
        Ok(self)
    }

    /// Attaches the measurement-side control points.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeMismatch`] if a response type the catalog
    /// declares has a different count than the transformation measures.
    pub fn with_daq_points(mut self, points: ControlPointCatalog) -> Result<Self> {
        let expected = self.transformation.sizes().daq;
        check_catalog(&points, expected, SizeRole::Daq)?;
        self.daq_points = points;
        Ok(self)
    }

    /// Scales every trial value of `ty` before the transform.
    ///
    /// # Errors
    ///
    /// Fails if the factor is zero or not finite.
    pub fn with_trial_factor(mut self, ty: ResponseType, factor: f64) -> Result<Self> {
        self.trial_factors[ty.index()] = valid_factor(factor)?;
        Ok(self)
    }

    /// Scales every output value of `ty` after the inverse transform.
    ///
    /// # Errors
    ///
    /// Fails if the factor is zero or not finite.
    pub fn with_out_factor(mut self, ty: ResponseType, factor: f64) -> Result<Self> {
        self.out_factors[ty.index()] = valid_factor(factor)?;
        Ok(self)
    }

    #[must_use]
    pub fn with_control(mut self, control: Box<dyn ExperimentalControl>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn transformation(&self) -> &dyn Transformation {
        self.transformation.as_ref()
    }

    pub const fn ctrl_points(&self) -> &ControlPointCatalog {
        &self.ctrl_points
    }

    pub const fn daq_points(&self) -> &ControlPointCatalog {
        &self.daq_points
    }

    pub const fn has_control(&self) -> bool {
        self.control.is_some()
    }

    pub fn control(&self) -> Option<&dyn ExperimentalControl> {
        self.control.as_deref()
    }

    /// Active sizes, once [`set_size`](Self::set_size) succeeded.
    pub const fn sizes(&self) -> Option<SetupSizes> {
        self.active
    }

    fn active(&self) -> Result<SetupSizes> {
        self.active.ok_or(Error::NotConfigured("setup sizes"))
    }

    fn control_mut(&mut self) -> Result<&mut (dyn ExperimentalControl + 'static)> {
        self.control
            .as_deref_mut()
            .ok_or(Error::NotConfigured("setup control"))
    }

    /// Enables the response types a site uses.
    ///
    /// A zero size disables that type on the trial or output side and on
    /// the matching command or measurement side.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeMismatch`] if a nonzero size differs from the
    /// transformation's.
    pub fn set_size(&mut self, trial: SizeVector, out: SizeVector) -> Result<SetupSizes> {
        let full = self.transformation.sizes();
        check_enabled(trial, full.trial, SizeRole::Trial)?;
        check_enabled(out, full.out, SizeRole::Output)?;

        let active = SetupSizes {
            trial,
            out,
            ctrl: full.ctrl.masked_by(&trial),
            daq: full.daq.masked_by(&out),
        };
        self.trial = Response::zeros(active.trial);
        self.ctrl = Response::zeros(active.ctrl);
        self.daq = Response::zeros(active.daq);
        self.out = Response::zeros(active.out);
        self.active = Some(active);
        info!(
            transformation = self.transformation.name(),
            ctrl = %active.ctrl,
            daq = %active.daq,
            "setup sized"
        );
        Ok(active)
    }

    /// Opens the control if needed and forwards the active command and
    /// measurement sizes.
    ///
    /// # Errors
    ///
    /// Fails without a control, before [`set_size`](Self::set_size), or if
    /// the control rejects the sizes.
    pub fn setup_control(&mut self) -> Result<()> {
        let active = self.active()?;
        let control = self.control_mut()?;
        if control.state() == SessionState::Idle {
            control.open()?;
        }
        control.setup(active.ctrl, active.daq)
    }

    /// Runs a trial through factors, transform and command limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeMismatch`] for a wrongly sized trial and
    /// [`Error::LimitExceeded`] if a command leaves its limits. Nothing is
    /// clamped.
    pub fn transf_trial_response(&mut self, trial: &Response) -> Result<&Response> {
        let active = self.active()?;
        trial.check_sizes(active.trial, SizeRole::Trial)?;
        self.trial.clone_from(trial);
        scale(&mut self.trial, &self.trial_factors);
        self.transformation.trial_to_ctrl(&self.trial, &mut self.ctrl)?;
        self.ctrl_points.apply_factors(&mut self.ctrl);
        self.ctrl_points
            .check_limits(&self.ctrl)
            .map_err(Error::LimitExceeded)?;
        Ok(&self.ctrl)
    }

    /// Runs measurements through factors, limits and the inverse transform.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SizeMismatch`] for wrongly sized measurements and
    /// [`Error::LimitExceeded`] if a measurement leaves its limits.
    pub fn transf_daq_response(&mut self, daq: &Response) -> Result<&Response> {
        let active = self.active()?;
        daq.check_sizes(active.daq, SizeRole::Daq)?;
        self.daq.clone_from(daq);
        self.finish_daq()
    }

    fn finish_daq(&mut self) -> Result<&Response> {
        self.daq_points.apply_factors(&mut self.daq);
        self.daq_points
            .check_limits(&self.daq)
            .map_err(Error::LimitExceeded)?;
        self.transformation.daq_to_out(&self.daq, &mut self.out)?;
        scale(&mut self.out, &self.out_factors);
        Ok(&self.out)
    }

    /// Transforms a trial and commands the control with it.
    ///
    /// # Errors
    ///
    /// See [`transf_trial_response`](Self::transf_trial_response); also
    /// fails without a control.
    pub fn set_trial_response(&mut self, trial: &Response) -> Result<()> {
        self.transf_trial_response(trial)?;
        let Self { control, ctrl, .. } = self;
        let control = control
            .as_deref_mut()
            .ok_or(Error::NotConfigured("setup control"))?;
        control.set_trial_response(ctrl)
    }

    /// Executes the pending trial and returns the transformed output.
    ///
    /// # Errors
    ///
    /// Fails without a control, if the control fails, or as
    /// [`transf_daq_response`](Self::transf_daq_response) does.
    pub fn acquire(&mut self) -> Result<&Response> {
        let active = self.active()?;
        let Self { control, daq, .. } = self;
        let control = control
            .as_deref_mut()
            .ok_or(Error::NotConfigured("setup control"))?;
        control.execute()?;
        control.get_daq_response(daq)?;
        daq.check_sizes(active.daq, SizeRole::Daq)?;
        debug!(daq = ?self.daq.slices(), "measurements acquired");
        self.finish_daq()
    }

    /// # Errors
    ///
    /// Fails without a control or if the control refuses the commit.
    pub fn commit_state(&mut self) -> Result<()> {
        self.control_mut()?.commit_state()
    }

    /// # Errors
    ///
    /// Fails without a control or if the control is already closed.
    pub fn shutdown(&mut self) -> Result<()> {
        self.control_mut()?.shutdown()
    }

    /// A control matrix brought to the basic system.
    ///
    /// # Errors
    ///
    /// Fails without a control or if the control fails.
    pub fn matrix(&mut self, kind: MatrixKind) -> Result<Option<DMatrix<f64>>> {
        match self.control_mut()?.matrix(kind)? {
            Some(k) => self.to_basic(k).map(Some),
            None => Ok(None),
        }
    }

    /// Applies `Jᵀ·K·J` for transformations with a Jacobian.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Geometry`] if `k` does not match the Jacobian.
    pub fn to_basic(&self, k: DMatrix<f64>) -> Result<DMatrix<f64>> {
        let Some(j) = self.transformation.jacobian() else {
            return Ok(k);
        };
        if !k.is_square() || k.nrows() != j.nrows() {
            return Err(Error::Geometry("matrix does not match the actuator count"));
        }
        Ok(j.transpose() * k * j)
    }
}

fn valid_factor(factor: f64) -> Result<f64> {
    if !factor.is_finite() || factor == 0.0 {
        return Err(CatalogError::InvalidFactor(factor).into());
    }
    Ok(factor)
}

fn scale(response: &mut Response, factors: &[f64; ResponseType::COUNT]) {
    for ty in ResponseType::ALL {
        let f = factors[ty.index()];
        if f != 1.0 {
            response.get_mut(ty).iter_mut().for_each(|v| *v *= f);
        }
    }
}

fn check_enabled(requested: SizeVector, full: SizeVector, role: SizeRole) -> Result<()> {
    let matches = requested
        .iter()
        .all(|(ty, n)| n == 0 || n == full.get(ty));
    if !matches {
        return Err(Error::SizeMismatch {
            role,
            expected: full,
            actual: requested,
        });
    }
    Ok(())
}

fn check_catalog(points: &ControlPointCatalog, expected: SizeVector, role: SizeRole) -> Result<()> {
    check_enabled(points.sizes(), expected, role)
}
