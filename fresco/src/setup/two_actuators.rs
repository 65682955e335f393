//! Planar setup with two parallel actuators on a rigid link.
//!
//! Actuator 0 drives the link's translational DOF directly. Actuator 1 is
//! attached at distance `L` along the link and controls its rotation. Basic
//! system DOFs are `(u_x, u_y, θ)`; `u_y` is not controlled and reads back
//! as zero.
//!
//! With `s = +1` for actuators on the left and `s = -1` on the right, the
//! linear transform is
//!
//! ```text
//! a0 = s·d0            a1 = s·(d0 − L·θ)
//! fa0 = s·(f0 + f2/L)  fa1 = −s·f2/L
//! ```
//!
//! The nonlinear transform follows actuator 1 as the link rotates:
//!
//! ```text
//! u = s·(d0 − L·sinθ) + La1     w = L·cosθ − L
//! a1 = √(u² + w²) − La1
//! ```
//!
//! Velocities and accelerations are its exact time derivatives, and forces
//! are in equilibrium in the deformed configuration. Every inverse is exact.

use nalgebra::{DMatrix, Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use super::{SetupSizes, Transformation};
use crate::error::{Error, Result};
use crate::response::{Response, ResponseType, SizeRole, SizeVector};

/// Below this, a length or a determinant is treated as zero.
const SINGULAR: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Geometry {
    #[default]
    Linear,
    Nonlinear,
}

/// Side of the link the actuators push from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorSide {
    #[default]
    Left,
    Right,
}

impl ActuatorSide {
    const fn sign(self) -> f64 {
        match self {
            Self::Left => 1.0,
            Self::Right => -1.0,
        }
    }
}

/// Actuator 1's position for link displacement `d0` and rotation `θ`.
#[derive(Debug, Clone, Copy)]
struct Arm {
    u: f64,
    w: f64,
    g: f64,
    sin: f64,
    cos: f64,
}

#[derive(Debug, Clone)]
pub struct TwoActuators2d {
    la0: f64,
    la1: f64,
    l: f64,
    geometry: Geometry,
    side: ActuatorSide,
    phi_loc_x: f64,
    rot: Matrix3<f64>,
}

impl TwoActuators2d {
    /// `la0`, `la1` are the actuator lengths, `l` the rigid link length and
    /// `phi_loc_x` the angle in degrees from the global X axis to the local
    /// actuator axis.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Geometry`] unless `l` and both actuator lengths are
    /// positive and finite.
    pub fn new(
        la0: f64,
        la1: f64,
        l: f64,
        geometry: Geometry,
        side: ActuatorSide,
        phi_loc_x: f64,
    ) -> Result<Self> {
        if !(l.is_finite() && l > 0.0) {
            return Err(Error::Geometry("rigid link length must be positive"));
        }
        if !(la0.is_finite() && la0 > 0.0 && la1.is_finite() && la1 > 0.0) {
            return Err(Error::Geometry("actuator lengths must be positive"));
        }
        if !phi_loc_x.is_finite() {
            return Err(Error::Geometry("rotation angle must be finite"));
        }
        let (sin, cos) = phi_loc_x.to_radians().sin_cos();
        #[rustfmt::skip]
        let rot = Matrix3::new(
            cos, -sin, 0.0,
            sin,  cos, 0.0,
            0.0,  0.0, 1.0,
        );
        Ok(Self {
            la0,
            la1,
            l,
            geometry,
            side,
            phi_loc_x,
            rot,
        })
    }

    pub const fn la0(&self) -> f64 {
        self.la0
    }

    pub const fn la1(&self) -> f64 {
        self.la1
    }

    pub const fn l(&self) -> f64 {
        self.l
    }

    pub const fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub const fn side(&self) -> ActuatorSide {
        self.side
    }

    pub const fn phi_loc_x(&self) -> f64 {
        self.phi_loc_x
    }

    /// A basic-system vector of `ty` rotated into local axes, if active.
    fn local(&self, trial: &Response, ty: ResponseType) -> Result<Option<Vector3<f64>>> {
        match *trial.get(ty) {
            [] => Ok(None),
            [x, y, z] => Ok(Some(self.rot * Vector3::new(x, y, z))),
            _ => Err(Error::SizeMismatch {
                role: SizeRole::Trial,
                expected: self.sizes().trial,
                actual: trial.sizes(),
            }),
        }
    }

    /// The two actuator values of `ty`, if active.
    fn actuators(&self, daq: &Response, ty: ResponseType) -> Result<Option<(f64, f64)>> {
        match *daq.get(ty) {
            [] => Ok(None),
            [a0, a1] => Ok(Some((a0, a1))),
            _ => Err(Error::SizeMismatch {
                role: SizeRole::Daq,
                expected: self.sizes().daq,
                actual: daq.sizes(),
            }),
        }
    }

    /// Rotates a local vector back and writes it into `out`, if active.
    fn write_basic(&self, out: &mut Response, ty: ResponseType, local: Vector3<f64>) {
        if let [x, y, z] = out.get_mut(ty) {
            let basic = self.rot.transpose() * local;
            (*x, *y, *z) = (basic.x, basic.y, basic.z);
        }
    }

    fn arm(&self, d0: f64, theta: f64) -> Result<Arm> {
        let s = self.side.sign();
        let (sin, cos) = theta.sin_cos();
        let u = s * (d0 - self.l * sin) + self.la1;
        let w = self.l * cos - self.l;
        let g = u.hypot(w);
        if g < SINGULAR {
            return Err(Error::Geometry("actuator 1 collapsed to zero length"));
        }
        Ok(Arm { u, w, g, sin, cos })
    }

    /// `∂(g·ġ)/∂θ̇`, the coefficient solved for by the velocity and
    /// acceleration inverses.
    fn rate_coefficient(&self, arm: &Arm) -> Result<f64> {
        let s = self.side.sign();
        let d = -s * arm.u * self.l * arm.cos - arm.w * self.l * arm.sin;
        if d.abs() < SINGULAR {
            return Err(Error::Geometry("actuator 1 is perpendicular to the link motion"));
        }
        Ok(d)
    }

    /// Inclination of actuator 1 and `cos(θ − θ1)` for the force transforms.
    fn force_angles(&self, arm: &Arm, theta: f64) -> Result<(f64, f64)> {
        let theta1 = (self.l * (1.0 - arm.cos) / arm.g).asin();
        let lever = (theta - theta1).cos();
        if lever.abs() < SINGULAR {
            return Err(Error::Geometry("actuator 1 has no lever arm"));
        }
        Ok((theta1, lever))
    }

    fn linear_to_ctrl(&self, trial: &Response, ctrl: &mut Response) -> Result<()> {
        let (s, l) = (self.side.sign(), self.l);
        for ty in [ResponseType::Disp, ResponseType::Vel, ResponseType::Accel] {
            if let Some(d) = self.local(trial, ty)? {
                set_pair(ctrl, ty, s * d.x, s * (d.x - l * d.z));
            }
        }
        if let Some(f) = self.local(trial, ResponseType::Force)? {
            set_pair(ctrl, ResponseType::Force, s * (f.x + f.z / l), -s * f.z / l);
        }
        Ok(())
    }

    fn nonlinear_to_ctrl(&self, trial: &Response, ctrl: &mut Response) -> Result<()> {
        let (s, l) = (self.side.sign(), self.l);
        let Some(d) = self.local(trial, ResponseType::Disp)? else {
            return self.require_disp(trial);
        };
        let theta = d.z;
        let arm = self.arm(d.x, theta)?;
        set_pair(ctrl, ResponseType::Disp, s * d.x, arm.g - self.la1);

        let v = self.local(trial, ResponseType::Vel)?;
        let (v0, omega) = v.map_or((0.0, 0.0), |v| (v.x, v.z));
        let du = s * (v0 - l * arm.cos * omega);
        let dw = -l * arm.sin * omega;
        let dg = (arm.u * du + arm.w * dw) / arm.g;
        if v.is_some() {
            set_pair(ctrl, ResponseType::Vel, s * v0, dg);
        }

        if let Some(a) = self.local(trial, ResponseType::Accel)? {
            let (acc0, alpha) = (a.x, a.z);
            let ddu = s * (acc0 + l * arm.sin * omega * omega - l * arm.cos * alpha);
            let ddw = -l * arm.cos * omega * omega - l * arm.sin * alpha;
            let ddg = (du * du + dw * dw + arm.u * ddu + arm.w * ddw - dg * dg) / arm.g;
            set_pair(ctrl, ResponseType::Accel, s * acc0, ddg);
        }

        if let Some(f) = self.local(trial, ResponseType::Force)? {
            let (theta1, lever) = self.force_angles(&arm, theta)?;
            let fa1 = -s * f.z / (l * lever);
            let fa0 = s * f.x - fa1 * theta1.cos();
            set_pair(ctrl, ResponseType::Force, fa0, fa1);
        }
        Ok(())
    }

    fn linear_to_out(&self, daq: &Response, out: &mut Response) -> Result<()> {
        let (s, l) = (self.side.sign(), self.l);
        for ty in [ResponseType::Disp, ResponseType::Vel, ResponseType::Accel] {
            if let Some((a0, a1)) = self.actuators(daq, ty)? {
                self.write_basic(out, ty, Vector3::new(s * a0, 0.0, s * (a0 - a1) / l));
            }
        }
        if let Some((fa0, fa1)) = self.actuators(daq, ResponseType::Force)? {
            let local = Vector3::new(s * (fa0 + fa1), 0.0, -s * l * fa1);
            self.write_basic(out, ResponseType::Force, local);
        }
        Ok(())
    }

    fn nonlinear_to_out(&self, daq: &Response, out: &mut Response) -> Result<()> {
        let (s, l) = (self.side.sign(), self.l);
        let Some((a0, a1)) = self.actuators(daq, ResponseType::Disp)? else {
            return self.require_disp(daq);
        };
        let x = self.la1 + a0;
        let d1 = self.la1 + a1;
        let root = l.hypot(x);
        let c = (d1 * d1 - 2.0 * l * l - x * x) / (-2.0 * l * root);
        if !(-1.0..=1.0).contains(&c) {
            return Err(Error::Geometry("measured actuator lengths are not reachable"));
        }
        let theta = s * (x.atan2(l) - c.acos());
        let d0 = s * a0;
        self.write_basic(out, ResponseType::Disp, Vector3::new(d0, 0.0, theta));

        let arm = self.arm(d0, theta)?;
        let vel = self.actuators(daq, ResponseType::Vel)?;
        let accel = self.actuators(daq, ResponseType::Accel)?;

        let (mut v0, mut omega) = (0.0, 0.0);
        if vel.is_some() || accel.is_some() {
            let coeff = self.rate_coefficient(&arm)?;
            if let Some((va0, va1)) = vel {
                v0 = s * va0;
                omega = (va1 * arm.g - s * arm.u * v0) / coeff;
                self.write_basic(out, ResponseType::Vel, Vector3::new(v0, 0.0, omega));
            }
            if let Some((aa0, aa1)) = accel {
                let du = s * (v0 - l * arm.cos * omega);
                let dw = -l * arm.sin * omega;
                let dg = (arm.u * du + arm.w * dw) / arm.g;
                let acc0 = s * aa0;
                let alpha = (aa1 * arm.g + dg * dg - du * du - dw * dw
                    - s * arm.u * (acc0 + l * arm.sin * omega * omega)
                    + arm.w * l * arm.cos * omega * omega)
                    / coeff;
                self.write_basic(out, ResponseType::Accel, Vector3::new(acc0, 0.0, alpha));
            }
        }

        if let Some((fa0, fa1)) = self.actuators(daq, ResponseType::Force)? {
            let (theta1, lever) = self.force_angles(&arm, theta)?;
            let f0 = s * (fa0 + fa1 * theta1.cos());
            let f2 = -s * fa1 * l * lever;
            self.write_basic(out, ResponseType::Force, Vector3::new(f0, 0.0, f2));
        }
        Ok(())
    }

    /// Nonlinear geometry needs the displacement to transform anything
    /// but time.
    fn require_disp(&self, r: &Response) -> Result<()> {
        let kinematic = [ResponseType::Vel, ResponseType::Accel, ResponseType::Force];
        if kinematic.iter().any(|ty| !r.get(*ty).is_empty()) {
            return Err(Error::Geometry(
                "nonlinear geometry needs the displacement vector",
            ));
        }
        Ok(())
    }
}

fn set_pair(r: &mut Response, ty: ResponseType, a0: f64, a1: f64) {
    if let [x, y] = r.get_mut(ty) {
        (*x, *y) = (a0, a1);
    }
}

fn copy_time(src: &Response, dst: &mut Response) {
    let src = src.get(ResponseType::Time);
    for (d, s) in dst.get_mut(ResponseType::Time).iter_mut().zip(src) {
        *d = *s;
    }
}

impl Transformation for TwoActuators2d {
    fn name(&self) -> &'static str {
        "TwoActuators2d"
    }

    fn sizes(&self) -> SetupSizes {
        let basic = SizeVector::new([3, 3, 3, 3, 1]);
        let actuators = SizeVector::new([2, 2, 2, 2, 1]);
        SetupSizes {
            trial: basic,
            out: basic,
            ctrl: actuators,
            daq: actuators,
        }
    }

    fn trial_to_ctrl(&self, trial: &Response, ctrl: &mut Response) -> Result<()> {
        match self.geometry {
            Geometry::Linear => self.linear_to_ctrl(trial, ctrl)?,
            Geometry::Nonlinear => self.nonlinear_to_ctrl(trial, ctrl)?,
        }
        copy_time(trial, ctrl);
        Ok(())
    }

    fn daq_to_out(&self, daq: &Response, out: &mut Response) -> Result<()> {
        match self.geometry {
            Geometry::Linear => self.linear_to_out(daq, out)?,
            Geometry::Nonlinear => self.nonlinear_to_out(daq, out)?,
        }
        copy_time(daq, out);
        Ok(())
    }

    /// Small-displacement map from basic displacements to actuator strokes.
    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let (s, l) = (self.side.sign(), self.l);
        #[rustfmt::skip]
        let local = DMatrix::from_row_slice(2, 3, &[
            s,   0.0, 0.0,
            s,   0.0, -s * l,
        ]);
        let rot = DMatrix::from_iterator(3, 3, self.rot.iter().copied());
        Some(local * rot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-9;

    fn setup(geometry: Geometry, side: ActuatorSide, phi: f64) -> TwoActuators2d {
        TwoActuators2d::new(120.0, 100.0, 50.0, geometry, side, phi).unwrap()
    }

    /// A trial whose local `u_y` components are zero, so it survives the
    /// round trip through two actuators.
    fn trial(t: &TwoActuators2d) -> Response {
        let basic = |x: f64, z: f64| {
            let v = t.rot.transpose() * Vector3::new(x, 0.0, z);
            [v.x, v.y, v.z]
        };
        Response::new()
            .with(ResponseType::Disp, &basic(0.5, 0.02))
            .with(ResponseType::Vel, &basic(0.1, 0.01))
            .with(ResponseType::Accel, &basic(0.3, -0.02))
            .with(ResponseType::Force, &basic(10.0, 5.0))
            .with(ResponseType::Time, &[2.5])
    }

    fn roundtrip(t: &TwoActuators2d, input: &Response) -> Response {
        let sizes = t.sizes();
        let mut ctrl = Response::zeros(sizes.ctrl);
        t.trial_to_ctrl(input, &mut ctrl).unwrap();
        let mut out = Response::zeros(sizes.out);
        t.daq_to_out(&ctrl, &mut out).unwrap();
        out
    }

    fn assert_close(a: &Response, b: &Response) {
        for ty in ResponseType::ALL {
            for (x, y) in a.get(ty).iter().zip(b.get(ty)) {
                assert!((x - y).abs() < TOL, "{ty}: {x} vs {y}");
            }
        }
    }

    #[test]
    fn inverse_law_holds_for_every_variant() {
        for geometry in [Geometry::Linear, Geometry::Nonlinear] {
            for side in [ActuatorSide::Left, ActuatorSide::Right] {
                for phi in [0.0, 30.0] {
                    let t = setup(geometry, side, phi);
                    let input = trial(&t);
                    assert_close(&roundtrip(&t, &input), &input);
                }
            }
        }
    }

    #[test]
    fn linear_strokes_follow_closed_form() {
        let t = setup(Geometry::Linear, ActuatorSide::Right, 0.0);
        let input = Response::new().with(ResponseType::Disp, &[0.5, 0.0, 0.02]);
        let mut ctrl = Response::new().with(ResponseType::Disp, &[0.0, 0.0]);
        t.trial_to_ctrl(&input, &mut ctrl).unwrap();
        assert!((ctrl.disp()[0] + 0.5).abs() < TOL);
        assert!((ctrl.disp()[1] - (-0.5 + 50.0 * 0.02)).abs() < TOL);
    }

    #[test]
    fn nonlinear_matches_linear_for_small_motion() {
        let lin = setup(Geometry::Linear, ActuatorSide::Left, 0.0);
        let nl = setup(Geometry::Nonlinear, ActuatorSide::Left, 0.0);
        let input = Response::new().with(ResponseType::Disp, &[1e-6, 0.0, 1e-8]);

        let mut a = Response::new().with(ResponseType::Disp, &[0.0, 0.0]);
        let mut b = a.clone();
        lin.trial_to_ctrl(&input, &mut a).unwrap();
        nl.trial_to_ctrl(&input, &mut b).unwrap();
        assert!((a.disp()[1] - b.disp()[1]).abs() < 1e-10);
    }

    #[test]
    fn unreachable_lengths_are_a_geometry_error() {
        let t = setup(Geometry::Nonlinear, ActuatorSide::Left, 0.0);
        let daq = Response::new().with(ResponseType::Disp, &[0.0, 1000.0]);
        let mut out = Response::new().with(ResponseType::Disp, &[0.0; 3]);
        assert!(matches!(
            t.daq_to_out(&daq, &mut out),
            Err(Error::Geometry(_))
        ));
    }

    #[test]
    fn nonlinear_force_without_disp_is_rejected() {
        let t = setup(Geometry::Nonlinear, ActuatorSide::Left, 0.0);
        let input = Response::new().with(ResponseType::Force, &[1.0, 0.0, 0.0]);
        let mut ctrl = Response::new().with(ResponseType::Force, &[0.0, 0.0]);
        assert!(matches!(
            t.trial_to_ctrl(&input, &mut ctrl),
            Err(Error::Geometry(_))
        ));
    }

    #[test]
    fn jacobian_maps_small_displacements() {
        let t = setup(Geometry::Linear, ActuatorSide::Left, 30.0);
        let input = trial(&t);
        let mut ctrl = Response::zeros(t.sizes().ctrl);
        t.trial_to_ctrl(&input, &mut ctrl).unwrap();

        let j = t.jacobian().unwrap();
        let d = nalgebra::DVector::from_column_slice(input.disp());
        let strokes = j * d;
        assert!((strokes[0] - ctrl.disp()[0]).abs() < TOL);
        assert!((strokes[1] - ctrl.disp()[1]).abs() < TOL);
    }

    #[test]
    fn invalid_dimensions_are_rejected() {
        assert!(TwoActuators2d::new(1.0, 1.0, 0.0, Geometry::Linear, ActuatorSide::Left, 0.0).is_err());
        assert!(TwoActuators2d::new(1.0, -1.0, 1.0, Geometry::Linear, ActuatorSide::Left, 0.0).is_err());
    }
}
