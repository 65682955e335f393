//! Control-point catalog.
//!
//! A control point names one physical command or measurement channel by
//! (node, direction, response type). The catalog assigns each declared point
//! a slot in the vector of its response type, in declaration order. Those
//! slots are what the per-type size vectors count.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::response::{Response, ResponseType, SizeVector};

/// Degree of freedom a control point acts along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    X,
    Y,
    Z,
    Rx,
    Ry,
    Rz,
    None,
}

impl Direction {
    /// Wire value.
    pub const fn code(self) -> i32 {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Z => 2,
            Self::Rx => 3,
            Self::Ry => 4,
            Self::Rz => 5,
            Self::None => 99,
        }
    }

    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::X),
            1 => Some(Self::Y),
            2 => Some(Self::Z),
            3 => Some(Self::Rx),
            4 => Some(Self::Ry),
            5 => Some(Self::Rz),
            99 => Some(Self::None),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::X => "x",
            Self::Y => "y",
            Self::Z => "z",
            Self::Rx => "rx",
            Self::Ry => "ry",
            Self::Rz => "rz",
            Self::None => "none",
        };
        f.write_str(name)
    }
}

/// Safe range of a control point.
///
/// Invariant: `lower <= upper`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    lower: f64,
    upper: f64,
}

impl Limits {
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidLimits`] if a bound is NaN or
    /// `lower > upper`.
    pub fn new(lower: f64, upper: f64) -> Result<Self, CatalogError> {
        if lower.is_nan() || upper.is_nan() || lower > upper {
            return Err(CatalogError::InvalidLimits { lower, upper });
        }
        Ok(Self { lower, upper })
    }

    pub const fn lower(&self) -> f64 {
        self.lower
    }

    pub const fn upper(&self) -> f64 {
        self.upper
    }

    /// True if `value` lies in `[lower, upper]`. NaN is never contained.
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// One declared command or measurement channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlPoint {
    node: u32,
    direction: Direction,
    response: ResponseType,
    factor: f64,
    limits: Option<Limits>,
}

impl ControlPoint {
    pub const fn node(&self) -> u32 {
        self.node
    }

    pub const fn direction(&self) -> Direction {
        self.direction
    }

    pub const fn response(&self) -> ResponseType {
        self.response
    }

    /// Scale applied to this channel's value in apparatus units.
    pub const fn factor(&self) -> f64 {
        self.factor
    }

    pub const fn limits(&self) -> Option<Limits> {
        self.limits
    }
}

/// Handle returned by [`ControlPointCatalog::declare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpHandle(usize);

impl fmt::Display for CpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cp#{}", self.0)
    }
}

/// A value outside a control point's limits.
#[derive(Debug, Clone, PartialEq)]
pub struct LimitViolation {
    pub node: u32,
    pub direction: Direction,
    pub response: ResponseType,
    /// Slot within the response type's vector.
    pub index: usize,
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
}

impl fmt::Display for LimitViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {} {} {}[{}] = {} outside [{}, {}]",
            self.node,
            self.direction,
            self.response,
            self.index,
            self.value,
            self.lower,
            self.upper
        )
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CatalogError {
    #[error("control point node {node} {direction} {response} declared twice")]
    Duplicate {
        node: u32,
        direction: Direction,
        response: ResponseType,
    },
    #[error("invalid limits [{lower}, {upper}]")]
    InvalidLimits { lower: f64, upper: f64 },
    #[error("invalid factor {0}")]
    InvalidFactor(f64),
}

/// Ordered set of control points owned by one setup.
#[derive(Debug, Clone, Default)]
pub struct ControlPointCatalog {
    points: Vec<ControlPoint>,
    /// Slot of each point within its response type's vector.
    slots: Vec<usize>,
    sizes: SizeVector,
}

impl ControlPointCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a control point and returns its handle.
    ///
    /// Points of the same response type occupy consecutive slots in
    /// declaration order.
    ///
    /// # Errors
    ///
    /// Fails if the same (node, direction, response) was already declared
    /// or the factor is zero or not finite.
    pub fn declare(
        &mut self,
        node: u32,
        direction: Direction,
        response: ResponseType,
        factor: f64,
        limits: Option<Limits>,
    ) -> Result<CpHandle, CatalogError> {
        if !factor.is_finite() || factor == 0.0 {
            return Err(CatalogError::InvalidFactor(factor));
        }
        let taken = self
            .points
            .iter()
            .any(|p| p.node == node && p.direction == direction && p.response == response);
        if taken {
            return Err(CatalogError::Duplicate {
                node,
                direction,
                response,
            });
        }

        let slot = self.sizes.get(response);
        self.sizes.set(response, slot + 1);
        self.slots.push(slot);
        self.points.push(ControlPoint {
            node,
            direction,
            response,
            factor,
            limits,
        });
        Ok(CpHandle(self.points.len() - 1))
    }

    /// Response type and slot of a declared point.
    #[must_use]
    pub fn resolve(&self, handle: CpHandle) -> Option<(ResponseType, usize)> {
        let point = self.points.get(handle.0)?;
        Some((point.response, self.slots[handle.0]))
    }

    #[must_use]
    pub fn get(&self, handle: CpHandle) -> Option<&ControlPoint> {
        self.points.get(handle.0)
    }

    /// Points per response type.
    #[must_use]
    pub const fn sizes(&self) -> SizeVector {
        self.sizes
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Iterates points with their slots, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&ControlPoint, usize)> {
        self.points.iter().zip(self.slots.iter().copied())
    }

    /// Multiplies every active slot by its point's factor.
    ///
    /// Slots of response types that are empty in `response` are skipped.
    pub fn apply_factors(&self, response: &mut Response) {
        for (point, slot) in self.iter() {
            if let Some(v) = response.get_mut(point.response).get_mut(slot) {
                *v *= point.factor;
            }
        }
    }

    /// Checks every active slot against its point's limits.
    ///
    /// Values are never clamped.
    ///
    /// # Errors
    ///
    /// Returns the first violation in declaration order.
    pub fn check_limits(&self, response: &Response) -> Result<(), LimitViolation> {
        for (point, slot) in self.iter() {
            let (Some(limits), Some(&value)) = (point.limits, response.get(point.response).get(slot))
            else {
                continue;
            };
            if !limits.contains(value) {
                return Err(LimitViolation {
                    node: point.node,
                    direction: point.direction,
                    response: point.response,
                    index: slot,
                    value,
                    lower: limits.lower,
                    upper: limits.upper,
                });
            }
        }
        Ok(())
    }
}
