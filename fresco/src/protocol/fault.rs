//! Fault records carried by `failed` replies.
//!
//! When a request fails on the actor, the reply code is
//! [`ReturnCode::Failed`](super::ReturnCode::Failed) and the payload starts
//! with a fault kind followed by its details. The shadow turns it back into
//! the matching [`Error`] so callers see the same error either way.

use std::fmt;

use super::PROTOCOL_VERSION;
use crate::catalog::{Direction, LimitViolation};
use crate::error::Error;
use crate::response::{ResponseType, SizeRole, SizeVector};

mod kind {
    pub const SIZE_MISMATCH: i32 = 1;
    pub const LIMIT_EXCEEDED: i32 = 2;
    pub const INVALID_STATE: i32 = 3;
    pub const SESSION_CLOSED: i32 = 4;
    pub const TIMEOUT: i32 = 5;
    pub const HARDWARE: i32 = 6;
    pub const GEOMETRY: i32 = 7;
    pub const UNSUPPORTED: i32 = 8;
    pub const VERSION_MISMATCH: i32 = 9;
    pub const PROTOCOL: i32 = 10;
    pub const OTHER: i32 = 99;
}

/// Why the actor answered `failed`.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteFault {
    SizeMismatch {
        role: SizeRole,
        expected: SizeVector,
        actual: SizeVector,
    },
    LimitExceeded(LimitViolation),
    InvalidState,
    SessionClosed,
    Timeout,
    Hardware,
    Geometry,
    /// The actor does not implement the request.
    Unsupported { code: i32 },
    /// The actor speaks another protocol version.
    VersionMismatch { supported: u32 },
    Protocol,
    Other,
}

impl RemoteFault {
    /// Classifies an actor-side error for the wire.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::SizeMismatch {
                role,
                expected,
                actual,
            } => Self::SizeMismatch {
                role: *role,
                expected: *expected,
                actual: *actual,
            },
            Error::LimitExceeded(v) => Self::LimitExceeded(v.clone()),
            Error::InvalidState { .. } | Error::NotConfigured(_) | Error::TrialRejected => {
                Self::InvalidState
            }
            Error::SessionClosed => Self::SessionClosed,
            Error::Timeout => Self::Timeout,
            Error::Hardware(_) => Self::Hardware,
            Error::Geometry(_) => Self::Geometry,
            Error::VersionMismatch { local, .. } => Self::VersionMismatch { supported: *local },
            Error::Remote(fault) => fault.clone(),
            Error::Protocol(_) | Error::Codec(_) | Error::PayloadTooLarge { .. } => Self::Protocol,
            _ => Self::Other,
        }
    }

    /// Turns the fault into the error the shadow reports.
    #[must_use]
    pub fn into_error(self) -> Error {
        match self {
            Self::SizeMismatch {
                role,
                expected,
                actual,
            } => Error::SizeMismatch {
                role,
                expected,
                actual,
            },
            Self::LimitExceeded(v) => Error::LimitExceeded(v),
            Self::VersionMismatch { supported } => Error::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: supported,
            },
            Self::SessionClosed => Error::SessionClosed,
            other => Error::Remote(other),
        }
    }

    /// Appends the fault record to `out`.
    pub fn encode(&self, out: &mut Vec<f64>) {
        out.clear();
        match self {
            Self::SizeMismatch {
                role,
                expected,
                actual,
            } => {
                out.push(f64::from(kind::SIZE_MISMATCH));
                out.push(f64::from(role.code()));
                out.extend_from_slice(&expected.to_wire());
                out.extend_from_slice(&actual.to_wire());
            }
            Self::LimitExceeded(v) => {
                out.extend_from_slice(&[
                    f64::from(kind::LIMIT_EXCEEDED),
                    f64::from(v.node),
                    f64::from(v.direction.code()),
                    v.response.index() as f64,
                    v.index as f64,
                    v.value,
                    v.lower,
                    v.upper,
                ]);
            }
            Self::InvalidState => out.push(f64::from(kind::INVALID_STATE)),
            Self::SessionClosed => out.push(f64::from(kind::SESSION_CLOSED)),
            Self::Timeout => out.push(f64::from(kind::TIMEOUT)),
            Self::Hardware => out.push(f64::from(kind::HARDWARE)),
            Self::Geometry => out.push(f64::from(kind::GEOMETRY)),
            Self::Unsupported { code } => {
                out.extend_from_slice(&[f64::from(kind::UNSUPPORTED), f64::from(*code)]);
            }
            Self::VersionMismatch { supported } => {
                out.extend_from_slice(&[f64::from(kind::VERSION_MISMATCH), f64::from(*supported)]);
            }
            Self::Protocol => out.push(f64::from(kind::PROTOCOL)),
            Self::Other => out.push(f64::from(kind::OTHER)),
        }
    }

    /// Parses a fault record. Unknown or damaged records decode as `Other`.
    #[must_use]
    pub fn decode(payload: &[f64]) -> Self {
        let Some((&k, rest)) = payload.split_first() else {
            return Self::Other;
        };
        if k.fract() != 0.0 || !k.is_finite() {
            return Self::Other;
        }
        let at = |i: usize| rest.get(i).copied().unwrap_or(0.0);
        match k as i32 {
            kind::SIZE_MISMATCH => {
                let n = ResponseType::COUNT;
                let sizes = |from: usize| {
                    rest.get(from..from + n)
                        .and_then(|v| SizeVector::from_wire(v, usize::MAX).ok())
                };
                match (sizes(1), sizes(1 + n)) {
                    (Some(expected), Some(actual)) => Self::SizeMismatch {
                        role: SizeRole::from_code(at(0) as u8),
                        expected,
                        actual,
                    },
                    _ => Self::Other,
                }
            }
            kind::LIMIT_EXCEEDED => {
                let direction = Direction::from_code(at(1) as i32);
                let response = ResponseType::from_index(at(2) as usize);
                match (direction, response) {
                    (Some(direction), Some(response)) => Self::LimitExceeded(LimitViolation {
                        node: at(0) as u32,
                        direction,
                        response,
                        index: at(3) as usize,
                        value: at(4),
                        lower: at(5),
                        upper: at(6),
                    }),
                    _ => Self::Other,
                }
            }
            kind::INVALID_STATE => Self::InvalidState,
            kind::SESSION_CLOSED => Self::SessionClosed,
            kind::TIMEOUT => Self::Timeout,
            kind::HARDWARE => Self::Hardware,
            kind::GEOMETRY => Self::Geometry,
            kind::UNSUPPORTED => Self::Unsupported { code: at(0) as i32 },
            kind::VERSION_MISMATCH => Self::VersionMismatch {
                supported: at(0) as u32,
            },
            kind::PROTOCOL => Self::Protocol,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeMismatch {
                role,
                expected,
                actual,
            } => write!(f, "{role} size mismatch: expected {expected}, got {actual}"),
            Self::LimitExceeded(v) => write!(f, "limit exceeded: {v}"),
            Self::InvalidState => f.write_str("request not allowed in the current state"),
            Self::SessionClosed => f.write_str("session closed"),
            Self::Timeout => f.write_str("controller timed out"),
            Self::Hardware => f.write_str("hardware error"),
            Self::Geometry => f.write_str("geometry error"),
            Self::Unsupported { code } => write!(f, "unsupported request {code}"),
            Self::VersionMismatch { supported } => {
                write!(f, "actor supports protocol version {supported}")
            }
            Self::Protocol => f.write_str("protocol violation"),
            Self::Other => f.write_str("unspecified failure"),
        }
    }
}
