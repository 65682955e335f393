//! Opcodes and return codes.

use std::fmt;

use super::CodecError;
use crate::response::{MatrixKind, ResponseType};

/// Version stamped into every `open` request.
///
/// Version 2 orders `commitState` before `getDaqResponse` (5 and 6).
pub const PROTOCOL_VERSION: u32 = 2;

/// Earlier numbering that swaps `commitState` and `getDaqResponse`.
///
/// Peers announcing it are refused at `open`; its records are never decoded.
pub const LEGACY_PROTOCOL_VERSION: u32 = 1;

/// Legacy codes, kept for diagnostics only.
pub mod legacy {
    pub const GET_DAQ_RESPONSE: i32 = 5;
    pub const COMMIT_STATE: i32 = 6;
}

/// Request codes, protocol version 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Opcode {
    Open = 1,
    Setup = 2,
    SetTrialResponse = 3,
    Execute = 4,
    CommitState = 5,
    GetDaqResponse = 6,
    GetDisp = 7,
    GetVel = 8,
    GetAccel = 9,
    GetForce = 10,
    GetTime = 11,
    GetInitialStiff = 12,
    GetTangentStiff = 13,
    GetDamp = 14,
    GetMass = 15,
    /// Reserved. Actors answer it with an unsupported fault.
    Acquire = 50,
    Shutdown = 98,
    Die = 99,
}

impl Opcode {
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// The response type returned by a single-vector getter.
    #[must_use]
    pub const fn response_type(self) -> Option<ResponseType> {
        match self {
            Self::GetDisp => Some(ResponseType::Disp),
            Self::GetVel => Some(ResponseType::Vel),
            Self::GetAccel => Some(ResponseType::Accel),
            Self::GetForce => Some(ResponseType::Force),
            Self::GetTime => Some(ResponseType::Time),
            _ => None,
        }
    }

    /// Getter opcode for one response type.
    #[must_use]
    pub const fn getter(ty: ResponseType) -> Self {
        match ty {
            ResponseType::Disp => Self::GetDisp,
            ResponseType::Vel => Self::GetVel,
            ResponseType::Accel => Self::GetAccel,
            ResponseType::Force => Self::GetForce,
            ResponseType::Time => Self::GetTime,
        }
    }

    #[must_use]
    pub const fn matrix_kind(self) -> Option<MatrixKind> {
        match self {
            Self::GetInitialStiff => Some(MatrixKind::InitialStiffness),
            Self::GetTangentStiff => Some(MatrixKind::TangentStiffness),
            Self::GetDamp => Some(MatrixKind::Damping),
            Self::GetMass => Some(MatrixKind::Mass),
            _ => None,
        }
    }

    #[must_use]
    pub const fn for_matrix(kind: MatrixKind) -> Self {
        match kind {
            MatrixKind::InitialStiffness => Self::GetInitialStiff,
            MatrixKind::TangentStiffness => Self::GetTangentStiff,
            MatrixKind::Damping => Self::GetDamp,
            MatrixKind::Mass => Self::GetMass,
        }
    }
}

impl TryFrom<i32> for Opcode {
    type Error = CodecError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => Self::Open,
            2 => Self::Setup,
            3 => Self::SetTrialResponse,
            4 => Self::Execute,
            5 => Self::CommitState,
            6 => Self::GetDaqResponse,
            7 => Self::GetDisp,
            8 => Self::GetVel,
            9 => Self::GetAccel,
            10 => Self::GetForce,
            11 => Self::GetTime,
            12 => Self::GetInitialStiff,
            13 => Self::GetTangentStiff,
            14 => Self::GetDamp,
            15 => Self::GetMass,
            50 => Self::Acquire,
            98 => Self::Shutdown,
            99 => Self::Die,
            other => return Err(CodecError::UnknownOpcode(other)),
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({})", self.code())
    }
}

/// Status codes carried by replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ReturnCode {
    Completed = 0,
    Failed = -1,
    Ready = 2,
    Accepted = 3,
    Received = 4,
    Started = 5,
}

impl ReturnCode {
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for ReturnCode {
    type Error = CodecError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => Self::Completed,
            -1 => Self::Failed,
            2 => Self::Ready,
            3 => Self::Accepted,
            4 => Self::Received,
            5 => Self::Started,
            other => return Err(CodecError::UnknownReturnCode(other)),
        })
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}({})", self.code())
    }
}
