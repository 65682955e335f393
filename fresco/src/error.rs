//! Crate-wide error type.
//!
//! Module-level errors ([`ChannelError`], [`CodecError`], [`CatalogError`],
//! [`ConfigError`]) fold into [`Error`]. Nothing in the crate retries: a
//! partially delivered command cannot be replayed against hardware, so every
//! failure propagates to the caller.

use thiserror::Error;

use crate::catalog::{CatalogError, LimitViolation};
use crate::config::ConfigError;
use crate::control::state::{Operation, SessionState};
use crate::net::ChannelError;
use crate::protocol::{CodecError, RemoteFault};
use crate::response::{SizeRole, SizeVector};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The channel could not be opened or accepted.
    #[error("connection failed: {0}")]
    Connection(#[source] ChannelError),
    /// The channel failed during a session.
    #[error("channel error: {0}")]
    Channel(#[source] ChannelError),
    /// A record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("{role} size mismatch: expected {expected}, got {actual}")]
    SizeMismatch {
        role: SizeRole,
        expected: SizeVector,
        actual: SizeVector,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(LimitViolation),
    #[error("session closed")]
    SessionClosed,
    #[error("{op} is not allowed while the session is {state}")]
    InvalidState { state: SessionState, op: Operation },
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The remote side answered `failed`.
    #[error("remote site failed: {0}")]
    Remote(RemoteFault),
    #[error("timed out waiting for the controller")]
    Timeout,
    #[error("geometry error: {0}")]
    Geometry(&'static str),
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("negotiated record needs {need} doubles, payload cap is {cap}")]
    PayloadTooLarge { need: usize, cap: usize },
    #[error("{0} is not configured")]
    NotConfigured(&'static str),
    /// The last trial was refused; nothing can be read or committed until
    /// another trial is accepted.
    #[error("last trial was rejected")]
    TrialRejected,
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// True for errors that leave the transport unusable.
    ///
    /// A session that hits one of these moves to the failed state.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Channel(_) | Self::Codec(_) | Self::Protocol(_)
        )
    }
}

impl From<ChannelError> for Error {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Connect { .. } | ChannelError::Bind { .. } => Self::Connection(e),
            other => Self::Channel(other),
        }
    }
}
