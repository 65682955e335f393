//! Transport channels between a shadow and its actor.
//!
//! A [`Channel`] is a reliable, ordered byte stream carrying whole records.
//! [`StreamChannel`] blocks on a TCP stream, [`PollingChannel`] drives a
//! non-blocking mio stream with an explicit would-block indicator, and
//! [`MemoryChannel`] connects two ends inside one process.

pub mod endpoint;
pub mod memory;
pub mod poll;
pub mod stream;

use std::io;
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

pub use endpoint::Endpoint;
pub use memory::MemoryChannel;
pub use poll::PollingChannel;
pub use stream::{ServerSocket, StreamChannel};

/// Errors from channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The peer closed the channel before sending anything.
    #[error("channel closed by peer")]
    Closed,
    /// The peer closed the channel in the middle of a record.
    #[error("short read: need {need} bytes, have {have}")]
    ShortRead { need: usize, have: usize },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Timeout for waiting receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timeout {
    /// Wait indefinitely.
    #[default]
    Infinite,
    /// Wait for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Which end of a channel opens the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Binds and accepts exactly one client.
    Server,
    /// Connects to a listening server.
    Client,
}

/// A reliable byte stream carrying whole records.
pub trait Channel: Send {
    /// Writes all of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the peer is gone.
    fn send(&mut self, buf: &[u8]) -> Result<(), ChannelError>;

    /// Fills `buf` completely, blocking as needed.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the peer closed before the first
    /// byte and [`ChannelError::ShortRead`] if it closed mid-record. A short
    /// record is never returned as success.
    fn receive(&mut self, buf: &mut [u8]) -> Result<(), ChannelError>;

    /// Bounds every later [`Channel::receive`]. `None` waits forever.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying transport rejects the timeout.
    fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError>;

    /// Closes the channel. Later calls fail with [`ChannelError::Closed`].
    fn close(&mut self);
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn send(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
        (**self).send(buf)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        (**self).receive(buf)
    }

    fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        (**self).set_receive_timeout(timeout)
    }

    fn close(&mut self) {
        (**self).close();
    }
}

/// A channel that can be checked without blocking.
pub trait PollChannel: Channel {
    /// Tries to complete one record in `buf`.
    ///
    /// Returns `Ok(false)` when the record is not complete yet. Bytes
    /// received so far are kept by the channel, so the next call continues
    /// where this one stopped. `buf` must have the same length on every call
    /// until one returns `Ok(true)`.
    ///
    /// # Errors
    ///
    /// Same as [`Channel::receive`].
    fn try_receive(&mut self, buf: &mut [u8]) -> Result<bool, ChannelError>;

    /// Retries [`PollChannel::try_receive`] until the record is complete or
    /// `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Timeout`] when the deadline passes.
    fn receive_timeout(&mut self, buf: &mut [u8], timeout: Timeout) -> Result<(), ChannelError> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some((Instant::now() + d, d)),
        };
        loop {
            if self.try_receive(buf)? {
                return Ok(());
            }
            if let Some((at, d)) = deadline
                && Instant::now() >= at
            {
                return Err(ChannelError::Timeout(d));
            }
            std::thread::yield_now();
        }
    }
}
