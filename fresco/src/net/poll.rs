//! Non-blocking TCP channel driven by mio.
//!
//! Used where the caller owns the loop, e.g. a real-time task that must
//! check for a reply between control ticks. A record may arrive in pieces;
//! the channel stages partial bytes until the record is complete.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener};
use std::time::Duration;

use minstant::Instant;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};

use super::{Channel, ChannelError, Endpoint, PollChannel, Role, Timeout};
use crate::trace::{debug, trace};

const STREAM: Token = Token(0);

/// A [`PollChannel`] over a non-blocking mio stream.
pub struct PollingChannel {
    stream: TcpStream,
    poll: Poll,
    events: Events,
    /// Bytes of the record being received.
    staged: Vec<u8>,
    filled: usize,
    timeout: Option<Duration>,
    closed: bool,
}

impl PollingChannel {
    /// Opens a channel in the given role.
    ///
    /// Connection setup blocks; only the exchange afterwards is
    /// non-blocking.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Bind`] or [`ChannelError::Connect`].
    pub fn open(role: Role, endpoint: Endpoint) -> Result<Self, ChannelError> {
        let stream = match role {
            Role::Server => {
                let listener = TcpListener::bind(endpoint.as_socket_addr())
                    .map_err(|source| ChannelError::Bind { endpoint, source })?;
                let (stream, _) = listener
                    .accept()
                    .map_err(|source| ChannelError::Connect { endpoint, source })?;
                stream
            }
            Role::Client => std::net::TcpStream::connect(endpoint.as_socket_addr())
                .map_err(|source| ChannelError::Connect { endpoint, source })?,
        };
        Self::from_std(stream)
    }

    /// Wraps a connected std stream, switching it to non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be configured or registered.
    pub fn from_std(stream: std::net::TcpStream) -> Result<Self, ChannelError> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let mut stream = TcpStream::from_std(stream);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, STREAM, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self {
            stream,
            poll,
            events: Events::with_capacity(8),
            staged: Vec::new(),
            filled: 0,
            timeout: None,
            closed: false,
        })
    }

    /// Bytes of a partially received record.
    pub const fn pending(&self) -> usize {
        self.filled
    }

    /// Waits for a readiness event. Returns `false` if `timeout` elapsed.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => return Ok(!self.events.is_empty()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

impl Channel for PollingChannel {
    fn send(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let mut sent = 0;
        while sent < buf.len() {
            match self.stream.write(&buf[sent..]) {
                Ok(0) => return Err(ChannelError::Closed),
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    trace!(sent, total = buf.len(), "send blocked");
                    self.wait(None)?;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::BrokenPipe
                            | ErrorKind::ConnectionReset
                            | ErrorKind::ConnectionAborted
                    ) =>
                {
                    return Err(ChannelError::Closed);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        if let Some(limit) = self.timeout {
            return self.receive_timeout(buf, Timeout::Duration(limit));
        }
        loop {
            if self.try_receive(buf)? {
                return Ok(());
            }
            self.wait(None)?;
        }
    }

    fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        self.timeout = timeout;
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.poll.registry().deregister(&mut self.stream);
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

impl PollChannel for PollingChannel {
    fn try_receive(&mut self, buf: &mut [u8]) -> Result<bool, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        if self.filled > 0 && self.staged.len() != buf.len() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "record length changed while a record was partially received",
            )
            .into());
        }
        self.staged.resize(buf.len(), 0);

        while self.filled < buf.len() {
            match self.stream.read(&mut self.staged[self.filled..]) {
                Ok(0) if self.filled == 0 => return Err(ChannelError::Closed),
                Ok(0) => {
                    return Err(ChannelError::ShortRead {
                        need: buf.len(),
                        have: self.filled,
                    });
                }
                Ok(n) => self.filled += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        buf.copy_from_slice(&self.staged);
        self.filled = 0;
        Ok(true)
    }

    fn receive_timeout(&mut self, buf: &mut [u8], timeout: Timeout) -> Result<(), ChannelError> {
        let Timeout::Duration(limit) = timeout else {
            loop {
                if self.try_receive(buf)? {
                    return Ok(());
                }
                self.wait(None)?;
            }
        };
        let deadline = Instant::now() + limit;
        loop {
            if self.try_receive(buf)? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(pending = self.filled, ?limit, "receive timed out");
                return Err(ChannelError::Timeout(limit));
            }
            self.wait(Some(deadline - now))?;
        }
    }
}
