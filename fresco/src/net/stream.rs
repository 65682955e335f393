//! Blocking TCP channel.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use super::{Channel, ChannelError, Endpoint, Role};
use crate::trace::{debug, info};

/// A bound listener that hands out exactly one client.
///
/// Split from [`StreamChannel::open`] so a caller can bind port 0 and
/// publish the assigned address before blocking in [`ServerSocket::accept`].
pub struct ServerSocket {
    listener: TcpListener,
    endpoint: Endpoint,
}

impl ServerSocket {
    /// # Errors
    ///
    /// Returns [`ChannelError::Bind`] if the address cannot be bound.
    pub fn bind(endpoint: Endpoint) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(endpoint.as_socket_addr())
            .map_err(|source| ChannelError::Bind { endpoint, source })?;
        let endpoint = listener
            .local_addr()
            .map_err(|source| ChannelError::Bind { endpoint, source })?
            .into();
        info!(%endpoint, "listening");
        Ok(Self { listener, endpoint })
    }

    /// The bound address, with the port the OS assigned.
    pub const fn local_addr(&self) -> Endpoint {
        self.endpoint
    }

    /// Blocks until one client connects, then drops the listener.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Connect`] if the accept fails.
    pub fn accept(self) -> Result<StreamChannel, ChannelError> {
        let (stream, _) = self.listener.accept().map_err(|source| ChannelError::Connect {
            endpoint: self.endpoint,
            source,
        })?;
        let channel = StreamChannel::from_stream(stream)?;
        info!(peer = ?channel.peer_addr().ok(), "accepted client");
        Ok(channel)
    }
}

/// A [`Channel`] over a blocking TCP stream.
pub struct StreamChannel {
    stream: TcpStream,
    closed: bool,
}

impl StreamChannel {
    /// Opens a channel in the given role.
    ///
    /// A server binds `endpoint` and accepts one client. A client connects
    /// to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Bind`] or [`ChannelError::Connect`].
    pub fn open(role: Role, endpoint: Endpoint) -> Result<Self, ChannelError> {
        match role {
            Role::Server => ServerSocket::bind(endpoint)?.accept(),
            Role::Client => Self::connect(endpoint),
        }
    }

    /// # Errors
    ///
    /// Returns [`ChannelError::Connect`] if the connection is refused.
    pub fn connect(endpoint: Endpoint) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect(endpoint.as_socket_addr())
            .map_err(|source| ChannelError::Connect { endpoint, source })?;
        debug!(%endpoint, "connected");
        Self::from_stream(stream)
    }

    /// Like [`StreamChannel::connect`], giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Connect`] if the connection is refused or
    /// not established in time.
    pub fn connect_timeout(endpoint: Endpoint, timeout: Duration) -> Result<Self, ChannelError> {
        let stream = TcpStream::connect_timeout(&endpoint.as_socket_addr(), timeout)
            .map_err(|source| ChannelError::Connect { endpoint, source })?;
        debug!(%endpoint, "connected");
        Self::from_stream(stream)
    }

    /// Wraps an already connected stream.
    ///
    /// # Errors
    ///
    /// Returns an error if `TCP_NODELAY` cannot be set.
    pub fn from_stream(stream: TcpStream) -> Result<Self, ChannelError> {
        // Records are small and strictly alternating; Nagle would delay every reply.
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            closed: false,
        })
    }

    /// Bounds every blocking receive. `None` waits forever.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the address cannot be read.
    pub fn peer_addr(&self) -> Result<Endpoint, ChannelError> {
        Ok(self.stream.peer_addr()?.into())
    }

    /// Sets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        rustix::net::sockopt::set_socket_send_buffer_size(self.stream.as_fd(), size)?;
        Ok(())
    }

    /// Sets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        rustix::net::sockopt::set_socket_recv_buffer_size(self.stream.as_fd(), size)?;
        Ok(())
    }

    /// Asks for `bytes` of kernel buffer in both directions.
    ///
    /// Returns the effective `(send, recv)` sizes, which the OS may round.
    ///
    /// # Errors
    ///
    /// Returns an error if an option cannot be set or read back.
    pub fn size_buffers(&self, bytes: usize) -> io::Result<(usize, usize)> {
        self.set_send_buffer_size(bytes)?;
        self.set_recv_buffer_size(bytes)?;
        let sizes = (self.send_buffer_size()?, self.recv_buffer_size()?);
        debug!(requested = bytes, send = sizes.0, recv = sizes.1, "socket buffers sized");
        Ok(sizes)
    }

    /// # Errors
    ///
    /// Returns an error if the option cannot be read.
    pub fn send_buffer_size(&self) -> io::Result<usize> {
        Ok(rustix::net::sockopt::socket_send_buffer_size(
            self.stream.as_fd(),
        )?)
    }

    /// # Errors
    ///
    /// Returns an error if the option cannot be read.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(rustix::net::sockopt::socket_recv_buffer_size(
            self.stream.as_fd(),
        )?)
    }

    fn read_timeout(&self) -> Duration {
        self.stream
            .read_timeout()
            .ok()
            .flatten()
            .unwrap_or(Duration::ZERO)
    }
}

impl Channel for StreamChannel {
    fn send(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        match self.stream.write_all(buf) {
            Ok(()) => Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
                ) =>
            {
                Err(ChannelError::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Err(ChannelError::Closed),
                Ok(0) => {
                    return Err(ChannelError::ShortRead {
                        need: buf.len(),
                        have: filled,
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(ChannelError::Timeout(self.read_timeout()));
                }
                Err(e) if e.kind() == ErrorKind::ConnectionReset && filled == 0 => {
                    return Err(ChannelError::Closed);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        self.set_read_timeout(timeout)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }
}

impl AsFd for StreamChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}
