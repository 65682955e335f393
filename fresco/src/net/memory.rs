//! In-process channel pair.
//!
//! Each send moves one chunk across a crossbeam channel. Chunks need not
//! line up with records: the receiver re-splits the byte stream exactly as a
//! socket would.

use std::collections::VecDeque;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};

use super::{Channel, ChannelError, PollChannel};

/// One end of an in-process byte stream.
pub struct MemoryChannel {
    tx: Option<Sender<Vec<u8>>>,
    rx: Receiver<Vec<u8>>,
    inbox: VecDeque<u8>,
    timeout: Option<Duration>,
    closed: bool,
}

impl MemoryChannel {
    /// Two connected ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = unbounded();
        let (b_tx, a_rx) = unbounded();
        (Self::new(a_tx, a_rx), Self::new(b_tx, b_rx))
    }

    fn new(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        Self {
            tx: Some(tx),
            rx,
            inbox: VecDeque::new(),
            timeout: None,
            closed: false,
        }
    }

    /// Bounds every blocking receive.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn take_into(&mut self, buf: &mut [u8]) {
        let n = buf.len();
        for (dst, src) in buf.iter_mut().zip(self.inbox.drain(..n)) {
            *dst = src;
        }
    }

    fn end_of_stream(&self, need: usize) -> ChannelError {
        if self.inbox.is_empty() {
            ChannelError::Closed
        } else {
            ChannelError::ShortRead {
                need,
                have: self.inbox.len(),
            }
        }
    }
}

impl Channel for MemoryChannel {
    fn send(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
        let tx = self.tx.as_ref().ok_or(ChannelError::Closed)?;
        tx.send(buf.to_vec()).map_err(|_| ChannelError::Closed)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        while self.inbox.len() < buf.len() {
            let chunk = match self.timeout {
                Some(t) => match self.rx.recv_timeout(t) {
                    Ok(chunk) => chunk,
                    Err(RecvTimeoutError::Timeout) => return Err(ChannelError::Timeout(t)),
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(self.end_of_stream(buf.len()));
                    }
                },
                None => match self.rx.recv() {
                    Ok(chunk) => chunk,
                    Err(_) => return Err(self.end_of_stream(buf.len())),
                },
            };
            self.inbox.extend(chunk);
        }
        self.take_into(buf);
        Ok(())
    }

    fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        self.timeout = timeout;
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
        self.tx = None;
    }
}

impl PollChannel for MemoryChannel {
    fn try_receive(&mut self, buf: &mut [u8]) -> Result<bool, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        while self.inbox.len() < buf.len() {
            match self.rx.try_recv() {
                Ok(chunk) => self.inbox.extend(chunk),
                Err(TryRecvError::Empty) => return Ok(false),
                Err(TryRecvError::Disconnected) => return Err(self.end_of_stream(buf.len())),
            }
        }
        self.take_into(buf);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::net::Timeout;

    #[test]
    fn records_are_resplit_from_chunks() {
        let (mut a, mut b) = MemoryChannel::pair();
        a.send(&[1, 2, 3]).unwrap();
        a.send(&[4, 5]).unwrap();

        let mut first = [0u8; 4];
        b.receive(&mut first).unwrap();
        assert_eq!(first, [1, 2, 3, 4]);

        let mut second = [0u8; 1];
        b.receive(&mut second).unwrap();
        assert_eq!(second, [5]);
    }

    #[test]
    fn try_receive_reports_would_block() {
        let (mut a, mut b) = MemoryChannel::pair();
        let mut buf = [0u8; 4];
        assert!(!b.try_receive(&mut buf).unwrap());

        a.send(&[7, 7]).unwrap();
        assert!(!b.try_receive(&mut buf).unwrap());
        a.send(&[7, 7]).unwrap();
        assert!(b.try_receive(&mut buf).unwrap());
        assert_eq!(buf, [7; 4]);
    }

    #[test]
    fn receive_timeout_expires() {
        let (_a, mut b) = MemoryChannel::pair();
        let mut buf = [0u8; 4];
        assert!(matches!(
            b.receive_timeout(&mut buf, Timeout::Duration(Duration::from_millis(10))),
            Err(ChannelError::Timeout(_))
        ));

        let (_c, d) = MemoryChannel::pair();
        let mut d = d.with_timeout(Duration::from_millis(10));
        assert!(matches!(d.receive(&mut buf), Err(ChannelError::Timeout(_))));
    }

    #[test]
    fn dropped_peer_is_closed_or_short_read() {
        let (mut a, mut b) = MemoryChannel::pair();
        a.send(&[1, 2]).unwrap();
        drop(a);

        let mut buf = [0u8; 4];
        assert!(matches!(
            b.receive(&mut buf),
            Err(ChannelError::ShortRead { need: 4, have: 2 })
        ));

        let (c, mut d) = MemoryChannel::pair();
        drop(c);
        assert!(matches!(d.receive(&mut buf), Err(ChannelError::Closed)));
        assert!(matches!(d.send(&buf), Err(ChannelError::Closed)));
    }

    #[test]
    fn ends_work_across_threads() {
        let (mut a, mut b) = MemoryChannel::pair();
        let echo = thread::spawn(move || {
            let mut buf = [0u8; 3];
            b.receive(&mut buf).unwrap();
            b.send(&buf).unwrap();
        });
        a.send(b"abc").unwrap();
        let mut buf = [0u8; 3];
        a.receive(&mut buf).unwrap();
        assert_eq!(&buf, b"abc");
        echo.join().unwrap();
    }
}
