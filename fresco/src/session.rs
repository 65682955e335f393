//! One shadow/actor session over a channel.
//!
//! A [`Session`] owns the channel, the current [`RecordLayout`] and every
//! buffer used to encode and decode records. Nothing is shared between
//! sessions, so independent sessions can run on separate threads.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::net::Channel;
use crate::protocol::{
    DEFAULT_PAYLOAD_CAP, MIN_PAYLOAD_LEN, Opcode, RecordLayout, RemoteFault, ReturnCode,
    decode_record, encode_record,
};
use crate::trace::trace;

/// Session settings shared by actors and shadows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Largest `data_size` this side accepts, in doubles.
    pub payload_cap: usize,
    /// Bound on every blocking receive. `None` waits forever.
    pub receive_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            payload_cap: DEFAULT_PAYLOAD_CAP,
            receive_timeout: None,
        }
    }
}

/// A decoded reply, borrowing the session's receive buffer.
#[derive(Debug)]
pub struct Reply<'a> {
    pub code: ReturnCode,
    pub payload: &'a [f64],
}

impl<'a> Reply<'a> {
    /// Returns the payload if the reply carries `expected`.
    ///
    /// # Errors
    ///
    /// A `failed` reply becomes the error its fault record describes. Any
    /// other unexpected code is [`Error::Protocol`].
    pub fn expect(self, expected: ReturnCode) -> Result<&'a [f64]> {
        match self.code {
            code if code == expected => Ok(self.payload),
            ReturnCode::Failed => Err(RemoteFault::decode(self.payload).into_error()),
            code => Err(Error::Protocol(format!(
                "expected {expected} reply, got {code}"
            ))),
        }
    }
}

/// Channel plus per-session record state.
pub struct Session<C> {
    channel: C,
    layout: RecordLayout,
    frozen: bool,
    payload_cap: usize,
    tx_buf: Vec<u8>,
    rx_buf: Vec<u8>,
    payload: Vec<f64>,
    fault: Vec<f64>,
}

impl<C: Channel> Session<C> {
    /// Starts a session on the handshake layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the receive timeout cannot be applied, or if
    /// `payload_cap` is below the smallest usable payload.
    pub fn new(mut channel: C, config: &SessionConfig) -> Result<Self> {
        if config.payload_cap < MIN_PAYLOAD_LEN {
            return Err(Error::PayloadTooLarge {
                need: MIN_PAYLOAD_LEN,
                cap: config.payload_cap,
            });
        }
        channel.set_receive_timeout(config.receive_timeout)?;
        Ok(Self {
            channel,
            layout: RecordLayout::HANDSHAKE,
            frozen: false,
            payload_cap: config.payload_cap,
            tx_buf: Vec::with_capacity(RecordLayout::HANDSHAKE.record_len()),
            rx_buf: Vec::with_capacity(RecordLayout::HANDSHAKE.record_len()),
            payload: Vec::with_capacity(RecordLayout::HANDSHAKE.payload_len()),
            fault: Vec::new(),
        })
    }

    pub const fn layout(&self) -> RecordLayout {
        self.layout
    }

    pub const fn payload_cap(&self) -> usize {
        self.payload_cap
    }

    /// True once `setup` fixed the layout.
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Switches to the negotiated layout. Happens once per session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PayloadTooLarge`] if `data_size` exceeds the cap and
    /// [`Error::Protocol`] if it is too small or the layout is already
    /// frozen.
    pub fn freeze(&mut self, data_size: usize) -> Result<()> {
        if self.frozen {
            return Err(Error::Protocol("record layout already negotiated".into()));
        }
        if data_size < MIN_PAYLOAD_LEN {
            return Err(Error::Protocol(format!(
                "data size {data_size} below minimum {MIN_PAYLOAD_LEN}"
            )));
        }
        if data_size > self.payload_cap {
            return Err(Error::PayloadTooLarge {
                need: data_size,
                cap: self.payload_cap,
            });
        }
        self.layout = RecordLayout::new(data_size);
        self.frozen = true;
        trace!(data_size, "record layout frozen");
        Ok(())
    }

    /// Sends one record.
    ///
    /// # Errors
    ///
    /// Fails if the vectors overflow the layout or the channel fails.
    pub fn send(&mut self, code: i32, vectors: &[&[f64]]) -> Result<()> {
        encode_record(code, vectors, self.layout, &mut self.tx_buf)?;
        self.channel.send(&self.tx_buf)?;
        trace!(code, bytes = self.tx_buf.len(), "sent record");
        Ok(())
    }

    /// Sends a `failed` reply carrying `fault`.
    ///
    /// # Errors
    ///
    /// Fails if the channel fails.
    pub fn send_fault(&mut self, fault: &RemoteFault) -> Result<()> {
        fault.encode(&mut self.fault);
        encode_record(
            ReturnCode::Failed.code(),
            &[&self.fault],
            self.layout,
            &mut self.tx_buf,
        )?;
        self.channel.send(&self.tx_buf)?;
        trace!(%fault, "sent fault");
        Ok(())
    }

    /// Receives one record of the current layout.
    ///
    /// # Errors
    ///
    /// Fails on a channel error or a record of the wrong length.
    pub fn receive(&mut self) -> Result<(i32, &[f64])> {
        self.rx_buf.resize(self.layout.record_len(), 0);
        self.channel.receive(&mut self.rx_buf)?;
        let code = decode_record(&self.rx_buf, self.layout, &mut self.payload)?;
        trace!(code, "received record");
        Ok((code, &self.payload))
    }

    /// Sends a request and waits for its one reply.
    ///
    /// # Errors
    ///
    /// Fails on channel and codec errors, or if the reply code is unknown.
    pub fn request(&mut self, op: Opcode, vectors: &[&[f64]]) -> Result<Reply<'_>> {
        self.send(op.code(), vectors)?;
        let (code, payload) = self.receive()?;
        let code = ReturnCode::try_from(code)?;
        Ok(Reply { code, payload })
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn close(&mut self) {
        self.channel.close();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::net::{ChannelError, MemoryChannel};
    use crate::protocol::RecordLayout;

    fn pair() -> (Session<MemoryChannel>, Session<MemoryChannel>) {
        let (a, b) = MemoryChannel::pair();
        let config = SessionConfig::default();
        (
            Session::new(a, &config).unwrap(),
            Session::new(b, &config).unwrap(),
        )
    }

    #[test]
    fn request_gets_one_reply() {
        let (mut shadow, mut actor) = pair();
        let server = thread::spawn(move || {
            let (code, payload) = actor.receive().unwrap();
            assert_eq!(code, Opcode::SetTrialResponse.code());
            assert_eq!(&payload[..2], &[0.5, -0.5]);
            actor.send(ReturnCode::Completed.code(), &[]).unwrap();
        });

        let reply = shadow
            .request(Opcode::SetTrialResponse, &[&[0.5], &[-0.5]])
            .unwrap();
        assert_eq!(reply.code, ReturnCode::Completed);
        server.join().unwrap();
    }

    #[test]
    fn failed_reply_maps_back_to_error() {
        let (mut shadow, mut actor) = pair();
        let server = thread::spawn(move || {
            actor.receive().unwrap();
            actor.send_fault(&RemoteFault::SessionClosed).unwrap();
        });

        let err = shadow
            .request(Opcode::CommitState, &[])
            .and_then(|r| r.expect(ReturnCode::Completed).map(|_| ()))
            .unwrap_err();
        assert!(matches!(err, Error::SessionClosed));
        server.join().unwrap();
    }

    #[test]
    fn freeze_checks_bounds_once() {
        let (mut session, _) = pair();
        assert!(matches!(session.freeze(4), Err(Error::Protocol(_))));
        assert!(matches!(
            session.freeze(DEFAULT_PAYLOAD_CAP + 1),
            Err(Error::PayloadTooLarge { .. })
        ));
        assert!(!session.is_frozen());

        session.freeze(20).unwrap();
        assert_eq!(session.layout(), RecordLayout::new(20));
        assert!(matches!(session.freeze(20), Err(Error::Protocol(_))));
    }

    #[test]
    fn cap_below_minimum_is_rejected() {
        let (a, _b) = MemoryChannel::pair();
        let config = SessionConfig {
            payload_cap: 4,
            ..SessionConfig::default()
        };
        assert!(Session::new(a, &config).is_err());
    }

    #[test]
    fn truncated_record_is_short_read() {
        let (a, mut b) = MemoryChannel::pair();
        let mut session = Session::new(a, &SessionConfig::default()).unwrap();
        b.send(&[0u8; 10]).unwrap();
        drop(b);

        assert!(matches!(
            session.receive(),
            Err(Error::Channel(ChannelError::ShortRead { have: 10, .. }))
        ));
    }

    #[test]
    fn oversized_request_is_rejected_before_sending() {
        let (mut session, _peer) = pair();
        let big = [0.0; 13];
        assert!(matches!(
            session.request(Opcode::SetTrialResponse, &[&big]),
            Err(Error::Codec(_))
        ));
    }
}
