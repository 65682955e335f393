//! Protocol client for a remote actor.
//!
//! [`RemoteControl`] is the shadow side of a session. It mirrors the actor's
//! state machine locally so illegal requests fail before touching the wire,
//! and every request it does send waits for exactly one reply.

use nalgebra::DMatrix;

use super::{ExperimentalControl, Operation, SessionState, StateMachine};
use crate::error::{Error, Result};
use crate::net::Channel;
use crate::protocol::{Opcode, PROTOCOL_VERSION, RecordLayout, RemoteFault, ReturnCode};
use crate::response::{MatrixKind, Response, ResponseType, SizeRole, SizeVector};
use crate::session::Session;
use crate::trace::{debug, info, warn};

/// An [`ExperimentalControl`] whose apparatus sits behind an actor.
pub struct RemoteControl<C: Channel> {
    session: Session<C>,
    machine: StateMachine,
    tag: u32,
    sizes: Option<(SizeVector, SizeVector)>,
    /// Vectors of the last `getDaqResponse` reply.
    daq: Response,
    last_status: Option<ReturnCode>,
}

impl<C: Channel> RemoteControl<C> {
    /// Wraps a session that has not been opened yet.
    #[must_use]
    pub fn new(session: Session<C>, tag: u32) -> Self {
        Self {
            session,
            machine: StateMachine::new(),
            tag,
            sizes: None,
            daq: Response::new(),
            last_status: None,
        }
    }

    pub const fn tag(&self) -> u32 {
        self.tag
    }

    /// Code of the last reply received.
    pub const fn last_status(&self) -> Option<ReturnCode> {
        self.last_status
    }

    pub const fn session(&self) -> &Session<C> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<C> {
        &mut self.session
    }

    fn negotiated(&self) -> Result<(SizeVector, SizeVector)> {
        self.sizes.ok_or(Error::NotConfigured("remote sizes"))
    }

    /// Sends `op` and returns the payload of a reply carrying `expected`.
    ///
    /// Transport failures fail the session; a `failed` reply does not.
    fn call(&mut self, op: Opcode, vectors: &[&[f64]], expected: ReturnCode) -> Result<&[f64]> {
        let reply = match self.session.request(op, vectors) {
            Ok(reply) => reply,
            Err(e) => return Err(self.machine.absorb(e)),
        };
        self.last_status = Some(reply.code);
        if reply.code == ReturnCode::Failed {
            debug!(%op, fault = %RemoteFault::decode(reply.payload), "request failed remotely");
        }
        match reply.expect(expected) {
            Ok(payload) => Ok(payload),
            Err(e) => Err(self.machine.absorb(e)),
        }
    }

    /// Fetches one measured vector without fetching the others.
    ///
    /// # Errors
    ///
    /// Fails unless a trial is pending or measured, or on a transport error.
    pub fn fetch(&mut self, ty: ResponseType) -> Result<&[f64]> {
        self.machine.check(Operation::Execute)?;
        let (_, size_daq) = self.negotiated()?;
        let n = size_daq[ty];
        let payload = self.call(Opcode::getter(ty), &[], ReturnCode::Completed)?;
        let values = payload[..n].to_vec();
        self.daq.set(ty, &values);
        Ok(self.daq.get(ty))
    }

    /// Tells the actor to exit without shutting its backend down.
    ///
    /// # Errors
    ///
    /// Fails if the session is already closed or the exchange fails.
    pub fn die(&mut self) -> Result<()> {
        if !self.machine.is_live() {
            return Err(Error::SessionClosed);
        }
        let result = self.call(Opcode::Die, &[], ReturnCode::Received).map(|_| ());
        if self.machine.is_live() {
            self.machine.apply(Operation::Shutdown)?;
        }
        self.session.close();
        info!(tag = self.tag, "sent DIE");
        result
    }

    /// Ends a session neither side can continue: the actor is told to exit
    /// and the machine fails.
    fn abandon(&mut self) {
        let _ = self.session.request(Opcode::Die, &[]);
        self.machine.fail();
        self.session.close();
        warn!(tag = self.tag, "session abandoned");
    }
}

impl<C: Channel> ExperimentalControl for RemoteControl<C> {
    fn open(&mut self) -> Result<()> {
        self.machine.check(Operation::Open)?;
        let nonce: u32 = rand::random();
        let hello = [
            f64::from(PROTOCOL_VERSION),
            f64::from(self.tag),
            f64::from(nonce),
        ];
        let tag = self.tag;
        let echoed = match self.call(Opcode::Open, &[&hello], ReturnCode::Completed) {
            Ok(payload) => [payload[0], payload[1], payload[2]],
            Err(e) => {
                self.machine.fail();
                return Err(e);
            }
        };

        let [remote_tag, remote_version, remote_nonce] = echoed;
        let failure = if remote_version != f64::from(PROTOCOL_VERSION) {
            Some(Error::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: remote_version as u32,
            })
        } else if remote_nonce != f64::from(nonce) {
            Some(Error::Protocol(format!(
                "open reply echoed nonce {remote_nonce}, sent {nonce}"
            )))
        } else if remote_tag != f64::from(tag) {
            Some(Error::Protocol(format!(
                "actor answered for site {remote_tag}, expected {tag}"
            )))
        } else {
            None
        };
        if let Some(e) = failure {
            warn!(error = %e, "open rejected");
            self.machine.fail();
            return Err(e);
        }

        self.machine.apply(Operation::Open)?;
        info!(tag, nonce, "session opened");
        Ok(())
    }

    fn setup(&mut self, ctrl: SizeVector, daq: SizeVector) -> Result<()> {
        self.machine.check(Operation::Setup)?;
        let data_size = RecordLayout::data_size(ctrl, daq, ctrl[ResponseType::Disp]);
        if data_size > self.session.payload_cap() {
            return Err(Error::PayloadTooLarge {
                need: data_size,
                cap: self.session.payload_cap(),
            });
        }

        let mut record = Vec::with_capacity(2 * ResponseType::COUNT + 1);
        record.extend_from_slice(&ctrl.to_wire());
        record.extend_from_slice(&daq.to_wire());
        record.push(data_size as f64);
        if let Err(e) = self.call(Opcode::Setup, &[&record], ReturnCode::Completed).map(|_| ()) {
            if matches!(e, Error::SizeMismatch { .. }) {
                self.abandon();
            }
            return Err(e);
        }

        if let Err(e) = self.session.freeze(data_size) {
            self.machine.fail();
            return Err(e);
        }
        self.machine.apply(Operation::Setup)?;
        self.sizes = Some((ctrl, daq));
        self.daq = Response::zeros(daq);
        self.machine.mark_ready()?;
        info!(%ctrl, %daq, data_size, "remote sizes negotiated");
        Ok(())
    }

    fn set_trial_response(&mut self, ctrl: &Response) -> Result<()> {
        self.machine.check(Operation::SetTrialResponse)?;
        let (size_ctrl, _) = self.negotiated()?;
        ctrl.check_sizes(size_ctrl, SizeRole::Ctrl)?;
        self.call(Opcode::SetTrialResponse, &ctrl.slices(), ReturnCode::Completed)?;
        self.machine.apply(Operation::SetTrialResponse)?;
        Ok(())
    }

    fn execute(&mut self) -> Result<()> {
        if self.machine.check(Operation::Execute)? == self.machine.state() {
            return Ok(());
        }
        let (_, size_daq) = self.negotiated()?;
        let payload = match self.session.request(Opcode::GetDaqResponse, &[]) {
            Ok(reply) => {
                self.last_status = Some(reply.code);
                reply.expect(ReturnCode::Completed)
            }
            Err(e) => Err(e),
        };
        let filled = payload.and_then(|flat| self.daq.fill_from_flat(size_daq, flat));
        if let Err(e) = filled {
            return Err(self.machine.absorb(e));
        }
        self.machine.apply(Operation::Execute)?;
        Ok(())
    }

    fn get_daq_response(&mut self, daq: &mut Response) -> Result<()> {
        self.machine.check(Operation::GetDaqResponse)?;
        let (_, size_daq) = self.negotiated()?;
        daq.fill_from(&self.daq, size_daq, SizeRole::Daq)?;
        self.machine.apply(Operation::GetDaqResponse)?;
        Ok(())
    }

    fn commit_state(&mut self) -> Result<()> {
        self.machine.check(Operation::CommitState)?;
        self.call(Opcode::CommitState, &[], ReturnCode::Completed)?;
        self.machine.apply(Operation::CommitState)?;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.machine.check(Operation::Shutdown)?;
        let result = self
            .call(Opcode::Shutdown, &[], ReturnCode::Received)
            .map(|_| ());
        if self.machine.is_live() {
            self.machine.apply(Operation::Shutdown)?;
        }
        self.session.close();
        info!(tag = self.tag, "remote session shut down");
        result
    }

    fn state(&self) -> SessionState {
        self.machine.state()
    }

    fn sizes(&self) -> Option<(SizeVector, SizeVector)> {
        self.sizes
    }

    fn matrix(&mut self, kind: MatrixKind) -> Result<Option<DMatrix<f64>>> {
        if !self.machine.is_live() {
            return Err(Error::SessionClosed);
        }
        let (size_ctrl, _) = self.negotiated()?;
        let n = size_ctrl[ResponseType::Disp];
        match self.call(Opcode::for_matrix(kind), &[], ReturnCode::Completed) {
            Ok(payload) => Ok(Some(DMatrix::from_row_slice(n, n, &payload[..n * n]))),
            Err(Error::Remote(RemoteFault::Unsupported { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<C: Channel> Drop for RemoteControl<C> {
    fn drop(&mut self) {
        if self.machine.is_live() {
            let _ = self.die();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::net::MemoryChannel;
    use crate::protocol::HANDSHAKE_PAYLOAD_LEN;
    use crate::session::SessionConfig;

    fn remote() -> (RemoteControl<MemoryChannel>, Session<MemoryChannel>) {
        let (a, b) = MemoryChannel::pair();
        let config = SessionConfig::default();
        let shadow = Session::new(a, &config).unwrap();
        let actor = Session::new(b, &config).unwrap();
        (RemoteControl::new(shadow, 7), actor)
    }

    #[test]
    fn open_echo_must_match_nonce() {
        let (mut control, mut actor) = remote();
        let server = thread::spawn(move || {
            let (code, payload) = actor.receive().unwrap();
            assert_eq!(code, Opcode::Open.code());
            assert_eq!(payload.len(), HANDSHAKE_PAYLOAD_LEN);
            let (tag, version) = (payload[1], payload[0]);
            actor
                .send(ReturnCode::Completed.code(), &[&[tag, version, -1.0]])
                .unwrap();
            actor
        });

        assert!(matches!(control.open(), Err(Error::Protocol(_))));
        assert_eq!(control.state(), SessionState::Failed);
        drop(server.join().unwrap());
    }

    #[test]
    fn version_fault_is_reported() {
        let (mut control, mut actor) = remote();
        let server = thread::spawn(move || {
            actor.receive().unwrap();
            actor
                .send_fault(&RemoteFault::VersionMismatch { supported: 3 })
                .unwrap();
            actor
        });

        assert!(matches!(
            control.open(),
            Err(Error::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: 3
            })
        ));
        assert_eq!(control.last_status(), Some(ReturnCode::Failed));
        drop(server.join().unwrap());
    }

    #[test]
    fn requests_before_setup_fail_locally() {
        let (mut control, _actor) = remote();
        assert!(matches!(
            control.set_trial_response(&Response::new()),
            Err(Error::InvalidState {
                state: SessionState::Idle,
                ..
            })
        ));
        assert_eq!(control.last_status(), None);
    }

    #[test]
    fn lost_actor_fails_the_session() {
        let (mut control, actor) = remote();
        drop(actor);
        assert!(control.open().is_err());
        assert_eq!(control.state(), SessionState::Failed);
        assert!(matches!(control.commit_state(), Err(Error::SessionClosed)));
    }
}
