//! Server side of a distributed site.
//!
//! An [`Actor`] owns one [`Session`] and one [`LocalSite`] and answers
//! requests in order, one reply per request. Requests the site rejects are
//! answered with a `failed` record and serving continues; only a broken
//! transport ends the loop.

use crate::control::{Operation, SessionState};
use crate::error::{Error, Result};
use crate::net::{Channel, Endpoint};
use crate::protocol::{
    LEGACY_PROTOCOL_VERSION, Opcode, PROTOCOL_VERSION, RecordLayout, RemoteFault, ReturnCode,
};
use crate::response::{Response, ResponseType, SizeVector, wire_count};
use crate::session::{Session, SessionConfig};
use crate::site::{ExperimentalSite, LocalSite};
use crate::trace::{debug, info, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorConfig {
    pub bind: Endpoint,
    /// Kernel buffer to request for the accepted socket, in bytes.
    pub socket_buffer: Option<usize>,
    pub session: SessionConfig,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            bind: Endpoint::any(8090),
            socket_buffer: None,
            session: SessionConfig::default(),
        }
    }
}

/// Why [`Actor::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorExit {
    /// The shadow sent `DIE`; the backend was left running.
    Die,
    /// The shadow sent `shutdown`; the backend was shut down.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitOpen,
    AwaitSetup,
    Running,
}

impl Phase {
    const fn state(self) -> SessionState {
        match self {
            Self::AwaitOpen => SessionState::Idle,
            Self::AwaitSetup => SessionState::Opened,
            Self::Running => SessionState::Ready,
        }
    }
}

/// What to send back once a handler succeeded.
#[derive(Debug, Clone, Copy)]
enum Answer {
    Done,
    Hello([f64; 3]),
    Frozen(usize),
    Output,
    Vector(ResponseType),
    Matrix,
    Exit(ActorExit),
}

/// Outcome of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Served {
    Completed(Opcode),
    Failed(Opcode),
    Unknown,
    Exit(ActorExit),
}

pub struct Actor<C: Channel> {
    session: Session<C>,
    site: LocalSite,
    phase: Phase,
    sizes: Option<(SizeVector, SizeVector)>,
    request: Vec<f64>,
    trial: Response,
    out: Response,
    matrix: Vec<f64>,
    shutdown_error: Option<Error>,
}

impl<C: Channel> Actor<C> {
    #[must_use]
    pub fn new(session: Session<C>, site: LocalSite) -> Self {
        Self {
            session,
            site,
            phase: Phase::AwaitOpen,
            sizes: None,
            request: Vec::new(),
            trial: Response::new(),
            out: Response::new(),
            matrix: Vec::new(),
            shutdown_error: None,
        }
    }

    /// Error the backend reported when a `shutdown` request closed it.
    ///
    /// The shadow is still told the actor is exiting.
    pub const fn shutdown_error(&self) -> Option<&Error> {
        self.shutdown_error.as_ref()
    }

    pub const fn site(&self) -> &LocalSite {
        &self.site
    }

    pub const fn session(&self) -> &Session<C> {
        &self.session
    }

    /// Serves until `DIE` or `shutdown`.
    ///
    /// # Errors
    ///
    /// Returns the transport error that ended the session.
    pub fn run(&mut self) -> Result<ActorExit> {
        info!(tag = self.site.tag(), "actor serving");
        loop {
            if let Served::Exit(exit) = self.serve_one()? {
                return Ok(exit);
            }
        }
    }

    /// Serves until a request with `opcode` completes.
    ///
    /// Returns the exit reason if the session ended first.
    ///
    /// # Errors
    ///
    /// Returns the transport error that ended the session.
    pub fn run_till(&mut self, opcode: Opcode) -> Result<Option<ActorExit>> {
        loop {
            match self.serve_one()? {
                Served::Completed(op) if op == opcode => return Ok(None),
                Served::Exit(exit) => return Ok(Some(exit)),
                _ => {}
            }
        }
    }

    /// Serves `steps` committed steps.
    ///
    /// # Errors
    ///
    /// Returns the transport error that ended the session.
    pub fn step(&mut self, steps: usize) -> Result<Option<ActorExit>> {
        for _ in 0..steps {
            if let Some(exit) = self.run_till(Opcode::CommitState)? {
                return Ok(Some(exit));
            }
        }
        Ok(None)
    }

    fn serve_one(&mut self) -> Result<Served> {
        let (code, payload) = self.session.receive()?;
        self.request.clear();
        self.request.extend_from_slice(payload);

        let Ok(op) = Opcode::try_from(code) else {
            warn!(code, "unknown request");
            self.session.send_fault(&RemoteFault::Unsupported { code })?;
            return Ok(Served::Unknown);
        };
        trace!(tag = self.site.tag(), %op, "request");

        match self.handle(op) {
            Ok(answer) => self.answer(answer).map(|exit| match exit {
                Some(exit) => Served::Exit(exit),
                None => Served::Completed(op),
            }),
            Err(e) => {
                warn!(%op, error = %e, "request failed");
                self.session.send_fault(&RemoteFault::from_error(&e))?;
                Ok(Served::Failed(op))
            }
        }
    }

    fn answer(&mut self, answer: Answer) -> Result<Option<ActorExit>> {
        let ok = ReturnCode::Completed.code();
        match answer {
            Answer::Done => self.session.send(ok, &[])?,
            Answer::Hello(hello) => self.session.send(ok, &[&hello])?,
            Answer::Frozen(data_size) => {
                self.session.send(ok, &[])?;
                self.session.freeze(data_size)?;
            }
            Answer::Output => self.session.send(ok, &self.out.slices())?,
            Answer::Vector(ty) => self.session.send(ok, &[self.out.get(ty)])?,
            Answer::Matrix => self.session.send(ok, &[&self.matrix])?,
            Answer::Exit(exit) => {
                self.session.send(ReturnCode::Received.code(), &[])?;
                self.session.close();
                info!(tag = self.site.tag(), ?exit, commits = self.site.commit_tag(), "actor exiting");
                return Ok(Some(exit));
            }
        }
        Ok(None)
    }

    fn require(&self, phase: Phase, op: Opcode) -> Result<()> {
        if self.phase != phase {
            return Err(Error::InvalidState {
                state: self.phase.state(),
                op: operation(op),
            });
        }
        Ok(())
    }

    fn handle(&mut self, op: Opcode) -> Result<Answer> {
        match op {
            Opcode::Open => self.open(),
            Opcode::Setup => self.setup(),
            Opcode::Shutdown => {
                if let Err(e) = self.site.shutdown() {
                    warn!(error = %e, "backend shutdown failed");
                    self.shutdown_error = Some(e);
                }
                Ok(Answer::Exit(ActorExit::Shutdown))
            }
            Opcode::Die => Ok(Answer::Exit(ActorExit::Die)),
            Opcode::Acquire => Err(Error::Remote(RemoteFault::Unsupported { code: op.code() })),
            _ => {
                self.require(Phase::Running, op)?;
                self.running(op)
            }
        }
    }

    fn open(&mut self) -> Result<Answer> {
        self.require(Phase::AwaitOpen, Opcode::Open)?;
        let [version, tag, nonce] = [self.request[0], self.request[1], self.request[2]];
        if version != f64::from(PROTOCOL_VERSION) {
            if version == f64::from(LEGACY_PROTOCOL_VERSION) {
                warn!(version, "shadow speaks the legacy opcode numbering");
            }
            return Err(Error::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: version as u32,
            });
        }
        let own = self.site.tag();
        if tag != f64::from(own) {
            warn!(own, requested = tag, "shadow asked for another site");
        }
        self.phase = Phase::AwaitSetup;
        info!(tag = own, nonce, "session opened");
        Ok(Answer::Hello([f64::from(own), version, nonce]))
    }

    fn setup(&mut self) -> Result<Answer> {
        self.require(Phase::AwaitSetup, Opcode::Setup)?;
        let n = ResponseType::COUNT;
        let cap = self.session.payload_cap();
        let commands = SizeVector::from_wire(&self.request[..n], cap)?;
        let measured = SizeVector::from_wire(&self.request[n..2 * n], cap)?;
        let data_size = wire_count(self.request[2 * n], usize::MAX)?;

        let needed = RecordLayout::data_size(commands, measured, commands[ResponseType::Disp]);
        if data_size > cap {
            return Err(Error::PayloadTooLarge {
                need: data_size,
                cap,
            });
        }
        if data_size < needed {
            return Err(Error::Protocol(format!(
                "data size {data_size} cannot carry sizes {commands} / {measured}"
            )));
        }

        self.site.set_size(commands, measured)?;
        self.trial = Response::zeros(commands);
        self.out = Response::zeros(measured);
        self.sizes = Some((commands, measured));
        self.phase = Phase::Running;
        info!(%commands, %measured, data_size, "actor sized");
        Ok(Answer::Frozen(data_size))
    }

    fn running(&mut self, op: Opcode) -> Result<Answer> {
        let (commands, _) = self.sizes.ok_or(Error::NotConfigured("actor sizes"))?;
        if let Some(ty) = op.response_type() {
            let values = self.site.response(ty)?;
            self.out.set(ty, values);
            return Ok(Answer::Vector(ty));
        }
        if let Some(kind) = op.matrix_kind() {
            let Some(m) = self.site.matrix(kind)? else {
                return Err(Error::Remote(RemoteFault::Unsupported { code: op.code() }));
            };
            let dim = commands[ResponseType::Disp];
            if m.shape() != (dim, dim) {
                return Err(Error::Protocol(format!(
                    "{kind} is {}x{}, session expects {dim}x{dim}",
                    m.nrows(),
                    m.ncols()
                )));
            }
            self.matrix.clear();
            self.matrix.extend(m.transpose().iter());
            return Ok(Answer::Matrix);
        }
        match op {
            Opcode::SetTrialResponse => {
                self.trial.fill_from_flat(commands, &self.request)?;
                self.site.set_trial_response(&self.trial)?;
                Ok(Answer::Done)
            }
            Opcode::Execute => {
                self.site.check_daq_response()?;
                Ok(Answer::Done)
            }
            Opcode::CommitState => {
                self.site.commit_state()?;
                debug!(commit = self.site.commit_tag(), "step committed");
                Ok(Answer::Done)
            }
            Opcode::GetDaqResponse => {
                self.site.get_daq_response(&mut self.out)?;
                Ok(Answer::Output)
            }
            _ => Err(Error::InvalidState {
                state: self.phase.state(),
                op: operation(op),
            }),
        }
    }
}

/// State-machine operation a request stands for, for error reports.
const fn operation(op: Opcode) -> Operation {
    match op {
        Opcode::Open => Operation::Open,
        Opcode::Setup => Operation::Setup,
        Opcode::SetTrialResponse => Operation::SetTrialResponse,
        Opcode::Execute => Operation::Execute,
        Opcode::CommitState => Operation::CommitState,
        Opcode::Shutdown | Opcode::Die => Operation::Shutdown,
        _ => Operation::GetDaqResponse,
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::control::{ExecMode, LocalControl, SimulatedSprings};
    use crate::net::MemoryChannel;
    use crate::protocol::HANDSHAKE_PAYLOAD_LEN;
    use crate::site::SiteBackend;

    const SIZES: SizeVector = SizeVector::new([1, 0, 0, 1, 0]);

    fn actor(tag: u32) -> (Actor<MemoryChannel>, Session<MemoryChannel>) {
        let (a, b) = MemoryChannel::pair();
        let config = SessionConfig::default();
        let control = LocalControl::new(SimulatedSprings::new(vec![1230.0]), ExecMode::Blocking);
        let site = LocalSite::new(tag, SiteBackend::Control(Box::new(control)));
        let actor = Actor::new(Session::new(a, &config).unwrap(), site);
        (actor, Session::new(b, &config).unwrap())
    }

    fn code(session: &mut Session<MemoryChannel>, op: Opcode, vectors: &[&[f64]]) -> ReturnCode {
        session.request(op, vectors).unwrap().code
    }

    fn open_and_setup(shadow: &mut Session<MemoryChannel>) {
        let hello = [f64::from(PROTOCOL_VERSION), 5.0, 42.0];
        let reply = shadow.request(Opcode::Open, &[&hello]).unwrap();
        assert_eq!(reply.code, ReturnCode::Completed);
        assert_eq!(&reply.payload[..3], &[5.0, 2.0, 42.0]);

        let data_size = RecordLayout::data_size(SIZES, SIZES, 1);
        let mut record = SIZES.to_wire().to_vec();
        record.extend_from_slice(&SIZES.to_wire());
        record.push(data_size as f64);
        assert_eq!(code(shadow, Opcode::Setup, &[&record]), ReturnCode::Completed);
        shadow.freeze(data_size).unwrap();
    }

    #[test]
    fn serves_a_step_then_exits_on_die() {
        let (mut actor, mut shadow) = actor(5);
        let server = thread::spawn(move || actor.run().unwrap());

        open_and_setup(&mut shadow);
        let trial: [&[f64]; 5] = [&[0.01], &[], &[], &[0.0], &[]];
        assert_eq!(code(&mut shadow, Opcode::SetTrialResponse, &trial), ReturnCode::Completed);
        assert_eq!(code(&mut shadow, Opcode::Execute, &[]), ReturnCode::Completed);

        let reply = shadow.request(Opcode::GetForce, &[]).unwrap();
        assert_eq!(reply.code, ReturnCode::Completed);
        assert!((reply.payload[0] - 12.3).abs() < 1e-12);

        assert_eq!(code(&mut shadow, Opcode::CommitState, &[]), ReturnCode::Completed);
        assert_eq!(code(&mut shadow, Opcode::Die, &[]), ReturnCode::Received);
        assert_eq!(server.join().unwrap(), ActorExit::Die);
    }

    #[test]
    fn rejects_other_protocol_versions() {
        let (mut actor, mut shadow) = actor(5);
        let server = thread::spawn(move || {
            let served = actor.serve_one().unwrap();
            (served, actor.phase)
        });

        let hello = [f64::from(LEGACY_PROTOCOL_VERSION), 5.0, 42.0];
        let reply = shadow.request(Opcode::Open, &[&hello]).unwrap();
        assert_eq!(reply.code, ReturnCode::Failed);
        assert_eq!(
            RemoteFault::decode(reply.payload),
            RemoteFault::VersionMismatch {
                supported: PROTOCOL_VERSION
            }
        );
        let (served, phase) = server.join().unwrap();
        assert_eq!(served, Served::Failed(Opcode::Open));
        assert_eq!(phase, Phase::AwaitOpen);
    }

    #[test]
    fn unknown_and_reserved_codes_keep_the_session() {
        let (mut actor, mut shadow) = actor(5);
        let server = thread::spawn(move || actor.run().unwrap());

        shadow.send(77, &[]).unwrap();
        let (code_77, payload) = shadow.receive().unwrap();
        assert_eq!(code_77, ReturnCode::Failed.code());
        assert_eq!(RemoteFault::decode(payload), RemoteFault::Unsupported { code: 77 });

        let reply = shadow.request(Opcode::Acquire, &[]).unwrap();
        assert_eq!(reply.code, ReturnCode::Failed);

        open_and_setup(&mut shadow);
        assert_eq!(code(&mut shadow, Opcode::Shutdown, &[]), ReturnCode::Received);
        assert_eq!(server.join().unwrap(), ActorExit::Shutdown);
    }

    #[test]
    fn failed_backend_shutdown_is_kept() {
        let (mut actor, mut shadow) = actor(5);
        let server = thread::spawn(move || {
            actor.run_till(Opcode::Setup).unwrap();
            actor.site.shutdown().unwrap();
            let exit = actor.run().unwrap();
            (exit, matches!(actor.shutdown_error(), Some(Error::SessionClosed)))
        });

        open_and_setup(&mut shadow);
        assert_eq!(code(&mut shadow, Opcode::Shutdown, &[]), ReturnCode::Received);
        assert_eq!(server.join().unwrap(), (ActorExit::Shutdown, true));
    }

    #[test]
    fn requests_before_setup_fail_without_desync() {
        let (mut actor, mut shadow) = actor(5);
        let server = thread::spawn(move || actor.run().unwrap());

        let reply = shadow.request(Opcode::CommitState, &[]).unwrap();
        assert_eq!(reply.code, ReturnCode::Failed);
        assert_eq!(RemoteFault::decode(reply.payload), RemoteFault::InvalidState);
        assert_eq!(shadow.layout().payload_len(), HANDSHAKE_PAYLOAD_LEN);

        open_and_setup(&mut shadow);
        assert_eq!(code(&mut shadow, Opcode::Die, &[]), ReturnCode::Received);
        server.join().unwrap();
    }

    #[test]
    fn stiffness_is_sent_row_major() {
        let (mut actor, mut shadow) = actor(5);
        let server = thread::spawn(move || actor.run().unwrap());

        open_and_setup(&mut shadow);
        let reply = shadow.request(Opcode::GetInitialStiff, &[]).unwrap();
        assert_eq!(reply.code, ReturnCode::Completed);
        assert_eq!(reply.payload[0], 1230.0);

        let reply = shadow.request(Opcode::GetMass, &[]).unwrap();
        assert_eq!(reply.code, ReturnCode::Failed);
        assert_eq!(
            RemoteFault::decode(reply.payload),
            RemoteFault::Unsupported {
                code: Opcode::GetMass.code()
            }
        );
        assert_eq!(code(&mut shadow, Opcode::Die, &[]), ReturnCode::Received);
        server.join().unwrap();
    }

    #[test]
    fn oversized_data_size_is_refused() {
        let (mut actor, mut shadow) = actor(5);
        let server = thread::spawn(move || actor.run().unwrap());

        let hello = [f64::from(PROTOCOL_VERSION), 5.0, 1.0];
        shadow.request(Opcode::Open, &[&hello]).unwrap();
        let mut record = SIZES.to_wire().to_vec();
        record.extend_from_slice(&SIZES.to_wire());
        record.push(10_000.0);
        let reply = shadow.request(Opcode::Setup, &[&record]).unwrap();
        assert_eq!(reply.code, ReturnCode::Failed);

        assert_eq!(code(&mut shadow, Opcode::Die, &[]), ReturnCode::Received);
        server.join().unwrap();
    }
}
