//! End-to-end tests for a shadow site driving an actor.
//!
//! Each test runs the actor on its own thread and drives it from a
//! [`ShadowSite`], over an in-process channel pair or TCP loopback:
//! 1. Shadow opens the session and negotiates sizes
//! 2. Trials travel to the actor, measurements come back
//! 3. Commits advance the actor's step counter
//! 4. Dropping the shadow sends `DIE` and the actor exits
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=fresco=debug cargo test --features tracing --test shadow_to_actor -- --nocapture
//! ```

use std::sync::Arc;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use serial_test::serial;

use fresco::catalog::{ControlPointCatalog, Direction, Limits};
use fresco::config::SiteDecl;
use fresco::control::{SessionState, SimulatedSprings};
use fresco::net::{Channel, ChannelError, Endpoint, MemoryChannel, ServerSocket, StreamChannel};
use fresco::protocol::{LEGACY_PROTOCOL_VERSION, Opcode, PROTOCOL_VERSION, ReturnCode};
use fresco::setup::{ActuatorSide, Geometry, NoTransformation, TwoActuators2d};
use fresco::{
    Actor, ActorExit, Error, ExecMode, ExperimentalControl, ExperimentalSetup, ExperimentalSite,
    LocalControl, LocalSite, MatrixKind, RemoteControl, Response, ResponseType, Session,
    SessionConfig, ShadowConfig, ShadowSite, SiteBackend, SizeVector,
};
use fresco::response::SizeRole;

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        fresco::init_tracing();
    });
}

const TAG: u32 = 7;
const SIZES: SizeVector = SizeVector::new([1, 0, 0, 1, 0]);

fn session_config() -> SessionConfig {
    SessionConfig {
        receive_timeout: Some(Duration::from_secs(5)),
        ..SessionConfig::default()
    }
}

fn shadow_config() -> ShadowConfig {
    ShadowConfig {
        tag: TAG,
        session: session_config(),
    }
}

fn springs(stiffness: Vec<f64>) -> SiteBackend {
    let control = LocalControl::new(SimulatedSprings::new(stiffness), ExecMode::Blocking);
    SiteBackend::Control(Box::new(control))
}

fn spawn_actor<C: Channel + 'static>(
    channel: C,
    backend: SiteBackend,
) -> thread::JoinHandle<fresco::Result<ActorExit>> {
    thread::spawn(move || {
        let session = Session::new(channel, &session_config())?;
        let mut actor = Actor::new(session, LocalSite::new(TAG, backend));
        actor.run()
    })
}

fn trial(d: f64) -> Response {
    Response::new()
        .with(ResponseType::Disp, &[d])
        .with(ResponseType::Force, &[0.0])
}

/// Counts records sent through the wrapped channel.
struct Counting<C> {
    inner: C,
    sent: Arc<AtomicUsize>,
}

impl<C: Channel> Channel for Counting<C> {
    fn send(&mut self, buf: &[u8]) -> Result<(), ChannelError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.inner.send(buf)
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<(), ChannelError> {
        self.inner.receive(buf)
    }

    fn set_receive_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        self.inner.set_receive_timeout(timeout)
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

#[test]
fn springs_step_over_memory_channel() {
    init_test_tracing();
    let (a, b) = MemoryChannel::pair();
    let actor = spawn_actor(a, springs(vec![1230.0]));

    let mut shadow = ShadowSite::connect(b, &shadow_config()).expect("connect");
    shadow.set_size(SIZES, SIZES).expect("set_size");
    shadow.set_trial_response(&trial(0.01)).expect("trial");

    assert_eq!(shadow.disp().expect("disp"), &[0.01]);
    assert!((shadow.force().expect("force")[0] - 12.3).abs() < 1e-12);

    shadow.commit_state().expect("commit");
    assert_eq!(shadow.last_status(), Some(ReturnCode::Completed));
    assert_eq!(shadow.commit_tag(), 1);

    shadow.shutdown().expect("shutdown");
    assert_eq!(shadow.last_status(), Some(ReturnCode::Received));
    assert_eq!(actor.join().unwrap().unwrap(), ActorExit::Shutdown);
}

#[test]
#[serial]
fn springs_step_over_tcp_loopback() {
    init_test_tracing();
    let listener = ServerSocket::bind(Endpoint::localhost(0)).expect("bind");
    let addr = listener.local_addr();
    let actor = thread::spawn(move || {
        let channel = listener.accept()?;
        let session = Session::new(channel, &session_config())?;
        let mut actor = Actor::new(session, LocalSite::new(TAG, springs(vec![1230.0])));
        actor.run()
    });

    let channel = StreamChannel::connect(addr).expect("connect");
    let mut shadow = ShadowSite::connect(channel, &shadow_config()).expect("open");
    shadow.set_size(SIZES, SIZES).expect("set_size");

    for d in [0.01, 0.02, -0.01] {
        shadow.set_trial_response(&trial(d)).expect("trial");
        assert_eq!(shadow.disp().unwrap(), &[d]);
        assert!((shadow.force().unwrap()[0] - 1230.0 * d).abs() < 1e-9);
        shadow.commit_state().expect("commit");
    }
    assert_eq!(shadow.commit_tag(), 3);

    drop(shadow);
    assert_eq!(actor.join().unwrap().unwrap(), ActorExit::Die);
}

#[test]
fn measurements_are_pulled_once_per_trial() {
    init_test_tracing();
    let (a, b) = MemoryChannel::pair();
    let actor = spawn_actor(a, springs(vec![1230.0]));

    let sent = Arc::new(AtomicUsize::new(0));
    let channel = Counting {
        inner: b,
        sent: Arc::clone(&sent),
    };
    let mut shadow = ShadowSite::connect(channel, &shadow_config()).expect("connect");
    shadow.set_size(SIZES, SIZES).unwrap();
    shadow.set_trial_response(&trial(0.01)).unwrap();

    let before = sent.load(Ordering::SeqCst);
    shadow.disp().unwrap();
    shadow.force().unwrap();
    shadow.disp().unwrap();
    let mut out = Response::new();
    shadow.get_daq_response(&mut out).unwrap();
    assert_eq!(sent.load(Ordering::SeqCst), before + 1);
    assert!((out.force()[0] - 12.3).abs() < 1e-12);

    // A new trial invalidates the pulled measurements.
    shadow.set_trial_response(&trial(0.02)).unwrap();
    let before = sent.load(Ordering::SeqCst);
    assert!((shadow.force().unwrap()[0] - 24.6).abs() < 1e-12);
    assert_eq!(sent.load(Ordering::SeqCst), before + 1);

    drop(shadow);
    assert_eq!(actor.join().unwrap().unwrap(), ActorExit::Die);
}

#[test]
fn wrong_trial_size_never_reaches_the_wire() {
    init_test_tracing();
    let (a, b) = MemoryChannel::pair();
    let actor = spawn_actor(a, springs(vec![1230.0]));

    let sent = Arc::new(AtomicUsize::new(0));
    let channel = Counting {
        inner: b,
        sent: Arc::clone(&sent),
    };
    let mut shadow = ShadowSite::connect(channel, &shadow_config()).unwrap();
    shadow.set_size(SIZES, SIZES).unwrap();

    let before = sent.load(Ordering::SeqCst);
    let wide = Response::new()
        .with(ResponseType::Disp, &[0.01, 0.02])
        .with(ResponseType::Force, &[0.0]);
    assert!(matches!(
        shadow.set_trial_response(&wide),
        Err(Error::SizeMismatch { .. })
    ));
    assert_eq!(sent.load(Ordering::SeqCst), before);

    // The session is still usable.
    shadow.set_trial_response(&trial(0.01)).unwrap();
    assert_eq!(shadow.disp().unwrap(), &[0.01]);

    drop(shadow);
    assert_eq!(actor.join().unwrap().unwrap(), ActorExit::Die);
}

#[test]
fn actor_rejects_sizes_its_backend_cannot_serve() {
    init_test_tracing();
    let (a, b) = MemoryChannel::pair();
    let actor = spawn_actor(a, springs(vec![1230.0]));

    let mut shadow = ShadowSite::connect(b, &shadow_config()).unwrap();
    let two = SizeVector::new([2, 0, 0, 2, 0]);
    assert!(matches!(
        shadow.set_size(two, two),
        Err(Error::SizeMismatch {
            role: SizeRole::Ctrl,
            ..
        })
    ));
    assert_eq!(shadow.last_status(), Some(ReturnCode::Failed));
    assert_eq!(shadow.control().state(), SessionState::Failed);

    // Both sides treat the session as dead; the actor was told to exit.
    assert_eq!(actor.join().unwrap().unwrap(), ActorExit::Die);
    assert!(matches!(shadow.set_size(SIZES, SIZES), Err(Error::SessionClosed)));
    assert!(matches!(
        shadow.set_trial_response(&trial(0.01)),
        Err(Error::NotConfigured(_))
    ));
}

#[test]
fn limits_are_enforced_on_the_actor() {
    init_test_tracing();
    let mut points = ControlPointCatalog::new();
    points
        .declare(1, Direction::X, ResponseType::Disp, 1.0, Some(Limits::new(-1.0, 1.0).unwrap()))
        .unwrap();
    let control = LocalControl::new(SimulatedSprings::new(vec![1230.0]), ExecMode::Blocking);
    let setup = ExperimentalSetup::new(NoTransformation::new(SIZES, SIZES))
        .with_ctrl_points(points)
        .unwrap()
        .with_control(Box::new(control));

    let (a, b) = MemoryChannel::pair();
    let actor = spawn_actor(a, SiteBackend::Setup(setup));

    let mut shadow = ShadowSite::connect(b, &shadow_config()).unwrap();
    shadow.set_size(SIZES, SIZES).unwrap();

    shadow.set_trial_response(&trial(0.5)).unwrap();
    assert!((shadow.force().unwrap()[0] - 615.0).abs() < 1e-9);

    match shadow.set_trial_response(&trial(1.5)) {
        Err(Error::LimitExceeded(v)) => {
            assert_eq!(v.node, 1);
            assert_eq!(v.response, ResponseType::Disp);
            assert_eq!(v.value, 1.5);
            assert_eq!((v.lower, v.upper), (-1.0, 1.0));
        }
        other => panic!("expected a limit violation, got {other:?}"),
    }

    // The rejected trial leaves nothing to read or commit.
    assert_eq!(shadow.trial_disp(), &[0.5]);
    assert!(matches!(shadow.force(), Err(Error::TrialRejected)));
    assert!(matches!(shadow.commit_state(), Err(Error::TrialRejected)));

    shadow.set_trial_response(&trial(0.25)).unwrap();
    assert!((shadow.force().unwrap()[0] - 307.5).abs() < 1e-9);
    shadow.commit_state().unwrap();
    assert_eq!(shadow.commit_tag(), 1);

    drop(shadow);
    assert_eq!(actor.join().unwrap().unwrap(), ActorExit::Die);
}

#[test]
fn shadow_setup_drives_a_control_only_actor() {
    init_test_tracing();
    let (a, b) = MemoryChannel::pair();
    let actor = spawn_actor(a, springs(vec![100.0, 200.0]));

    let geometry =
        TwoActuators2d::new(120.0, 100.0, 50.0, Geometry::Linear, ActuatorSide::Left, 0.0)
            .unwrap();
    let mut shadow = ShadowSite::connect(b, &shadow_config())
        .unwrap()
        .with_setup(ExperimentalSetup::new(geometry))
        .unwrap();

    let basic = SizeVector::new([3, 0, 0, 3, 0]);
    shadow.set_size(basic, basic).unwrap();
    let step = Response::new()
        .with(ResponseType::Disp, &[0.2, 0.0, 0.001])
        .with(ResponseType::Force, &[0.0; 3]);
    shadow.set_trial_response(&step).unwrap();

    let disp = shadow.disp().unwrap().to_vec();
    for (got, want) in disp.iter().zip([0.2, 0.0, 0.001]) {
        assert!((got - want).abs() < 1e-12, "disp {disp:?}");
    }
    // Strokes 0.2 and 0.15 give actuator forces 20 and 30.
    let force = shadow.force().unwrap().to_vec();
    for (got, want) in force.iter().zip([50.0, 0.0, -1500.0]) {
        assert!((got - want).abs() < 1e-9, "force {force:?}");
    }

    let k = shadow
        .matrix(MatrixKind::InitialStiffness)
        .unwrap()
        .expect("springs report stiffness");
    assert_eq!(k.shape(), (3, 3));
    assert!((k[(0, 0)] - 300.0).abs() < 1e-9);
    assert!((k[(0, 2)] + 10_000.0).abs() < 1e-9);
    assert!((k[(2, 2)] - 500_000.0).abs() < 1e-6);
    assert!(shadow.matrix(MatrixKind::Mass).unwrap().is_none());

    drop(shadow);
    assert_eq!(actor.join().unwrap().unwrap(), ActorExit::Die);
}

#[test]
fn remote_control_fetches_single_vectors() {
    init_test_tracing();
    let (a, b) = MemoryChannel::pair();
    let actor = spawn_actor(a, springs(vec![1230.0]));

    let session = Session::new(b, &session_config()).unwrap();
    let mut control = RemoteControl::new(session, TAG);
    control.open().unwrap();
    control.setup(SIZES, SIZES).unwrap();
    control.set_trial_response(&trial(0.01)).unwrap();

    assert!((control.fetch(ResponseType::Force).unwrap()[0] - 12.3).abs() < 1e-12);
    assert_eq!(control.fetch(ResponseType::Disp).unwrap(), &[0.01]);
    assert!(control.fetch(ResponseType::Time).unwrap().is_empty());

    let k = control.matrix(MatrixKind::TangentStiffness).unwrap().unwrap();
    assert_eq!(k[(0, 0)], 1230.0);
    assert!(control.matrix(MatrixKind::Damping).unwrap().is_none());

    control.execute().unwrap();
    control.commit_state().unwrap();
    control.die().unwrap();
    assert!(matches!(control.die(), Err(Error::SessionClosed)));
    assert_eq!(actor.join().unwrap().unwrap(), ActorExit::Die);
}

#[test]
fn legacy_protocol_version_is_rejected() {
    init_test_tracing();
    let (a, b) = MemoryChannel::pair();
    let actor = spawn_actor(a, springs(vec![1230.0]));

    let mut raw = Session::new(b, &session_config()).unwrap();
    let hello = [f64::from(LEGACY_PROTOCOL_VERSION), f64::from(TAG), 99.0];
    let reply = raw.request(Opcode::Open, &[&hello]).unwrap();
    assert!(matches!(
        reply.expect(ReturnCode::Completed),
        Err(Error::VersionMismatch { remote, .. }) if remote == PROTOCOL_VERSION
    ));

    // The actor is still waiting for a valid open; DIE ends it.
    let reply = raw.request(Opcode::Die, &[]).unwrap();
    assert_eq!(reply.code, ReturnCode::Received);
    assert_eq!(actor.join().unwrap().unwrap(), ActorExit::Die);
}

#[test]
fn actor_serves_setup_then_counted_steps() {
    init_test_tracing();
    let (a, b) = MemoryChannel::pair();
    let actor = thread::spawn(move || {
        let session = Session::new(a, &session_config())?;
        let mut actor = Actor::new(session, LocalSite::new(TAG, springs(vec![10.0])));
        let setup = actor.run_till(Opcode::Setup)?;
        let steps = actor.step(2)?;
        let rest = actor.run()?;
        Ok::<_, Error>((setup, steps, rest))
    });

    let mut shadow = ShadowSite::connect(b, &shadow_config()).unwrap();
    shadow.set_size(SIZES, SIZES).unwrap();
    for d in [0.1, 0.2, 0.3] {
        shadow.set_trial_response(&trial(d)).unwrap();
        assert!((shadow.force().unwrap()[0] - 10.0 * d).abs() < 1e-12);
        shadow.commit_state().unwrap();
    }
    drop(shadow);

    let (setup, steps, rest) = actor.join().unwrap().unwrap();
    assert_eq!(setup, None);
    assert_eq!(steps, None);
    assert_eq!(rest, ActorExit::Die);
}

#[test]
#[serial]
fn declared_remote_control_over_polling_transport() {
    init_test_tracing();
    let listener = ServerSocket::bind(Endpoint::localhost(0)).expect("bind");
    let addr = listener.local_addr();
    let actor = thread::spawn(move || {
        let channel = listener.accept()?;
        let session = Session::new(channel, &session_config())?;
        let mut actor = Actor::new(session, LocalSite::new(TAG, springs(vec![1230.0])));
        actor.run()
    });

    let decl = SiteDecl::from_toml_str(&format!(
        r#"
        tag = {TAG}

        [control]
        type = "remote"
        address = "{addr}"
        transport = "polling"
        timeout_ms = 5000
        "#
    ))
    .unwrap();
    let mut site = decl.build().expect("connect to actor");
    site.set_size(SIZES, SIZES).unwrap();
    site.set_trial_response(&trial(0.01)).unwrap();
    assert!((site.force().unwrap()[0] - 12.3).abs() < 1e-12);
    site.commit_state().unwrap();

    drop(site);
    assert_eq!(actor.join().unwrap().unwrap(), ActorExit::Die);
}
