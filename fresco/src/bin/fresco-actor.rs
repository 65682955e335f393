//! Fresco actor daemon.
//!
//! Serves one experimental site to one shadow over TCP.
//!
//! # Usage
//!
//! ```sh
//! fresco-actor --config site.toml --bind 0.0.0.0:8090
//! fresco-actor --config site.toml --steps 100 --socket-buffer 1048576
//! fresco-actor --config site.toml --setup-only
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use fresco::config::SiteDecl;
use fresco::net::{Endpoint, ServerSocket};
use fresco::protocol::{DEFAULT_PAYLOAD_CAP, Opcode};
use fresco::{Actor, ActorConfig, Session, SessionConfig};

#[derive(Parser, Debug)]
#[command(name = "fresco-actor")]
#[command(author, version, about = "Serve an experimental site to a remote shadow", long_about = None)]
struct Cli {
    /// Site declaration (TOML)
    #[arg(short, long)]
    config: PathBuf,

    /// Address to accept the shadow on
    #[arg(short, long, default_value_t = ActorConfig::default().bind)]
    bind: Endpoint,

    /// Override the tag from the declaration
    #[arg(short, long)]
    tag: Option<u32>,

    /// Largest negotiated record, in doubles
    #[arg(long, default_value_t = DEFAULT_PAYLOAD_CAP)]
    payload_cap: usize,

    /// Kernel socket buffer to request, in bytes
    #[arg(long)]
    socket_buffer: Option<usize>,

    /// Give up on a silent shadow after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Serve this many committed steps, then exit
    #[arg(long, conflicts_with = "setup_only")]
    steps: Option<usize>,

    /// Serve until setup completes, then exit
    #[arg(long)]
    setup_only: bool,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("fresco-actor: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    fresco::init_tracing();

    let mut decl = SiteDecl::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(tag) = cli.tag {
        decl.tag = tag;
    }
    let config = ActorConfig {
        bind: cli.bind,
        socket_buffer: cli.socket_buffer,
        session: SessionConfig {
            payload_cap: cli.payload_cap,
            receive_timeout: cli.timeout_ms.map(Duration::from_millis),
        },
    };

    let site = decl.build().context("building site")?;

    let listener = ServerSocket::bind(config.bind).context("binding")?;
    eprintln!(
        "fresco-actor: site {} waiting on {}",
        decl.tag,
        listener.local_addr()
    );
    let channel = listener.accept().context("accepting shadow")?;
    let peer = channel.peer_addr().context("reading peer address")?;
    eprintln!("fresco-actor: shadow connected from {peer}");
    if let Some(bytes) = config.socket_buffer {
        let (send, recv) = channel
            .size_buffers(bytes)
            .context("sizing socket buffers")?;
        eprintln!("fresco-actor: socket buffers send {send} / recv {recv} bytes");
    }

    let session = Session::new(channel, &config.session)?;
    let mut actor = Actor::new(session, site);

    let exit = if cli.setup_only {
        actor.run_till(Opcode::Setup)?
    } else if let Some(steps) = cli.steps {
        actor.step(steps)?
    } else {
        Some(actor.run()?)
    };

    match exit {
        Some(exit) => eprintln!("fresco-actor: session ended ({exit:?})"),
        None => eprintln!("fresco-actor: done"),
    }
    if let Some(e) = actor.shutdown_error() {
        eprintln!("fresco-actor: backend did not shut down cleanly: {e}");
    }
    Ok(())
}
