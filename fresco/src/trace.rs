//! Tracing for actor and shadow sessions.
//!
//! Enable with `--features tracing`. Without the feature every log macro
//! expands to nothing, so the request/reply hot path carries no formatting.

/// Installs a subscriber that writes timestamped events to stderr.
///
/// The filter comes from `RUST_LOG` and defaults to `fresco=trace`. Call once
/// at the top of a binary or test. Does nothing without the `tracing` feature.
#[cfg(feature = "tracing")]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fresco=trace"));

    // A second call (another test in the same binary) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

#[cfg(not(feature = "tracing"))]
pub const fn init_tracing() {}

#[cfg(feature = "tracing")]
pub(crate) use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing"))]
macro_rules! silent {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use silent as debug;
#[cfg(not(feature = "tracing"))]
pub(crate) use silent as error;
#[cfg(not(feature = "tracing"))]
pub(crate) use silent as info;
#[cfg(not(feature = "tracing"))]
pub(crate) use silent as trace;
#[cfg(not(feature = "tracing"))]
pub(crate) use silent as warn;
