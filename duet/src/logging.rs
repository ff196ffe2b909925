//! Tracing setup for the duet binary.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: diagnostics via `RUST_LOG`, output to stderr.
//!   The driver captures stderr, so transitions are logged at `info`.
//!
//! - **History and escalation files (`io/history`, `io/escalation`)**: product
//!   artifacts in `.duet/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Where stderr ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    /// A terminal or the driver's log capture.
    Console,
    /// `logs/watchdog.log`, appended to by every detached watchdog.
    WatchdogLog,
}

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `info` if unset.
/// Output: stderr, compact format. The watchdog log gets no ANSI colors and
/// includes the thread id, since several watchdogs may share the file over time.
///
/// # Example
/// ```bash
/// RUST_LOG=duet=debug duet tick
/// ```
pub fn init(sink: Sink) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let layer = fmt::layer().with_writer(std::io::stderr).compact();
    let layer = match sink {
        Sink::Console => layer,
        Sink::WatchdogLog => layer.with_ansi(false).with_thread_ids(true),
    };

    tracing_subscriber::registry().with(filter).with(layer).init();
}
