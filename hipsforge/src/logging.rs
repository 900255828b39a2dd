//! Subscriber setup for embedding applications.
//!
//! The engine itself only emits `tracing` events; installing a subscriber
//! is the host's decision. This helper covers the common case: compact
//! stderr output filtered by `RUST_LOG`, defaulting to `info`.

use tracing_subscriber::EnvFilter;

/// Install the default stderr subscriber. Safe to call once per process;
/// later calls are ignored so tests can call it freely.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
