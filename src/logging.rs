//! Development-time tracing for debugging the orchestrator.
//!
//! Tracing here is dev diagnostics via `RUST_LOG`, written to stderr and
//! never persisted. Product artifacts (iteration records, checkpoints,
//! verification results) live in the artifact store and are always written
//! regardless of the tracing filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber for the CLI.
///
/// Reads `RUST_LOG`; defaults to `warn` if unset. Output goes to stderr in
/// compact format so piped stdout stays machine-readable.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
