//! Diagnostic tracing for the orchestrator.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: operator diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted and never mixed into worker output.
//!
//! - **State ledger (`io/ledger`)**: durable per-task artifacts under
//!   `.orchestrator/tasks/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset.
/// Output: stderr, compact format, so `orchestrator run` can stream worker
/// output on stdout undisturbed.
///
/// # Example
/// ```bash
/// RUST_LOG=orchestrator=debug orchestrator run task 42
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
