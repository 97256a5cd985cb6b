//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded (or the worker exited cleanly for `orchestrator run`).
pub const OK: i32 = 0;
/// Invalid arguments, config, or an internal failure.
pub const INVALID: i32 = 1;
/// The requested context, task or session does not exist.
pub const NOT_FOUND: i32 = 2;
/// `orchestrator run`: the worker exited with a non-zero code or was stopped.
pub const WORKER_FAILED: i32 = 3;
