//! Supervises coding-agent worker sessions against a task board.
//!
//! Each task runs in its own git worktree with a terminal-attached worker
//! process. Worker output is filtered, parsed for progress signals and
//! broadcast to subscribers; when the worker exits the task is moved along
//! the board and completed dependencies unblock their dependents.
//!
//! - **[`core`]**: Pure, deterministic logic (state machine, completion table,
//!   dependency rules). No I/O.
//! - **[`io`]**: Side-effecting operations (store, git, worktrees, ledger,
//!   prompts, PTY, publishing).
//! - **[`pipeline`]**: Per-session output processing.
//! - **[`session`]**: The [`session::Supervisor`] that ties everything together.

pub mod core;
pub mod dependencies;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod model;
pub mod pipeline;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::{OrchestratorError, OrchestratorResult};
pub use session::{SpawnOptions, Supervisor};
