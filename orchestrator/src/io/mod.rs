//! Side-effecting pieces: persistence, git, processes, templates.

pub mod config;
pub mod fs_util;
pub mod git;
pub mod init;
pub mod ledger;
pub mod pr;
pub mod process;
pub mod prompt;
pub mod pty;
pub mod store;
pub mod workspace;
