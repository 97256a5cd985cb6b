//! Session status transitions.

use anyhow::{Result, bail};

use crate::core::types::SessionStatus;

const VALID_TRANSITIONS: &[(SessionStatus, &[SessionStatus])] = &[
    (
        SessionStatus::Starting,
        &[SessionStatus::Running, SessionStatus::Failed],
    ),
    (
        SessionStatus::Running,
        &[
            SessionStatus::Stopping,
            SessionStatus::Completed,
            SessionStatus::Failed,
        ],
    ),
    (
        SessionStatus::Stopping,
        &[SessionStatus::Stopped, SessionStatus::Failed],
    ),
];

pub fn is_valid_transition(from: SessionStatus, to: SessionStatus) -> bool {
    VALID_TRANSITIONS
        .iter()
        .any(|(f, targets)| *f == from && targets.contains(&to))
}

/// Validate a transition, returning an error naming both ends when illegal.
pub fn check_transition(from: SessionStatus, to: SessionStatus) -> Result<()> {
    if !is_valid_transition(from, to) {
        bail!("invalid session transition: {from} -> {to}");
    }
    Ok(())
}

/// Final status for an exited process.
///
/// A requested stop wins over the exit code; otherwise zero means completed.
pub fn exit_status(stop_requested: bool, exit_code: i32) -> SessionStatus {
    if stop_requested {
        SessionStatus::Stopped
    } else if exit_code == 0 {
        SessionStatus::Completed
    } else {
        SessionStatus::Failed
    }
}
