//! Post-run completion decision.
//!
//! Maps `(exit_code, has_changes, requires_approval)` to the resulting task
//! status and the side effect the supervisor must perform. The decision is
//! pure; publishing and workspace cleanup happen in the session exit path.

use serde::{Deserialize, Serialize};

use crate::core::types::TaskStatus;

/// Inputs observed once a task worker has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionInput {
    pub exit_code: i32,
    pub has_changes: bool,
    pub requires_approval: bool,
}

/// Side effect requested by a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionAction {
    /// Keep the workspace for a retry.
    RetainWorkspace,
    /// Nothing automatic; a human approves later.
    AwaitReview,
    /// Commit, push and open a pull request; release the workspace on success.
    CommitAndPublish,
    /// Release the workspace.
    ReleaseWorkspace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionDecision {
    pub status: TaskStatus,
    pub action: CompletionAction,
}

/// Decide the resulting task status for a finished worker.
pub fn decide(input: CompletionInput) -> CompletionDecision {
    if input.exit_code != 0 {
        return CompletionDecision {
            status: TaskStatus::Ready,
            action: CompletionAction::RetainWorkspace,
        };
    }
    match (input.has_changes, input.requires_approval) {
        (_, true) => CompletionDecision {
            status: TaskStatus::PendingReview,
            action: CompletionAction::AwaitReview,
        },
        (true, false) => CompletionDecision {
            status: TaskStatus::Done,
            action: CompletionAction::CommitAndPublish,
        },
        (false, false) => CompletionDecision {
            status: TaskStatus::Done,
            action: CompletionAction::ReleaseWorkspace,
        },
    }
}

/// Status after attempting to publish: a failed publish parks the task for review.
pub fn settle_publish(decision: CompletionDecision, published: bool) -> TaskStatus {
    match (decision.action, published) {
        (CompletionAction::CommitAndPublish, false) => TaskStatus::PendingReview,
        _ => decision.status,
    }
}
