//! Shared deterministic types for orchestrator core logic.
//!
//! These types define stable contracts between the supervisor, the store
//! boundary and the pipeline. They carry no I/O and serialize with stable
//! snake_case names so persisted records survive upgrades.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Unit of work a session operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    Task,
    Epic,
    Project,
}

impl ContextType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextType::Task => "task",
            ContextType::Epic => "epic",
            ContextType::Project => "project",
        }
    }
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "task" => Ok(ContextType::Task),
            "epic" => Ok(ContextType::Epic),
            "project" => Ok(ContextType::Project),
            other => Err(anyhow!("unknown context type '{other}'")),
        }
    }
}

/// Composite identity of a session: at most one active session per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextKey {
    pub context_type: ContextType,
    pub context_id: String,
}

impl ContextKey {
    pub fn new(context_type: ContextType, context_id: impl Into<String>) -> Self {
        Self {
            context_type,
            context_id: context_id.into(),
        }
    }

    pub fn task(task_id: impl Into<String>) -> Self {
        Self::new(ContextType::Task, task_id)
    }

    /// Task id when this key addresses a task context.
    pub fn task_id(&self) -> Option<&str> {
        (self.context_type == ContextType::Task).then_some(self.context_id.as_str())
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.context_type, self.context_id)
    }
}

/// Lifecycle of one worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl SessionStatus {
    /// Statuses that mean a live process may still exist.
    pub const ACTIVE: [SessionStatus; 3] = [
        SessionStatus::Starting,
        SessionStatus::Running,
        SessionStatus::Stopping,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Stopped | SessionStatus::Completed | SessionStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Board status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Ready,
    InProgress,
    PendingReview,
    Approved,
    Done,
}

impl TaskStatus {
    /// Statuses that satisfy a dependency edge.
    pub fn is_complete(self) -> bool {
        matches!(self, TaskStatus::Approved | TaskStatus::Done)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::PendingReview => "pending_review",
            TaskStatus::Approved => "approved",
            TaskStatus::Done => "done",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a worker touched a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeType {
    Created,
    Modified,
    Deleted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_type_parses_and_displays() {
        for ty in [ContextType::Task, ContextType::Epic, ContextType::Project] {
            let parsed: ContextType = ty.as_str().parse().expect("parse");
            assert_eq!(parsed, ty);
        }
        assert!("release".parse::<ContextType>().is_err());
    }

    #[test]
    fn task_status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::PendingReview).expect("serialize");
        assert_eq!(json, "\"pending_review\"");
        assert!(TaskStatus::Approved.is_complete());
        assert!(!TaskStatus::PendingReview.is_complete());
    }

    #[test]
    fn only_task_keys_expose_task_id() {
        assert_eq!(ContextKey::task("t1").task_id(), Some("t1"));
        assert_eq!(ContextKey::new(ContextType::Epic, "e1").task_id(), None);
    }
}
