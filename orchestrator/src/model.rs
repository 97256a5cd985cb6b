//! Records exchanged with the store boundary.
//!
//! A task is one concrete record with optional relations (epic), not a
//! variant hierarchy. Timestamps are UTC.

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::session_state::check_transition;
use crate::core::types::{ContextKey, FileChangeType, SessionStatus, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub repo_path: PathBuf,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

fn default_base_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epic {
    pub id: String,
    pub project_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    /// Percentage in `0..=100`.
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub requires_approval: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceCriterion {
    pub id: String,
    pub task_id: String,
    pub description: String,
    #[serde(default)]
    pub checked: bool,
    #[serde(default)]
    pub position: u32,
}

/// A file touched by a worker, unique per `(task_id, session_id, path)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub task_id: String,
    pub session_id: String,
    pub path: String,
    pub change_type: FileChangeType,
    pub recorded_at: DateTime<Utc>,
}

/// Persisted view of one worker run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub context: ContextKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<PathBuf>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionRecord {
    /// New record in `starting` with a fresh id.
    pub fn starting(context: ContextKey, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            context,
            pid: None,
            workspace_path: None,
            status: SessionStatus::Starting,
            started_at: now,
            ended_at: None,
            exit_code: None,
            error: None,
        }
    }

    /// Move to `to`, stamping `ended_at` for terminal statuses.
    pub fn transition(&mut self, to: SessionStatus, now: DateTime<Utc>) -> Result<()> {
        check_transition(self.status, to)?;
        self.status = to;
        if to.is_terminal() {
            self.ended_at = Some(now);
        }
        Ok(())
    }

    /// Mark failed with a message, from any non-terminal status.
    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(SessionStatus::Failed, now)?;
        self.error = Some(message.into());
        Ok(())
    }
}
