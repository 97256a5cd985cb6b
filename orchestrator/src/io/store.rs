//! Persistence boundary.
//!
//! The orchestrator only needs a narrow, key-indexed view of projects,
//! tasks and their satellites. [`Store`] is that view; [`LocalStore`] keeps
//! everything in memory and optionally mirrors it to a JSON file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::fs_util::{read_optional, write_atomic};
use crate::core::deps::{DependencyEdge, validate_new_edge};
use crate::core::types::{ContextKey, SessionStatus, TaskStatus};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{AcceptanceCriterion, Epic, FileChange, Project, SessionRecord, Task};

/// Which tasks to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskScope<'a> {
    Project(&'a str),
    Epic(&'a str),
}

pub trait Store: Send + Sync {
    fn project(&self, id: &str) -> Result<Option<Project>>;
    fn projects(&self) -> Result<Vec<Project>>;
    fn epic(&self, id: &str) -> Result<Option<Epic>>;
    fn task(&self, id: &str) -> Result<Option<Task>>;
    fn tasks(&self, scope: TaskScope<'_>) -> Result<Vec<Task>>;
    fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<()>;
    fn set_task_progress(&self, id: &str, progress: u8) -> Result<()>;

    /// Criteria for a task ordered by position.
    fn criteria(&self, task_id: &str) -> Result<Vec<AcceptanceCriterion>>;
    fn set_criterion_checked(&self, task_id: &str, criterion_id: &str, checked: bool)
    -> Result<()>;

    /// Insert, or update the change type of the record with the same
    /// `(task_id, session_id, path)`.
    fn upsert_file_change(&self, change: FileChange) -> Result<()>;
    fn file_changes(&self, task_id: &str) -> Result<Vec<FileChange>>;

    fn edges(&self) -> Result<Vec<DependencyEdge>>;
    /// Validate (self-edge, duplicate, cycle) and insert atomically.
    fn add_edge(&self, edge: DependencyEdge) -> OrchestratorResult<()>;
    /// Returns false when no such edge existed.
    fn remove_edge(&self, task_id: &str, depends_on_task_id: &str) -> Result<bool>;

    fn save_session(&self, record: &SessionRecord) -> Result<()>;
    /// Sessions, newest first, optionally restricted to one context.
    fn sessions(&self, key: Option<&ContextKey>) -> Result<Vec<SessionRecord>>;
    fn sessions_with_status(&self, statuses: &[SessionStatus]) -> Result<Vec<SessionRecord>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreData {
    pub projects: BTreeMap<String, Project>,
    pub epics: BTreeMap<String, Epic>,
    pub tasks: BTreeMap<String, Task>,
    pub criteria: Vec<AcceptanceCriterion>,
    pub file_changes: Vec<FileChange>,
    pub edges: Vec<DependencyEdge>,
    pub sessions: Vec<SessionRecord>,
}

/// In-memory store, persisted to `path` after every mutation when set.
#[derive(Debug)]
pub struct LocalStore {
    data: Mutex<StoreData>,
    path: Option<PathBuf>,
}

impl LocalStore {
    pub fn in_memory() -> Self {
        Self {
            data: Mutex::new(StoreData::default()),
            path: None,
        }
    }

    /// Open a JSON-backed store; a missing file starts empty.
    pub fn open(path: &Path) -> Result<Self> {
        let data = match read_optional(path)? {
            Some(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("parse store {}", path.display()))?,
            None => StoreData::default(),
        };
        debug!(path = %path.display(), "opened store");
        Ok(Self {
            data: Mutex::new(data),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn upsert_project(&self, project: Project) -> Result<()> {
        self.mutate(|d| {
            d.projects.insert(project.id.clone(), project);
            Ok(())
        })
    }

    pub fn upsert_epic(&self, epic: Epic) -> Result<()> {
        self.mutate(|d| {
            d.epics.insert(epic.id.clone(), epic);
            Ok(())
        })
    }

    pub fn upsert_task(&self, task: Task) -> Result<()> {
        self.mutate(|d| {
            d.tasks.insert(task.id.clone(), task);
            Ok(())
        })
    }

    pub fn upsert_criterion(&self, criterion: AcceptanceCriterion) -> Result<()> {
        self.mutate(|d| {
            match d
                .criteria
                .iter_mut()
                .find(|c| c.id == criterion.id && c.task_id == criterion.task_id)
            {
                Some(existing) => *existing = criterion,
                None => d.criteria.push(criterion),
            }
            Ok(())
        })
    }

    fn data(&self) -> Result<MutexGuard<'_, StoreData>> {
        self.data.lock().map_err(|_| anyhow!("store lock poisoned"))
    }

    /// Apply `f` to a copy and publish it only once the copy is on disk, so a
    /// failed write leaves memory matching the file.
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreData) -> Result<T>) -> Result<T> {
        let mut data = self.data()?;
        let mut next = data.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        *data = next;
        Ok(out)
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut buf = serde_json::to_string_pretty(data).context("serialize store")?;
        buf.push('\n');
        write_atomic(path, &buf)
    }
}

fn task_mut<'a>(data: &'a mut StoreData, id: &str) -> Result<&'a mut Task> {
    data.tasks
        .get_mut(id)
        .ok_or_else(|| anyhow!("task {id} not found"))
}

impl Store for LocalStore {
    fn project(&self, id: &str) -> Result<Option<Project>> {
        Ok(self.data()?.projects.get(id).cloned())
    }

    fn projects(&self) -> Result<Vec<Project>> {
        Ok(self.data()?.projects.values().cloned().collect())
    }

    fn epic(&self, id: &str) -> Result<Option<Epic>> {
        Ok(self.data()?.epics.get(id).cloned())
    }

    fn task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.data()?.tasks.get(id).cloned())
    }

    fn tasks(&self, scope: TaskScope<'_>) -> Result<Vec<Task>> {
        let data = self.data()?;
        Ok(data
            .tasks
            .values()
            .filter(|t| match scope {
                TaskScope::Project(id) => t.project_id == id,
                TaskScope::Epic(id) => t.epic_id.as_deref() == Some(id),
            })
            .cloned()
            .collect())
    }

    fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        self.mutate(|d| {
            task_mut(d, id)?.status = status;
            Ok(())
        })
    }

    fn set_task_progress(&self, id: &str, progress: u8) -> Result<()> {
        self.mutate(|d| {
            task_mut(d, id)?.progress = progress.min(100);
            Ok(())
        })
    }

    fn criteria(&self, task_id: &str) -> Result<Vec<AcceptanceCriterion>> {
        let data = self.data()?;
        let mut criteria: Vec<_> = data
            .criteria
            .iter()
            .filter(|c| c.task_id == task_id)
            .cloned()
            .collect();
        criteria.sort_by(|a, b| (a.position, &a.id).cmp(&(b.position, &b.id)));
        Ok(criteria)
    }

    fn set_criterion_checked(
        &self,
        task_id: &str,
        criterion_id: &str,
        checked: bool,
    ) -> Result<()> {
        self.mutate(|d| {
            let criterion = d
                .criteria
                .iter_mut()
                .find(|c| c.task_id == task_id && c.id == criterion_id)
                .ok_or_else(|| anyhow!("criterion {criterion_id} not found on task {task_id}"))?;
            criterion.checked = checked;
            Ok(())
        })
    }

    fn upsert_file_change(&self, change: FileChange) -> Result<()> {
        self.mutate(|d| {
            match d.file_changes.iter_mut().find(|c| {
                c.task_id == change.task_id
                    && c.session_id == change.session_id
                    && c.path == change.path
            }) {
                Some(existing) => {
                    existing.change_type = change.change_type;
                    existing.recorded_at = change.recorded_at;
                }
                None => d.file_changes.push(change),
            }
            Ok(())
        })
    }

    fn file_changes(&self, task_id: &str) -> Result<Vec<FileChange>> {
        let data = self.data()?;
        Ok(data
            .file_changes
            .iter()
            .filter(|c| c.task_id == task_id)
            .cloned()
            .collect())
    }

    fn edges(&self) -> Result<Vec<DependencyEdge>> {
        Ok(self.data()?.edges.clone())
    }

    fn add_edge(&self, edge: DependencyEdge) -> OrchestratorResult<()> {
        let mut data = self.data()?;
        for id in [&edge.task_id, &edge.depends_on_task_id] {
            if !data.tasks.contains_key(id.as_str()) {
                return Err(OrchestratorError::not_found("task", id.clone()));
            }
        }
        validate_new_edge(&data.edges, &edge.task_id, &edge.depends_on_task_id)?;
        data.edges.push(edge);
        self.persist(&data)?;
        Ok(())
    }

    fn remove_edge(&self, task_id: &str, depends_on_task_id: &str) -> Result<bool> {
        self.mutate(|d| {
            let before = d.edges.len();
            d.edges
                .retain(|e| !(e.task_id == task_id && e.depends_on_task_id == depends_on_task_id));
            Ok(d.edges.len() != before)
        })
    }

    fn save_session(&self, record: &SessionRecord) -> Result<()> {
        self.mutate(|d| {
            match d.sessions.iter_mut().find(|s| s.id == record.id) {
                Some(existing) => *existing = record.clone(),
                None => d.sessions.push(record.clone()),
            }
            Ok(())
        })
    }

    fn sessions(&self, key: Option<&ContextKey>) -> Result<Vec<SessionRecord>> {
        let data = self.data()?;
        let mut sessions: Vec<_> = data
            .sessions
            .iter()
            .filter(|s| key.is_none_or(|k| &s.context == k))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }

    fn sessions_with_status(&self, statuses: &[SessionStatus]) -> Result<Vec<SessionRecord>> {
        let data = self.data()?;
        Ok(data
            .sessions
            .iter()
            .filter(|s| statuses.contains(&s.status))
            .cloned()
            .collect())
    }
}
