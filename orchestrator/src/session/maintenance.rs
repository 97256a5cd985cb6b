//! Recovery and housekeeping that run outside a live session.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::exit::{record_completion, release_workspace};
use super::{Inner, Supervisor};
use crate::core::branch::task_branch_name;
use crate::core::types::{ContextKey, SessionStatus, TaskStatus};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::io::pr::{PrOutcome, Publisher, pull_request_body};
use crate::io::store::TaskScope;
use crate::io::workspace::Workspace;
use crate::model::{Project, Task};

/// Statuses whose on-disk workspace is worth keeping across restarts.
const RESUMABLE: [TaskStatus; 3] = [
    TaskStatus::Ready,
    TaskStatus::InProgress,
    TaskStatus::PendingReview,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Sessions left active by a previous process, now failed.
    pub failed_sessions: Vec<String>,
    /// Tasks returned from `in_progress` to `ready`.
    pub requeued_tasks: Vec<String>,
    /// Tasks whose existing checkout is tracked again.
    pub adopted: Vec<String>,
    /// Untracked workspace directories removed.
    pub reconciled: usize,
    /// Workspaces released by the abandoned sweep.
    pub released: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApproveOutcome {
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PrOutcome>,
}

impl Supervisor {
    /// Repair state left behind by a previous process.
    ///
    /// Must run before the first spawn: every persisted active session is
    /// assumed dead.
    pub async fn startup_sweep(&self) -> OrchestratorResult<SweepReport> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.startup_sweep())
            .await
            .map_err(|err| OrchestratorError::Internal(anyhow!("startup sweep panicked: {err}")))?
    }

    /// Release workspaces of idle tasks that nobody has touched for a while.
    pub async fn sweep_abandoned(&self, now: DateTime<Utc>) -> OrchestratorResult<SweepReport> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.sweep_abandoned(now))
            .await
            .map_err(|err| OrchestratorError::Internal(anyhow!("abandoned sweep panicked: {err}")))?
    }

    /// Approve a task waiting for review, publishing its changes first.
    pub async fn approve(&self, task_id: &str) -> OrchestratorResult<ApproveOutcome> {
        let inner = Arc::clone(&self.inner);
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || inner.approve(&task_id))
            .await
            .map_err(|err| OrchestratorError::Internal(anyhow!("approve panicked: {err}")))?
    }
}

impl Inner {
    #[instrument(skip_all)]
    fn startup_sweep(&self) -> OrchestratorResult<SweepReport> {
        let mut report = SweepReport::default();
        let now = Utc::now();
        for mut record in self.store.sessions_with_status(&SessionStatus::ACTIVE)? {
            let message = format!("orchestrator restarted while session was {}", record.status);
            record.fail(message, now)?;
            self.store.save_session(&record)?;
            report.failed_sessions.push(record.id.clone());

            if let Some(task_id) = record.context.task_id()
                && let Some(task) = self.store.task(task_id)?
                && task.status == TaskStatus::InProgress
            {
                self.store.set_task_status(task_id, TaskStatus::Ready)?;
                report.requeued_tasks.push(task_id.to_string());
            }
        }

        for project in self.store.projects()? {
            for task in self.store.tasks(TaskScope::Project(&project.id))? {
                if !RESUMABLE.contains(&task.status) {
                    continue;
                }
                let branch = task_branch_name(&task.id, &task.title);
                match self
                    .workspaces
                    .adopt_existing(&task.id, &project.repo_path, &branch, &project.base_branch)
                {
                    Ok(Some(_)) => report.adopted.push(task.id),
                    Ok(None) => {}
                    Err(err) => warn!(task_id = %task.id, err = %err, "could not adopt workspace"),
                }
            }
            let reconciled = self.workspaces.reconcile_orphans(&project.repo_path);
            for (path, err) in &reconciled.failures {
                warn!(path = %path.display(), err = %err, "orphan cleanup failed");
            }
            report.reconciled += reconciled.removed.len();
        }

        info!(
            failed = report.failed_sessions.len(),
            requeued = report.requeued_tasks.len(),
            adopted = report.adopted.len(),
            reconciled = report.reconciled,
            "startup sweep finished"
        );
        Ok(report)
    }

    #[instrument(skip_all)]
    fn sweep_abandoned(&self, now: DateTime<Utc>) -> OrchestratorResult<SweepReport> {
        let hours = self.config.sweep.abandoned_after_hours;
        let window = i64::try_from(hours)
            .ok()
            .and_then(Duration::try_hours)
            .ok_or_else(|| OrchestratorError::validation(format!("sweep.abandoned_after_hours out of range: {hours}")))?;
        let cutoff = now - window;
        let active: HashSet<ContextKey> = self.registry()?.keys().cloned().collect();
        let mut report = SweepReport::default();

        for project in self.store.projects()? {
            for task in self.store.tasks(TaskScope::Project(&project.id))? {
                if !matches!(task.status, TaskStatus::Ready | TaskStatus::Backlog) {
                    continue;
                }
                let key = ContextKey::task(&task.id);
                if active.contains(&key) {
                    continue;
                }
                let Some(last) = self.store.sessions(Some(&key))?.into_iter().next() else {
                    continue;
                };
                let idle_since = match (last.status.is_terminal(), last.ended_at) {
                    (true, Some(ended)) => ended,
                    _ => continue,
                };
                if idle_since >= cutoff {
                    continue;
                }
                match self.workspaces.release(&task.id, &project.repo_path) {
                    Ok(true) => {
                        info!(task_id = %task.id, %idle_since, "released abandoned workspace");
                        report.released.push(task.id);
                    }
                    Ok(false) => {}
                    Err(err) => warn!(task_id = %task.id, err = %err, "failed to release abandoned workspace"),
                }
            }
        }
        Ok(report)
    }

    #[instrument(skip_all, fields(task_id = %task_id))]
    fn approve(&self, task_id: &str) -> OrchestratorResult<ApproveOutcome> {
        let task = self
            .store
            .task(task_id)?
            .ok_or_else(|| OrchestratorError::not_found("task", task_id))?;
        if task.status != TaskStatus::PendingReview {
            return Err(OrchestratorError::validation(format!(
                "task {task_id} is {}, only pending_review tasks can be approved",
                task.status
            )));
        }
        if self.registry()?.contains_key(&ContextKey::task(task_id)) {
            return Err(OrchestratorError::validation(format!(
                "task {task_id} has an active session"
            )));
        }
        let project = self.project(&task.project_id)?;

        let workspace = self.task_workspace(&project, &task)?;
        let diff = workspace
            .as_ref()
            .map(|ws| self.workspaces.diff_against_base(ws))
            .unwrap_or_default();

        let mut pull_request = None;
        if let Some(ws) = &workspace
            && diff.has_changes()
        {
            let criteria = self.store.criteria(&task.id)?;
            let body = pull_request_body(&task, &criteria, &diff);
            let outcome = Publisher::new(self.config.publish.clone())
                .publish(ws, &task.title, &body)
                .map_err(|err| {
                    warn!(err = %format!("{err:#}"), "publish failed; task stays in review");
                    err.context("publish approved task")
                })?;
            pull_request = Some(outcome);
        }

        self.store.set_task_status(&task.id, TaskStatus::Approved)?;
        if workspace.is_some() {
            release_workspace(self, &task.id, &project.repo_path);
        }
        record_completion(self, &task, &diff)?;
        info!(published = pull_request.is_some(), "task approved");
        Ok(ApproveOutcome {
            status: TaskStatus::Approved,
            pull_request,
        })
    }

    /// Tracked workspace for the task, adopting a valid checkout when untracked.
    fn task_workspace(&self, project: &Project, task: &Task) -> OrchestratorResult<Option<Workspace>> {
        if let Some(ws) = self.workspaces.tracked(&task.id)? {
            return Ok(Some(ws));
        }
        let branch = task_branch_name(&task.id, &task.title);
        Ok(self
            .workspaces
            .adopt_existing(&task.id, &project.repo_path, &branch, &project.base_branch)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::OrchestratorConfig;
    use crate::io::store::{LocalStore, Store};
    use crate::model::SessionRecord;
    use crate::test_support::{init_repo, project, task};

    fn supervisor(store: Arc<LocalStore>, workspaces: &std::path::Path) -> Supervisor {
        Supervisor::new(store, OrchestratorConfig::default(), workspaces)
    }

    #[tokio::test]
    async fn startup_sweep_fails_stale_sessions_and_requeues_tasks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = init_repo(temp.path());
        let store = Arc::new(LocalStore::in_memory());
        store.upsert_project(project("p1", &repo)).expect("project");
        let mut t = task("t1", "p1");
        t.status = TaskStatus::InProgress;
        store.upsert_task(t).expect("task");
        let mut stale = SessionRecord::starting(ContextKey::task("t1"), Utc::now());
        stale
            .transition(SessionStatus::Running, Utc::now())
            .expect("running");
        store.save_session(&stale).expect("save");

        let sup = supervisor(Arc::clone(&store), &temp.path().join("ws"));
        let report = sup.startup_sweep().await.expect("sweep");

        assert_eq!(report.failed_sessions, vec![stale.id.clone()]);
        assert_eq!(report.requeued_tasks, vec!["t1".to_string()]);
        let record = store
            .sessions(Some(&ContextKey::task("t1")))
            .expect("sessions")
            .remove(0);
        assert_eq!(record.status, SessionStatus::Failed);
        assert_eq!(
            record.error.as_deref(),
            Some("orchestrator restarted while session was running")
        );
        assert_eq!(
            store.task("t1").expect("read").expect("task").status,
            TaskStatus::Ready
        );
    }

    #[tokio::test]
    async fn approve_rejects_tasks_not_in_review() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(LocalStore::in_memory());
        store.upsert_project(project("p1", temp.path())).expect("project");
        store.upsert_task(task("t1", "p1")).expect("task");
        let sup = supervisor(Arc::clone(&store), &temp.path().join("ws"));

        let err = sup.approve("t1").await.expect_err("backlog task");
        assert!(matches!(err, OrchestratorError::Validation(_)));
        let err = sup.approve("missing").await.expect_err("unknown task");
        assert!(matches!(err, OrchestratorError::NotFound { .. }));
    }

    #[tokio::test]
    async fn approve_without_changes_completes_and_cascades() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = init_repo(temp.path());
        let store = Arc::new(LocalStore::in_memory());
        store.upsert_project(project("p1", &repo)).expect("project");
        let mut reviewed = task("t1", "p1");
        reviewed.status = TaskStatus::PendingReview;
        store.upsert_task(reviewed).expect("task");
        store.upsert_task(task("t2", "p1")).expect("dependent");
        crate::dependencies::add_dependency(store.as_ref(), "t2", "t1").expect("edge");
        let sup = supervisor(Arc::clone(&store), &temp.path().join("ws"));

        let outcome = sup.approve("t1").await.expect("approve");
        assert_eq!(outcome.status, TaskStatus::Approved);
        assert!(outcome.pull_request.is_none());
        assert_eq!(
            store.task("t2").expect("read").expect("task").status,
            TaskStatus::Ready
        );
        let ledger = crate::io::ledger::Ledger::new(&repo, sup.config().ledger.clone());
        let output = ledger
            .read("t1")
            .expect("read")
            .and_then(|r| r.chain_output)
            .expect("default chain output");
        assert!(output.summary.starts_with("Completed t1 title."));
    }

    #[tokio::test]
    async fn abandoned_sweep_skips_recent_sessions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = init_repo(temp.path());
        let store = Arc::new(LocalStore::in_memory());
        store.upsert_project(project("p1", &repo)).expect("project");
        let mut t = task("t1", "p1");
        t.status = TaskStatus::Ready;
        store.upsert_task(t).expect("task");
        let sup = supervisor(Arc::clone(&store), &temp.path().join("ws"));
        sup.workspaces()
            .acquire("t1", &repo, "task/t1", "main")
            .expect("acquire");

        let ended = Utc::now() - Duration::hours(1);
        let mut record = SessionRecord::starting(ContextKey::task("t1"), ended);
        record.fail("crashed", ended).expect("fail");
        store.save_session(&record).expect("save");

        let report = sup.sweep_abandoned(Utc::now()).await.expect("sweep");
        assert!(report.released.is_empty());
        assert!(sup.workspaces().tracked("t1").expect("tracked").is_some());

        let report = sup
            .sweep_abandoned(Utc::now() + Duration::hours(73))
            .await
            .expect("sweep");
        assert_eq!(report.released, vec!["t1".to_string()]);
        assert!(sup.workspaces().tracked("t1").expect("tracked").is_none());
    }
}
