//! The per-session driver: output delivery while the worker runs, then exit
//! handling in a fixed order.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::events::EventKind;
use super::{Inner, SessionHandle};
use crate::core::completion::{CompletionAction, CompletionInput, decide, settle_publish};
use crate::core::session_state::exit_status;
use crate::core::types::{FileChangeType, TaskStatus};
use crate::dependencies::{ledger_for, propagate_completion};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::io::pr::{PrOutcome, Publisher, pull_request_body};
use crate::io::pty::WorkerExit;
use crate::io::store::Store;
use crate::io::workspace::WorkspaceDiff;
use crate::model::FileChange;
use crate::pipeline::{OutputPipeline, PipelineOutput};

/// Outcome of post-exit handling for a task session.
struct TaskCompletion {
    status: TaskStatus,
    action: CompletionAction,
    pull_request: Option<PrOutcome>,
}

/// A store write produced by output delivery.
#[derive(Debug)]
enum TaskWrite {
    Progress(u8),
    FileChange(FileChange),
}

/// Applies a task session's progress and file-change writes on the blocking
/// pool, in order, so the driver never waits on the store.
struct TaskWriter {
    tx: mpsc::UnboundedSender<Vec<TaskWrite>>,
    join: JoinHandle<()>,
}

impl TaskWriter {
    fn spawn(store: Arc<dyn Store>, task_id: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<TaskWrite>>();
        let join = tokio::spawn(async move {
            while let Some(mut batch) = rx.recv().await {
                while let Ok(more) = rx.try_recv() {
                    batch.extend(more);
                }
                let store = Arc::clone(&store);
                let task_id = task_id.clone();
                let applied = tokio::task::spawn_blocking(move || {
                    apply_writes(store.as_ref(), &task_id, batch);
                });
                if let Err(err) = applied.await {
                    warn!(err = %err, "task write batch panicked");
                }
            }
        });
        Self { tx, join }
    }

    fn send(&self, batch: Vec<TaskWrite>) {
        if !batch.is_empty() && self.tx.send(batch).is_err() {
            warn!("task writer stopped; dropping writes");
        }
    }

    /// Wait until every queued write has been applied.
    async fn close(self) {
        drop(self.tx);
        if let Err(err) = self.join.await {
            warn!(err = %err, "task writer failed");
        }
    }
}

/// File changes in order; only the newest progress value is written.
fn apply_writes(store: &dyn Store, task_id: &str, batch: Vec<TaskWrite>) {
    let mut progress = None;
    for write in batch {
        match write {
            TaskWrite::Progress(value) => progress = Some(value),
            TaskWrite::FileChange(change) => {
                if let Err(err) = store.upsert_file_change(change) {
                    warn!(task_id, err = %err, "failed to record file change");
                }
            }
        }
    }
    if let Some(value) = progress
        && let Err(err) = store.set_task_progress(task_id, value)
    {
        warn!(task_id, err = %err, "failed to persist progress");
    }
}

pub(super) async fn drive(
    inner: Arc<Inner>,
    handle: Arc<SessionHandle>,
    mut output: mpsc::Receiver<Vec<u8>>,
    exit: oneshot::Receiver<WorkerExit>,
    mut pipeline: OutputPipeline,
) {
    let session_id = match handle.session_id() {
        Ok(id) => id,
        Err(err) => {
            warn!(err = %err, "session record unavailable; driver not started");
            return;
        }
    };
    let config = inner.config.pipeline.clone();
    let mut estimate = tokio::time::interval(config.estimate_interval());
    estimate.set_missed_tick_behavior(MissedTickBehavior::Skip);
    estimate.reset();
    let mut flush_at: Option<Instant> = None;
    let writer_owned = handle
        .key
        .task_id()
        .map(|task_id| TaskWriter::spawn(Arc::clone(&inner.store), task_id.to_string()));
    let writer = writer_owned.as_ref();
    tokio::pin!(exit);

    let exited = loop {
        let flush = async move {
            match flush_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            chunk = output.recv() => match chunk {
                Some(bytes) => {
                    let outputs = pipeline.process(&bytes, Instant::now().into_std());
                    deliver(&inner, &handle, &session_id, writer, outputs);
                    flush_at = pipeline
                        .has_pending()
                        .then(|| flush_at.unwrap_or_else(|| Instant::now() + config.debounce()));
                }
                None => break (&mut exit).await,
            },
            result = &mut exit => break result,
            () = flush => {
                let outputs = pipeline.flush_pending().into_iter().collect();
                deliver(&inner, &handle, &session_id, writer, outputs);
                flush_at = None;
            }
            _ = estimate.tick() => {
                if let Some(progress) = pipeline.estimate_tick(Instant::now().into_std()) {
                    deliver(&inner, &handle, &session_id, writer, vec![progress]);
                }
            }
        }
    };
    let code = exited.ok().and_then(|e| e.code);

    // Output may still be in flight after the exit status arrives.
    let deadline = Instant::now() + config.exit_drain();
    while let Ok(Some(bytes)) = tokio::time::timeout_at(deadline, output.recv()).await {
        let outputs = pipeline.process(&bytes, Instant::now().into_std());
        deliver(&inner, &handle, &session_id, writer, outputs);
    }
    let outputs = pipeline.finish(Instant::now().into_std());
    deliver(&inner, &handle, &session_id, writer, outputs);
    drop(output);
    // Trailing writes must land before completion sets the final progress.
    if let Some(writer) = writer_owned {
        writer.close().await;
    }

    finalize(inner, handle, session_id, code).await;
}

/// Publish pipeline outputs in order and queue their store writes for tasks.
fn deliver(
    inner: &Inner,
    handle: &SessionHandle,
    session_id: &str,
    writer: Option<&TaskWriter>,
    outputs: Vec<PipelineOutput>,
) {
    let key = &handle.key;
    let mut writes = Vec::new();
    for item in outputs {
        let kind = match item {
            PipelineOutput::Raw(data) => EventKind::Output { data },
            PipelineOutput::Progress { value, applied } => {
                if applied {
                    writes.push(TaskWrite::Progress(value));
                }
                EventKind::Progress { value, applied }
            }
            PipelineOutput::FileChange { path, change } => {
                if let Some(task_id) = key.task_id() {
                    writes.push(TaskWrite::FileChange(FileChange {
                        task_id: task_id.to_string(),
                        session_id: session_id.to_string(),
                        path: path.clone(),
                        change_type: change,
                        recorded_at: Utc::now(),
                    }));
                }
                EventKind::FileChange { path, change }
            }
            PipelineOutput::TestResult(summary) => EventKind::TestResult(summary),
        };
        inner.events.publish(key, session_id, kind);
    }
    if let Some(writer) = writer {
        writer.send(writes);
    }
}

/// Deregister, persist the final status, announce the exit, then settle the task.
#[instrument(skip_all, fields(context = %handle.key, session_id = %session_id))]
async fn finalize(inner: Arc<Inner>, handle: Arc<SessionHandle>, session_id: String, code: Option<i32>) {
    inner.remove_slot(&handle.key, Some(&session_id));

    let stop_requested = handle.stop_requested.load(Ordering::SeqCst);
    let status = exit_status(stop_requested, code.unwrap_or(-1));
    let persisted = handle.record().and_then(|mut record| {
        let now = Utc::now();
        if let Err(err) = record.transition(status, now) {
            warn!(err = %err, "unexpected exit transition; marking failed");
            let message = format!("worker exited during {}", record.status);
            record.fail(message, now)?;
        }
        record.exit_code = code;
        inner.store.save_session(&record)?;
        Ok(record.status)
    });
    let final_status = match persisted {
        Ok(s) => s,
        Err(err) => {
            warn!(err = %err, "failed to persist session exit");
            status
        }
    };
    info!(?code, status = %final_status, "session exited");
    inner.events.publish(
        &handle.key,
        &session_id,
        EventKind::Exit {
            code,
            status: final_status,
        },
    );

    if handle.key.task_id().is_none() {
        return;
    }
    let worker = Arc::clone(&inner);
    let task_handle = Arc::clone(&handle);
    let settled = tokio::task::spawn_blocking(move || settle_task(&worker, &task_handle, code))
        .await
        .unwrap_or_else(|err| Err(OrchestratorError::Internal(anyhow::anyhow!("completion panicked: {err}"))));

    let kind = match settled {
        Ok(done) => EventKind::Completion {
            task_status: done.status,
            action: done.action,
            pull_request: done.pull_request,
        },
        Err(err) => {
            warn!(err = %err, "task completion failed");
            EventKind::CompletionError {
                message: err.to_string(),
            }
        }
    };
    inner.events.publish(&handle.key, &session_id, kind);
}

/// Apply the completion decision and its side effects.
fn settle_task(inner: &Inner, handle: &SessionHandle, code: Option<i32>) -> OrchestratorResult<TaskCompletion> {
    let task_id = handle
        .key
        .task_id()
        .ok_or_else(|| OrchestratorError::validation("completion requires a task context"))?;
    let task = inner
        .store
        .task(task_id)?
        .ok_or_else(|| OrchestratorError::not_found("task", task_id))?;

    let diff = handle
        .workspace
        .as_ref()
        .map(|ws| inner.workspaces.diff_against_base(ws))
        .unwrap_or_default();
    let decision = decide(CompletionInput {
        exit_code: code.unwrap_or(-1),
        has_changes: diff.has_changes(),
        requires_approval: task.requires_approval,
    });
    debug!(?decision, files = diff.files.len(), "completion decided");

    let mut pull_request = None;
    match (decision.action, &handle.workspace) {
        (CompletionAction::CommitAndPublish, Some(ws)) => {
            let criteria = inner.store.criteria(&task.id)?;
            let body = pull_request_body(&task, &criteria, &diff);
            match Publisher::new(inner.config.publish.clone()).publish(ws, &task.title, &body) {
                Ok(outcome) => {
                    pull_request = Some(outcome);
                    release_workspace(inner, &task.id, &ws.repo_path);
                }
                Err(err) => warn!(err = %format!("{err:#}"), "publish failed; task parked for review"),
            }
        }
        (CompletionAction::ReleaseWorkspace, Some(ws)) => {
            release_workspace(inner, &task.id, &ws.repo_path);
        }
        _ => {}
    }

    let status = settle_publish(decision, pull_request.is_some());
    inner.store.set_task_status(&task.id, status)?;
    if status == TaskStatus::Done {
        inner.store.set_task_progress(&task.id, 100)?;
    }
    if status.is_complete() {
        record_completion(inner, &task, &diff)?;
    }
    Ok(TaskCompletion {
        status,
        action: decision.action,
        pull_request,
    })
}

/// Default chain output plus the dependency cascade for a completed task.
pub(super) fn record_completion(
    inner: &Inner,
    task: &crate::model::Task,
    diff: &WorkspaceDiff,
) -> OrchestratorResult<()> {
    let ledger = ledger_for(inner.store.as_ref(), task, &inner.config.ledger)?;
    ledger.ensure(&task.id, &task.title, task.epic_id.as_deref())?;
    ledger.ensure_chain_output(&task.id, diff.paths_with(FileChangeType::Created))?;
    let report = propagate_completion(inner.store.as_ref(), &inner.config.ledger, &task.id)?;
    info!(
        task_id = %task.id,
        unblocked = report.unblocked.len(),
        reinjected = report.reinjected.len(),
        "completion propagated"
    );
    Ok(())
}

pub(super) fn release_workspace(inner: &Inner, task_id: &str, repo_path: &std::path::Path) {
    if let Err(err) = inner.workspaces.release(task_id, repo_path) {
        warn!(task_id, err = %err, "failed to release workspace");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::store::LocalStore;
    use crate::test_support::{project, task};

    fn change(path: &str, change_type: FileChangeType) -> TaskWrite {
        TaskWrite::FileChange(FileChange {
            task_id: "t1".to_string(),
            session_id: "s1".to_string(),
            path: path.to_string(),
            change_type,
            recorded_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn writer_applies_queued_writes_before_close_returns() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(LocalStore::in_memory());
        store.upsert_project(project("p1", temp.path())).expect("project");
        store.upsert_task(task("t1", "p1")).expect("task");

        let writer = TaskWriter::spawn(store.clone(), "t1".to_string());
        writer.send(vec![TaskWrite::Progress(10), change("src/a.rs", FileChangeType::Created)]);
        writer.send(Vec::new());
        writer.send(vec![
            change("src/a.rs", FileChangeType::Modified),
            TaskWrite::Progress(40),
        ]);
        writer.close().await;

        assert_eq!(store.task("t1").expect("read").expect("task").progress, 40);
        let changes = store.file_changes("t1").expect("changes");
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, FileChangeType::Modified);
    }

    #[test]
    fn only_newest_progress_in_a_batch_is_written() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::in_memory();
        store.upsert_project(project("p1", temp.path())).expect("project");
        store.upsert_task(task("t1", "p1")).expect("task");

        apply_writes(
            &store,
            "t1",
            vec![TaskWrite::Progress(70), TaskWrite::Progress(35)],
        );
        assert_eq!(store.task("t1").expect("read").expect("task").progress, 35);
    }
}
