//! Worker session supervision.
//!
//! The [`Supervisor`] owns the registry of active sessions, keyed by
//! [`ContextKey`]. A spawn reserves its key with a `starting` placeholder in a
//! single lock acquisition, prepares the workspace and prompt on the blocking
//! pool, then swaps the placeholder for a running handle before the output
//! driver starts. Each session has exactly one driver task; it owns the output
//! pipeline and runs exit handling to completion.

pub mod events;
mod exit;
mod maintenance;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{Context, anyhow};
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::core::branch::task_branch_name;
use crate::core::types::{ContextKey, ContextType, SessionStatus, TaskStatus};
use crate::dependencies::{self, ledger_for};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::io::config::{OrchestratorConfig, PromptDelivery};
use crate::io::git::Git;
use crate::io::prompt::ProtocolBuilder;
use crate::io::pty::{WorkerCommand, WorkerControl, WorkerExit, WorkerProcess, spawn_worker};
use crate::io::store::Store;
use crate::io::workspace::{Workspace, WorkspaceManager};
use crate::model::{Project, SessionRecord};
use crate::pipeline::OutputPipeline;

use events::{EventHub, EventKind, SessionEvent};
pub use maintenance::{ApproveOutcome, SweepReport};

/// Overrides accepted by [`Supervisor::spawn`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpawnOptions {
    /// Replaces the configured worker command (program followed by arguments).
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

/// A running session.
struct SessionHandle {
    key: ContextKey,
    record: Mutex<SessionRecord>,
    control: WorkerControl,
    stop_requested: AtomicBool,
    workspace: Option<Workspace>,
}

impl SessionHandle {
    fn record(&self) -> anyhow::Result<MutexGuard<'_, SessionRecord>> {
        self.record
            .lock()
            .map_err(|_| anyhow!("session record lock poisoned"))
    }

    fn snapshot(&self) -> anyhow::Result<SessionRecord> {
        Ok(self.record()?.clone())
    }

    fn session_id(&self) -> anyhow::Result<String> {
        Ok(self.record()?.id.clone())
    }
}

enum Slot {
    Starting {
        record: SessionRecord,
        cancel: Arc<AtomicBool>,
    },
    Running(Arc<SessionHandle>),
}

impl Slot {
    fn session_id(&self) -> anyhow::Result<String> {
        match self {
            Slot::Starting { record, .. } => Ok(record.id.clone()),
            Slot::Running(handle) => handle.session_id(),
        }
    }
}

struct Inner {
    store: Arc<dyn Store>,
    config: OrchestratorConfig,
    workspaces: WorkspaceManager,
    events: EventHub,
    registry: Mutex<HashMap<ContextKey, Slot>>,
}

/// A registered, running worker and the streams its driver consumes.
struct Launched {
    record: SessionRecord,
    handle: Arc<SessionHandle>,
    output: mpsc::Receiver<Vec<u8>>,
    exit: oneshot::Receiver<WorkerExit>,
    initial_progress: u8,
}

/// Undo list for a spawn that fails part-way.
#[derive(Default)]
struct Rollback {
    created_workspace: Option<(String, PathBuf)>,
    task_status: Option<(String, TaskStatus)>,
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn Store>,
        config: OrchestratorConfig,
        workspaces_dir: impl Into<PathBuf>,
    ) -> Self {
        let workspaces = WorkspaceManager::new(workspaces_dir, config.publish.remote.clone());
        let events = EventHub::new(config.events.capacity);
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                workspaces,
                events,
                registry: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.inner.workspaces
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Start a worker for `key`.
    ///
    /// Fails with a validation error while another session for the same key
    /// is starting or running. The start runs on its own task, so dropping
    /// the returned future never strands the reservation or the worker.
    #[instrument(skip_all, fields(context = %key))]
    pub async fn spawn(
        &self,
        key: ContextKey,
        options: SpawnOptions,
    ) -> OrchestratorResult<SessionRecord> {
        let record = SessionRecord::starting(key.clone(), Utc::now());
        let cancel = Arc::new(AtomicBool::new(false));
        {
            let mut registry = self.inner.registry()?;
            if registry.contains_key(&key) {
                return Err(OrchestratorError::validation(format!(
                    "session already exists for {key}: already running"
                )));
            }
            registry.insert(
                key.clone(),
                Slot::Starting {
                    record: record.clone(),
                    cancel: Arc::clone(&cancel),
                },
            );
        }

        let inner = Arc::clone(&self.inner);
        let session_id = record.id.clone();
        let start_key = key.clone();
        let joined = tokio::spawn(Inner::start(inner, start_key, record, cancel, options)).await;
        joined.unwrap_or_else(|err| {
            self.inner.remove_slot(&key, Some(&session_id));
            Err(OrchestratorError::Internal(anyhow!("session start task failed: {err}")))
        })
    }

    /// Request termination. Returns false when nothing was tracked for `key`.
    #[instrument(skip_all, fields(context = %key))]
    pub fn stop(&self, key: &ContextKey) -> OrchestratorResult<bool> {
        let handle = {
            let registry = self.inner.registry()?;
            match registry.get(key) {
                None => return Ok(false),
                Some(Slot::Starting { cancel, .. }) => {
                    cancel.store(true, Ordering::SeqCst);
                    return Ok(true);
                }
                Some(Slot::Running(handle)) => Arc::clone(handle),
            }
        };
        self.inner.request_stop(&handle)?;
        Ok(true)
    }

    pub fn send_input(&self, key: &ContextKey, data: &[u8]) -> OrchestratorResult<()> {
        let handle = self.inner.running(key)?;
        handle.control.write(data)?;
        Ok(())
    }

    pub fn resize(&self, key: &ContextKey, cols: u16, rows: u16) -> OrchestratorResult<()> {
        let handle = self.inner.running(key)?;
        handle.control.resize(cols, rows)?;
        Ok(())
    }

    /// Active record for `key`, or the most recent persisted one.
    pub fn status(&self, key: &ContextKey) -> OrchestratorResult<Option<SessionRecord>> {
        if let Some(record) = self.inner.active_record(key)? {
            return Ok(Some(record));
        }
        Ok(self.inner.store.sessions(Some(key))?.into_iter().next())
    }

    /// Persisted records for `key`, newest first.
    pub fn history(&self, key: &ContextKey) -> OrchestratorResult<Vec<SessionRecord>> {
        Ok(self.inner.store.sessions(Some(key))?)
    }

    pub fn list_active(&self) -> OrchestratorResult<Vec<SessionRecord>> {
        let registry = self.inner.registry()?;
        let mut records = registry
            .values()
            .map(|slot| match slot {
                Slot::Starting { record, .. } => Ok(record.clone()),
                Slot::Running(handle) => handle.snapshot(),
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        records.sort_by(|a, b| a.context.cmp(&b.context));
        Ok(records)
    }

    pub fn is_active(&self, key: &ContextKey) -> OrchestratorResult<bool> {
        Ok(self.inner.registry()?.contains_key(key))
    }
}

impl Inner {
    fn registry(&self) -> anyhow::Result<MutexGuard<'_, HashMap<ContextKey, Slot>>> {
        self.registry
            .lock()
            .map_err(|_| anyhow!("session registry lock poisoned"))
    }

    /// Remove `key` if its slot still belongs to `session_id` (any slot when `None`).
    fn remove_slot(&self, key: &ContextKey, session_id: Option<&str>) {
        let Ok(mut registry) = self.registry() else {
            warn!(context = %key, "registry unavailable while deregistering");
            return;
        };
        let owned = match (registry.get(key), session_id) {
            (Some(_), None) => true,
            (Some(slot), Some(id)) => slot.session_id().is_ok_and(|current| current == id),
            (None, _) => false,
        };
        if owned {
            registry.remove(key);
        }
    }

    fn running(&self, key: &ContextKey) -> OrchestratorResult<Arc<SessionHandle>> {
        match self.registry()?.get(key) {
            Some(Slot::Running(handle)) => Ok(Arc::clone(handle)),
            _ => Err(OrchestratorError::not_found("session", key.to_string())),
        }
    }

    fn active_record(&self, key: &ContextKey) -> anyhow::Result<Option<SessionRecord>> {
        match self.registry()?.get(key) {
            Some(Slot::Starting { record, .. }) => Ok(Some(record.clone())),
            Some(Slot::Running(handle)) => Ok(Some(handle.snapshot()?)),
            None => Ok(None),
        }
    }

    fn request_stop(&self, handle: &SessionHandle) -> anyhow::Result<()> {
        let first = !handle.stop_requested.swap(true, Ordering::SeqCst);
        if first {
            let mut record = handle.record()?;
            if record.status == SessionStatus::Running {
                record.transition(SessionStatus::Stopping, Utc::now())?;
                self.store.save_session(&record)?;
            }
            info!(context = %handle.key, session_id = %record.id, "stopping session");
        }
        handle.control.kill()
    }

    /// Launch on the blocking pool, then announce the session and hand its
    /// streams to a driver task. Any failure leaves the key free.
    async fn start(
        self: Arc<Self>,
        key: ContextKey,
        record: SessionRecord,
        cancel: Arc<AtomicBool>,
        options: SpawnOptions,
    ) -> OrchestratorResult<SessionRecord> {
        let inner = Arc::clone(&self);
        let launch_key = key.clone();
        let session_id = record.id.clone();
        let launched = tokio::task::spawn_blocking(move || inner.launch(&launch_key, record, &options))
            .await
            .map_err(|err| OrchestratorError::Internal(anyhow!("spawn preparation panicked: {err}")))
            .and_then(|launched| launched);
        let Launched {
            record,
            handle,
            output,
            exit,
            initial_progress,
        } = match launched {
            Ok(launched) => launched,
            Err(err) => {
                self.remove_slot(&key, Some(&session_id));
                return Err(err);
            }
        };
        info!(session_id = %record.id, pid = ?record.pid, "session running");

        self.events.publish(
            &key,
            &record.id,
            EventKind::Started {
                pid: record.pid,
                workspace: record.workspace_path.clone(),
            },
        );

        if cancel.load(Ordering::SeqCst) {
            debug!("stop requested while starting");
            if let Err(err) = self.request_stop(&handle) {
                warn!(err = %err, "failed to stop session after start");
            }
        }

        let pipeline = OutputPipeline::new(&self.config.pipeline, initial_progress, Instant::now());
        tokio::spawn(exit::drive(self, handle, output, exit, pipeline));
        Ok(record)
    }

    /// Persist the placeholder, prepare and start the worker, and register it.
    ///
    /// On failure the worker is killed, the workspace and task status are
    /// restored, and the record is persisted as failed.
    fn launch(
        &self,
        key: &ContextKey,
        mut record: SessionRecord,
        options: &SpawnOptions,
    ) -> OrchestratorResult<Launched> {
        self.store.save_session(&record)?;
        let mut rollback = Rollback::default();
        match self.launch_inner(key, &mut record, options, &mut rollback) {
            Ok(launched) => Ok(launched),
            Err(err) => {
                warn!(err = %err, "spawn failed");
                self.roll_back(rollback);
                if let Err(persist_err) = record
                    .fail(err.to_string(), Utc::now())
                    .and_then(|()| self.store.save_session(&record))
                {
                    warn!(err = %persist_err, "failed to persist failed session");
                }
                Err(err)
            }
        }
    }

    fn launch_inner(
        &self,
        key: &ContextKey,
        record: &mut SessionRecord,
        options: &SpawnOptions,
        rollback: &mut Rollback,
    ) -> OrchestratorResult<Launched> {
        let (project, task) = match key.context_type {
            ContextType::Task => {
                let task = self
                    .store
                    .task(&key.context_id)?
                    .ok_or_else(|| OrchestratorError::not_found("task", &key.context_id))?;
                (self.project(&task.project_id)?, Some(task))
            }
            ContextType::Epic => {
                let epic = self
                    .store
                    .epic(&key.context_id)?
                    .ok_or_else(|| OrchestratorError::not_found("epic", &key.context_id))?;
                (self.project(&epic.project_id)?, None)
            }
            ContextType::Project => (self.project(&key.context_id)?, None),
        };
        if !project.repo_path.is_dir() {
            return Err(OrchestratorError::validation(format!(
                "project repository {} does not exist",
                project.repo_path.display()
            )));
        }

        let ledger_config = &self.config.ledger;
        let mut workspace = None;
        let mut initial_progress = 0;
        if let Some(task) = &task {
            if !Git::new(&project.repo_path).is_repository() {
                return Err(OrchestratorError::validation(format!(
                    "{} is not a git repository",
                    project.repo_path.display()
                )));
            }
            let existed = self.workspaces.tracked(&task.id)?.is_some()
                || self
                    .workspaces
                    .task_dir(&project.repo_path, &task.id)?
                    .exists();
            let branch = task_branch_name(&task.id, &task.title);
            let acquired = self.workspaces.acquire(
                &task.id,
                &project.repo_path,
                &branch,
                &project.base_branch,
            )?;
            if !existed {
                rollback.created_workspace = Some((task.id.clone(), project.repo_path.clone()));
            }
            workspace = Some(acquired);

            let ledger = ledger_for(self.store.as_ref(), task, ledger_config)?;
            ledger.ensure(&task.id, &task.title, task.epic_id.as_deref())?;
            dependencies::inject_chain_inputs(self.store.as_ref(), ledger_config, task)?;
            initial_progress = task.progress;
        }

        let ledger = dependencies::ledger_for_project(&project, ledger_config);
        let prompt = ProtocolBuilder::new(
            self.config.prompt.budget_bytes,
            self.config.prompt.recent_sessions,
        )
        .build_initial_prompt(self.store.as_ref(), &ledger, key, &self.config.server.api_url)?
        .into_string();

        if let Some(task) = &task {
            self.store.set_task_status(&task.id, TaskStatus::InProgress)?;
            rollback.task_status = Some((task.id.clone(), task.status));
        }

        let cwd = workspace
            .as_ref()
            .map_or_else(|| project.repo_path.clone(), |w| w.path.clone());
        let command = self.worker_command(key, &record.id, &cwd, options, &prompt)?;
        let WorkerProcess {
            pid,
            control,
            output,
            exit,
        } = spawn_worker(&command, self.config.pipeline.channel_capacity)?;
        if let Err(err) = self.activate(record, pid, workspace.as_ref(), &control, &prompt) {
            kill_after_failed_start(&control);
            return Err(err);
        }

        let handle = Arc::new(SessionHandle {
            key: key.clone(),
            record: Mutex::new(record.clone()),
            control,
            stop_requested: AtomicBool::new(false),
            workspace,
        });
        if let Err(err) = self.register(&handle) {
            kill_after_failed_start(&handle.control);
            return Err(err.into());
        }
        Ok(Launched {
            record: record.clone(),
            handle,
            output,
            exit,
            initial_progress,
        })
    }

    /// Deliver the prompt if configured and persist the record as running.
    fn activate(
        &self,
        record: &mut SessionRecord,
        pid: Option<u32>,
        workspace: Option<&Workspace>,
        control: &WorkerControl,
        prompt: &str,
    ) -> OrchestratorResult<()> {
        if self.config.worker.prompt_delivery == PromptDelivery::Stdin {
            control
                .write(format!("{prompt}\n").as_bytes())
                .context("deliver prompt")?;
        }
        record.pid = pid;
        record.workspace_path = workspace.map(|w| w.path.clone());
        record.transition(SessionStatus::Running, Utc::now())?;
        self.store.save_session(record)?;
        Ok(())
    }

    /// Swap the placeholder for the running handle.
    fn register(&self, handle: &Arc<SessionHandle>) -> anyhow::Result<()> {
        self.registry()?
            .insert(handle.key.clone(), Slot::Running(Arc::clone(handle)));
        Ok(())
    }

    fn worker_command(
        &self,
        key: &ContextKey,
        session_id: &str,
        cwd: &Path,
        options: &SpawnOptions,
        prompt: &str,
    ) -> OrchestratorResult<WorkerCommand> {
        let argv = options
            .command
            .clone()
            .unwrap_or_else(|| self.config.worker.command.clone());
        let mut argv = argv.into_iter();
        let program = argv
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| OrchestratorError::validation("worker command is empty"))?;
        let mut args: Vec<String> = argv.collect();
        if self.config.worker.prompt_delivery == PromptDelivery::Argument {
            args.push(prompt.to_string());
        }
        Ok(WorkerCommand {
            program,
            args,
            cwd: cwd.to_path_buf(),
            env: vec![
                ("ORCHESTRATOR_SESSION_ID".to_string(), session_id.to_string()),
                (
                    "ORCHESTRATOR_CONTEXT_TYPE".to_string(),
                    key.context_type.as_str().to_string(),
                ),
                ("ORCHESTRATOR_CONTEXT_ID".to_string(), key.context_id.clone()),
                (
                    "ORCHESTRATOR_WORKSPACE".to_string(),
                    cwd.display().to_string(),
                ),
                (
                    "ORCHESTRATOR_API_URL".to_string(),
                    self.config.server.api_url.clone(),
                ),
                ("TERM".to_string(), "xterm-256color".to_string()),
            ],
            cols: self.config.worker.cols,
            rows: self.config.worker.rows,
        })
    }

    fn roll_back(&self, rollback: Rollback) {
        if let Some((task_id, status)) = rollback.task_status
            && let Err(err) = self.store.set_task_status(&task_id, status)
        {
            warn!(task_id = %task_id, err = %err, "failed to restore task status");
        }
        if let Some((task_id, repo_path)) = rollback.created_workspace
            && let Err(err) = self.workspaces.release(&task_id, &repo_path)
        {
            warn!(task_id = %task_id, err = %err, "failed to release workspace during rollback");
        }
    }

    fn project(&self, project_id: &str) -> OrchestratorResult<Project> {
        self.store
            .project(project_id)
            .context("load project")?
            .ok_or_else(|| OrchestratorError::not_found("project", project_id))
    }
}

fn kill_after_failed_start(control: &WorkerControl) {
    if let Err(err) = control.kill() {
        warn!(err = %err, "failed to kill worker after failed start");
    }
}
