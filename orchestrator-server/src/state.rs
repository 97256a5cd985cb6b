//! Shared application state for the HTTP server.

use std::sync::Arc;

use orchestrator::Supervisor;
use orchestrator::io::init::OrchestratorPaths;
use orchestrator::io::ledger::Ledger;
use orchestrator::io::store::Store;
use orchestrator::model::Task;
use orchestrator::{OrchestratorError, OrchestratorResult, dependencies};

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub paths: Arc<OrchestratorPaths>,
}

impl AppState {
    pub fn new(supervisor: Supervisor, paths: OrchestratorPaths) -> Self {
        Self {
            supervisor,
            paths: Arc::new(paths),
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.supervisor.store().as_ref()
    }

    pub fn task(&self, task_id: &str) -> OrchestratorResult<Task> {
        self.store()
            .task(task_id)?
            .ok_or_else(|| OrchestratorError::not_found("task", task_id))
    }

    /// Ledger for the task, with its state document created if missing.
    pub fn ledger(&self, task: &Task) -> OrchestratorResult<Ledger> {
        let ledger = dependencies::ledger_for(self.store(), task, &self.supervisor.config().ledger)?;
        ledger.ensure(&task.id, &task.title, task.epic_id.as_deref())?;
        Ok(ledger)
    }
}
