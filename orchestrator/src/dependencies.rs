//! Task dependency edges and what happens when a dependency completes.

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::core::deps::{DependencyEdge, should_unblock};
use crate::core::types::TaskStatus;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::io::config::LedgerConfig;
use crate::io::ledger::{CompletedDependency, Ledger};
use crate::io::store::Store;
use crate::model::{Project, Task};

/// Tasks touched by a completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeReport {
    /// Dependents moved from backlog to ready.
    pub unblocked: Vec<String>,
    /// Dependents whose chain inputs were refreshed.
    pub reinjected: Vec<String>,
}

/// Add `task_id -> depends_on_task_id`.
///
/// A ready task that gains an incomplete dependency goes back to backlog.
#[instrument(skip_all, fields(task_id, depends_on_task_id))]
pub fn add_dependency(
    store: &dyn Store,
    task_id: &str,
    depends_on_task_id: &str,
) -> OrchestratorResult<()> {
    store.add_edge(DependencyEdge::new(task_id, depends_on_task_id))?;
    let task = require_task(store, task_id)?;
    let dependency = require_task(store, depends_on_task_id)?;
    if task.status == TaskStatus::Ready && !dependency.status.is_complete() {
        store.set_task_status(task_id, TaskStatus::Backlog)?;
        info!("task blocked by new dependency");
    }
    Ok(())
}

/// Remove an edge; returns false when it did not exist.
pub fn remove_dependency(
    store: &dyn Store,
    task_id: &str,
    depends_on_task_id: &str,
) -> OrchestratorResult<bool> {
    Ok(store.remove_edge(task_id, depends_on_task_id)?)
}

/// Tasks `task_id` depends on.
pub fn dependencies(store: &dyn Store, task_id: &str) -> OrchestratorResult<Vec<Task>> {
    require_task(store, task_id)?;
    let ids: Vec<String> = store
        .edges()?
        .into_iter()
        .filter(|e| e.task_id == task_id)
        .map(|e| e.depends_on_task_id)
        .collect();
    load_tasks(store, &ids)
}

/// Tasks that depend on `task_id`.
pub fn dependents(store: &dyn Store, task_id: &str) -> OrchestratorResult<Vec<Task>> {
    require_task(store, task_id)?;
    let ids: Vec<String> = store
        .edges()?
        .into_iter()
        .filter(|e| e.depends_on_task_id == task_id)
        .map(|e| e.task_id)
        .collect();
    load_tasks(store, &ids)
}

/// Move every backlog dependent of `completed_task_id` whose dependencies are
/// now all complete to ready.
pub fn unblock_dependents(store: &dyn Store, completed_task_id: &str) -> OrchestratorResult<Vec<String>> {
    let mut unblocked = Vec::new();
    for dependent in dependents(store, completed_task_id)? {
        let statuses: Vec<TaskStatus> = dependencies(store, &dependent.id)?
            .iter()
            .map(|t| t.status)
            .collect();
        if should_unblock(dependent.status, &statuses) {
            store.set_task_status(&dependent.id, TaskStatus::Ready)?;
            info!(task_id = %dependent.id, "dependent unblocked");
            unblocked.push(dependent.id);
        }
    }
    Ok(unblocked)
}

/// Completed dependencies of `task_id` with their recorded chain outputs.
pub fn completed_dependencies(
    store: &dyn Store,
    ledger_config: &LedgerConfig,
    task_id: &str,
) -> OrchestratorResult<Vec<CompletedDependency>> {
    let mut completed = Vec::new();
    for dependency in dependencies(store, task_id)? {
        if !dependency.status.is_complete() {
            continue;
        }
        let ledger = ledger_for(store, &dependency, ledger_config)?;
        let chain_output = ledger
            .read(&dependency.id)?
            .and_then(|record| record.chain_output);
        completed.push(CompletedDependency {
            task_id: dependency.id,
            title: dependency.title,
            chain_output,
        });
    }
    Ok(completed)
}

/// Refresh a task's chain inputs from its completed dependencies.
pub fn inject_chain_inputs(
    store: &dyn Store,
    ledger_config: &LedgerConfig,
    task: &Task,
) -> OrchestratorResult<()> {
    let completed = completed_dependencies(store, ledger_config, &task.id)?;
    let ledger = ledger_for(store, task, ledger_config)?;
    ledger.ensure(&task.id, &task.title, task.epic_id.as_deref())?;
    ledger.inject_chain_inputs(&task.id, &completed)?;
    Ok(())
}

/// Run the unblocking cascade and re-inject chain inputs into every
/// incomplete dependent of `completed_task_id`.
#[instrument(skip_all, fields(task_id = completed_task_id))]
pub fn propagate_completion(
    store: &dyn Store,
    ledger_config: &LedgerConfig,
    completed_task_id: &str,
) -> OrchestratorResult<CascadeReport> {
    let unblocked = unblock_dependents(store, completed_task_id)?;
    let mut reinjected = Vec::new();
    for dependent in dependents(store, completed_task_id)? {
        if dependent.status.is_complete() {
            continue;
        }
        inject_chain_inputs(store, ledger_config, &dependent)?;
        reinjected.push(dependent.id);
    }
    Ok(CascadeReport {
        unblocked,
        reinjected,
    })
}

/// Ledger rooted at the repository of the task's project.
pub fn ledger_for(store: &dyn Store, task: &Task, config: &LedgerConfig) -> Result<Ledger> {
    let project = store
        .project(&task.project_id)?
        .with_context(|| format!("project {} of task {} not found", task.project_id, task.id))?;
    Ok(ledger_for_project(&project, config))
}

pub fn ledger_for_project(project: &Project, config: &LedgerConfig) -> Ledger {
    Ledger::new(&project.repo_path, config.clone())
}

fn require_task(store: &dyn Store, task_id: &str) -> OrchestratorResult<Task> {
    store
        .task(task_id)?
        .ok_or_else(|| OrchestratorError::not_found("task", task_id))
}

fn load_tasks(store: &dyn Store, ids: &[String]) -> OrchestratorResult<Vec<Task>> {
    ids.iter().map(|id| require_task(store, id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ledger::ChainOutput;
    use crate::io::store::LocalStore;
    use crate::test_support::{project, task};

    fn store_with(root: &std::path::Path, tasks: &[(&str, TaskStatus)]) -> LocalStore {
        let store = LocalStore::in_memory();
        store.upsert_project(project("p1", root)).expect("project");
        for (id, status) in tasks {
            let mut t = task(id, "p1");
            t.status = *status;
            store.upsert_task(t).expect("task");
        }
        store
    }

    fn status(store: &LocalStore, id: &str) -> TaskStatus {
        store.task(id).expect("read").expect("task").status
    }

    #[test]
    fn cascade_unblocks_only_fully_satisfied_dependents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_with(
            temp.path(),
            &[
                ("x", TaskStatus::Backlog),
                ("w", TaskStatus::Backlog),
                ("y", TaskStatus::Done),
                ("z", TaskStatus::InProgress),
            ],
        );
        add_dependency(&store, "x", "y").expect("x->y");
        add_dependency(&store, "w", "y").expect("w->y");
        add_dependency(&store, "w", "z").expect("w->z");

        let unblocked = unblock_dependents(&store, "y").expect("cascade");
        assert_eq!(unblocked, vec!["x".to_string()]);
        assert_eq!(status(&store, "x"), TaskStatus::Ready);
        assert_eq!(status(&store, "w"), TaskStatus::Backlog);
    }

    #[test]
    fn approved_counts_as_complete() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_with(
            temp.path(),
            &[("x", TaskStatus::Backlog), ("y", TaskStatus::Approved)],
        );
        add_dependency(&store, "x", "y").expect("edge");
        unblock_dependents(&store, "y").expect("cascade");
        assert_eq!(status(&store, "x"), TaskStatus::Ready);
    }

    #[test]
    fn new_incomplete_dependency_blocks_ready_task() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_with(
            temp.path(),
            &[("x", TaskStatus::Ready), ("y", TaskStatus::Backlog)],
        );
        add_dependency(&store, "x", "y").expect("edge");
        assert_eq!(status(&store, "x"), TaskStatus::Backlog);
    }

    #[test]
    fn cycles_and_unknown_tasks_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_with(
            temp.path(),
            &[
                ("a", TaskStatus::Backlog),
                ("b", TaskStatus::Backlog),
                ("c", TaskStatus::Backlog),
            ],
        );
        add_dependency(&store, "a", "b").expect("a->b");
        add_dependency(&store, "b", "c").expect("b->c");
        let err = add_dependency(&store, "c", "a").expect_err("cycle");
        assert!(matches!(err, OrchestratorError::Validation(msg) if msg.contains("circular")));
        let err = add_dependency(&store, "a", "missing").expect_err("unknown");
        assert!(matches!(err, OrchestratorError::NotFound { .. }));

        assert!(remove_dependency(&store, "a", "b").expect("remove"));
        assert!(!remove_dependency(&store, "a", "b").expect("remove again"));
        let deps: Vec<String> = dependencies(&store, "b")
            .expect("deps")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(deps, vec!["c".to_string()]);
    }

    #[test]
    fn propagation_reinjects_chain_inputs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_with(
            temp.path(),
            &[("x", TaskStatus::Backlog), ("y", TaskStatus::Done)],
        );
        add_dependency(&store, "x", "y").expect("edge");
        let config = LedgerConfig::default();
        let ledger = Ledger::new(temp.path(), config.clone());
        ledger.ensure("y", "y title", None).expect("ensure");
        ledger
            .set_chain_output(
                "y",
                ChainOutput {
                    summary: "schema ready".to_string(),
                    ..ChainOutput::default()
                },
            )
            .expect("output");

        let report = propagate_completion(&store, &config, "y").expect("propagate");
        assert_eq!(report.unblocked, vec!["x".to_string()]);
        assert_eq!(report.reinjected, vec!["x".to_string()]);
        let record = ledger.read("x").expect("read").expect("record");
        assert_eq!(record.chain_inputs.len(), 1);
        assert_eq!(record.chain_inputs[0].content, "schema ready");
    }
}
