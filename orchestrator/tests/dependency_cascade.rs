//! Dependency graph rules and the completion cascade across a small board.

use orchestrator::OrchestratorError;
use orchestrator::core::types::TaskStatus;
use orchestrator::dependencies::{
    add_dependency, dependencies, dependents, propagate_completion, remove_dependency,
};
use orchestrator::io::config::LedgerConfig;
use orchestrator::io::ledger::{ChainOutput, Ledger};
use orchestrator::io::store::{LocalStore, Store};
use orchestrator::test_support::{project, task};

fn board(root: &std::path::Path) -> LocalStore {
    let store = LocalStore::in_memory();
    store.upsert_project(project("p1", root)).expect("project");
    for id in ["schema", "api", "ui", "docs"] {
        store.upsert_task(task(id, "p1")).expect("task");
    }
    store
}

fn status(store: &LocalStore, id: &str) -> TaskStatus {
    store.task(id).expect("read").expect("task").status
}

fn ids(tasks: Vec<orchestrator::model::Task>) -> Vec<String> {
    let mut ids: Vec<String> = tasks.into_iter().map(|t| t.id).collect();
    ids.sort();
    ids
}

#[test]
fn multi_hop_cycles_are_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = board(temp.path());
    add_dependency(&store, "ui", "api").expect("ui -> api");
    add_dependency(&store, "api", "schema").expect("api -> schema");
    add_dependency(&store, "docs", "ui").expect("docs -> ui");

    let err = add_dependency(&store, "schema", "docs").expect_err("cycle");
    match err {
        OrchestratorError::Validation(msg) => assert!(msg.contains("circular"), "{msg}"),
        other => panic!("expected validation error, got {other:?}"),
    }
    let err = add_dependency(&store, "api", "api").expect_err("self");
    assert!(matches!(err, OrchestratorError::Validation(_)));
    let err = add_dependency(&store, "ui", "api").expect_err("duplicate");
    assert!(matches!(err, OrchestratorError::Validation(_)));
    assert_eq!(store.edges().expect("edges").len(), 3);
}

#[test]
fn completion_cascades_one_level_at_a_time() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = board(temp.path());
    add_dependency(&store, "api", "schema").expect("api -> schema");
    add_dependency(&store, "ui", "api").expect("ui -> api");
    add_dependency(&store, "docs", "api").expect("docs -> api");
    add_dependency(&store, "docs", "ui").expect("docs -> ui");
    let config = LedgerConfig::default();
    let ledger = Ledger::new(temp.path(), config.clone());

    store.set_task_status("schema", TaskStatus::Done).expect("done");
    ledger.ensure("schema", "schema title", None).expect("ensure");
    ledger
        .set_chain_output(
            "schema",
            ChainOutput {
                summary: "tables: users, orders".to_string(),
                ..ChainOutput::default()
            },
        )
        .expect("output");

    let report = propagate_completion(&store, &config, "schema").expect("cascade");
    assert_eq!(report.unblocked, vec!["api".to_string()]);
    assert_eq!(status(&store, "api"), TaskStatus::Ready);
    assert_eq!(status(&store, "ui"), TaskStatus::Backlog);
    let api_state = ledger.read("api").expect("read").expect("api state");
    assert_eq!(api_state.chain_inputs[0].source_task_id, "schema");

    store.set_task_status("api", TaskStatus::Approved).expect("approved");
    let report = propagate_completion(&store, &config, "api").expect("cascade");
    assert_eq!(report.unblocked, vec!["ui".to_string()]);
    assert_eq!(ids_of(&report.reinjected), vec!["docs".to_string(), "ui".to_string()]);
    assert_eq!(status(&store, "docs"), TaskStatus::Backlog, "docs still waits on ui");

    assert_eq!(ids(dependencies(&store, "docs").expect("deps")), vec!["api", "ui"]);
    assert_eq!(ids(dependents(&store, "api").expect("dependents")), vec!["docs", "ui"]);
}

fn ids_of(ids: &[String]) -> Vec<String> {
    let mut sorted = ids.to_vec();
    sorted.sort();
    sorted
}

#[test]
fn removing_an_edge_leaves_status_alone() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = board(temp.path());
    store.set_task_status("ui", TaskStatus::Ready).expect("ready");
    add_dependency(&store, "ui", "api").expect("ui -> api");
    assert_eq!(status(&store, "ui"), TaskStatus::Backlog);

    assert!(remove_dependency(&store, "ui", "api").expect("remove"));
    assert_eq!(status(&store, "ui"), TaskStatus::Backlog);
    assert!(dependencies(&store, "ui").expect("deps").is_empty());
}
