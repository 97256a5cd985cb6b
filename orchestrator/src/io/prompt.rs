//! Initial instructions handed to a worker when its session starts.

use std::sync::LazyLock;

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use super::ledger::{Ledger, ProgressEntry};
use super::store::{Store, TaskScope};
use crate::core::types::{ContextKey, ContextType};
use crate::error::{OrchestratorError, OrchestratorResult};

/// First line of every task prompt; workers and tests key off it.
pub const TASK_BRIEF_MARKER: &str = "=== TASK BRIEF ===";

const TASK_TEMPLATE: &str = include_str!("prompts/task.md");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");

/// Sections dropped first when the prompt exceeds its budget.
const DROP_ORDER: [&str; 2] = ["history", "chain"];

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("task", TASK_TEMPLATE)?;
        env.add_template("review", REVIEW_TEMPLATE)?;
        Ok(Self { env })
    }
}

#[derive(Debug, Clone, Serialize)]
struct ReviewTask {
    id: String,
    title: String,
    status: String,
    progress: u8,
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Split rendered output on `<!-- section:KEY required|droppable -->` markers.
fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->")
            .expect("section marker pattern is valid")
    });

    let markers: Vec<(usize, usize, String, bool)> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                whole.start(),
                whole.end(),
                caps.get(1)?.as_str().to_string(),
                caps.get(2)?.as_str() == "required",
            ))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (_, end, key, required)) in markers.iter().enumerate() {
        let next = markers.get(i + 1).map_or(rendered.len(), |m| m.0);
        let content = rendered[*end..next].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let other: usize = rest.iter().map(|s| s.content.len()).sum();
    let allowed = budget.saturating_sub(other);
    let before_len = last.content.len();
    let suffix = "\n[truncated]";
    let cut = if allowed > suffix.len() {
        allowed - suffix.len()
    } else {
        allowed
    };
    let mut boundary = cut.min(last.content.len());
    while !last.content.is_char_boundary(boundary) {
        boundary -= 1;
    }
    last.content.truncate(boundary);
    if allowed > suffix.len() {
        last.content.push_str(suffix);
    }
    debug!(
        section = %last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Rendered prompt for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPack {
    content: String,
}

impl PromptPack {
    pub fn render(&self) -> &str {
        &self.content
    }

    pub fn into_string(self) -> String {
        self.content
    }
}

/// Builds prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct ProtocolBuilder {
    budget_bytes: usize,
    recent_sessions: usize,
}

impl ProtocolBuilder {
    pub fn new(budget_bytes: usize, recent_sessions: usize) -> Self {
        Self {
            budget_bytes,
            recent_sessions,
        }
    }

    /// Compose the initial prompt for `key`.
    ///
    /// Task contexts read the ledger for chain inputs and recent history;
    /// the ledger record must already exist or those sections are empty.
    pub fn build_initial_prompt(
        &self,
        store: &dyn Store,
        ledger: &Ledger,
        key: &ContextKey,
        api_url: &str,
    ) -> OrchestratorResult<PromptPack> {
        let engine = PromptEngine::new()?;
        let rendered = match key.context_type {
            ContextType::Task => self.render_task(&engine, store, ledger, &key.context_id, api_url)?,
            ContextType::Epic => {
                let epic = store
                    .epic(&key.context_id)?
                    .ok_or_else(|| OrchestratorError::not_found("epic", &key.context_id))?;
                let tasks = store.tasks(TaskScope::Epic(&epic.id))?;
                render_review(&engine, "Epic", &epic.id, &epic.title, &epic.description, &tasks)?
            }
            ContextType::Project => {
                let project = store
                    .project(&key.context_id)?
                    .ok_or_else(|| OrchestratorError::not_found("project", &key.context_id))?;
                let tasks = store.tasks(TaskScope::Project(&project.id))?;
                let description = format!("Repository: {}", project.repo_path.display());
                render_review(&engine, "Project", &project.id, &project.name, &description, &tasks)?
            }
        };

        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(PromptPack {
            content: render_sections(&sections),
        })
    }

    fn render_task(
        &self,
        engine: &PromptEngine,
        store: &dyn Store,
        ledger: &Ledger,
        task_id: &str,
        api_url: &str,
    ) -> OrchestratorResult<String> {
        let task = store
            .task(task_id)?
            .ok_or_else(|| OrchestratorError::not_found("task", task_id))?;
        let criteria = store.criteria(task_id)?;
        if criteria.is_empty() {
            return Err(OrchestratorError::validation(format!(
                "task {task_id} has no acceptance criteria"
            )));
        }
        let project = store
            .project(&task.project_id)?
            .ok_or_else(|| OrchestratorError::not_found("project", &task.project_id))?;
        let epic = match &task.epic_id {
            Some(id) => store.epic(id)?,
            None => None,
        };

        let record = ledger.read(task_id)?;
        let (chain_inputs, history) = match record {
            Some(record) => {
                let skip = record.progress_log.len().saturating_sub(self.recent_sessions);
                let recent: Vec<ProgressEntry> = record.progress_log.into_iter().skip(skip).collect();
                (record.chain_inputs, recent)
            }
            None => (Vec::new(), Vec::new()),
        };

        let template = engine.env.get_template("task").map_err(anyhow::Error::from)?;
        let rendered = template
            .render(context! {
                marker => TASK_BRIEF_MARKER,
                task => task,
                epic => epic,
                project => project,
                criteria => criteria,
                chain_inputs => chain_inputs,
                history => history,
                api_url => api_url.trim_end_matches('/'),
            })
            .map_err(anyhow::Error::from)?;
        Ok(rendered)
    }
}

fn render_review(
    engine: &PromptEngine,
    scope: &str,
    id: &str,
    title: &str,
    description: &str,
    tasks: &[crate::model::Task],
) -> Result<String> {
    let tasks: Vec<ReviewTask> = tasks
        .iter()
        .map(|t| ReviewTask {
            id: t.id.clone(),
            title: t.title.clone(),
            status: t.status.as_str().to_string(),
            progress: t.progress,
        })
        .collect();
    let template = engine.env.get_template("review")?;
    Ok(template.render(context! {
        scope => scope,
        id => id,
        title => title,
        description => description.trim(),
        tasks => tasks,
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::LedgerConfig;
    use crate::io::ledger::{ChainOutput, CompletedDependency, NewProgressEntry};
    use crate::io::store::LocalStore;
    use crate::test_support::{criterion, epic, project, task};

    const API: &str = "http://127.0.0.1:3001/api";

    fn seeded(root: &std::path::Path) -> LocalStore {
        let store = LocalStore::in_memory();
        store.upsert_project(project("p1", root)).expect("project");
        store.upsert_epic(epic("e1", "p1")).expect("epic");
        let mut t = task("t1", "p1");
        t.epic_id = Some("e1".to_string());
        store.upsert_task(t).expect("task");
        let mut checked = criterion("t1", "c1", 0);
        checked.checked = true;
        store.upsert_criterion(checked).expect("c1");
        store.upsert_criterion(criterion("t1", "c2", 1)).expect("c2");
        store
    }

    #[test]
    fn task_prompt_has_marker_criteria_and_protocol() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = seeded(temp.path());
        let ledger = Ledger::new(temp.path(), LedgerConfig::default());
        let pack = ProtocolBuilder::new(32_000, 3)
            .build_initial_prompt(&store, &ledger, &ContextKey::task("t1"), API)
            .expect("prompt");
        let content = pack.render();

        assert!(content.starts_with(TASK_BRIEF_MARKER));
        assert!(content.contains("- [x] c1 holds (id: c1)"));
        assert!(content.contains("- [ ] c2 holds (id: c2)"));
        assert!(content.contains("e1 title"));
        assert!(content.contains(&format!("{API}/tasks/t1/progress-log")));
        assert!(content.contains("PROGRESS: NN%"));
        assert!(!content.contains("### Chain Inputs"));
    }

    #[test]
    fn task_without_criteria_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = LocalStore::in_memory();
        store.upsert_project(project("p1", temp.path())).expect("project");
        store.upsert_task(task("t2", "p1")).expect("task");
        let ledger = Ledger::new(temp.path(), LedgerConfig::default());
        let err = ProtocolBuilder::new(32_000, 3)
            .build_initial_prompt(&store, &ledger, &ContextKey::task("t2"), API)
            .expect_err("no criteria");
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn includes_chain_inputs_and_recent_history() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = seeded(temp.path());
        let ledger = Ledger::new(temp.path(), LedgerConfig::default());
        ledger.ensure("t1", "t1 title", Some("e1")).expect("ensure");
        ledger
            .inject_chain_inputs(
                "t1",
                &[CompletedDependency {
                    task_id: "d1".to_string(),
                    title: "schema".to_string(),
                    chain_output: Some(ChainOutput {
                        summary: "tables exist".to_string(),
                        ..ChainOutput::default()
                    }),
                }],
            )
            .expect("inject");
        for i in 1..=4 {
            ledger
                .append_session(
                    "t1",
                    NewProgressEntry {
                        accomplishments: vec![format!("step {i}")],
                        issues: None,
                        next_steps: String::new(),
                    },
                )
                .expect("append");
        }

        let pack = ProtocolBuilder::new(32_000, 2)
            .build_initial_prompt(&store, &ledger, &ContextKey::task("t1"), API)
            .expect("prompt");
        let content = pack.render();
        assert!(content.contains("From schema (d1)"));
        assert!(content.contains("tables exist"));
        assert!(!content.contains("step 2"));
        assert!(content.contains("step 3"));
        assert!(content.contains("step 4"));
    }

    #[test]
    fn tight_budget_drops_history_before_required_sections() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = seeded(temp.path());
        let ledger = Ledger::new(temp.path(), LedgerConfig::default());
        ledger.ensure("t1", "t1 title", None).expect("ensure");
        ledger
            .append_session(
                "t1",
                NewProgressEntry {
                    accomplishments: vec!["x".repeat(4_000)],
                    issues: None,
                    next_steps: String::new(),
                },
            )
            .expect("append");

        let pack = ProtocolBuilder::new(3_000, 3)
            .build_initial_prompt(&store, &ledger, &ContextKey::task("t1"), API)
            .expect("prompt");
        let content = pack.render();
        assert!(!content.contains("### Recent Sessions"));
        assert!(content.contains("### Operating Protocol"));
        assert!(content.contains("### Acceptance Criteria"));
    }

    #[test]
    fn epic_context_renders_review_brief() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = seeded(temp.path());
        let ledger = Ledger::new(temp.path(), LedgerConfig::default());
        let pack = ProtocolBuilder::new(32_000, 3)
            .build_initial_prompt(
                &store,
                &ledger,
                &ContextKey::new(ContextType::Epic, "e1"),
                API,
            )
            .expect("prompt");
        let content = pack.render();
        assert!(content.contains("### Epic Review"));
        assert!(content.contains("- t1: t1 title [backlog, 0%]"));
        assert!(!content.contains(TASK_BRIEF_MARKER));
        assert!(!content.contains("Operating Protocol"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut sections = vec![ParsedSection {
            key: "brief".to_string(),
            required: true,
            content: "é".repeat(100),
        }];
        apply_budget(&mut sections, 51);
        assert!(sections[0].content.len() <= 51);
        assert!(sections[0].content.ends_with("[truncated]"));
    }
}
