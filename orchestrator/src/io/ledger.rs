//! Durable per-task state documents.
//!
//! Each task owns `{repo}/.orchestrator/tasks/{task_id}/STATE.md` plus an
//! `ARCHIVE.md` companion. The document opens with a version marker and a
//! fenced JSON block holding the complete record; the markdown sections
//! after it are regenerated on every write for humans and workers to read.
//! Only the JSON block is parsed back, so round-trips are lossless.
//!
//! A task's document has a single writer at a time: sessions for one task
//! never overlap, so no locking happens here.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::config::LedgerConfig;
use super::fs_util::{read_optional, write_atomic};

const STATE_HEADER: &str = "<!-- task-state v1 -->";
const ARCHIVE_HEADER: &str = "<!-- task-archive v1 -->";
const JSON_FENCE_OPEN: &str = "```json\n";
const JSON_FENCE_CLOSE: &str = "\n```";
/// Accomplishments quoted in the archive rollup.
const HIGHLIGHT_LIMIT: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMetadata {
    pub session_count: u32,
    pub first_session_at: Option<DateTime<Utc>>,
    pub last_session_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Condensed output of a completed dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInput {
    pub source_task_id: String,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub session_number: u32,
    pub timestamp: DateTime<Utc>,
    pub accomplishments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issues: Option<String>,
    pub next_steps: String,
}

/// Progress entry as submitted; the ledger assigns number and timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProgressEntry {
    pub accomplishments: Vec<String>,
    #[serde(default)]
    pub issues: Option<String>,
    #[serde(default)]
    pub next_steps: String,
}

/// Cumulative summary of entries moved to the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRollup {
    pub archived_sessions: u32,
    pub first_session: u32,
    pub last_session: u32,
    pub first_at: DateTime<Utc>,
    pub last_at: DateTime<Utc>,
    pub highlights: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainOutput {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_created: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_contract: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStateRecord {
    pub task_id: String,
    pub title: String,
    pub epic_id: Option<String>,
    pub metadata: StateMetadata,
    pub chain_inputs: Vec<ChainInput>,
    pub progress_log: Vec<ProgressEntry>,
    pub archive: Option<ArchiveRollup>,
    pub chain_output: Option<ChainOutput>,
}

impl TaskStateRecord {
    fn new(task_id: &str, title: &str, epic_id: Option<&str>) -> Self {
        Self {
            task_id: task_id.to_string(),
            title: title.to_string(),
            epic_id: epic_id.map(str::to_string),
            metadata: StateMetadata::default(),
            chain_inputs: Vec::new(),
            progress_log: Vec::new(),
            archive: None,
            chain_output: None,
        }
    }
}

/// A dependency of the task, as seen when chain inputs are injected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedDependency {
    pub task_id: String,
    pub title: String,
    pub chain_output: Option<ChainOutput>,
}

/// Ledger rooted at a project repository.
#[derive(Debug, Clone)]
pub struct Ledger {
    tasks_dir: PathBuf,
    limits: LedgerConfig,
}

impl Ledger {
    pub fn new(repo_root: &Path, limits: LedgerConfig) -> Self {
        Self {
            tasks_dir: repo_root.join(".orchestrator").join("tasks"),
            limits,
        }
    }

    pub fn state_path(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(task_id).join("STATE.md")
    }

    pub fn archive_path(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(task_id).join("ARCHIVE.md")
    }

    /// Create an empty record if none exists; returns the current record.
    #[instrument(skip_all, fields(task_id))]
    pub fn ensure(&self, task_id: &str, title: &str, epic_id: Option<&str>) -> Result<TaskStateRecord> {
        if let Some(existing) = self.read(task_id)? {
            return Ok(existing);
        }
        let record = TaskStateRecord::new(task_id, title, epic_id);
        self.write(&record)?;
        debug!("created task state");
        Ok(record)
    }

    pub fn read(&self, task_id: &str) -> Result<Option<TaskStateRecord>> {
        let path = self.state_path(task_id);
        let Some(contents) = read_optional(&path)? else {
            return Ok(None);
        };
        let record = parse_state(&contents)
            .with_context(|| format!("parse task state {}", path.display()))?;
        Ok(Some(record))
    }

    /// Entries previously moved out of the live document, oldest first.
    pub fn read_archive(&self, task_id: &str) -> Result<Vec<ProgressEntry>> {
        let path = self.archive_path(task_id);
        let Some(contents) = read_optional(&path)? else {
            return Ok(Vec::new());
        };
        parse_archive(&contents).with_context(|| format!("parse archive {}", path.display()))
    }

    /// Append a session entry, archiving older entries when the document is too large.
    #[instrument(skip_all, fields(task_id))]
    pub fn append_session(&self, task_id: &str, entry: NewProgressEntry) -> Result<ProgressEntry> {
        self.append_session_at(task_id, entry, Utc::now())
    }

    pub fn append_session_at(
        &self,
        task_id: &str,
        entry: NewProgressEntry,
        now: DateTime<Utc>,
    ) -> Result<ProgressEntry> {
        let mut record = self
            .read(task_id)?
            .ok_or_else(|| anyhow!("no task state for {task_id}; call ensure first"))?;

        record.metadata.session_count += 1;
        record.metadata.first_session_at.get_or_insert(now);
        record.metadata.last_session_at = Some(now);
        let appended = ProgressEntry {
            session_number: record.metadata.session_count,
            timestamp: now,
            accomplishments: entry.accomplishments,
            issues: entry.issues.filter(|s| !s.trim().is_empty()),
            next_steps: entry.next_steps,
        };
        record.progress_log.push(appended.clone());

        let rendered = render_state(&record)?;
        if rendered.len() > self.limits.max_document_bytes
            || record.progress_log.len() > self.limits.max_entries
        {
            self.archive_older(&mut record)?;
        }
        self.write(&record)?;
        Ok(appended)
    }

    /// Replace chain inputs wholesale from dependencies that recorded an output.
    #[instrument(skip_all, fields(task_id, dependencies = completed.len()))]
    pub fn inject_chain_inputs(
        &self,
        task_id: &str,
        completed: &[CompletedDependency],
    ) -> Result<TaskStateRecord> {
        let mut record = self
            .read(task_id)?
            .ok_or_else(|| anyhow!("no task state for {task_id}; call ensure first"))?;
        record.chain_inputs = completed
            .iter()
            .filter_map(|dep| {
                dep.chain_output.as_ref().map(|output| ChainInput {
                    source_task_id: dep.task_id.clone(),
                    title: dep.title.clone(),
                    content: condense(output),
                })
            })
            .collect();
        self.write(&record)?;
        Ok(record)
    }

    /// Overwrite the chain output and stamp completion time.
    pub fn set_chain_output(&self, task_id: &str, output: ChainOutput) -> Result<TaskStateRecord> {
        let mut record = self
            .read(task_id)?
            .ok_or_else(|| anyhow!("no task state for {task_id}; call ensure first"))?;
        record.chain_output = Some(output);
        record.metadata.completed_at = Some(Utc::now());
        self.write(&record)?;
        Ok(record)
    }

    /// Write a synthesized chain output unless the worker already recorded one.
    ///
    /// Returns true when a default was written.
    pub fn ensure_chain_output(&self, task_id: &str, files_created: Vec<String>) -> Result<bool> {
        let record = self
            .read(task_id)?
            .ok_or_else(|| anyhow!("no task state for {task_id}; call ensure first"))?;
        if record.chain_output.is_some() {
            return Ok(false);
        }
        self.set_chain_output(task_id, default_chain_output(&record, files_created))?;
        debug!(task_id, "wrote default chain output");
        Ok(true)
    }

    fn archive_older(&self, record: &mut TaskStateRecord) -> Result<()> {
        let keep = self.limits.retain_recent.min(record.progress_log.len());
        let split = record.progress_log.len() - keep;
        if split == 0 {
            return Ok(());
        }
        let moved: Vec<ProgressEntry> = record.progress_log.drain(..split).collect();

        let mut archived = self.read_archive(&record.task_id)?;
        archived.extend(moved.iter().cloned());
        write_atomic(
            &self.archive_path(&record.task_id),
            &render_archive(&record.title, &archived)?,
        )?;

        record.archive = Some(extend_rollup(record.archive.take(), &moved));
        info!(
            task_id = %record.task_id,
            archived = moved.len(),
            retained = record.progress_log.len(),
            "archived progress log entries"
        );
        Ok(())
    }

    fn write(&self, record: &TaskStateRecord) -> Result<()> {
        write_atomic(&self.state_path(&record.task_id), &render_state(record)?)
    }
}

/// Chain output for a task that finished without writing one.
pub fn default_chain_output(record: &TaskStateRecord, files_created: Vec<String>) -> ChainOutput {
    let mut summary = format!("Completed {}.", record.title);
    if let Some(last) = record.progress_log.last()
        && !last.accomplishments.is_empty()
    {
        summary.push(' ');
        summary.push_str(&last.accomplishments.join("; "));
    }
    ChainOutput {
        summary,
        files_created: (!files_created.is_empty()).then_some(files_created),
        ..ChainOutput::default()
    }
}

/// Summary, API contract and integration notes of a dependency's output.
fn condense(output: &ChainOutput) -> String {
    let mut content = output.summary.trim().to_string();
    if let Some(contract) = output.api_contract.as_deref().filter(|s| !s.trim().is_empty()) {
        content.push_str("\n\nAPI contract:\n");
        content.push_str(contract.trim());
    }
    if let Some(notes) = output
        .integration_notes
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        content.push_str("\n\nIntegration notes:\n");
        content.push_str(notes.trim());
    }
    content
}

fn extend_rollup(previous: Option<ArchiveRollup>, moved: &[ProgressEntry]) -> ArchiveRollup {
    let first = &moved[0];
    let last = &moved[moved.len() - 1];
    let mut rollup = previous.unwrap_or_else(|| ArchiveRollup {
        archived_sessions: 0,
        first_session: first.session_number,
        last_session: first.session_number,
        first_at: first.timestamp,
        last_at: first.timestamp,
        highlights: Vec::new(),
    });
    rollup.archived_sessions = rollup
        .archived_sessions
        .saturating_add(u32::try_from(moved.len()).unwrap_or(u32::MAX));
    rollup.last_session = last.session_number;
    rollup.last_at = last.timestamp;
    for item in moved.iter().flat_map(|e| e.accomplishments.iter()) {
        if rollup.highlights.len() >= HIGHLIGHT_LIMIT {
            break;
        }
        rollup.highlights.push(item.clone());
    }
    rollup
}

fn render_state(record: &TaskStateRecord) -> Result<String> {
    let json = serde_json::to_string_pretty(record).context("serialize task state")?;
    let mut out = String::new();
    let _ = writeln!(out, "{STATE_HEADER}");
    let _ = writeln!(out, "# Task State: {}\n", record.title);
    let _ = writeln!(out, "{JSON_FENCE_OPEN}{json}{JSON_FENCE_CLOSE}\n");

    let meta = &record.metadata;
    let _ = writeln!(out, "## Metadata\n");
    let _ = writeln!(out, "- Task: {}", record.task_id);
    if let Some(epic) = &record.epic_id {
        let _ = writeln!(out, "- Epic: {epic}");
    }
    let _ = writeln!(out, "- Sessions: {}", meta.session_count);
    if let Some(at) = meta.first_session_at {
        let _ = writeln!(out, "- First session: {}", at.to_rfc3339());
    }
    if let Some(at) = meta.last_session_at {
        let _ = writeln!(out, "- Last session: {}", at.to_rfc3339());
    }
    if let Some(at) = meta.completed_at {
        let _ = writeln!(out, "- Completed: {}", at.to_rfc3339());
    }

    if !record.chain_inputs.is_empty() {
        let _ = writeln!(out, "\n## Chain Inputs");
        for input in &record.chain_inputs {
            let _ = writeln!(out, "\n### From {} ({})\n", input.title, input.source_task_id);
            let _ = writeln!(out, "{}", input.content);
        }
    }

    if let Some(rollup) = &record.archive {
        let _ = writeln!(out, "\n## Archived Sessions\n");
        let _ = writeln!(
            out,
            "Sessions {}-{} ({} entries, {} to {}) are in ARCHIVE.md.",
            rollup.first_session,
            rollup.last_session,
            rollup.archived_sessions,
            rollup.first_at.format("%Y-%m-%d"),
            rollup.last_at.format("%Y-%m-%d"),
        );
        for item in &rollup.highlights {
            let _ = writeln!(out, "- {item}");
        }
    }

    let _ = writeln!(out, "\n## Progress Log");
    for entry in &record.progress_log {
        render_entry(&mut out, entry);
    }

    if let Some(output) = &record.chain_output {
        let _ = writeln!(out, "\n## Chain Output\n");
        let _ = writeln!(out, "{}", output.summary);
        if let Some(files) = &output.files_created {
            let _ = writeln!(out, "\nFiles created:");
            for file in files {
                let _ = writeln!(out, "- {file}");
            }
        }
        for (label, value) in [
            ("API contract", &output.api_contract),
            ("Configuration", &output.configuration),
            ("Integration notes", &output.integration_notes),
        ] {
            if let Some(value) = value {
                let _ = writeln!(out, "\n{label}:\n{value}");
            }
        }
    }
    Ok(out)
}

fn render_entry(out: &mut String, entry: &ProgressEntry) {
    let _ = writeln!(
        out,
        "\n### Session {} ({})\n",
        entry.session_number,
        entry.timestamp.to_rfc3339()
    );
    for item in &entry.accomplishments {
        let _ = writeln!(out, "- {item}");
    }
    if let Some(issues) = &entry.issues {
        let _ = writeln!(out, "\nIssues: {issues}");
    }
    if !entry.next_steps.is_empty() {
        let _ = writeln!(out, "\nNext: {}", entry.next_steps);
    }
}

fn render_archive(title: &str, entries: &[ProgressEntry]) -> Result<String> {
    let json = serde_json::to_string_pretty(entries).context("serialize archive")?;
    let mut out = String::new();
    let _ = writeln!(out, "{ARCHIVE_HEADER}");
    let _ = writeln!(out, "# Archived Sessions: {title}\n");
    let _ = writeln!(out, "{JSON_FENCE_OPEN}{json}{JSON_FENCE_CLOSE}");
    for entry in entries {
        render_entry(&mut out, entry);
    }
    Ok(out)
}

fn parse_state(contents: &str) -> Result<TaskStateRecord> {
    let json = extract_json_block(contents, STATE_HEADER)?;
    serde_json::from_str(json).context("decode task state json")
}

fn parse_archive(contents: &str) -> Result<Vec<ProgressEntry>> {
    let json = extract_json_block(contents, ARCHIVE_HEADER)?;
    serde_json::from_str(json).context("decode archive json")
}

fn extract_json_block<'a>(contents: &'a str, header: &str) -> Result<&'a str> {
    let first_line = contents.lines().next().unwrap_or_default().trim();
    if first_line != header {
        bail!("unsupported document header '{first_line}' (expected '{header}')");
    }
    let start = contents
        .find(JSON_FENCE_OPEN)
        .ok_or_else(|| anyhow!("missing json block"))?
        + JSON_FENCE_OPEN.len();
    let len = contents[start..]
        .find(JSON_FENCE_CLOSE)
        .ok_or_else(|| anyhow!("unterminated json block"))?;
    Ok(&contents[start..start + len])
}
