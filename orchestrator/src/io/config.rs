//! Orchestrator configuration stored under `.orchestrator/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Orchestrator configuration (TOML).
///
/// Edited by humans; missing fields default to values that work for a
/// single-operator setup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub worker: WorkerConfig,
    pub pipeline: PipelineConfig,
    pub ledger: LedgerConfig,
    pub prompt: PromptConfig,
    pub publish: PublishConfig,
    pub server: ServerConfig,
    pub events: EventsConfig,
    pub sweep: SweepConfig,
}

/// How the initial prompt reaches the worker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PromptDelivery {
    /// Appended as the final command-line argument.
    Argument,
    /// Written to the terminal once the process is running.
    Stdin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Program and leading arguments (e.g. `["claude", "--dangerously-skip-permissions"]`).
    pub command: Vec<String>,
    pub prompt_delivery: PromptDelivery,
    pub cols: u16,
    pub rows: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string()],
            prompt_delivery: PromptDelivery::Argument,
            cols: 120,
            rows: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Buffered output is emitted in slices of this many bytes.
    pub flush_threshold_bytes: usize,
    /// Small writes are flushed after this quiet period.
    pub debounce_ms: u64,
    /// Raw PTY chunks queued between the reader thread and the session driver.
    pub channel_capacity: usize,
    /// Minimum percentage-point change before progress is persisted.
    pub progress_threshold: u8,
    /// How often an activity estimate is offered when no explicit progress is seen.
    pub estimate_interval_secs: u64,
    /// Repeated task-brief renders inside this window are suppressed.
    pub dedupe_window_ms: u64,
    /// How long to keep draining output after the process has exited.
    pub exit_drain_ms: u64,
    /// Longest partial line the parser holds; older bytes of a longer line are dropped.
    pub max_line_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_threshold_bytes: 8 * 1024,
            debounce_ms: 40,
            channel_capacity: 256,
            progress_threshold: 5,
            estimate_interval_secs: 30,
            dedupe_window_ms: 1_500,
            exit_drain_ms: 250,
            max_line_bytes: 64 * 1024,
        }
    }
}

impl PipelineConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn estimate_interval(&self) -> Duration {
        Duration::from_secs(self.estimate_interval_secs)
    }

    pub fn dedupe_window(&self) -> Duration {
        Duration::from_millis(self.dedupe_window_ms)
    }

    pub fn exit_drain(&self) -> Duration {
        Duration::from_millis(self.exit_drain_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    /// Archive once the rendered state document grows past this size.
    pub max_document_bytes: usize,
    /// Archive once the live progress log holds more entries than this.
    pub max_entries: usize,
    /// Entries kept in the live document after archival.
    pub retain_recent: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_document_bytes: 48_000,
            max_entries: 30,
            retain_recent: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    pub budget_bytes: usize,
    /// Progress-log entries rendered into a task brief.
    pub recent_sessions: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 32_000,
            recent_sessions: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PublishConfig {
    /// Environment variable holding a hosting-provider token.
    pub token_env: String,
    pub api_base: String,
    /// Timeout for `git push` and `gh` invocations.
    pub command_timeout_secs: u64,
    pub remote: String,
    /// `gh` executable used for the CLI tier.
    pub gh_program: String,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            token_env: "GITHUB_TOKEN".to_string(),
            api_base: "https://api.github.com".to_string(),
            command_timeout_secs: 120,
            remote: "origin".to_string(),
            gh_program: "gh".to_string(),
        }
    }
}

impl PublishConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Base URL workers use for the task API.
    pub api_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:3001/api".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EventsConfig {
    /// Broadcast buffer per subscriber before lagging subscribers drop events.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SweepConfig {
    /// Workspaces of idle tasks whose last session ended longer ago are released.
    pub abandoned_after_hours: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            abandoned_after_hours: 72,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker.command.is_empty() || self.worker.command[0].trim().is_empty() {
            return Err(anyhow!("worker.command must be a non-empty array"));
        }
        if self.worker.cols == 0 || self.worker.rows == 0 {
            return Err(anyhow!("worker.cols and worker.rows must be > 0"));
        }
        if self.pipeline.flush_threshold_bytes < 4 {
            return Err(anyhow!("pipeline.flush_threshold_bytes must be >= 4"));
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(anyhow!("pipeline.channel_capacity must be > 0"));
        }
        if self.pipeline.max_line_bytes < 256 {
            return Err(anyhow!("pipeline.max_line_bytes must be >= 256"));
        }
        if self.pipeline.progress_threshold == 0 || self.pipeline.progress_threshold > 100 {
            return Err(anyhow!("pipeline.progress_threshold must be in 1..=100"));
        }
        if self.ledger.retain_recent == 0 {
            return Err(anyhow!("ledger.retain_recent must be > 0"));
        }
        if self.ledger.max_entries < self.ledger.retain_recent {
            return Err(anyhow!("ledger.max_entries must be >= ledger.retain_recent"));
        }
        if self.prompt.budget_bytes == 0 {
            return Err(anyhow!("prompt.budget_bytes must be > 0"));
        }
        if self.events.capacity == 0 {
            return Err(anyhow!("events.capacity must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::fs_util::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = OrchestratorConfig::default();
        cfg.worker.command = vec!["sh".to_string(), "-c".to_string()];
        cfg.worker.prompt_delivery = PromptDelivery::Stdin;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[pipeline]\nprogress_threshold = 10\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.pipeline.progress_threshold, 10);
        assert_eq!(cfg.pipeline.debounce_ms, PipelineConfig::default().debounce_ms);
        assert_eq!(cfg.worker, WorkerConfig::default());
    }

    #[test]
    fn rejects_empty_worker_command() {
        let mut cfg = OrchestratorConfig::default();
        cfg.worker.command.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_retain_above_max_entries() {
        let mut cfg = OrchestratorConfig::default();
        cfg.ledger.max_entries = 2;
        cfg.ledger.retain_recent = 3;
        assert!(cfg.validate().is_err());
    }
}
