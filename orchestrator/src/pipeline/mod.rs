//! Per-session output processing.
//!
//! Bytes from the PTY pass through four stages in a fixed order: the escape
//! filter, duplicate-render suppression, chunked delivery and semantic
//! extraction. [`OutputPipeline`] owns all per-session state; it performs no
//! I/O and is driven by the session's output task.

pub mod chunker;
pub mod dedupe;
pub mod escape;
pub mod parser;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::core::progress::{ActivitySignals, ProgressGate, estimate};
use crate::core::types::FileChangeType;
use crate::io::config::PipelineConfig;

use chunker::OutputBuffer;
use dedupe::DedupeState;
use escape::EscapeFilter;
use parser::{LineParser, Signal, TestSummary};

/// One item leaving the pipeline, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutput {
    Raw(String),
    /// `applied` is false when the throttle gate held the value back.
    Progress { value: u8, applied: bool },
    FileChange { path: String, change: FileChangeType },
    TestResult(TestSummary),
}

#[derive(Debug)]
pub struct OutputPipeline {
    escape: EscapeFilter,
    dedupe: DedupeState,
    buffer: OutputBuffer,
    parser: LineParser,
    gate: ProgressGate,
    activity: ActivitySignals,
    touched: HashSet<String>,
    estimate_interval: Duration,
    last_explicit: Option<Instant>,
}

impl OutputPipeline {
    /// `initial_progress` seeds the throttle gate with the task's stored progress.
    pub fn new(config: &PipelineConfig, initial_progress: u8, started: Instant) -> Self {
        Self {
            escape: EscapeFilter::new(),
            dedupe: DedupeState::new(config.dedupe_window()),
            buffer: OutputBuffer::new(config.flush_threshold_bytes),
            parser: LineParser::with_limit(config.max_line_bytes),
            gate: ProgressGate::new(config.progress_threshold, initial_progress),
            activity: ActivitySignals::default(),
            touched: HashSet::new(),
            estimate_interval: config.estimate_interval(),
            last_explicit: Some(started),
        }
    }

    /// Process one PTY chunk.
    ///
    /// Full slices are released immediately. When the chunk yields semantic
    /// events, the buffered remainder is flushed first so subscribers never see
    /// an event ahead of the output that produced it.
    pub fn process(&mut self, bytes: &[u8], now: Instant) -> Vec<PipelineOutput> {
        let text = self.escape.push(bytes);
        let text = self.dedupe.filter(text, now);
        let mut out: Vec<PipelineOutput> = self
            .buffer
            .push(&text)
            .into_iter()
            .map(PipelineOutput::Raw)
            .collect();

        let signals = self.parser.feed(&text);
        if !signals.is_empty() {
            out.extend(self.buffer.take().map(PipelineOutput::Raw));
            self.apply_signals(signals, now, &mut out);
        }
        self.activity.lines_seen = self.parser.lines_seen();
        out
    }

    /// Release the buffered remainder once the debounce delay elapses.
    pub fn flush_pending(&mut self) -> Option<PipelineOutput> {
        self.buffer.take().map(PipelineOutput::Raw)
    }

    pub fn has_pending(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Offer an activity estimate when no explicit progress arrived recently.
    pub fn estimate_tick(&mut self, now: Instant) -> Option<PipelineOutput> {
        let quiet = self
            .last_explicit
            .is_none_or(|at| now.duration_since(at) >= self.estimate_interval);
        if !quiet {
            return None;
        }
        let value = estimate(&self.activity);
        if value == 0 {
            return None;
        }
        self.gate.offer(value).map(|value| PipelineOutput::Progress {
            value,
            applied: true,
        })
    }

    /// Drain every stage at session end.
    pub fn finish(&mut self, now: Instant) -> Vec<PipelineOutput> {
        let tail = self.escape.finish();
        let mut out: Vec<PipelineOutput> = self
            .buffer
            .push(&tail)
            .into_iter()
            .map(PipelineOutput::Raw)
            .collect();
        out.extend(self.buffer.take().map(PipelineOutput::Raw));
        let mut signals = self.parser.feed(&tail);
        signals.extend(self.parser.finish());
        self.apply_signals(signals, now, &mut out);
        out
    }

    pub fn activity(&self) -> &ActivitySignals {
        &self.activity
    }

    fn apply_signals(&mut self, signals: Vec<Signal>, now: Instant, out: &mut Vec<PipelineOutput>) {
        for signal in signals {
            match signal {
                Signal::Progress(value) => {
                    self.last_explicit = Some(now);
                    let applied = self.gate.offer(value).is_some();
                    out.push(PipelineOutput::Progress { value, applied });
                }
                Signal::File { path, change } => {
                    if self.touched.insert(path.clone()) {
                        self.activity.files_touched += 1;
                    }
                    out.push(PipelineOutput::FileChange { path, change });
                }
                Signal::Tests(summary) => {
                    self.activity.test_runs += 1;
                    if summary.succeeded() {
                        self.activity.passing_test_runs += 1;
                    }
                    out.push(PipelineOutput::TestResult(summary));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::prompt::TASK_BRIEF_MARKER;

    fn config(threshold: usize) -> PipelineConfig {
        PipelineConfig {
            flush_threshold_bytes: threshold,
            ..PipelineConfig::default()
        }
    }

    fn raw_text(outputs: &[PipelineOutput]) -> String {
        outputs
            .iter()
            .filter_map(|o| match o {
                PipelineOutput::Raw(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn raw_output_precedes_events_from_same_chunk() {
        let now = Instant::now();
        let mut p = OutputPipeline::new(&config(8192), 0, now);
        let out = p.process(b"\x1b[?1000hworking\nPROGRESS: 40%\n", now);
        assert_eq!(
            out,
            vec![
                PipelineOutput::Raw("working\nPROGRESS: 40%\n".to_string()),
                PipelineOutput::Progress {
                    value: 40,
                    applied: true
                },
            ]
        );
        assert!(!p.has_pending());
    }

    #[test]
    fn plain_text_waits_for_debounce() {
        let now = Instant::now();
        let mut p = OutputPipeline::new(&config(8192), 0, now);
        assert!(p.process(b"typing...", now).is_empty());
        assert!(p.has_pending());
        assert_eq!(
            p.flush_pending(),
            Some(PipelineOutput::Raw("typing...".to_string()))
        );
    }

    #[test]
    fn throttled_progress_is_reported_unapplied() {
        let now = Instant::now();
        let mut p = OutputPipeline::new(&config(8192), 40, now);
        let out = p.process(b"PROGRESS: 42%\n", now);
        assert!(out.contains(&PipelineOutput::Progress {
            value: 42,
            applied: false
        }));
    }

    #[test]
    fn duplicate_brief_is_collapsed() {
        let now = Instant::now();
        let mut p = OutputPipeline::new(&config(8192), 0, now);
        let chunk = format!("{TASK_BRIEF_MARKER}\nx\n\x1b[2J{TASK_BRIEF_MARKER}\nx\n");
        let mut out = p.process(chunk.as_bytes(), now);
        out.extend(p.flush_pending());
        let text = raw_text(&out);
        assert_eq!(text.matches(TASK_BRIEF_MARKER).count(), 1);
        assert!(text.starts_with("\x1b[2J"));
    }

    #[test]
    fn estimates_only_after_quiet_interval() {
        let start = Instant::now();
        let mut p = OutputPipeline::new(&config(8192), 0, start);
        p.process(b"Created a.rs\nCreated b.rs\nCreated c.rs\n", start);
        assert_eq!(p.activity().files_touched, 3);
        assert_eq!(p.estimate_tick(start + Duration::from_secs(1)), None);
        assert_eq!(
            p.estimate_tick(start + Duration::from_secs(31)),
            Some(PipelineOutput::Progress {
                value: 18,
                applied: true
            })
        );
        assert_eq!(p.estimate_tick(start + Duration::from_secs(62)), None);
    }

    #[test]
    fn finish_flushes_partial_line() {
        let now = Instant::now();
        let mut p = OutputPipeline::new(&config(8192), 0, now);
        assert!(p.process(b"PROGRESS: 100%", now).is_empty());
        let out = p.finish(now);
        assert_eq!(
            out,
            vec![
                PipelineOutput::Raw("PROGRESS: 100%".to_string()),
                PipelineOutput::Progress {
                    value: 100,
                    applied: true
                },
            ]
        );
    }
}
