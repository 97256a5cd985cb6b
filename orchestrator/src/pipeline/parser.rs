//! Line-oriented extraction of progress, file and test signals from worker output.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::FileChangeType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestFramework {
    Cargo,
    Jest,
    Pytest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub framework: TestFramework,
    pub passed: u32,
    pub failed: u32,
}

impl TestSummary {
    pub fn succeeded(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Progress(u8),
    File { path: String, change: FileChangeType },
    Tests(TestSummary),
}

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()][A-Za-z0-9]|\x1b[=>c78]")
        .expect("ansi pattern is valid")
});
static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bprogress:?\s*(\d{1,3})\s*%|\b(\d{1,3})%\s+complete\b")
        .expect("progress pattern is valid")
});
static FILE_VERB_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[^\w\s]\s*)?(Created|Wrote|Modified|Updated|Edited|Deleted|Removed)\s+(?:file\s+)?[`'\x22]?([\w./-]+)[`'\x22]?\s*$")
        .expect("file verb pattern is valid")
});
static FILE_TOOL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(Write|Edit|Update)\(([^)\s]+)\)").expect("file tool pattern is valid")
});
static CARGO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"test result: (?:ok|FAILED)\. (\d+) passed; (\d+) failed")
        .expect("cargo pattern is valid")
});
static JEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Tests:\s+.*\btotal\b").expect("jest pattern is valid"));
static PYTEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d+ (?:passed|failed)\b.* in \d+(?:\.\d+)?s\b").expect("pytest pattern is valid")
});
static PASSED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) passed").expect("passed pattern is valid"));
static FAILED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) failed").expect("failed pattern is valid"));

/// Remove color and cursor escape sequences.
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Default cap on the carried partial line.
const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Stateful parser; partial lines are carried to the next chunk.
///
/// The carry never exceeds `max_line_bytes`: a line that keeps growing without
/// a break (redraw streams) keeps only its newest bytes.
#[derive(Debug)]
pub struct LineParser {
    carry: String,
    max_line_bytes: usize,
    lines_seen: u64,
}

impl Default for LineParser {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_LINE_BYTES)
    }
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_line_bytes: usize) -> Self {
        Self {
            carry: String::new(),
            max_line_bytes: max_line_bytes.max(1),
            lines_seen: 0,
        }
    }

    pub fn carried_bytes(&self) -> usize {
        self.carry.len()
    }

    pub fn lines_seen(&self) -> u64 {
        self.lines_seen
    }

    pub fn feed(&mut self, text: &str) -> Vec<Signal> {
        // Only the new text can hold a break; the carry has none.
        let Some(last_break) = text.rfind(['\n', '\r']) else {
            self.carry.push_str(text);
            self.trim_carry();
            return Vec::new();
        };
        let (head, rest) = text.split_at(last_break + 1);
        let mut complete = std::mem::take(&mut self.carry);
        complete.push_str(head);
        self.carry.push_str(rest);
        self.trim_carry();
        self.parse_lines(&complete)
    }

    fn trim_carry(&mut self) {
        let excess = self.carry.len().saturating_sub(self.max_line_bytes);
        if excess == 0 {
            return;
        }
        let mut cut = excess;
        while !self.carry.is_char_boundary(cut) {
            cut += 1;
        }
        self.carry.drain(..cut);
    }

    /// Parse whatever partial line remains.
    pub fn finish(&mut self) -> Vec<Signal> {
        let rest = std::mem::take(&mut self.carry);
        self.parse_lines(&rest)
    }

    fn parse_lines(&mut self, text: &str) -> Vec<Signal> {
        let clean = strip_ansi(text);
        let mut signals = Vec::new();
        for line in clean.split(['\n', '\r']) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.lines_seen += 1;
            parse_line(line, &mut signals);
        }
        signals
    }
}

fn parse_line(line: &str, out: &mut Vec<Signal>) {
    if let Some(caps) = PROGRESS_RE.captures(line) {
        let value = caps
            .get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse::<u8>().ok());
        if let Some(value) = value.filter(|v| *v <= 100) {
            out.push(Signal::Progress(value));
        }
    }

    if let Some(caps) = FILE_VERB_RE.captures(line) {
        let change = match &caps[1] {
            "Created" | "Wrote" => FileChangeType::Created,
            "Deleted" | "Removed" => FileChangeType::Deleted,
            _ => FileChangeType::Modified,
        };
        out.push(Signal::File {
            path: caps[2].to_string(),
            change,
        });
    }
    for caps in FILE_TOOL_RE.captures_iter(line) {
        let change = match &caps[1] {
            "Write" => FileChangeType::Created,
            _ => FileChangeType::Modified,
        };
        out.push(Signal::File {
            path: caps[2].to_string(),
            change,
        });
    }

    if let Some(summary) = parse_test_summary(line) {
        out.push(Signal::Tests(summary));
    }
}

fn parse_test_summary(line: &str) -> Option<TestSummary> {
    if let Some(caps) = CARGO_RE.captures(line) {
        return Some(TestSummary {
            framework: TestFramework::Cargo,
            passed: caps[1].parse().ok()?,
            failed: caps[2].parse().ok()?,
        });
    }
    let framework = if JEST_RE.is_match(line) {
        TestFramework::Jest
    } else if PYTEST_RE.is_match(line) {
        TestFramework::Pytest
    } else {
        return None;
    };
    let count = |re: &Regex| -> u32 {
        re.captures(line)
            .and_then(|c| c[1].parse().ok())
            .unwrap_or(0)
    };
    Some(TestSummary {
        framework,
        passed: count(&PASSED_RE),
        failed: count(&FAILED_RE),
    })
}
