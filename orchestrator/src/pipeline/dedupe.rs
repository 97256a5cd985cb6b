//! Suppression of duplicated prompt renders.
//!
//! Some workers echo the initial prompt and then redraw the screen, so the
//! task brief shows up twice. Within a chunk the first copy is cut back to the
//! redraw that precedes the second; across chunks a marker line identical to
//! one seen moments ago is dropped.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use crate::io::prompt::TASK_BRIEF_MARKER;

/// Screen clear and cursor-home sequences that mark a redraw.
const REDRAW_SEQUENCES: [&str; 4] = ["\x1b[2J", "\x1b[3J", "\x1b[H", "\x1bc"];

/// Visible text after the marker folded into its fingerprint.
const FINGERPRINT_BYTES: usize = 256;

#[derive(Debug)]
pub struct DedupeState {
    window: Duration,
    last_marker: Option<(u64, Instant)>,
}

impl DedupeState {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_marker: None,
        }
    }

    pub fn filter(&mut self, text: String, now: Instant) -> String {
        let mut text = collapse_in_chunk(text);
        let Some(pos) = text.find(TASK_BRIEF_MARKER) else {
            return text;
        };

        let print = fingerprint(&text[pos..]);
        let repeated = matches!(
            self.last_marker,
            Some((prev, at)) if prev == print && now.duration_since(at) <= self.window
        );
        self.last_marker = Some((print, now));
        if repeated {
            let line_end = text[pos..]
                .find('\n')
                .map_or(text.len(), |i| pos + i + 1);
            let line_start = text[..pos].rfind('\n').map_or(0, |i| i + 1);
            text.replace_range(line_start..line_end, "");
        }
        text
    }
}

/// Drop earlier copies of the brief until a single marker remains.
pub fn collapse_in_chunk(mut text: String) -> String {
    loop {
        let Some(first) = text.find(TASK_BRIEF_MARKER) else {
            return text;
        };
        let after_first = first + TASK_BRIEF_MARKER.len();
        let Some(second) = text[after_first..]
            .find(TASK_BRIEF_MARKER)
            .map(|i| after_first + i)
        else {
            return text;
        };
        let cut_end = redraw_run_start(&text, first, second).unwrap_or(second);
        text.replace_range(first..cut_end, "");
    }
}

/// Start of the run of redraw sequences closest before `before`, searching from `from`.
fn redraw_run_start(text: &str, from: usize, before: usize) -> Option<usize> {
    let region = &text[from..before];
    let last = REDRAW_SEQUENCES
        .iter()
        .filter_map(|seq| region.rfind(seq))
        .max()?;
    let mut start = from + last;
    'extend: loop {
        for seq in REDRAW_SEQUENCES {
            if start >= from + seq.len() && text[..start].ends_with(seq) {
                start -= seq.len();
                continue 'extend;
            }
        }
        return Some(start);
    }
}

fn fingerprint(from_marker: &str) -> u64 {
    let visible: String = from_marker
        .chars()
        .filter(|c| !c.is_control())
        .take(FINGERPRINT_BYTES)
        .collect();
    let mut hasher = DefaultHasher::new();
    visible.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brief(body: &str) -> String {
        format!("{TASK_BRIEF_MARKER}\n{body}\n")
    }

    #[test]
    fn single_copy_is_untouched() {
        let text = format!("intro\n{}", brief("do the thing"));
        assert_eq!(collapse_in_chunk(text.clone()), text);
    }

    #[test]
    fn cuts_back_to_redraw_run() {
        let text = format!(
            "echo: {}\x1b[H\x1b[2J{}",
            brief("first"),
            brief("second")
        );
        let collapsed = collapse_in_chunk(text);
        assert_eq!(collapsed, format!("echo: \x1b[H\x1b[2J{}", brief("second")));
    }

    #[test]
    fn without_redraw_drops_to_second_marker() {
        let text = format!("{}{}{}", brief("a"), brief("b"), brief("c"));
        assert_eq!(collapse_in_chunk(text), brief("c"));
    }

    #[test]
    fn repeated_marker_line_across_chunks_is_suppressed() {
        let mut state = DedupeState::new(Duration::from_millis(1500));
        let start = Instant::now();
        let first = state.filter(format!("hello\n{}", brief("task")), start);
        assert!(first.contains(TASK_BRIEF_MARKER));

        let second = state.filter(brief("task"), start + Duration::from_millis(200));
        assert!(!second.contains(TASK_BRIEF_MARKER));
        assert_eq!(second, "task\n");

        let later = state.filter(brief("task"), start + Duration::from_secs(10));
        assert!(later.contains(TASK_BRIEF_MARKER));
    }

    #[test]
    fn different_brief_is_not_suppressed() {
        let mut state = DedupeState::new(Duration::from_millis(1500));
        let now = Instant::now();
        state.filter(brief("task one"), now);
        let next = state.filter(brief("task two"), now);
        assert!(next.contains(TASK_BRIEF_MARKER));
    }
}
