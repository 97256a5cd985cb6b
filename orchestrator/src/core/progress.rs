//! Progress throttling and activity-based estimates.

/// Applies progress values only when they move far enough from the last applied one.
#[derive(Debug, Clone)]
pub struct ProgressGate {
    threshold: u8,
    last_applied: u8,
}

impl ProgressGate {
    /// `initial` is the task's persisted progress when the session starts.
    pub fn new(threshold: u8, initial: u8) -> Self {
        Self {
            threshold: threshold.max(1),
            last_applied: initial.min(100),
        }
    }

    pub fn last_applied(&self) -> u8 {
        self.last_applied
    }

    /// Offer a new value; returns it when it should be persisted.
    ///
    /// Reaching 100 always applies once, even inside the threshold.
    pub fn offer(&mut self, value: u8) -> Option<u8> {
        let value = value.min(100);
        let delta = value.abs_diff(self.last_applied);
        let finishing = value == 100 && self.last_applied != 100;
        if delta >= self.threshold || finishing {
            self.last_applied = value;
            return Some(value);
        }
        None
    }
}

/// Rolling activity counters used when the worker prints no explicit progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivitySignals {
    pub files_touched: u32,
    pub test_runs: u32,
    pub passing_test_runs: u32,
    pub lines_seen: u64,
}

/// Upper bound for estimates; only an explicit signal can claim completion.
pub const ESTIMATE_CEILING: u8 = 90;

/// Heuristic completion estimate from activity counters.
pub fn estimate(signals: &ActivitySignals) -> u8 {
    let files = (signals.files_touched * 6).min(50);
    let tests = (signals.test_runs * 5).min(15) + (signals.passing_test_runs * 10).min(20);
    let chatter = (signals.lines_seen / 200).min(10) as u32;
    (files + tests + chatter).min(u32::from(ESTIMATE_CEILING)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_moves_are_ignored() {
        let mut gate = ProgressGate::new(5, 0);
        assert_eq!(gate.offer(2), None);
        assert_eq!(gate.offer(4), None);
        assert_eq!(gate.last_applied(), 0);
    }

    #[test]
    fn crossing_threshold_applies_exactly_once() {
        let mut gate = ProgressGate::new(5, 10);
        assert_eq!(gate.offer(15), Some(15));
        assert_eq!(gate.offer(15), None);
        assert_eq!(gate.offer(18), None);
        assert_eq!(gate.offer(20), Some(20));
    }

    #[test]
    fn completion_always_lands() {
        let mut gate = ProgressGate::new(10, 97);
        assert_eq!(gate.offer(100), Some(100));
        assert_eq!(gate.offer(100), None);
    }

    #[test]
    fn values_clamp_to_hundred() {
        let mut gate = ProgressGate::new(5, 0);
        assert_eq!(gate.offer(250), Some(100));
    }

    #[test]
    fn estimate_grows_with_activity_and_caps() {
        let idle = ActivitySignals::default();
        assert_eq!(estimate(&idle), 0);

        let busy = ActivitySignals {
            files_touched: 4,
            test_runs: 1,
            passing_test_runs: 0,
            lines_seen: 450,
        };
        assert_eq!(estimate(&busy), 24 + 5 + 2);

        let huge = ActivitySignals {
            files_touched: 100,
            test_runs: 100,
            passing_test_runs: 100,
            lines_seen: 1_000_000,
        };
        assert_eq!(estimate(&huge), ESTIMATE_CEILING);
    }
}
