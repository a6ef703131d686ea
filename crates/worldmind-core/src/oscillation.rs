//! Oscillation detection.
//!
//! Keeps a short per-task history of failure-reason fingerprints. A task
//! that keeps failing the same way is not going to recover by retrying,
//! so the failure handler overrides its retry to an escalation.

use std::collections::HashMap;
use std::collections::VecDeque;

/// How many failure reasons are retained per task.
const HISTORY_WINDOW: usize = 5;

/// How many identical fingerprints within the window count as oscillation.
const REPEAT_LIMIT: usize = 3;

/// Per-task failure history keyed by reason fingerprint.
#[derive(Debug, Default)]
pub struct OscillationDetector {
    history: HashMap<String, VecDeque<String>>,
}

impl OscillationDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure reason for a task.
    pub fn record(&mut self, task_id: &str, reason: &str) {
        let entries = self.history.entry(task_id.to_owned()).or_default();
        if entries.len() == HISTORY_WINDOW {
            entries.pop_front();
        }
        entries.push_back(fingerprint(reason));
    }

    /// Whether the task is oscillating: the two most recent reasons are
    /// identical, or the same fingerprint occurs [`REPEAT_LIMIT`] times
    /// within the history window.
    pub fn is_oscillating(&self, task_id: &str) -> bool {
        let Some(entries) = self.history.get(task_id) else {
            return false;
        };

        if entries.len() >= 2 {
            let mut tail = entries.iter().rev();
            let last = tail.next();
            let prev = tail.next();
            if last.is_some() && last == prev {
                return true;
            }
        }

        entries.iter().any(|fp| {
            entries.iter().filter(|other| *other == fp).count() >= REPEAT_LIMIT
        })
    }

    /// Forget a task's history (after a grant or a reset to a new plan).
    pub fn clear(&mut self, task_id: &str) {
        self.history.remove(task_id);
    }
}

/// Normalise a reason into a comparable fingerprint: lowercase, collapsed
/// whitespace. Line numbers and test names are deliberately kept -- two
/// failures on different lines are different reasons.
fn fingerprint(reason: &str) -> String {
    reason.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}
