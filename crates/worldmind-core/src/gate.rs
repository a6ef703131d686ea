//! Quality gate.
//!
//! The gate decision is a pure function of the recorded test result and
//! review feedback. Everything with side effects (running the tester and
//! reviewer, applying the failure strategy) lives in the wave evaluator.

use worldmind_store::models::{FailureStrategy, FileChange, ReviewFeedback, TestResult};

/// Outcome of evaluating the gate for one coder task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Tests pass and the review approves with a sufficient score.
    Grant,
    /// The gate is denied; `action` is the nominal failure action to apply.
    Deny {
        action: FailureStrategy,
        reason: String,
    },
}

impl GateDecision {
    pub fn is_grant(&self) -> bool {
        matches!(self, Self::Grant)
    }
}

/// Decide the gate for a coder task.
///
/// Grant iff the tests pass, the review approves, and the score is at or
/// above `threshold`. Denials map to a failure action:
///
/// - tests failed -> retry ("tests failed")
/// - review flags the work as unfixable -> escalate
/// - not approved but score at threshold -> skip (nothing substantive left)
/// - otherwise -> retry with the reviewer's summary as the reason
pub fn evaluate_gate(test: &TestResult, review: &ReviewFeedback, threshold: u8) -> GateDecision {
    if !test.passed {
        return GateDecision::Deny {
            action: FailureStrategy::Retry,
            reason: "tests failed".to_owned(),
        };
    }

    if review.approved && review.score >= threshold {
        return GateDecision::Grant;
    }

    if flags_unfixable(review) {
        return GateDecision::Deny {
            action: FailureStrategy::Escalate,
            reason: deny_reason(review),
        };
    }

    if !review.approved && review.score >= threshold {
        return GateDecision::Deny {
            action: FailureStrategy::Skip,
            reason: deny_reason(review),
        };
    }

    GateDecision::Deny {
        action: FailureStrategy::Retry,
        reason: deny_reason(review),
    }
}

/// Whether the reviewer marked the problem as beyond the coder's reach.
fn flags_unfixable(review: &ReviewFeedback) -> bool {
    let marked = |s: &str| s.to_lowercase().contains("unfixable");
    marked(&review.summary) || review.issues.iter().any(|i| marked(i))
}

fn deny_reason(review: &ReviewFeedback) -> String {
    if review.summary.trim().is_empty() {
        format!("review score {} below threshold", review.score)
    } else {
        review.summary.clone()
    }
}

// ---------------------------------------------------------------------------
// Diagnostic-file filter
// ---------------------------------------------------------------------------

/// Identifies orchestrator-internal diagnostic files so they do not count
/// as code output. The filter is injectable; these defaults match the
/// reserved internal directory and known log artefacts.
#[derive(Debug, Clone)]
pub struct DiagnosticFilter {
    /// Paths under this directory are internal.
    pub reserved_dir: String,
    /// Suffixes of log artefacts.
    pub log_suffixes: Vec<String>,
    /// Any path containing this fragment is an agent log.
    pub agent_logs_fragment: String,
}

impl Default for DiagnosticFilter {
    fn default() -> Self {
        Self {
            reserved_dir: ".worldmind/".to_owned(),
            log_suffixes: vec![".log".to_owned(), ".jsonl".to_owned()],
            agent_logs_fragment: "agent-logs/".to_owned(),
        }
    }
}

impl DiagnosticFilter {
    /// Whether a path is an internal diagnostic artefact.
    pub fn is_diagnostic(&self, path: &str) -> bool {
        let normalized = path.trim_start_matches("./");
        normalized.starts_with(&self.reserved_dir)
            || self.log_suffixes.iter().any(|s| normalized.ends_with(s))
            || normalized.contains(&self.agent_logs_fragment)
    }

    /// Keep only the file changes that count as code output.
    pub fn code_files(&self, changes: &[FileChange]) -> Vec<FileChange> {
        changes
            .iter()
            .filter(|c| !self.is_diagnostic(&c.path))
            .cloned()
            .collect()
    }
}

/// The last portion of an agent's raw output, up to `max_chars` characters,
/// for retry-context enrichment.
pub fn output_tail(output: &str, max_chars: usize) -> &str {
    let char_count = output.chars().count();
    if char_count <= max_chars {
        return output;
    }
    let skip = char_count - max_chars;
    let (idx, _) = output.char_indices().nth(skip).unwrap_or((output.len(), ' '));
    &output[idx..]
}

/// Characters of agent output carried into a retry context.
pub const OUTPUT_TAIL_CHARS: usize = 2_000;
