//! Failure strategy application.
//!
//! Applied by the wave evaluator when a task's gate is denied or the task
//! failed before reaching the gate. Two overrides precede the nominal
//! action: the iteration cap and oscillation detection, both of which turn
//! a retry into an escalation.

use worldmind_store::models::{FailureStrategy, ReviewFeedback, Task, TaskStatus};

use crate::config::OrchestratorConfig;
use crate::oscillation::OscillationDetector;

/// How many reviewer issues and suggestions are carried into a retry.
const RETRY_FEEDBACK_ITEMS: usize = 3;

/// Extra diagnostic material available when enriching a retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureEvidence<'a> {
    pub review: Option<&'a ReviewFeedback>,
    /// Tail of the agent's raw output, for failures before the gate.
    pub output_tail: Option<&'a str>,
}

/// The action that was actually applied after overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedAction {
    Retried,
    Skipped,
    Escalated,
}

/// Everything the evaluator needs to fold into the wave's delta.
#[derive(Debug, Clone)]
pub struct FailureOutcome {
    /// The task with its post-failure state.
    pub task: Task,
    pub action: AppliedAction,
    /// Whether the task id joins the completed set (skip unblocking).
    pub add_completed: bool,
    /// New mission-level retry context (diagnostic, single-consumer).
    pub retry_context: Option<String>,
    /// Error entry to append when the mission escalates.
    pub error: Option<String>,
}

impl FailureOutcome {
    pub fn mission_failed(&self) -> bool {
        self.action == AppliedAction::Escalated
    }
}

/// Apply a task's failure strategy.
///
/// 1. A retry at or above the iteration cap escalates instead.
/// 2. A retry records the failure reason; an oscillating task escalates.
/// 3. The (possibly overridden) action mutates a copy of the task and is
///    reported for the evaluator to merge.
pub fn apply_failure_strategy(
    task: &Task,
    nominal: FailureStrategy,
    reason: &str,
    evidence: FailureEvidence<'_>,
    detector: &mut OscillationDetector,
    config: &OrchestratorConfig,
) -> FailureOutcome {
    let mut action = nominal;
    let mut reason = reason.to_owned();

    if action == FailureStrategy::Retry && task.iteration >= task.max_iterations {
        tracing::warn!(
            task_id = %task.id,
            iteration = task.iteration,
            max_iterations = task.max_iterations,
            "retry cap reached, escalating"
        );
        action = FailureStrategy::Escalate;
    }

    if nominal == FailureStrategy::Retry {
        // The check reads the history of earlier failures; the current one
        // is recorded afterwards. A task that failed the same way twice
        // before therefore escalates on its third failure.
        if action == FailureStrategy::Retry && detector.is_oscillating(&task.id) {
            tracing::warn!(task_id = %task.id, reason = %reason, "oscillation detected, escalating");
            reason = format!("oscillation detected: {reason}");
            action = FailureStrategy::Escalate;
        }
        detector.record(&task.id, &reason);
    }

    let mut updated = task.clone();
    match action {
        FailureStrategy::Retry => {
            let enriched = build_retry_context(&reason, evidence);
            updated.status = TaskStatus::Pending;
            updated.iteration += 1;
            updated.input_context = if updated.input_context.is_empty() {
                enriched.clone()
            } else {
                format!("{enriched}\n\n{}", updated.input_context)
            };
            FailureOutcome {
                task: updated,
                action: AppliedAction::Retried,
                add_completed: false,
                retry_context: Some(enriched),
                error: None,
            }
        }
        FailureStrategy::Skip => {
            updated.status = TaskStatus::Skipped;
            FailureOutcome {
                task: updated,
                action: AppliedAction::Skipped,
                add_completed: config.skip_adds_to_completed,
                retry_context: None,
                error: None,
            }
        }
        // Replanning is out of scope; replan behaves as escalate.
        FailureStrategy::Escalate | FailureStrategy::Replan => {
            updated.status = TaskStatus::Failed;
            FailureOutcome {
                error: Some(format!("task {} escalated: {reason}", updated.id)),
                task: updated,
                action: AppliedAction::Escalated,
                add_completed: false,
                retry_context: None,
            }
        }
    }
}

/// Concatenate the failure reason, reviewer feedback, and (for pre-gate
/// failures) the agent output tail into the retry context.
pub fn build_retry_context(reason: &str, evidence: FailureEvidence<'_>) -> String {
    let mut context = format!("Previous attempt failed: {reason}");

    if let Some(review) = evidence.review {
        if !review.summary.trim().is_empty() {
            context.push_str(&format!("\nReview summary: {}", review.summary));
        }
        if !review.issues.is_empty() {
            context.push_str("\nIssues:");
            for issue in review.issues.iter().take(RETRY_FEEDBACK_ITEMS) {
                context.push_str(&format!("\n- {issue}"));
            }
        }
        if !review.suggestions.is_empty() {
            context.push_str("\nSuggestions:");
            for suggestion in review.suggestions.iter().take(RETRY_FEEDBACK_ITEMS) {
                context.push_str(&format!("\n- {suggestion}"));
            }
        }
    }

    if let Some(tail) = evidence.output_tail {
        if !tail.trim().is_empty() {
            context.push_str(&format!("\nAgent output (tail):\n{tail}"));
        }
    }

    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldmind_store::models::AgentRole;

    fn task() -> Task {
        let mut t = Task::new("TASK-001", AgentRole::Coder, "implement");
        t.input_context = "original context".into();
        t
    }

    fn review() -> ReviewFeedback {
        ReviewFeedback {
            task_id: "TASK-001".into(),
            approved: false,
            summary: "wrong field name".into(),
            issues: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            suggestions: vec!["s1".into(), "s2".into(), "s3".into(), "s4".into()],
            score: 3,
        }
    }

    #[test]
    fn retry_resets_task_and_enriches_context() {
        let mut detector = OscillationDetector::new();
        let rv = review();
        let outcome = apply_failure_strategy(
            &task(),
            FailureStrategy::Retry,
            "tests failed",
            FailureEvidence {
                review: Some(&rv),
                output_tail: None,
            },
            &mut detector,
            &OrchestratorConfig::default(),
        );

        assert_eq!(outcome.action, AppliedAction::Retried);
        assert_eq!(outcome.task.status, TaskStatus::Pending);
        assert_eq!(outcome.task.iteration, 1);
        assert!(outcome.task.input_context.starts_with("Previous attempt failed"));
        assert!(outcome.task.input_context.ends_with("original context"));
        let ctx = outcome.retry_context.unwrap();
        assert!(ctx.contains("wrong field name"));
        // Top three issues and suggestions only.
        assert!(ctx.contains("- c"));
        assert!(!ctx.contains("- d"));
        assert!(ctx.contains("- s3"));
        assert!(!ctx.contains("- s4"));
    }

    #[test]
    fn pre_gate_failure_carries_output_tail() {
        let mut detector = OscillationDetector::new();
        let outcome = apply_failure_strategy(
            &task(),
            FailureStrategy::Retry,
            "coder task produced no code files",
            FailureEvidence {
                review: None,
                output_tail: Some("...last lines of agent output..."),
            },
            &mut detector,
            &OrchestratorConfig::default(),
        );
        let ctx = outcome.retry_context.unwrap();
        assert!(ctx.contains("produced no code files"));
        assert!(ctx.contains("last lines of agent output"));
    }

    #[test]
    fn iteration_cap_overrides_retry_to_escalate() {
        let mut detector = OscillationDetector::new();
        let mut t = task();
        t.iteration = 3;
        let outcome = apply_failure_strategy(
            &t,
            FailureStrategy::Retry,
            "tests failed",
            FailureEvidence::default(),
            &mut detector,
            &OrchestratorConfig::default(),
        );
        assert_eq!(outcome.action, AppliedAction::Escalated);
        assert_eq!(outcome.task.status, TaskStatus::Failed);
        assert!(outcome.mission_failed());
        assert!(outcome.error.unwrap().contains("TASK-001"));
        // Iteration never exceeds the cap.
        assert_eq!(outcome.task.iteration, 3);
    }

    #[test]
    fn oscillation_escalates_on_third_identical_failure() {
        let mut detector = OscillationDetector::new();
        let config = OrchestratorConfig::default();
        let reason = "tests failed: x_test.java line 42";

        let first = apply_failure_strategy(
            &task(),
            FailureStrategy::Retry,
            reason,
            FailureEvidence::default(),
            &mut detector,
            &config,
        );
        assert_eq!(first.action, AppliedAction::Retried);

        let second = apply_failure_strategy(
            &first.task,
            FailureStrategy::Retry,
            reason,
            FailureEvidence::default(),
            &mut detector,
            &config,
        );
        assert_eq!(second.action, AppliedAction::Retried);

        let third = apply_failure_strategy(
            &second.task,
            FailureStrategy::Retry,
            reason,
            FailureEvidence::default(),
            &mut detector,
            &config,
        );
        assert_eq!(third.action, AppliedAction::Escalated);
        assert!(third.error.unwrap().contains("oscillation detected"));
    }

    #[test]
    fn skip_marks_task_and_unblocks_dependents() {
        let mut detector = OscillationDetector::new();
        let outcome = apply_failure_strategy(
            &task(),
            FailureStrategy::Skip,
            "nothing substantive to fix",
            FailureEvidence::default(),
            &mut detector,
            &OrchestratorConfig::default(),
        );
        assert_eq!(outcome.action, AppliedAction::Skipped);
        assert_eq!(outcome.task.status, TaskStatus::Skipped);
        assert!(outcome.add_completed);
        assert!(!outcome.mission_failed());
    }

    #[test]
    fn skip_unblocking_is_configurable() {
        let mut detector = OscillationDetector::new();
        let config = OrchestratorConfig {
            skip_adds_to_completed: false,
            ..Default::default()
        };
        let outcome = apply_failure_strategy(
            &task(),
            FailureStrategy::Skip,
            "r",
            FailureEvidence::default(),
            &mut detector,
            &config,
        );
        assert!(!outcome.add_completed);
    }

    #[test]
    fn replan_behaves_as_escalate() {
        let mut detector = OscillationDetector::new();
        let outcome = apply_failure_strategy(
            &task(),
            FailureStrategy::Replan,
            "needs a new plan",
            FailureEvidence::default(),
            &mut detector,
            &OrchestratorConfig::default(),
        );
        assert_eq!(outcome.action, AppliedAction::Escalated);
    }
}
