//! Partial mission updates.
//!
//! Stages never mutate the live mission; they return a [`MissionDelta`]
//! and the pipeline driver merges it under the per-mission single-writer
//! discipline. Append-only collections (errors, dispatch results, test
//! results, review feedback, containers) are expressed as appends here so
//! re-applying a stale delta cannot silently overwrite history.

use std::collections::BTreeSet;

use chrono::Utc;

use crate::models::{
    Classification, ContainerInfo, ExecutionStrategy, Mission, MissionMetrics, MissionStatus,
    ProductSpec, ReviewFeedback, Task, TestResult, WaveDispatchResult,
};

/// A partial state update returned by a pipeline stage.
#[derive(Debug, Clone, Default)]
pub struct MissionDelta {
    pub status: Option<MissionStatus>,
    pub classification: Option<Classification>,
    pub spec: Option<ProductSpec>,
    pub clarifying_questions: Option<Vec<String>>,
    pub project_context: Option<String>,
    /// Full replacement of the task list (planning stage only).
    pub tasks: Option<Vec<Task>>,
    /// Per-task replacements matched by id (dispatch and evaluation).
    pub task_updates: Vec<Task>,
    pub current_wave: Option<u32>,
    pub add_completed: BTreeSet<String>,
    /// Ids removed from the completed set (merge-conflict reset only).
    pub remove_completed: BTreeSet<String>,
    /// `Some(Some(..))` sets the retry context, `Some(None)` clears it.
    pub retry_context: Option<Option<String>>,
    pub errors: Vec<String>,
    pub dispatch_results: Vec<WaveDispatchResult>,
    pub containers: Vec<ContainerInfo>,
    pub test_results: Vec<TestResult>,
    pub review_feedback: Vec<ReviewFeedback>,
    pub strategy: Option<ExecutionStrategy>,
    pub runtime_tag: Option<String>,
    pub metrics: Option<MissionMetrics>,
}

impl MissionDelta {
    /// A delta that only advances the status.
    pub fn status(status: MissionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// A terminal delta: mark the mission failed and record why.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(MissionStatus::Failed),
            errors: vec![error.into()],
            ..Self::default()
        }
    }

    /// Whether applying this delta would change nothing.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.classification.is_none()
            && self.spec.is_none()
            && self.clarifying_questions.is_none()
            && self.project_context.is_none()
            && self.tasks.is_none()
            && self.task_updates.is_empty()
            && self.current_wave.is_none()
            && self.add_completed.is_empty()
            && self.remove_completed.is_empty()
            && self.retry_context.is_none()
            && self.errors.is_empty()
            && self.dispatch_results.is_empty()
            && self.containers.is_empty()
            && self.test_results.is_empty()
            && self.review_feedback.is_empty()
            && self.strategy.is_none()
            && self.runtime_tag.is_none()
            && self.metrics.is_none()
    }

    /// Merge this delta into a mission and bump its updated-at timestamp.
    pub fn apply(self, mission: &mut Mission) {
        if let Some(status) = self.status {
            mission.status = status;
        }
        if let Some(classification) = self.classification {
            mission.classification = Some(classification);
        }
        if let Some(spec) = self.spec {
            mission.spec = Some(spec);
        }
        if let Some(questions) = self.clarifying_questions {
            mission.clarifying_questions = questions;
        }
        if let Some(ctx) = self.project_context {
            mission.project_context = Some(ctx);
        }
        if let Some(tasks) = self.tasks {
            mission.tasks = tasks;
        }
        for update in self.task_updates {
            match mission.task_mut(&update.id) {
                Some(slot) => *slot = update,
                None => mission.tasks.push(update),
            }
        }
        if let Some(wave) = self.current_wave {
            mission.current_wave = wave;
        }
        for id in self.add_completed {
            mission.completed_task_ids.insert(id);
        }
        for id in &self.remove_completed {
            mission.completed_task_ids.remove(id);
        }
        if let Some(retry) = self.retry_context {
            mission.retry_context = retry;
        }
        mission.errors.extend(self.errors);
        mission.dispatch_results.extend(self.dispatch_results);
        mission.containers.extend(self.containers);
        mission.test_results.extend(self.test_results);
        mission.review_feedback.extend(self.review_feedback);
        if let Some(strategy) = self.strategy {
            mission.strategy = strategy;
        }
        if let Some(tag) = self.runtime_tag {
            mission.runtime_tag = Some(tag);
        }
        if let Some(metrics) = self.metrics {
            mission.metrics = Some(metrics);
        }
        mission.updated_at_ms = Utc::now().timestamp_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentRole, TaskStatus, task_id};

    #[test]
    fn empty_delta_is_empty() {
        assert!(MissionDelta::default().is_empty());
        assert!(!MissionDelta::status(MissionStatus::Planning).is_empty());
    }

    #[test]
    fn status_delta_only_moves_status() {
        let mut mission = Mission::new("r");
        MissionDelta::status(MissionStatus::Uploading).apply(&mut mission);
        assert_eq!(mission.status, MissionStatus::Uploading);
        assert!(mission.errors.is_empty());
    }

    #[test]
    fn failed_delta_appends_error() {
        let mut mission = Mission::new("r");
        MissionDelta::failed("classifier unavailable").apply(&mut mission);
        assert_eq!(mission.status, MissionStatus::Failed);
        assert_eq!(mission.errors, vec!["classifier unavailable".to_string()]);
    }

    #[test]
    fn task_update_replaces_by_id() {
        let mut mission = Mission::new("r");
        mission.tasks.push(Task::new(task_id(1), AgentRole::Coder, "a"));

        let mut updated = mission.tasks[0].clone();
        updated.status = TaskStatus::Passed;
        updated.iteration = 1;

        let delta = MissionDelta {
            task_updates: vec![updated],
            ..Default::default()
        };
        delta.apply(&mut mission);

        assert_eq!(mission.tasks.len(), 1);
        assert_eq!(mission.tasks[0].status, TaskStatus::Passed);
        assert_eq!(mission.tasks[0].iteration, 1);
    }

    #[test]
    fn retry_context_set_and_clear() {
        let mut mission = Mission::new("r");

        let set = MissionDelta {
            retry_context: Some(Some("reviewer found issues".into())),
            ..Default::default()
        };
        set.apply(&mut mission);
        assert_eq!(mission.retry_context.as_deref(), Some("reviewer found issues"));

        let clear = MissionDelta {
            retry_context: Some(None),
            ..Default::default()
        };
        clear.apply(&mut mission);
        assert!(mission.retry_context.is_none());
    }

    #[test]
    fn completed_ids_add_then_remove() {
        let mut mission = Mission::new("r");

        let add = MissionDelta {
            add_completed: [task_id(1), task_id(2)].into_iter().collect(),
            ..Default::default()
        };
        add.apply(&mut mission);
        assert_eq!(mission.completed_task_ids.len(), 2);

        // Merge-conflict reset removes one id.
        let remove = MissionDelta {
            remove_completed: [task_id(2)].into_iter().collect(),
            ..Default::default()
        };
        remove.apply(&mut mission);
        assert!(mission.completed_task_ids.contains("TASK-001"));
        assert!(!mission.completed_task_ids.contains("TASK-002"));
    }

    #[test]
    fn appends_accumulate_across_deltas() {
        let mut mission = Mission::new("r");
        for i in 0..2 {
            let delta = MissionDelta {
                errors: vec![format!("error {i}")],
                ..Default::default()
            };
            delta.apply(&mut mission);
        }
        assert_eq!(mission.errors.len(), 2);
    }
}
