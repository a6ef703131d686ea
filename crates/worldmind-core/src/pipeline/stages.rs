//! Pipeline stages.
//!
//! Each stage is a function from the mission snapshot to a state delta.
//! Stages are idempotent: when a stage's own output is already present it
//! returns only the status delta advancing to the next stage, so any stage
//! can be re-entered after a crash or a manual retry.
//!
//! Per the propagation policy, only LLM errors (and programmer errors)
//! escape as `Err`; every expected condition is encoded in the delta.

use std::path::Path;

use anyhow::Result;
use chrono::Utc;

use worldmind_store::delta::MissionDelta;
use worldmind_store::models::{
    FileAction, Mission, MissionMetrics, MissionStatus, TaskStatus,
};

use crate::events::{EventBus, EventType, OrchestratorEvent};
use crate::llm::{LanguageModel, classifier, clarifier, planner, spec_gen};
use crate::pipeline::ContextSource;

/// Stage `classify`: validate the request and classify it.
///
/// Validation failures (empty request, missing project path) append a
/// single error entry and leave the status untouched, so the mission never
/// leaves `received`.
pub async fn classify_stage(model: &dyn LanguageModel, mission: &Mission) -> Result<MissionDelta> {
    if mission.classification.is_some() {
        return Ok(MissionDelta::status(MissionStatus::Uploading));
    }

    if mission.request.trim().is_empty() {
        return Ok(MissionDelta {
            errors: vec!["request is empty".to_owned()],
            ..Default::default()
        });
    }
    if let Some(ref path) = mission.project_path {
        if !Path::new(path).is_dir() {
            return Ok(MissionDelta {
                errors: vec![format!("project path does not exist: {path}")],
                ..Default::default()
            });
        }
    }

    let classification = classifier::classify(model, &mission.request).await?;

    let mut delta = MissionDelta {
        status: Some(MissionStatus::Uploading),
        runtime_tag: classification.runtime_tag.clone(),
        ..Default::default()
    };
    tracing::info!(
        mission_id = %mission.id,
        category = %classification.category,
        complexity = classification.complexity,
        "request classified"
    );
    delta.classification = Some(classification);
    Ok(delta)
}

/// Stage `upload-context`: gather project context through the injected
/// source. Context gathering is best-effort; an empty context is valid.
pub async fn upload_context_stage(
    source: &dyn ContextSource,
    mission: &Mission,
) -> Result<MissionDelta> {
    if mission.project_context.is_some() {
        return Ok(MissionDelta::status(MissionStatus::Specifying));
    }

    let path = mission.project_path.as_deref().map(Path::new);
    let context = match source.gather(path).await {
        Ok(context) => context,
        Err(e) => {
            tracing::warn!(mission_id = %mission.id, error = %e, "context gathering failed");
            String::new()
        }
    };

    Ok(MissionDelta {
        status: Some(MissionStatus::Specifying),
        project_context: Some(context),
        ..Default::default()
    })
}

/// Stage `specify`: clarifying questions, then the product specification.
///
/// - Spec already present: advance to planning.
/// - Questions outstanding and unanswered: park in `clarifying`.
/// - No questions asked yet: ask; a non-empty set parks the mission,
///   an empty set falls straight through to spec generation.
pub async fn specify_stage(model: &dyn LanguageModel, mission: &Mission) -> Result<MissionDelta> {
    if mission.spec.is_some() {
        return Ok(MissionDelta::status(MissionStatus::Planning));
    }

    let classification = match mission.classification {
        Some(ref c) => c,
        None => {
            return Ok(MissionDelta::failed(
                "cannot specify without a classification",
            ));
        }
    };

    if !mission.clarifying_questions.is_empty() && mission.clarification_answers.is_empty() {
        return Ok(MissionDelta::status(MissionStatus::Clarifying));
    }

    if mission.clarifying_questions.is_empty() && mission.clarification_answers.is_empty() {
        let questions =
            clarifier::clarifying_questions(model, &mission.request, classification).await?;
        if !questions.is_empty() {
            tracing::info!(
                mission_id = %mission.id,
                count = questions.len(),
                "request needs clarification"
            );
            return Ok(MissionDelta {
                status: Some(MissionStatus::Clarifying),
                clarifying_questions: Some(questions),
                ..Default::default()
            });
        }
    }

    let spec = spec_gen::generate_spec(
        model,
        &mission.request,
        classification,
        mission.project_context.as_deref(),
        &mission.clarification_answers,
    )
    .await?;

    // Persist the spec into the working copy; never fatal.
    if let Some(ref path) = mission.project_path {
        spec_gen::write_spec_markdown(&spec, Path::new(path)).await;
    }

    Ok(MissionDelta {
        status: Some(MissionStatus::Planning),
        spec: Some(spec),
        ..Default::default()
    })
}

/// Stage `plan`: produce the task list and execution strategy.
pub async fn plan_stage(model: &dyn LanguageModel, mission: &Mission) -> Result<MissionDelta> {
    if !mission.tasks.is_empty() {
        return Ok(MissionDelta::status(MissionStatus::AwaitingApproval));
    }

    let classification = match mission.classification {
        Some(ref c) => c,
        None => return Ok(MissionDelta::failed("cannot plan without a classification")),
    };

    let outcome = planner::plan_mission(
        model,
        &mission.request,
        classification,
        mission.project_context.as_deref(),
        mission.spec.as_ref(),
    )
    .await?;

    let tasks = planner::build_tasks(&outcome.plans, &mission.request, classification);
    tracing::info!(
        mission_id = %mission.id,
        tasks = tasks.len(),
        strategy = %outcome.strategy,
        "mission planned"
    );

    Ok(MissionDelta {
        status: Some(MissionStatus::AwaitingApproval),
        tasks: Some(tasks),
        strategy: Some(outcome.strategy),
        ..Default::default()
    })
}

/// Stage `converge`: compute metrics and derive the final status.
pub fn converge_stage(mission: &Mission) -> MissionDelta {
    if mission.metrics.is_some() {
        return MissionDelta::default();
    }

    let any_passed = mission.tasks.iter().any(|t| t.status == TaskStatus::Passed);
    let status = if mission.status == MissionStatus::Failed {
        MissionStatus::Failed
    } else if any_passed || mission.tasks.is_empty() {
        MissionStatus::Completed
    } else {
        MissionStatus::Failed
    };

    MissionDelta {
        status: Some(status),
        metrics: Some(compute_metrics(mission)),
        ..Default::default()
    }
}

/// Compute the convergence aggregates.
///
/// Total duration is the sum of container lifetimes (not the span), and
/// the aggregate task duration is the sum of per-task elapsed times.
pub fn compute_metrics(mission: &Mission) -> MissionMetrics {
    let mut metrics = MissionMetrics::default();

    for task in &mission.tasks {
        match task.status {
            TaskStatus::Passed => metrics.tasks_completed += 1,
            TaskStatus::Failed => metrics.tasks_failed += 1,
            _ => {}
        }
        metrics.total_iterations += task.iteration;
        metrics.aggregate_task_elapsed_ms += task.elapsed_ms;
        for change in &task.files_affected {
            match change.action {
                FileAction::Created => metrics.files_created += 1,
                FileAction::Modified => metrics.files_modified += 1,
                FileAction::Deleted => {}
            }
        }
    }

    for test in &mission.test_results {
        metrics.tests_run += test.total_tests;
        metrics.tests_passed += test.total_tests.saturating_sub(test.failed_tests);
    }

    for container in &mission.containers {
        let completed = container
            .completed_at_ms
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        metrics.total_duration_ms += (completed - container.started_at_ms).max(0);
    }

    metrics.waves_executed = mission.current_wave;
    metrics
}

/// Stage `post-mission`: summarise the run and announce completion.
/// Entirely best-effort; a model failure only loses the summary text.
pub async fn post_mission_stage(
    model: &dyn LanguageModel,
    events: &EventBus,
    mission: &Mission,
) {
    let summary = summarize(model, mission).await.unwrap_or_else(|e| {
        tracing::debug!(mission_id = %mission.id, error = %e, "post-mission summary unavailable");
        String::new()
    });

    let mut event = OrchestratorEvent::new(EventType::MissionCompleted, mission.id)
        .with("status", mission.status.to_string());
    if let Some(ref metrics) = mission.metrics {
        event = event
            .with("tasksCompleted", metrics.tasks_completed.to_string())
            .with("tasksFailed", metrics.tasks_failed.to_string())
            .with("wavesExecuted", metrics.waves_executed.to_string());
    }
    if !summary.is_empty() {
        event = event.with("summary", summary);
    }
    events.publish(event);
}

async fn summarize(model: &dyn LanguageModel, mission: &Mission) -> Result<String> {
    let schema = serde_json::json!({
        "type": "object",
        "required": ["summary"],
        "properties": { "summary": { "type": "string" } }
    });

    let user_prompt = format!(
        "Mission {} finished with status {}. Request: {}\nTasks: {}\nErrors: {}",
        mission.id,
        mission.status,
        mission.request,
        mission
            .tasks
            .iter()
            .map(|t| format!("{} ({}, {})", t.id, t.role, t.status))
            .collect::<Vec<_>>()
            .join("; "),
        mission.errors.join("; "),
    );

    let value = model
        .structured_call(
            "Summarise a finished engineering mission in two sentences for the operator.",
            &user_prompt,
            &schema,
        )
        .await?;
    Ok(value
        .get("summary")
        .and_then(|s| s.as_str())
        .unwrap_or_default()
        .to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldmind_store::models::{
        AgentRole, ContainerInfo, Task, TestResult, task_id,
    };

    #[test]
    fn metrics_aggregate_tasks_tests_and_containers() {
        let mut mission = Mission::new("r");
        mission.current_wave = 3;

        let mut passed = Task::new(task_id(1), AgentRole::Coder, "a");
        passed.status = TaskStatus::Passed;
        passed.iteration = 1;
        passed.elapsed_ms = 500;
        passed.files_affected = vec![
            worldmind_store::models::FileChange {
                path: "src/a.rs".into(),
                action: FileAction::Created,
                lines_changed: 10,
            },
            worldmind_store::models::FileChange {
                path: "src/b.rs".into(),
                action: FileAction::Modified,
                lines_changed: 4,
            },
        ];
        let mut failed = Task::new(task_id(2), AgentRole::Coder, "b");
        failed.status = TaskStatus::Failed;
        failed.iteration = 3;
        failed.elapsed_ms = 200;
        mission.tasks = vec![passed, failed];

        mission.test_results.push(TestResult {
            task_id: task_id(1),
            passed: true,
            total_tests: 10,
            failed_tests: 2,
            output: String::new(),
            elapsed_ms: 40,
        });

        mission.containers.push(ContainerInfo {
            container_id: "c1".into(),
            task_id: task_id(1),
            provider: "local-container".into(),
            started_at_ms: 1_000,
            completed_at_ms: Some(1_700),
        });
        mission.containers.push(ContainerInfo {
            container_id: "c2".into(),
            task_id: task_id(2),
            provider: "local-container".into(),
            started_at_ms: 2_000,
            completed_at_ms: Some(2_300),
        });

        let metrics = compute_metrics(&mission);
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(metrics.total_iterations, 4);
        assert_eq!(metrics.files_created, 1);
        assert_eq!(metrics.files_modified, 1);
        assert_eq!(metrics.tests_run, 10);
        assert_eq!(metrics.tests_passed, 8);
        // Sum of container lifetimes, not the span.
        assert_eq!(metrics.total_duration_ms, 700 + 300);
        assert_eq!(metrics.aggregate_task_elapsed_ms, 700);
        assert_eq!(metrics.waves_executed, 3);
    }

    #[test]
    fn converge_completes_with_one_passed_task() {
        let mut mission = Mission::new("r");
        mission.status = MissionStatus::Executing;
        let mut task = Task::new(task_id(1), AgentRole::Coder, "a");
        task.status = TaskStatus::Passed;
        mission.tasks.push(task);

        let delta = converge_stage(&mission);
        assert_eq!(delta.status, Some(MissionStatus::Completed));
        assert!(delta.metrics.is_some());
    }

    #[test]
    fn converge_fails_when_nothing_passed() {
        let mut mission = Mission::new("r");
        mission.status = MissionStatus::Executing;
        let mut task = Task::new(task_id(1), AgentRole::Coder, "a");
        task.status = TaskStatus::Failed;
        mission.tasks.push(task);

        let delta = converge_stage(&mission);
        assert_eq!(delta.status, Some(MissionStatus::Failed));
    }

    #[test]
    fn converge_empty_task_list_completes() {
        let mut mission = Mission::new("r");
        mission.status = MissionStatus::Executing;
        let delta = converge_stage(&mission);
        assert_eq!(delta.status, Some(MissionStatus::Completed));
    }

    #[test]
    fn converge_preserves_earlier_failure() {
        let mut mission = Mission::new("r");
        mission.status = MissionStatus::Failed;
        let mut task = Task::new(task_id(1), AgentRole::Coder, "a");
        task.status = TaskStatus::Passed;
        mission.tasks.push(task);

        let delta = converge_stage(&mission);
        assert_eq!(delta.status, Some(MissionStatus::Failed));
    }

    #[test]
    fn converge_is_idempotent() {
        let mut mission = Mission::new("r");
        mission.status = MissionStatus::Completed;
        mission.metrics = Some(MissionMetrics::default());
        let delta = converge_stage(&mission);
        assert!(delta.is_empty());
    }
}
