//! Wave evaluator.
//!
//! Runs after every wave dispatch: detects empty coder output, runs the
//! tester and reviewer workers against each code-producing task, evaluates
//! the quality gate, applies failure strategies, and finally merges the
//! wave's passed branches into the base branch, resetting any task whose
//! rebase conflicted.
//!
//! The evaluator works from the pre-wave mission snapshot plus the
//! dispatch observations and folds everything -- dispatch results, gate
//! outcomes, merge effects -- into one [`MissionDelta`] so the driver
//! writes mission state exactly once per wave.

use std::sync::Arc;

use anyhow::Result;

use worldmind_store::delta::MissionDelta;
use worldmind_store::models::{
    AgentRole, FailureStrategy, Mission, MissionStatus, ReviewFeedback, Task, TaskStatus,
    TestResult, WaveDispatchResult,
};

use crate::config::OrchestratorConfig;
use crate::deployer::{
    BuildVerification, DeployOutcome, deploy_retry_context, scan_deployer_output,
    verify_build_output,
};
use crate::dispatch::{DispatchRequest, Dispatcher};
use crate::events::{EventBus, EventType, OrchestratorEvent, TaskPhase};
use crate::failure::{FailureEvidence, apply_failure_strategy};
use crate::gate::{DiagnosticFilter, GateDecision, OUTPUT_TAIL_CHARS, evaluate_gate, output_tail};
use crate::git::GitWorkspace;
use crate::oscillation::OscillationDetector;
use crate::wave::dispatcher::DispatchedWave;

/// Header prepended to a task reset by a merge conflict.
const MERGE_CONFLICT_HEADER: &str = "MERGE CONFLICT RETRY";

/// Evaluates one dispatched wave.
pub struct WaveEvaluator {
    dispatcher: Arc<dyn Dispatcher>,
    git: Option<GitWorkspace>,
    events: EventBus,
    config: OrchestratorConfig,
    filter: DiagnosticFilter,
}

impl WaveEvaluator {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        git: Option<GitWorkspace>,
        events: EventBus,
        config: OrchestratorConfig,
        filter: DiagnosticFilter,
    ) -> Self {
        Self {
            dispatcher,
            git,
            events,
            config,
            filter,
        }
    }

    /// Evaluate every task of a dispatched wave and produce the wave's
    /// aggregated delta.
    pub async fn evaluate_wave(
        &self,
        mission: &Mission,
        dispatched: &DispatchedWave,
        detector: &mut OscillationDetector,
    ) -> Result<MissionDelta> {
        let mut delta = MissionDelta {
            dispatch_results: dispatched.results.clone(),
            containers: dispatched.containers.clone(),
            ..Default::default()
        };
        let mut last_retry_context: Option<String> = None;
        let mut mission_failed = false;

        for (task, result) in dispatched
            .tasks
            .iter()
            .zip(dispatched.results.iter())
        {
            match task.role {
                // Deployers follow the dedicated protocol; a deployer
                // appearing here is recorded as observed, nothing more.
                AgentRole::Deployer => {
                    delta.task_updates.push(task.clone());
                }
                AgentRole::Researcher | AgentRole::Tester | AgentRole::Reviewer => {
                    if result.status == TaskStatus::Passed {
                        let mut passed = task.clone();
                        passed.status = TaskStatus::Passed;
                        delta.add_completed.insert(passed.id.clone());
                        delta.task_updates.push(passed);
                    } else {
                        self.apply_failure(
                            mission,
                            task,
                            task.failure_strategy,
                            "task failed during execution",
                            FailureEvidence {
                                review: None,
                                output_tail: Some(output_tail(&result.output, OUTPUT_TAIL_CHARS)),
                            },
                            detector,
                            &mut delta,
                            &mut last_retry_context,
                            &mut mission_failed,
                        );
                    }
                }
                AgentRole::Coder | AgentRole::Refactorer => {
                    self.evaluate_code_task(
                        mission,
                        task,
                        result,
                        detector,
                        &mut delta,
                        &mut last_retry_context,
                        &mut mission_failed,
                    )
                    .await?;
                }
            }
        }

        // Merge the wave's surviving code branches into the base branch.
        self.merge_wave(mission, &mut delta, &mut mission_failed)
            .await?;

        self.events.publish(
            OrchestratorEvent::new(EventType::WaveCompleted, mission.id)
                .with("wave", mission.current_wave.to_string()),
        );

        // Single-consumer discipline: the wave read the retry context, so
        // it is cleared unless a fresh failure replaced it.
        delta.retry_context = match last_retry_context {
            Some(fresh) => Some(Some(fresh)),
            None if dispatched.retry_context_consumed => Some(None),
            None => None,
        };

        delta.current_wave = Some(mission.current_wave + 1);
        if mission_failed {
            delta.status = Some(MissionStatus::Failed);
        }

        Ok(delta)
    }

    /// Gate logic for one code-producing task.
    #[allow(clippy::too_many_arguments)]
    async fn evaluate_code_task(
        &self,
        mission: &Mission,
        task: &Task,
        result: &WaveDispatchResult,
        detector: &mut OscillationDetector,
        delta: &mut MissionDelta,
        last_retry_context: &mut Option<String>,
        mission_failed: &mut bool,
    ) -> Result<()> {
        if result.status != TaskStatus::Passed {
            self.apply_failure(
                mission,
                task,
                task.failure_strategy,
                "coder task failed during execution",
                FailureEvidence {
                    review: None,
                    output_tail: Some(output_tail(&result.output, OUTPUT_TAIL_CHARS)),
                },
                detector,
                delta,
                last_retry_context,
                mission_failed,
            );
            return Ok(());
        }

        // Internal diagnostics do not count as code output.
        let code_files = self.filter.code_files(&task.files_affected);
        if code_files.is_empty() {
            self.apply_failure(
                mission,
                task,
                task.failure_strategy,
                "coder task produced no code files",
                FailureEvidence {
                    review: None,
                    output_tail: Some(output_tail(&result.output, OUTPUT_TAIL_CHARS)),
                },
                detector,
                delta,
                last_retry_context,
                mission_failed,
            );
            return Ok(());
        }

        let mut verifying = task.clone();
        verifying.status = TaskStatus::Verifying;

        // Run the tester and the reviewer against the produced code.
        self.events.task_phase(mission.id, &task.id, TaskPhase::Tester);
        let test = self.run_tester(mission, &verifying).await;
        delta.test_results.push(test.clone());

        self.events.task_phase(mission.id, &task.id, TaskPhase::Reviewer);
        let review = self.run_reviewer(mission, &verifying).await;
        delta.review_feedback.push(review.clone());

        self.events.task_phase(mission.id, &task.id, TaskPhase::QualityGate);
        let decision = evaluate_gate(&test, &review, self.config.review_score_threshold);

        match decision {
            GateDecision::Grant => {
                self.events.publish(
                    OrchestratorEvent::new(EventType::QualityGateGranted, mission.id)
                        .task(&task.id)
                        .with("score", review.score.to_string()),
                );
                self.events
                    .publish(OrchestratorEvent::new(EventType::TaskFulfilled, mission.id).task(&task.id));
                detector.clear(&task.id);
                let mut passed = task.clone();
                passed.status = TaskStatus::Passed;
                delta.add_completed.insert(passed.id.clone());
                delta.task_updates.push(passed);
            }
            GateDecision::Deny { action, reason } => {
                self.events.publish(
                    OrchestratorEvent::new(EventType::QualityGateDenied, mission.id)
                        .task(&task.id)
                        .with("score", review.score.to_string())
                        .with("reason", reason.clone()),
                );
                // The gate proposes an action; a task whose own strategy is
                // not retry keeps its strategy.
                let nominal = if task.failure_strategy == FailureStrategy::Retry {
                    action
                } else {
                    task.failure_strategy
                };
                self.apply_failure(
                    mission,
                    task,
                    nominal,
                    &reason,
                    FailureEvidence {
                        review: Some(&review),
                        output_tail: None,
                    },
                    detector,
                    delta,
                    last_retry_context,
                    mission_failed,
                );
            }
        }

        Ok(())
    }

    /// Dispatch a short-lived tester worker for a coder task and parse its
    /// output. A dispatcher exception becomes a failed test result carrying
    /// the exception message.
    async fn run_tester(&self, mission: &Mission, coder: &Task) -> TestResult {
        let mut tester = Task::new(
            format!("{}-tester", coder.id),
            AgentRole::Tester,
            format!("Run the test suite relevant to {}", coder.id),
        );
        tester.input_context = verification_context(coder);
        tester.success_criteria =
            "Report `TESTS: PASS` or `TESTS: FAIL`, plus `TOTAL: <n>` and `FAILED: <n>`.".into();

        match self.dispatch_verifier(mission, tester, coder).await {
            Ok((output, elapsed_ms, passed)) => {
                parse_test_output(&coder.id, &output, passed, elapsed_ms)
            }
            Err(e) => TestResult {
                task_id: coder.id.clone(),
                passed: false,
                total_tests: 0,
                failed_tests: 0,
                output: format!("tester dispatch failed: {e}"),
                elapsed_ms: 0,
            },
        }
    }

    /// Dispatch a short-lived reviewer worker for a coder task and parse
    /// its output. A dispatcher exception becomes an unapproved review
    /// carrying the exception message.
    async fn run_reviewer(&self, mission: &Mission, coder: &Task) -> ReviewFeedback {
        let mut reviewer = Task::new(
            format!("{}-reviewer", coder.id),
            AgentRole::Reviewer,
            format!("Review the changes produced by {}", coder.id),
        );
        reviewer.input_context = verification_context(coder);
        reviewer.success_criteria =
            "Respond with JSON: {approved, summary, issues, suggestions, score}.".into();

        match self.dispatch_verifier(mission, reviewer, coder).await {
            Ok((output, _elapsed, _passed)) => parse_review_output(&coder.id, &output),
            Err(e) => ReviewFeedback {
                task_id: coder.id.clone(),
                approved: false,
                summary: format!("reviewer dispatch failed: {e}"),
                issues: Vec::new(),
                suggestions: Vec::new(),
                score: 0,
            },
        }
    }

    /// Dispatch a tester/reviewer worker in the coder's working copy.
    async fn dispatch_verifier(
        &self,
        mission: &Mission,
        task: Task,
        coder: &Task,
    ) -> Result<(String, u64, bool)> {
        let mut project_path = std::path::PathBuf::from(
            mission.project_path.clone().unwrap_or_else(|| ".".to_owned()),
        );
        if self.config.worktrees_enabled {
            if let Some(ref git) = self.git {
                if let Ok(path) = git.acquire_worktree(&coder.id).await {
                    project_path = path;
                }
            }
        }

        let request = DispatchRequest {
            task,
            project_context: mission.project_context.clone(),
            project_path,
            git_remote_url: mission.git_remote_url.clone(),
            runtime_tag: mission.runtime_tag.clone(),
            reasoning_level: mission.reasoning_level,
        };

        let outcome =
            tokio::time::timeout(self.config.task_timeout, self.dispatcher.execute(request))
                .await
                .map_err(|_| anyhow::anyhow!("verification worker timed out"))??;

        Ok((
            outcome.output,
            outcome.task.elapsed_ms,
            outcome.task.status == TaskStatus::Passed,
        ))
    }

    /// Fold one failure-strategy application into the wave delta.
    #[allow(clippy::too_many_arguments)]
    fn apply_failure(
        &self,
        mission: &Mission,
        task: &Task,
        nominal: FailureStrategy,
        reason: &str,
        evidence: FailureEvidence<'_>,
        detector: &mut OscillationDetector,
        delta: &mut MissionDelta,
        last_retry_context: &mut Option<String>,
        mission_failed: &mut bool,
    ) {
        let outcome = apply_failure_strategy(task, nominal, reason, evidence, detector, &self.config);

        if outcome.add_completed {
            delta.add_completed.insert(outcome.task.id.clone());
        }
        if let Some(context) = outcome.retry_context.clone() {
            *last_retry_context = Some(context);
        }
        if let Some(error) = outcome.error.clone() {
            delta.errors.push(error);
        }
        if outcome.mission_failed() {
            *mission_failed = true;
            self.events.publish(
                OrchestratorEvent::new(EventType::TaskFailed, mission.id)
                    .task(&outcome.task.id)
                    .with("escalated", "true"),
            );
        }
        delta.task_updates.push(outcome.task);
    }

    /// Merge the wave's passed code branches into the base branch and
    /// reset any conflicted task. Branches merge in lexicographic id
    /// order, which is creation order under the zero-padded convention.
    async fn merge_wave(
        &self,
        mission: &Mission,
        delta: &mut MissionDelta,
        mission_failed: &mut bool,
    ) -> Result<()> {
        let Some(ref git) = self.git else {
            return Ok(());
        };
        if mission.git_remote_url.is_none() {
            return Ok(());
        }

        let mut candidates: Vec<&Task> = delta
            .task_updates
            .iter()
            .filter(|t| t.role.produces_code() && t.status == TaskStatus::Passed)
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        if candidates.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = candidates.iter().map(|t| t.id.clone()).collect();
        let report = git.merge_wave(&git.merge_dir(), &ids).await?;

        self.events.publish(
            OrchestratorEvent::new(EventType::WaveMerged, mission.id)
                .with("merged", report.merged.join(","))
                .with("conflicted", report.conflicted.join(",")),
        );

        if report.conflicted.is_empty() {
            return Ok(());
        }

        // Files the merged tasks already landed on the base branch; the
        // conflicted retries must not recreate them.
        let merged_files: Vec<String> = delta
            .task_updates
            .iter()
            .filter(|t| report.merged.contains(&t.id))
            .flat_map(|t| t.files_affected.iter().map(|f| f.path.clone()))
            .collect();

        for conflicted_id in &report.conflicted {
            let Some(position) = delta.task_updates.iter().position(|t| &t.id == conflicted_id)
            else {
                continue;
            };

            delta.remove_completed.insert(conflicted_id.clone());
            delta.add_completed.remove(conflicted_id);

            let escalated = {
                let task = &mut delta.task_updates[position];
                task.iteration += 1;

                if task.iteration > task.max_iterations {
                    task.status = TaskStatus::Failed;
                    true
                } else {
                    task.status = TaskStatus::Pending;
                    let mut header = format!(
                        "{MERGE_CONFLICT_HEADER}\n\
                         Your previous branch conflicted while merging into {}.",
                        git.base_branch()
                    );
                    if !merged_files.is_empty() {
                        header.push_str(
                            "\nThese files are already present on the base branch; do not recreate them:",
                        );
                        for file in &merged_files {
                            header.push_str(&format!("\n- {file}"));
                        }
                    }
                    task.input_context = if task.input_context.is_empty() {
                        header
                    } else {
                        format!("{header}\n\n{}", task.input_context)
                    };

                    // Retry with what the task actually touched, falling
                    // back to the planner's advisory targets.
                    if !task.files_affected.is_empty() {
                        task.target_files =
                            task.files_affected.iter().map(|f| f.path.clone()).collect();
                    }
                    task.files_affected.clear();

                    tracing::info!(
                        task_id = %conflicted_id,
                        iteration = task.iteration,
                        "task reset after merge conflict"
                    );
                    false
                }
            };

            if escalated {
                delta.errors.push(format!(
                    "task {conflicted_id} escalated: merge conflicts exhausted retries"
                ));
                *mission_failed = true;
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Deployer protocol
    // -----------------------------------------------------------------------

    /// Run a deployer task through its sub-protocol: pre-deploy build
    /// verification, the deployer run itself, and the output scan.
    /// Produces the wave's aggregated delta, exactly like `evaluate_wave`.
    pub async fn run_deployer_wave(
        &self,
        mission: &Mission,
        deployer_id: &str,
        detector: &mut OscillationDetector,
    ) -> Result<MissionDelta> {
        let mut delta = MissionDelta::default();
        let Some(task) = mission.task(deployer_id) else {
            return Ok(MissionDelta::failed(format!(
                "deployer wave references unknown task {deployer_id}"
            )));
        };

        // Pre-deploy verification: a tester with a build-verification brief.
        self.events.task_phase(mission.id, deployer_id, TaskPhase::Build);
        let mut verifier = Task::new(
            format!("{deployer_id}-build-verify"),
            AgentRole::Tester,
            "Build verification: build the project and check the deployment manifest".to_owned(),
        );
        verifier.success_criteria =
            "Report `BUILD: OK` or `BUILD: FAIL`, and `MANIFEST: OK`, `MANIFEST: FAIL`, or `MANIFEST: MISSING`.".into();

        let verification = match self.dispatch_verifier(mission, verifier, task).await {
            Ok((output, _, _)) => verify_build_output(&output),
            Err(e) => BuildVerification::Failed {
                reason: format!("build verification dispatch failed: {e}"),
            },
        };

        if let BuildVerification::Failed { reason } = verification {
            let mut skipped = task.clone();
            skipped.status = TaskStatus::Skipped;
            delta.task_updates.push(skipped);
            delta.errors.push(format!("deployment aborted: {reason}"));
            delta.status = Some(MissionStatus::Failed);
            self.events.publish(
                OrchestratorEvent::new(EventType::DeployerFailed, mission.id)
                    .task(deployer_id)
                    .with("reason", reason),
            );
            return Ok(delta);
        }

        // The deployer itself.
        self.events.task_phase(mission.id, deployer_id, TaskPhase::Push);
        let mut dispatched_task = task.clone();
        dispatched_task.status = TaskStatus::Executing;
        let request = DispatchRequest {
            task: dispatched_task,
            project_context: mission.project_context.clone(),
            project_path: std::path::PathBuf::from(
                mission.project_path.clone().unwrap_or_else(|| ".".to_owned()),
            ),
            git_remote_url: mission.git_remote_url.clone(),
            runtime_tag: mission.runtime_tag.clone(),
            reasoning_level: mission.reasoning_level,
        };

        let outcome =
            match tokio::time::timeout(self.config.task_timeout, self.dispatcher.execute(request))
                .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    return Ok(self.deployer_dispatch_failed(
                        mission,
                        task,
                        &format!("deployer dispatch failed: {e}"),
                        detector,
                    ));
                }
                Err(_elapsed) => {
                    return Ok(self.deployer_dispatch_failed(
                        mission,
                        task,
                        "deployer timed out",
                        detector,
                    ));
                }
            };

        self.events.task_phase(mission.id, deployer_id, TaskPhase::Verify);

        delta.containers.push(outcome.container.clone());
        delta.dispatch_results.push(WaveDispatchResult {
            task_id: deployer_id.to_owned(),
            wave: mission.current_wave,
            status: outcome.task.status,
            files_affected: outcome.task.files_affected.clone(),
            output: outcome.output.clone(),
            elapsed_ms: outcome.task.elapsed_ms,
        });

        // Success is decided by the output scan, not the exit status.
        match scan_deployer_output(&outcome.output) {
            DeployOutcome::Success { url } => {
                let mut passed = outcome.task.clone();
                passed.status = TaskStatus::Passed;
                delta.add_completed.insert(passed.id.clone());
                delta.task_updates.push(passed);
                let mut event =
                    OrchestratorEvent::new(EventType::DeployerSuccess, mission.id).task(deployer_id);
                if let Some(url) = url {
                    event = event.with("url", url);
                }
                self.events.publish(event);
            }
            DeployOutcome::Failure { diagnosis } => {
                self.events.publish(
                    OrchestratorEvent::new(EventType::DeployerFailed, mission.id)
                        .task(deployer_id)
                        .with("category", diagnosis.category.to_string())
                        .with("reason", diagnosis.reason.clone()),
                );
                let retry_context = deploy_retry_context(&diagnosis);
                let mut last_retry_context = None;
                let mut mission_failed = false;
                self.apply_failure(
                    mission,
                    task,
                    task.failure_strategy,
                    &retry_context,
                    FailureEvidence::default(),
                    detector,
                    &mut delta,
                    &mut last_retry_context,
                    &mut mission_failed,
                );
                if let Some(context) = last_retry_context {
                    delta.retry_context = Some(Some(context));
                }
                if mission_failed {
                    delta.status = Some(MissionStatus::Failed);
                }
            }
        }

        delta.current_wave = Some(mission.current_wave + 1);
        Ok(delta)
    }

    /// Infrastructure failure while running the deployer: apply the task's
    /// failure strategy and report the wave.
    fn deployer_dispatch_failed(
        &self,
        mission: &Mission,
        task: &Task,
        reason: &str,
        detector: &mut OscillationDetector,
    ) -> MissionDelta {
        let mut delta = MissionDelta::default();
        self.events.publish(
            OrchestratorEvent::new(EventType::DeployerFailed, mission.id)
                .task(&task.id)
                .with("reason", reason.to_owned()),
        );

        let mut last_retry_context = None;
        let mut mission_failed = false;
        self.apply_failure(
            mission,
            task,
            task.failure_strategy,
            reason,
            FailureEvidence::default(),
            detector,
            &mut delta,
            &mut last_retry_context,
            &mut mission_failed,
        );
        if let Some(context) = last_retry_context {
            delta.retry_context = Some(Some(context));
        }
        if mission_failed {
            delta.status = Some(MissionStatus::Failed);
        }
        delta.current_wave = Some(mission.current_wave + 1);
        delta
    }
}

/// Build the context handed to tester and reviewer workers.
fn verification_context(coder: &Task) -> String {
    let mut context = format!("Task under verification: {}\n{}\n", coder.id, coder.description);
    if !coder.success_criteria.is_empty() {
        context.push_str(&format!("Success criteria: {}\n", coder.success_criteria));
    }
    if !coder.files_affected.is_empty() {
        context.push_str("Changed files:\n");
        for change in &coder.files_affected {
            context.push_str(&format!(
                "- {} ({}, {} lines)\n",
                change.path, change.action, change.lines_changed
            ));
        }
    }
    context
}

/// Parse tester output.
///
/// The tester reports `TESTS: PASS` or `TESTS: FAIL` plus `TOTAL: <n>` and
/// `FAILED: <n>`. Without markers the worker's own exit status decides,
/// with zero counted tests.
fn parse_test_output(task_id: &str, output: &str, worker_passed: bool, elapsed_ms: u64) -> TestResult {
    let total_tests = scan_count(output, "TOTAL:");
    let failed_tests = scan_count(output, "FAILED:");

    let passed = if output.contains("TESTS: FAIL") {
        false
    } else if output.contains("TESTS: PASS") {
        failed_tests == 0
    } else {
        worker_passed && failed_tests == 0
    };

    TestResult {
        task_id: task_id.to_owned(),
        passed,
        total_tests,
        failed_tests,
        output: output.to_owned(),
        elapsed_ms,
    }
}

fn scan_count(output: &str, marker: &str) -> u32 {
    output
        .lines()
        .find_map(|line| {
            line.trim()
                .strip_prefix(marker)
                .and_then(|rest| rest.trim().split_whitespace().next())
                .and_then(|n| n.parse().ok())
        })
        .unwrap_or(0)
}

/// Parse reviewer output.
///
/// The reviewer is asked for a JSON object `{approved, summary, issues,
/// suggestions, score}`; the first balanced JSON object in the output is
/// used. Unparseable output is treated as an unapproved review carrying a
/// snippet of the raw text.
fn parse_review_output(task_id: &str, output: &str) -> ReviewFeedback {
    #[derive(serde::Deserialize)]
    struct ReviewWire {
        approved: bool,
        #[serde(default)]
        summary: String,
        #[serde(default)]
        issues: Vec<String>,
        #[serde(default)]
        suggestions: Vec<String>,
        #[serde(default)]
        score: u8,
    }

    if let Some(json) = extract_json_object(output) {
        if let Ok(wire) = serde_json::from_str::<ReviewWire>(json) {
            return ReviewFeedback {
                task_id: task_id.to_owned(),
                approved: wire.approved,
                summary: wire.summary,
                issues: wire.issues,
                suggestions: wire.suggestions,
                score: wire.score.min(10),
            };
        }
    }

    ReviewFeedback {
        task_id: task_id.to_owned(),
        approved: false,
        summary: format!(
            "reviewer output was not parseable: {}",
            output_tail(output, 200)
        ),
        issues: Vec::new(),
        suggestions: Vec::new(),
        score: 0,
    }
}

/// Find the first balanced `{...}` object in free-form output.
fn extract_json_object(output: &str) -> Option<&str> {
    let start = output.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in output[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&output[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tester_markers_decide_pass() {
        let result = parse_test_output("TASK-001", "TESTS: PASS\nTOTAL: 12\nFAILED: 0\n", true, 5);
        assert!(result.passed);
        assert_eq!(result.total_tests, 12);
        assert_eq!(result.failed_tests, 0);
    }

    #[test]
    fn tester_fail_marker_wins_over_worker_status() {
        let result = parse_test_output("TASK-001", "TESTS: FAIL\nTOTAL: 9\nFAILED: 2\n", true, 5);
        assert!(!result.passed);
        assert_eq!(result.failed_tests, 2);
    }

    #[test]
    fn tester_pass_marker_with_failures_is_not_a_pass() {
        let result = parse_test_output("TASK-001", "TESTS: PASS\nTOTAL: 9\nFAILED: 1\n", true, 5);
        assert!(!result.passed);
    }

    #[test]
    fn tester_without_markers_uses_worker_status() {
        assert!(parse_test_output("TASK-001", "all good", true, 5).passed);
        assert!(!parse_test_output("TASK-001", "boom", false, 5).passed);
    }

    #[test]
    fn reviewer_json_is_parsed() {
        let output = r#"Here is my verdict:
{"approved": true, "summary": "clean change", "issues": [], "suggestions": ["add a test"], "score": 8}
Thanks."#;
        let review = parse_review_output("TASK-001", output);
        assert!(review.approved);
        assert_eq!(review.score, 8);
        assert_eq!(review.summary, "clean change");
        assert_eq!(review.suggestions, vec!["add a test".to_string()]);
    }

    #[test]
    fn reviewer_score_clamped_to_ten() {
        let output = r#"{"approved": true, "summary": "s", "score": 42}"#;
        assert_eq!(parse_review_output("TASK-001", output).score, 10);
    }

    #[test]
    fn reviewer_garbage_is_unapproved() {
        let review = parse_review_output("TASK-001", "LGTM!!");
        assert!(!review.approved);
        assert_eq!(review.score, 0);
        assert!(review.summary.contains("not parseable"));
    }

    #[test]
    fn json_extraction_handles_nesting_and_strings() {
        let output = r#"note {"a": {"b": "with } brace"}, "c": 1} tail"#;
        let json = extract_json_object(output).unwrap();
        assert_eq!(json, r#"{"a": {"b": "with } brace"}, "c": 1}"#);
    }

    #[test]
    fn verification_context_lists_changes() {
        use worldmind_store::models::{FileAction, FileChange};
        let mut coder = Task::new("TASK-002", AgentRole::Coder, "add endpoint");
        coder.files_affected.push(FileChange {
            path: "src/health.rs".into(),
            action: FileAction::Created,
            lines_changed: 30,
        });
        let context = verification_context(&coder);
        assert!(context.contains("TASK-002"));
        assert!(context.contains("src/health.rs"));
        assert!(context.contains("created"));
    }
}
