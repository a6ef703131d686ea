//! End-to-end pipeline tests over mock collaborators: the staged flow,
//! the wave loop, gate denials, oscillation, and empty-output retries.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use worldmind_core::config::OrchestratorConfig;
use worldmind_core::events::{EventBus, EventType, OrchestratorEvent};
use worldmind_core::gate::DiagnosticFilter;
use worldmind_core::pipeline::{NullContextSource, Pipeline};
use worldmind_store::models::{
    AgentRole, Mission, MissionStatus, Task, TaskStatus, task_id,
};
use worldmind_store::store::{MemoryStore, MissionStore};

use worldmind_test_utils::{CannedModel, ScriptedDispatcher, ScriptedOutcome, planning_model};

// ===========================================================================
// Harness
// ===========================================================================

struct TestHarness {
    store: Arc<MemoryStore>,
    dispatcher: Arc<ScriptedDispatcher>,
    pipeline: Pipeline,
    events: mpsc::Receiver<OrchestratorEvent>,
}

impl TestHarness {
    fn new(model: CannedModel, dispatcher: ScriptedDispatcher) -> Self {
        let config = OrchestratorConfig::default();
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(dispatcher);
        let (bus, events) = EventBus::new(1024);
        let pipeline = Pipeline::new(
            Arc::clone(&store) as Arc<dyn MissionStore>,
            Arc::new(model),
            Arc::clone(&dispatcher) as _,
            None,
            bus,
            config,
            Arc::new(NullContextSource),
            DiagnosticFilter::default(),
        );
        Self {
            store,
            dispatcher,
            pipeline,
            events,
        }
    }

    async fn save(&self, mission: &Mission) {
        self.store.save(mission).await.unwrap();
    }

    async fn run(&self, mission: &Mission) -> Mission {
        self.pipeline
            .run(mission.id, CancellationToken::new())
            .await
            .unwrap()
    }

    fn drain_events(&mut self) -> Vec<OrchestratorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// A mission already approved for execution with the given tasks.
fn executing_mission(tasks: Vec<Task>) -> Mission {
    let mut mission = Mission::new("run the tasks");
    mission.status = MissionStatus::Executing;
    mission.tasks = tasks;
    mission
}

fn coder_task(n: usize) -> Task {
    let mut task = Task::new(task_id(n), AgentRole::Coder, format!("implement part {n}"));
    task.target_files = vec![format!("src/part{n}.rs")];
    task
}

fn passing_review() -> serde_json::Value {
    serde_json::json!({
        "approved": true, "summary": "clean", "issues": [], "suggestions": [], "score": 8
    })
}

fn tester_pass() -> ScriptedOutcome {
    ScriptedOutcome::passed("TESTS: PASS\nTOTAL: 5\nFAILED: 0")
}

// ===========================================================================
// Staged flow
// ===========================================================================

#[tokio::test]
async fn single_coder_happy_path() {
    let plans = serde_json::json!({
        "tasks": [
            { "role": "researcher", "description": "survey the http module" },
            { "role": "coder", "description": "add GET /health",
              "targetFiles": ["src/health.rs"] }
        ],
        "strategy": "parallel"
    });

    let dispatcher = ScriptedDispatcher::new()
        .script(
            "TASK-002",
            ScriptedOutcome::passed("wrote the endpoint").with_file("src/health.rs"),
        )
        .script("TASK-002-tester", tester_pass())
        .script(
            "TASK-002-reviewer",
            ScriptedOutcome::passed(passing_review().to_string()),
        );

    let mut harness = TestHarness::new(planning_model(plans), dispatcher);
    let mission = Mission::new("Add GET /health returning {status:\"ok\"}");
    harness.save(&mission).await;

    // First run walks classify -> context -> specify -> plan and parks.
    let parked = harness.run(&mission).await;
    assert_eq!(parked.status, MissionStatus::AwaitingApproval);
    assert_eq!(parked.tasks.len(), 2);
    assert_eq!(parked.tasks[0].role, AgentRole::Researcher);
    assert_eq!(parked.tasks[1].role, AgentRole::Coder);
    assert_eq!(parked.tasks[1].depends_on, vec![task_id(1)]);

    // Approval releases the wave loop.
    harness.pipeline.approve(mission.id).await.unwrap();
    let done = harness.run(&mission).await;

    assert_eq!(done.status, MissionStatus::Completed);
    let metrics = done.metrics.expect("metrics computed at convergence");
    assert_eq!(metrics.tasks_completed, 2);
    assert_eq!(metrics.tasks_failed, 0);
    assert_eq!(metrics.tests_run, 5);

    // Researcher ran before the coder (dependency order).
    let ordered: Vec<String> = harness
        .dispatcher
        .executed()
        .into_iter()
        .filter(|id| id == &task_id(1) || id == &task_id(2))
        .collect();
    assert_eq!(ordered, vec![task_id(1), task_id(2)]);

    let events = harness.drain_events();
    assert!(
        events
            .iter()
            .any(|e| e.event_type == EventType::QualityGateGranted),
        "expected a quality_gate.granted event"
    );
    assert!(
        events
            .iter()
            .any(|e| e.event_type == EventType::MissionCompleted)
    );
}

#[tokio::test]
async fn validation_failure_never_leaves_received() {
    let harness = TestHarness::new(CannedModel::new(), ScriptedDispatcher::new());
    let mission = Mission::new("   ");
    harness.save(&mission).await;

    let stalled = harness.run(&mission).await;
    assert_eq!(stalled.status, MissionStatus::Received);
    assert_eq!(stalled.errors.len(), 1);
    assert!(stalled.errors[0].contains("request is empty"));
}

#[tokio::test]
async fn llm_error_fails_the_mission() {
    // The classifier response is garbage, which is an LLM-contract error
    // and must bubble into a failed mission.
    let model = CannedModel::new().respond(serde_json::json!({ "nonsense": true }));
    let harness = TestHarness::new(model, ScriptedDispatcher::new());
    let mission = Mission::new("do something");
    harness.save(&mission).await;

    let failed = harness.run(&mission).await;
    assert_eq!(failed.status, MissionStatus::Failed);
    assert!(!failed.errors.is_empty());
}

#[tokio::test]
async fn clarifying_questions_park_the_mission() {
    let model = CannedModel::new()
        .respond(serde_json::json!({
            "category": "feature",
            "complexity": 2,
            "affectedComponents": [],
            "planningStrategy": "parallel"
        }))
        .respond(serde_json::json!({ "questions": ["Which port should the server use?"] }))
        // After the answer arrives: spec, then plan.
        .respond(serde_json::json!({
            "title": "t", "overview": "o", "goals": [], "nonGoals": [],
            "technicalRequirements": [], "edgeCases": [], "acceptanceCriteria": [],
            "components": []
        }))
        .respond(serde_json::json!({
            "tasks": [ { "role": "coder", "description": "implement" } ]
        }));

    let harness = TestHarness::new(model, ScriptedDispatcher::new());
    let mission = Mission::new("add a server");
    harness.save(&mission).await;

    let parked = harness.run(&mission).await;
    assert_eq!(parked.status, MissionStatus::Clarifying);
    assert_eq!(parked.clarifying_questions.len(), 1);

    harness
        .pipeline
        .answer(
            mission.id,
            [("Which port should the server use?".to_owned(), "8080".to_owned())],
        )
        .await
        .unwrap();

    let replanned = harness.run(&mission).await;
    assert_eq!(replanned.status, MissionStatus::AwaitingApproval);
    assert!(replanned.spec.is_some());
}

#[tokio::test]
async fn stages_short_circuit_when_output_present() {
    // An empty CannedModel fails any real LLM call, so reaching
    // awaiting_approval proves every stage short-circuited.
    let model = CannedModel::new();
    let harness = TestHarness::new(model, ScriptedDispatcher::new());

    let mut mission = Mission::new("already classified");
    mission.classification = Some(worldmind_store::models::Classification {
        category: worldmind_store::models::RequestCategory::Feature,
        complexity: 1,
        affected_components: vec![],
        planning_strategy: worldmind_store::models::PlanningStrategy::Parallel,
        runtime_tag: None,
    });
    mission.project_context = Some(String::new());
    mission.spec = Some(worldmind_store::models::ProductSpec {
        title: "t".into(),
        overview: "o".into(),
        goals: vec![],
        non_goals: vec![],
        technical_requirements: vec![],
        edge_cases: vec![],
        acceptance_criteria: vec![],
        components: vec![],
    });
    mission.tasks = vec![coder_task(1)];
    harness.save(&mission).await;

    let parked = harness.run(&mission).await;
    assert_eq!(parked.status, MissionStatus::AwaitingApproval);
}

// ===========================================================================
// Wave loop
// ===========================================================================

#[tokio::test]
async fn gate_denied_retry_then_grant() {
    let denied_review = serde_json::json!({
        "approved": false, "summary": "uses wrong field name",
        "issues": ["uses wrong field name"], "suggestions": [], "score": 3
    });

    let dispatcher = ScriptedDispatcher::new()
        .script(
            "TASK-001",
            ScriptedOutcome::passed("first try").with_file("src/part1.rs"),
        )
        .script(
            "TASK-001",
            ScriptedOutcome::passed("second try").with_file("src/part1.rs"),
        )
        .script("TASK-001-tester", tester_pass())
        .script("TASK-001-tester", tester_pass())
        .script(
            "TASK-001-reviewer",
            ScriptedOutcome::passed(denied_review.to_string()),
        )
        .script(
            "TASK-001-reviewer",
            ScriptedOutcome::passed(passing_review().to_string()),
        );

    let harness = TestHarness::new(CannedModel::new(), dispatcher);
    let mission = executing_mission(vec![coder_task(1)]);
    harness.save(&mission).await;

    let done = harness.run(&mission).await;
    assert_eq!(done.status, MissionStatus::Completed);

    let task = done.task(&task_id(1)).unwrap();
    assert_eq!(task.status, TaskStatus::Passed);
    assert_eq!(task.iteration, 1);
    // The denial enriched the task's own context.
    assert!(task.input_context.contains("uses wrong field name"));
    // The single-consumer retry context was read and cleared.
    assert!(done.retry_context.is_none());
    assert_eq!(done.review_feedback.len(), 2);
    assert_eq!(done.review_feedback[1].score, 8);
}

#[tokio::test]
async fn oscillation_escalates_on_third_identical_failure() {
    // Tests fail the same way on every attempt.
    let failing_tester = || ScriptedOutcome::passed("TESTS: FAIL\nTOTAL: 5\nFAILED: 2");
    let review = || ScriptedOutcome::passed(passing_review().to_string());

    let mut dispatcher = ScriptedDispatcher::new()
        .with_default(ScriptedOutcome::passed("coded").with_file("src/part1.rs"));
    for _ in 0..3 {
        dispatcher = dispatcher
            .script("TASK-001-tester", failing_tester())
            .script("TASK-001-reviewer", review());
    }

    let mut harness = TestHarness::new(CannedModel::new(), dispatcher);
    let mission = executing_mission(vec![coder_task(1)]);
    harness.save(&mission).await;

    let failed = harness.run(&mission).await;
    assert_eq!(failed.status, MissionStatus::Failed);
    assert!(
        failed.errors.iter().any(|e| e.contains("oscillation detected")),
        "errors were: {:?}",
        failed.errors
    );

    let metrics = failed.metrics.expect("metrics computed for failed missions");
    assert_eq!(metrics.tasks_failed, 1);

    let events = harness.drain_events();
    let denials = events
        .iter()
        .filter(|e| e.event_type == EventType::QualityGateDenied)
        .count();
    assert_eq!(denials, 3);
}

#[tokio::test]
async fn empty_output_retries_with_agent_tail() {
    let long_output = format!("{}IMPORTANT FINAL WORDS", "x".repeat(3000));

    let dispatcher = ScriptedDispatcher::new()
        // First attempt only touches a log file.
        .script(
            "TASK-001",
            ScriptedOutcome::passed(long_output).with_file("build/output.log"),
        )
        // Second attempt produces real code and passes the gate.
        .script(
            "TASK-001",
            ScriptedOutcome::passed("fixed").with_file("src/part1.rs"),
        )
        .script("TASK-001-tester", tester_pass())
        .script(
            "TASK-001-reviewer",
            ScriptedOutcome::passed(passing_review().to_string()),
        );

    let harness = TestHarness::new(CannedModel::new(), dispatcher);
    let mission = executing_mission(vec![coder_task(1)]);
    harness.save(&mission).await;

    let done = harness.run(&mission).await;
    assert_eq!(done.status, MissionStatus::Completed);

    let task = done.task(&task_id(1)).unwrap();
    assert_eq!(task.iteration, 1);
    assert!(task.input_context.contains("coder task produced no code files"));
    // The tail of the agent output (last 2000 chars) made it into the
    // retry context; the far prefix did not.
    assert!(task.input_context.contains("IMPORTANT FINAL WORDS"));
    // Only one test result: the empty first attempt never reached the gate.
    assert_eq!(done.test_results.len(), 1);
}

#[tokio::test]
async fn dispatcher_infrastructure_error_is_a_task_failure() {
    let dispatcher = ScriptedDispatcher::new()
        .script(
            "TASK-001",
            ScriptedOutcome::infrastructure_error("docker daemon unreachable"),
        )
        .script(
            "TASK-001",
            ScriptedOutcome::passed("recovered").with_file("src/part1.rs"),
        )
        .script("TASK-001-tester", tester_pass())
        .script(
            "TASK-001-reviewer",
            ScriptedOutcome::passed(passing_review().to_string()),
        );

    let harness = TestHarness::new(CannedModel::new(), dispatcher);
    let mission = executing_mission(vec![coder_task(1)]);
    harness.save(&mission).await;

    let done = harness.run(&mission).await;
    assert_eq!(done.status, MissionStatus::Completed);

    // The synthesised failed result recorded the error message.
    let first = done
        .dispatch_results
        .iter()
        .find(|r| r.status == TaskStatus::Failed)
        .expect("failed dispatch result recorded");
    assert!(first.output.contains("docker daemon unreachable"));
    assert!(first.files_affected.is_empty());
}

#[tokio::test]
async fn skip_strategy_unblocks_dependents() {
    // TASK-001 fails but is marked skip; TASK-002 depends on it and must
    // still run.
    let mut optional = coder_task(1);
    optional.failure_strategy = worldmind_store::models::FailureStrategy::Skip;
    let mut dependent = coder_task(2);
    dependent.depends_on = vec![task_id(1)];

    let dispatcher = ScriptedDispatcher::new()
        .script("TASK-001", ScriptedOutcome::failed("broken"))
        .script(
            "TASK-002",
            ScriptedOutcome::passed("done").with_file("src/part2.rs"),
        )
        .script("TASK-002-tester", tester_pass())
        .script(
            "TASK-002-reviewer",
            ScriptedOutcome::passed(passing_review().to_string()),
        );

    let harness = TestHarness::new(CannedModel::new(), dispatcher);
    let mission = executing_mission(vec![optional, dependent]);
    harness.save(&mission).await;

    let done = harness.run(&mission).await;
    assert_eq!(done.status, MissionStatus::Completed);
    assert_eq!(done.task(&task_id(1)).unwrap().status, TaskStatus::Skipped);
    assert_eq!(done.task(&task_id(2)).unwrap().status, TaskStatus::Passed);
    assert!(done.completed_task_ids.contains(&task_id(1)));
}

#[tokio::test]
async fn sequential_strategy_runs_one_task_per_wave() {
    let dispatcher = ScriptedDispatcher::new()
        .script("TASK-001", ScriptedOutcome::passed("a").with_file("src/a.rs"))
        .script("TASK-001-tester", tester_pass())
        .script(
            "TASK-001-reviewer",
            ScriptedOutcome::passed(passing_review().to_string()),
        )
        .script("TASK-002", ScriptedOutcome::passed("b").with_file("src/b.rs"))
        .script("TASK-002-tester", tester_pass())
        .script(
            "TASK-002-reviewer",
            ScriptedOutcome::passed(passing_review().to_string()),
        );

    let harness = TestHarness::new(CannedModel::new(), dispatcher);
    let mut mission = executing_mission(vec![coder_task(1), coder_task(2)]);
    mission.strategy = worldmind_store::models::ExecutionStrategy::Sequential;
    harness.save(&mission).await;

    let done = harness.run(&mission).await;
    assert_eq!(done.status, MissionStatus::Completed);
    // Two singleton waves plus the terminating empty wave.
    assert_eq!(done.metrics.unwrap().waves_executed, 2);
    let waves: Vec<u32> = done.dispatch_results.iter().map(|r| r.wave).collect();
    assert_eq!(waves, vec![0, 1]);
}

#[tokio::test]
async fn deployer_runs_last_and_succeeds() {
    let mut deployer = Task::new(task_id(2), AgentRole::Deployer, "ship the app");
    deployer.failure_strategy = worldmind_store::models::FailureStrategy::Retry;

    let dispatcher = ScriptedDispatcher::new()
        .script("TASK-001", ScriptedOutcome::passed("a").with_file("src/a.rs"))
        .script("TASK-001-tester", tester_pass())
        .script(
            "TASK-001-reviewer",
            ScriptedOutcome::passed(passing_review().to_string()),
        )
        .script(
            "TASK-002-build-verify",
            ScriptedOutcome::passed("BUILD: OK\nMANIFEST: OK"),
        )
        .script(
            "TASK-002",
            ScriptedOutcome::passed("push successful\nroutes: demo.cfapps.io\napp started"),
        );

    let mut harness = TestHarness::new(CannedModel::new(), dispatcher);
    let mission = executing_mission(vec![coder_task(1), deployer]);
    harness.save(&mission).await;

    let done = harness.run(&mission).await;
    assert_eq!(done.status, MissionStatus::Completed);
    assert_eq!(done.task(&task_id(2)).unwrap().status, TaskStatus::Passed);

    // The deployer ran after the coder, in a wave of its own.
    let order = harness.dispatcher.executed();
    let coder_pos = order.iter().position(|id| id == &task_id(1)).unwrap();
    let deploy_pos = order.iter().position(|id| id == &task_id(2)).unwrap();
    assert!(coder_pos < deploy_pos);

    let events = harness.drain_events();
    let success = events
        .iter()
        .find(|e| e.event_type == EventType::DeployerSuccess)
        .expect("deployer.success event");
    assert_eq!(
        success.payload.get("url").map(String::as_str),
        Some("https://demo.cfapps.io")
    );
}

#[tokio::test]
async fn failed_build_verification_skips_deployer_and_fails_mission() {
    let deployer = Task::new(task_id(2), AgentRole::Deployer, "ship the app");

    let dispatcher = ScriptedDispatcher::new()
        .script("TASK-001", ScriptedOutcome::passed("a").with_file("src/a.rs"))
        .script("TASK-001-tester", tester_pass())
        .script(
            "TASK-001-reviewer",
            ScriptedOutcome::passed(passing_review().to_string()),
        )
        .script(
            "TASK-002-build-verify",
            ScriptedOutcome::passed("BUILD: FAIL\ncompile error in Main.x"),
        );

    let harness = TestHarness::new(CannedModel::new(), dispatcher);
    let mission = executing_mission(vec![coder_task(1), deployer]);
    harness.save(&mission).await;

    let failed = harness.run(&mission).await;
    assert_eq!(failed.status, MissionStatus::Failed);
    assert_eq!(failed.task(&task_id(2)).unwrap().status, TaskStatus::Skipped);
    assert!(failed.errors.iter().any(|e| e.contains("BUILD: FAIL")));

    // The deployer itself was never dispatched.
    assert!(!harness.dispatcher.executed().contains(&task_id(2)));
}

#[tokio::test]
async fn cancellation_fails_mission_at_stage_boundary() {
    let harness = TestHarness::new(CannedModel::new(), ScriptedDispatcher::new());
    let mission = executing_mission(vec![coder_task(1)]);
    harness.save(&mission).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let failed = harness.pipeline.run(mission.id, cancel).await.unwrap();
    assert_eq!(failed.status, MissionStatus::Failed);
    assert!(failed.errors.iter().any(|e| e.contains("cancelled")));
}

#[tokio::test]
async fn orphaned_tasks_reset_on_resume() {
    let dispatcher = ScriptedDispatcher::new()
        .script("TASK-001", ScriptedOutcome::passed("a").with_file("src/a.rs"))
        .script("TASK-001-tester", tester_pass())
        .script(
            "TASK-001-reviewer",
            ScriptedOutcome::passed(passing_review().to_string()),
        );

    let harness = TestHarness::new(CannedModel::new(), dispatcher);
    let mut mission = executing_mission(vec![coder_task(1)]);
    // Simulate a crash mid-dispatch.
    mission.tasks[0].status = TaskStatus::Executing;
    harness.save(&mission).await;

    let done = harness.run(&mission).await;
    assert_eq!(done.status, MissionStatus::Completed);
    assert_eq!(done.task(&task_id(1)).unwrap().status, TaskStatus::Passed);
}

#[tokio::test]
async fn retry_context_is_single_consumer() {
    let dispatcher = ScriptedDispatcher::new()
        .script("TASK-001", ScriptedOutcome::passed("a").with_file("src/a.rs"))
        .script("TASK-001-tester", tester_pass())
        .script(
            "TASK-001-reviewer",
            ScriptedOutcome::passed(passing_review().to_string()),
        );

    let harness = TestHarness::new(CannedModel::new(), dispatcher);
    let mut mission = executing_mission(vec![coder_task(1)]);
    mission.retry_context = Some("carry this into the next dispatch".to_owned());
    harness.save(&mission).await;

    let done = harness.run(&mission).await;
    assert_eq!(done.status, MissionStatus::Completed);
    // The next dispatch read it...
    let task = done.task(&task_id(1)).unwrap();
    assert!(task.input_context.contains("## Retry Context (from previous attempt)"));
    assert!(task.input_context.contains("carry this into the next dispatch"));
    // ...and it was cleared afterwards.
    assert!(done.retry_context.is_none());
}
