//! Mission and task data model.
//!
//! A mission is the unit of work for one user request; it owns its tasks,
//! dispatch results, test results, and review feedback by containment.
//! Persisted records serialize with camelCase field names and epoch-millis
//! timestamps.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Received,
    Uploading,
    Specifying,
    Clarifying,
    Planning,
    AwaitingApproval,
    Executing,
    Completed,
    Failed,
}

impl MissionStatus {
    /// Whether this status is terminal (no further stage runs).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check whether `from -> to` is an edge of the allowed transition graph.
    pub fn is_valid_transition(from: Self, to: Self) -> bool {
        matches!(
            (from, to),
            (Self::Received, Self::Uploading)
                | (Self::Uploading, Self::Specifying)
                | (Self::Specifying, Self::Clarifying)
                | (Self::Specifying, Self::Specifying)
                | (Self::Clarifying, Self::Specifying)
                | (Self::Specifying, Self::Planning)
                | (Self::Planning, Self::AwaitingApproval)
                | (Self::AwaitingApproval, Self::Executing)
                | (Self::Executing, Self::Executing)
                | (Self::Executing, Self::Completed)
                | (Self::Executing, Self::Failed)
        ) || (to == Self::Failed && !from.is_terminal())
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Uploading => "uploading",
            Self::Specifying => "specifying",
            Self::Clarifying => "clarifying",
            Self::Planning => "planning",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for MissionStatus {
    type Err = MissionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "uploading" => Ok(Self::Uploading),
            "specifying" => Ok(Self::Specifying),
            "clarifying" => Ok(Self::Clarifying),
            "planning" => Ok(Self::Planning),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(MissionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`MissionStatus`] string.
#[derive(Debug, Clone)]
pub struct MissionStatusParseError(pub String);

impl fmt::Display for MissionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid mission status: {:?}", self.0)
    }
}

impl std::error::Error for MissionStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a task within a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Executing,
    Verifying,
    Passed,
    Failed,
    Skipped,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "executing" => Ok(Self::Executing),
            "verifying" => Ok(Self::Verifying),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Behavioural specialisation of the worker invoked for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Researcher,
    Coder,
    Refactorer,
    Tester,
    Reviewer,
    Deployer,
}

impl AgentRole {
    /// Roles whose output is source code and therefore gate-checked.
    pub fn produces_code(self) -> bool {
        matches!(self, Self::Coder | Self::Refactorer)
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Researcher => "researcher",
            Self::Coder => "coder",
            Self::Refactorer => "refactorer",
            Self::Tester => "tester",
            Self::Reviewer => "reviewer",
            Self::Deployer => "deployer",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentRole {
    type Err = AgentRoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "researcher" => Ok(Self::Researcher),
            "coder" => Ok(Self::Coder),
            "refactorer" => Ok(Self::Refactorer),
            "tester" => Ok(Self::Tester),
            "reviewer" => Ok(Self::Reviewer),
            "deployer" => Ok(Self::Deployer),
            other => Err(AgentRoleParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentRole`] string.
#[derive(Debug, Clone)]
pub struct AgentRoleParseError(pub String);

impl fmt::Display for AgentRoleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent role: {:?}", self.0)
    }
}

impl std::error::Error for AgentRoleParseError {}

// ---------------------------------------------------------------------------

/// What to do when a task's quality gate is denied or the task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    Retry,
    Skip,
    Escalate,
    Replan,
}

impl fmt::Display for FailureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Retry => "retry",
            Self::Skip => "skip",
            Self::Escalate => "escalate",
            Self::Replan => "replan",
        };
        f.write_str(s)
    }
}

impl FromStr for FailureStrategy {
    type Err = FailureStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry" => Ok(Self::Retry),
            "skip" => Ok(Self::Skip),
            "escalate" => Ok(Self::Escalate),
            "replan" => Ok(Self::Replan),
            other => Err(FailureStrategyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`FailureStrategy`] string.
#[derive(Debug, Clone)]
pub struct FailureStrategyParseError(pub String);

impl fmt::Display for FailureStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid failure strategy: {:?}", self.0)
    }
}

impl std::error::Error for FailureStrategyParseError {}

// ---------------------------------------------------------------------------

/// How waves are scheduled: one task at a time, or file-disjoint batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    Sequential,
    Parallel,
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStrategy {
    type Err = ExecutionStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sequential" => Ok(Self::Sequential),
            "parallel" => Ok(Self::Parallel),
            other => Err(ExecutionStrategyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionStrategy`] string.
#[derive(Debug, Clone)]
pub struct ExecutionStrategyParseError(pub String);

impl fmt::Display for ExecutionStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution strategy: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionStrategyParseError {}

// ---------------------------------------------------------------------------

/// Planning-strategy hint emitted by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningStrategy {
    Sequential,
    Parallel,
    Adaptive,
}

impl fmt::Display for PlanningStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Adaptive => "adaptive",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// Category assigned to the user's request by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestCategory {
    Feature,
    BugFix,
    Refactor,
    Documentation,
    Infrastructure,
    Deployment,
}

impl fmt::Display for RequestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Feature => "feature",
            Self::BugFix => "bug_fix",
            Self::Refactor => "refactor",
            Self::Documentation => "documentation",
            Self::Infrastructure => "infrastructure",
            Self::Deployment => "deployment",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// How much deliberation the worker's model is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl fmt::Display for ReasoningLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for ReasoningLevel {
    type Err = ReasoningLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(ReasoningLevelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ReasoningLevel`] string.
#[derive(Debug, Clone)]
pub struct ReasoningLevelParseError(pub String);

impl fmt::Display for ReasoningLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid reasoning level: {:?}", self.0)
    }
}

impl std::error::Error for ReasoningLevelParseError {}

// ---------------------------------------------------------------------------

/// What happened to a file, per `diff --stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileAction {
    Created,
    Modified,
    Deleted,
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One changed file observed after a task ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub path: String,
    pub action: FileAction,
    pub lines_changed: u64,
}

/// Classifier output for a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub category: RequestCategory,
    /// 1 (trivial) to 5 (cross-cutting).
    pub complexity: u8,
    pub affected_components: Vec<String>,
    pub planning_strategy: PlanningStrategy,
    pub runtime_tag: Option<String>,
}

/// Product specification generated before planning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSpec {
    pub title: String,
    pub overview: String,
    pub goals: Vec<String>,
    pub non_goals: Vec<String>,
    pub technical_requirements: Vec<String>,
    pub edge_cases: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub components: Vec<String>,
}

/// A task -- the unit of work dispatched to a single worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Stable id of the form `TASK-NNN`, assigned in creation order.
    pub id: String,
    pub role: AgentRole,
    pub description: String,
    pub input_context: String,
    pub success_criteria: String,
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    pub iteration: u32,
    pub max_iterations: u32,
    pub failure_strategy: FailureStrategy,
    /// Advisory file ownership, populated by the planner.
    pub target_files: Vec<String>,
    /// Observed file changes after execution.
    pub files_affected: Vec<FileChange>,
    pub elapsed_ms: u64,
}

impl Task {
    /// Create a pending task with the default iteration cap.
    pub fn new(id: impl Into<String>, role: AgentRole, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            description: description.into(),
            input_context: String::new(),
            success_criteria: String::new(),
            depends_on: Vec::new(),
            status: TaskStatus::Pending,
            iteration: 0,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            failure_strategy: FailureStrategy::Retry,
            target_files: Vec::new(),
            files_affected: Vec::new(),
            elapsed_ms: 0,
        }
    }
}

/// Default per-task retry cap.
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// Build the stable string form of a task id: `TASK-NNN`, 1-based,
/// zero-padded to width 3 so lexicographic order equals creation order.
pub fn task_id(n: usize) -> String {
    format!("TASK-{n:03}")
}

/// Result of dispatching one task in one wave attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveDispatchResult {
    pub task_id: String,
    pub wave: u32,
    pub status: TaskStatus,
    pub files_affected: Vec<FileChange>,
    pub output: String,
    pub elapsed_ms: u64,
}

/// Parsed output of a tester worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub task_id: String,
    pub passed: bool,
    pub total_tests: u32,
    pub failed_tests: u32,
    pub output: String,
    pub elapsed_ms: u64,
}

/// Parsed output of a reviewer worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewFeedback {
    pub task_id: String,
    pub approved: bool,
    pub summary: String,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    /// 0..=10.
    pub score: u8,
}

/// A container observed during dispatch. Containers are owned by the
/// dispatcher; this is a reference for reporting and metrics only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerInfo {
    pub container_id: String,
    pub task_id: String,
    pub provider: String,
    pub started_at_ms: i64,
    pub completed_at_ms: Option<i64>,
}

/// Aggregates computed at convergence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionMetrics {
    pub total_duration_ms: i64,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub total_iterations: u32,
    pub files_created: u32,
    pub files_modified: u32,
    pub tests_run: u32,
    pub tests_passed: u32,
    pub waves_executed: u32,
    pub aggregate_task_elapsed_ms: u64,
}

// ---------------------------------------------------------------------------
// Mission
// ---------------------------------------------------------------------------

/// One user request and the execution state required to fulfil it.
///
/// Immutable by convention: only the pipeline driver mutates a mission, by
/// applying [`crate::delta::MissionDelta`] values returned from stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mission {
    pub id: Uuid,
    pub request: String,
    pub status: MissionStatus,
    pub classification: Option<Classification>,
    pub spec: Option<ProductSpec>,
    pub clarifying_questions: Vec<String>,
    pub clarification_answers: BTreeMap<String, String>,
    pub project_context: Option<String>,
    pub tasks: Vec<Task>,
    pub current_wave: u32,
    pub completed_task_ids: BTreeSet<String>,
    /// Single-consumer diagnostic for the next dispatch; cleared on read.
    pub retry_context: Option<String>,
    pub errors: Vec<String>,
    pub dispatch_results: Vec<WaveDispatchResult>,
    pub containers: Vec<ContainerInfo>,
    pub test_results: Vec<TestResult>,
    pub review_feedback: Vec<ReviewFeedback>,
    pub strategy: ExecutionStrategy,
    pub project_path: Option<String>,
    pub git_remote_url: Option<String>,
    pub runtime_tag: Option<String>,
    pub reasoning_level: ReasoningLevel,
    pub metrics: Option<MissionMetrics>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Mission {
    /// Create a mission in the `received` state.
    pub fn new(request: impl Into<String>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: Uuid::new_v4(),
            request: request.into(),
            status: MissionStatus::Received,
            classification: None,
            spec: None,
            clarifying_questions: Vec::new(),
            clarification_answers: BTreeMap::new(),
            project_context: None,
            tasks: Vec::new(),
            current_wave: 0,
            completed_task_ids: BTreeSet::new(),
            retry_context: None,
            errors: Vec::new(),
            dispatch_results: Vec::new(),
            containers: Vec::new(),
            test_results: Vec::new(),
            review_feedback: Vec::new(),
            strategy: ExecutionStrategy::Parallel,
            project_path: None,
            git_remote_url: None,
            runtime_tag: None,
            reasoning_level: ReasoningLevel::default(),
            metrics: None,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }

    /// Look up a task by id.
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Look up a task mutably by id.
    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Whether any task produces code (coder or refactorer).
    pub fn has_implementation_task(&self) -> bool {
        self.tasks.iter().any(|t| t.role.produces_code())
    }

    /// Dispatch results recorded for a given wave.
    pub fn wave_results(&self, wave: u32) -> Vec<&WaveDispatchResult> {
        self.dispatch_results.iter().filter(|r| r.wave == wave).collect()
    }

    /// Latest test result recorded for a task, if any.
    pub fn latest_test_result(&self, task_id: &str) -> Option<&TestResult> {
        self.test_results.iter().rev().find(|r| r.task_id == task_id)
    }

    /// Latest review feedback recorded for a task, if any.
    pub fn latest_review(&self, task_id: &str) -> Option<&ReviewFeedback> {
        self.review_feedback.iter().rev().find(|r| r.task_id == task_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
