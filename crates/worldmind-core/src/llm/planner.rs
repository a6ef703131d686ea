//! Mission planning.
//!
//! The planner call produces an ordered list of task plans plus a strategy
//! recommendation. Three deterministic post-processors then turn plans
//! into tasks: id assignment, implementation-task insertion, and
//! type-based dependency assignment. The planner's own dependency ideas
//! are discarded; only the type rules decide the DAG.

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use worldmind_store::models::{
    AgentRole, Classification, ExecutionStrategy, FailureStrategy, ProductSpec, RequestCategory,
    Task, task_id,
};

use super::{LanguageModel, ToolSpec, call_typed_with_tools};

/// One planned unit of work, before it becomes a task.
#[derive(Debug, Clone)]
pub struct TaskPlan {
    pub role: AgentRole,
    pub description: String,
    pub input_context: String,
    pub success_criteria: String,
    pub target_files: Vec<String>,
}

/// Planner output: ordered plans plus a strategy recommendation.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plans: Vec<TaskPlan>,
    pub strategy: ExecutionStrategy,
}

const SYSTEM_PROMPT: &str = "\
You decompose an engineering request into an ordered list of worker tasks. \
Available roles: researcher (reads code, writes findings), coder (writes \
code), refactorer (restructures code), tester (runs and writes tests), \
reviewer (judges code quality), deployer (ships artefacts). Prefer few, \
narrow tasks. Give every code-producing task the specific files it should \
touch, as repo-relative paths; two tasks that would touch the same file \
cannot run in parallel. Write descriptions the worker can act on without \
seeing this conversation. Recommend sequential execution only when tasks \
are so entangled that parallelism would thrash.";

fn result_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["tasks"],
        "properties": {
            "tasks": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["role", "description"],
                    "properties": {
                        "role": { "type": "string", "enum": [
                            "researcher", "coder", "refactorer",
                            "tester", "reviewer", "deployer"
                        ]},
                        "description": { "type": "string" },
                        "inputContext": { "type": "string" },
                        "successCriteria": { "type": "string" },
                        "targetFiles": { "type": "array", "items": { "type": "string" } }
                    }
                }
            },
            "strategy": { "type": "string", "enum": ["sequential", "parallel"] }
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskPlanWire {
    role: String,
    description: String,
    #[serde(default)]
    input_context: Option<String>,
    #[serde(default)]
    success_criteria: Option<String>,
    #[serde(default)]
    target_files: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct PlanWire {
    tasks: Vec<TaskPlanWire>,
    #[serde(default)]
    strategy: Option<String>,
}

/// Run the planner call.
pub async fn plan_mission(
    model: &dyn LanguageModel,
    request: &str,
    classification: &Classification,
    project_context: Option<&str>,
    spec: Option<&ProductSpec>,
) -> Result<PlanOutcome> {
    let mut user_prompt = format!(
        "Request: {request}\n\nCategory: {} (complexity {}), suggested strategy: {}\n",
        classification.category, classification.complexity, classification.planning_strategy,
    );
    if let Some(spec) = spec {
        user_prompt.push_str(&format!("\nSpecification: {}\n{}\n", spec.title, spec.overview));
        for criterion in &spec.acceptance_criteria {
            user_prompt.push_str(&format!("- must: {criterion}\n"));
        }
    }
    if let Some(ctx) = project_context {
        user_prompt.push_str("\nProject context:\n");
        user_prompt.push_str(ctx);
        user_prompt.push('\n');
    }

    let wire: PlanWire = call_typed_with_tools(
        model,
        SYSTEM_PROMPT,
        &user_prompt,
        &result_schema(),
        &exploration_tools(),
    )
    .await
    .context("planner call failed")?;

    let mut plans = Vec::with_capacity(wire.tasks.len());
    for task in wire.tasks {
        plans.push(TaskPlan {
            role: parse_role(&task.role)?,
            description: task.description,
            input_context: task.input_context.unwrap_or_default(),
            success_criteria: task.success_criteria.unwrap_or_default(),
            target_files: task.target_files.unwrap_or_default(),
        });
    }

    let strategy = match wire.strategy.as_deref() {
        Some("sequential") => ExecutionStrategy::Sequential,
        Some("parallel") | None => ExecutionStrategy::Parallel,
        Some(other) => bail!("planner returned unknown strategy {other:?}"),
    };

    Ok(PlanOutcome { plans, strategy })
}

fn parse_role(s: &str) -> Result<AgentRole> {
    s.parse()
        .map_err(|e| anyhow::anyhow!("planner returned unknown role: {e}"))
}

/// Tools the planner may use to look at the codebase before decomposing.
/// Tool execution lives with the model provider.
fn exploration_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "list_files".to_owned(),
            description: "List files under a repo-relative directory".to_owned(),
            input_schema: serde_json::json!({
                "type": "object",
                "required": ["path"],
                "properties": { "path": { "type": "string" } }
            }),
        },
        ToolSpec {
            name: "read_file".to_owned(),
            description: "Read a repo-relative file".to_owned(),
            input_schema: serde_json::json!({
                "type": "object",
                "required": ["path"],
                "properties": { "path": { "type": "string" } }
            }),
        },
    ]
}

// ---------------------------------------------------------------------------
// Post-processors
// ---------------------------------------------------------------------------

/// Run the three post-processors in their required order, plus the optional
/// deployment append, and return the final task list.
pub fn build_tasks(plans: &[TaskPlan], request: &str, classification: &Classification) -> Vec<Task> {
    let mut tasks = plans_to_tasks(plans);
    ensure_implementation_task(&mut tasks, request);
    assign_type_dependencies(&mut tasks);
    if classification.category == RequestCategory::Deployment {
        append_deployment_task(&mut tasks);
    }
    tasks
}

/// Post-processor 1: assign sequential zero-padded ids and copy fields.
pub fn plans_to_tasks(plans: &[TaskPlan]) -> Vec<Task> {
    plans
        .iter()
        .enumerate()
        .map(|(i, plan)| {
            let mut task = Task::new(task_id(i + 1), plan.role, plan.description.clone());
            task.input_context = plan.input_context.clone();
            task.success_criteria = plan.success_criteria.clone();
            task.target_files = plan.target_files.clone();
            task.failure_strategy = FailureStrategy::Retry;
            task
        })
        .collect()
}

/// Post-processor 2: guarantee a code-producing task exists.
///
/// When no coder or refactorer is planned, a default coder is inserted
/// before a trailing reviewer (if present, so the reviewer still reviews
/// it) or appended at the end. Its id continues the sequence regardless of
/// position.
pub fn ensure_implementation_task(tasks: &mut Vec<Task>, request: &str) {
    if tasks.iter().any(|t| t.role.produces_code()) {
        return;
    }

    let mut task = Task::new(
        task_id(tasks.len() + 1),
        AgentRole::Coder,
        format!("Implement the requested changes: {request}"),
    );
    task.failure_strategy = FailureStrategy::Retry;

    let position = match tasks.last() {
        Some(last) if last.role == AgentRole::Reviewer => tasks.len() - 1,
        _ => tasks.len(),
    };
    tasks.insert(position, task);
}

/// Post-processor 3: recompute dependencies from role types.
///
/// The planner's dependency list is discarded. Coders and refactorers
/// depend on every preceding researcher; testers and reviewers depend on
/// every preceding coder or refactorer; everything else has no
/// dependencies. "Preceding" is list order, so the DAG edges always point
/// backwards.
pub fn assign_type_dependencies(tasks: &mut [Task]) {
    let snapshot: Vec<(String, AgentRole)> =
        tasks.iter().map(|t| (t.id.clone(), t.role)).collect();

    for (index, task) in tasks.iter_mut().enumerate() {
        let preceding = &snapshot[..index];
        task.depends_on = match task.role {
            AgentRole::Coder | AgentRole::Refactorer => preceding
                .iter()
                .filter(|(_, role)| *role == AgentRole::Researcher)
                .map(|(id, _)| id.clone())
                .collect(),
            AgentRole::Tester | AgentRole::Reviewer => preceding
                .iter()
                .filter(|(_, role)| role.produces_code())
                .map(|(id, _)| id.clone())
                .collect(),
            AgentRole::Researcher | AgentRole::Deployer => Vec::new(),
        };
    }
}

/// Optional append: a deployment-config coder gated on every implementation
/// task, skipped (not escalated) when it fails.
pub fn append_deployment_task(tasks: &mut Vec<Task>) {
    let implementation_ids: Vec<String> = tasks
        .iter()
        .filter(|t| t.role.produces_code())
        .map(|t| t.id.clone())
        .collect();

    let mut task = Task::new(
        task_id(tasks.len() + 1),
        AgentRole::Coder,
        "Produce the deployment configuration for the delivered changes",
    );
    task.depends_on = implementation_ids;
    task.target_files = vec!["manifest.yml".into(), "Dockerfile".into()];
    task.failure_strategy = FailureStrategy::Skip;
    tasks.push(task);
}
