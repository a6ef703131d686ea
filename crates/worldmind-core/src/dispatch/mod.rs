//! The dispatcher interface.
//!
//! A dispatcher runs one task to completion in an isolated environment and
//! returns the observed outcome. It is blocking from the orchestrator's
//! viewpoint: `execute` returns only once the task completed, failed, or
//! exceeded its timeout. Concrete providers run local containers with
//! bind-mounted workdirs or remote task-runner containers that exchange
//! work via git branches; callers treat both identically.

pub mod local;
pub mod remote;

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use worldmind_store::models::{ContainerInfo, ReasoningLevel, Task};

/// Everything a provider needs to run one task.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub task: Task,
    /// Project context gathered during the upload-context stage.
    pub project_context: Option<String>,
    /// Effective working directory: the task worktree if one was acquired,
    /// else the mission's project path.
    pub project_path: PathBuf,
    pub git_remote_url: Option<String>,
    pub runtime_tag: Option<String>,
    pub reasoning_level: ReasoningLevel,
}

/// What came back from running one task.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// The task with its observed status, files-affected, and elapsed time.
    pub task: Task,
    pub container: ContainerInfo,
    /// Raw agent output.
    pub output: String,
}

/// Runs one task to completion in an isolated environment.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Provider name for container records and logs.
    fn name(&self) -> &str;

    /// Run the task and return its outcome. Worker-reported failure is a
    /// normal return with a failed task status; only infrastructure
    /// problems surface as errors.
    async fn execute(&self, request: DispatchRequest) -> Result<DispatchOutcome>;
}

// Compile-time assertion: Dispatcher must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Dispatcher) {}
};

/// Render the brief a worker receives: description, success criteria, and
/// accumulated input context.
pub fn render_task_brief(task: &Task) -> String {
    let mut brief = String::with_capacity(256);
    brief.push_str(&format!("# {} ({})\n\n", task.id, task.role));
    brief.push_str(&task.description);
    brief.push('\n');
    if !task.success_criteria.is_empty() {
        brief.push_str("\n## Success Criteria\n\n");
        brief.push_str(&task.success_criteria);
        brief.push('\n');
    }
    if !task.input_context.is_empty() {
        brief.push_str("\n## Context\n\n");
        brief.push_str(&task.input_context);
        brief.push('\n');
    }
    brief
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldmind_store::models::AgentRole;

    #[test]
    fn brief_contains_all_sections() {
        let mut task = Task::new("TASK-001", AgentRole::Coder, "Add the endpoint");
        task.success_criteria = "GET /health returns ok".into();
        task.input_context = "The server lives in src/server.rs".into();

        let brief = render_task_brief(&task);
        assert!(brief.contains("TASK-001"));
        assert!(brief.contains("coder"));
        assert!(brief.contains("Add the endpoint"));
        assert!(brief.contains("## Success Criteria"));
        assert!(brief.contains("## Context"));
    }

    #[test]
    fn brief_omits_empty_sections() {
        let task = Task::new("TASK-002", AgentRole::Researcher, "Survey the code");
        let brief = render_task_brief(&task);
        assert!(!brief.contains("## Success Criteria"));
        assert!(!brief.contains("## Context"));
    }
}
