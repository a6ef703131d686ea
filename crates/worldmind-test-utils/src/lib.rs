//! Shared fixtures for worldmind tests: a scripted dispatcher, a canned
//! language model, and git repository fixtures.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use worldmind_core::dispatch::{DispatchOutcome, DispatchRequest, Dispatcher};
use worldmind_core::llm::{LanguageModel, ToolSpec};
use worldmind_store::models::{ContainerInfo, FileAction, FileChange, TaskStatus};

// ---------------------------------------------------------------------------
// Git fixtures
// ---------------------------------------------------------------------------

/// Create a temporary git repository with an initial commit on `main`.
/// The `TempDir` must be held alive by the caller.
pub fn create_temp_git_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().to_path_buf();

    run_git(&repo_path, &["init", "-b", "main"]);
    run_git(&repo_path, &["config", "user.email", "test@worldmind.dev"]);
    run_git(&repo_path, &["config", "user.name", "Worldmind Test"]);
    std::fs::write(repo_path.join("README.md"), "# Test repo\n").expect("failed to write README");
    run_git(&repo_path, &["add", "."]);
    run_git(&repo_path, &["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

/// Create a bare remote seeded with an initial commit, plus a working
/// clone. Returns `(tempdir, clone_path, remote_url)`.
pub fn create_repo_with_remote() -> (TempDir, PathBuf, String) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let remote_path = dir.path().join("remote.git");
    let seed_path = dir.path().join("seed");
    let clone_path = dir.path().join("clone");

    run_git(dir.path(), &["init", "--bare", "-b", "main", "remote.git"]);

    std::fs::create_dir_all(&seed_path).expect("failed to create seed dir");
    run_git(&seed_path, &["init", "-b", "main"]);
    run_git(&seed_path, &["config", "user.email", "test@worldmind.dev"]);
    run_git(&seed_path, &["config", "user.name", "Worldmind Test"]);
    std::fs::write(seed_path.join("README.md"), "# Seed\n").expect("failed to write README");
    run_git(&seed_path, &["add", "."]);
    run_git(&seed_path, &["commit", "-m", "Initial commit"]);
    let remote_url = remote_path.to_string_lossy().into_owned();
    run_git(&seed_path, &["remote", "add", "origin", &remote_url]);
    run_git(&seed_path, &["push", "origin", "main"]);

    let clone_str = clone_path.to_string_lossy().into_owned();
    run_git(dir.path(), &["clone", &remote_url, &clone_str]);
    run_git(&clone_path, &["config", "user.email", "test@worldmind.dev"]);
    run_git(&clone_path, &["config", "user.name", "Worldmind Test"]);

    (dir, clone_path, remote_url)
}

/// Run a git command in `dir`, panicking on failure.
pub fn run_git(dir: &std::path::Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {}: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Commit a file on a branch of a clone and push it to `origin`.
pub fn push_branch_with_file(clone: &std::path::Path, branch: &str, file: &str, contents: &str) {
    run_git(clone, &["checkout", "-B", branch, "main"]);
    if let Some(parent) = std::path::Path::new(file).parent() {
        std::fs::create_dir_all(clone.join(parent)).expect("failed to create parent dir");
    }
    std::fs::write(clone.join(file), contents).expect("failed to write file");
    run_git(clone, &["add", "."]);
    run_git(clone, &["commit", "-m", &format!("add {file}")]);
    run_git(clone, &["push", "-f", "origin", branch]);
    run_git(clone, &["checkout", "main"]);
}

// ---------------------------------------------------------------------------
// Scripted dispatcher
// ---------------------------------------------------------------------------

/// One scripted response for a task id.
#[derive(Debug, Clone)]
pub struct ScriptedOutcome {
    pub status: TaskStatus,
    pub output: String,
    pub files: Vec<FileChange>,
    /// When set, `execute` fails with this message (infrastructure error).
    pub error: Option<String>,
}

impl ScriptedOutcome {
    pub fn passed(output: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Passed,
            output: output.into(),
            files: Vec::new(),
            error: None,
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            output: output.into(),
            files: Vec::new(),
            error: None,
        }
    }

    pub fn infrastructure_error(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            output: String::new(),
            files: Vec::new(),
            error: Some(message.into()),
        }
    }

    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.files.push(FileChange {
            path: path.into(),
            action: FileAction::Created,
            lines_changed: 10,
        });
        self
    }
}

/// Dispatcher that replays scripted outcomes per task id.
///
/// Outcomes queue per id and pop in order, so a task can fail on its first
/// attempt and pass on its retry. Ids without a script use the default
/// outcome. Every executed task id is recorded for assertions.
#[derive(Debug)]
pub struct ScriptedDispatcher {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    default_outcome: ScriptedOutcome,
    calls: Mutex<Vec<String>>,
}

impl ScriptedDispatcher {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default_outcome: ScriptedOutcome::passed("done").with_file("src/generated.rs"),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default(mut self, outcome: ScriptedOutcome) -> Self {
        self.default_outcome = outcome;
        self
    }

    /// Queue an outcome for a task id. Repeated calls for the same id
    /// queue further attempts.
    pub fn script(self, task_id: impl Into<String>, outcome: ScriptedOutcome) -> Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .entry(task_id.into())
            .or_default()
            .push_back(outcome);
        self
    }

    /// Task ids in execution order.
    pub fn executed(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }
}

impl Default for ScriptedDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, request: DispatchRequest) -> Result<DispatchOutcome> {
        let mut task = request.task;
        self.calls.lock().expect("calls lock").push(task.id.clone());

        let outcome = {
            let mut scripts = self.scripts.lock().expect("scripts lock");
            scripts
                .get_mut(&task.id)
                .and_then(|queue| queue.pop_front())
                .unwrap_or_else(|| self.default_outcome.clone())
        };

        if let Some(message) = outcome.error {
            anyhow::bail!("{message}");
        }

        task.status = outcome.status;
        task.files_affected = outcome.files;
        task.elapsed_ms = 10;

        let now = Utc::now().timestamp_millis();
        Ok(DispatchOutcome {
            container: ContainerInfo {
                container_id: format!("scripted-{}", task.id),
                task_id: task.id.clone(),
                provider: "scripted".into(),
                started_at_ms: now - 10,
                completed_at_ms: Some(now),
            },
            task,
            output: outcome.output,
        })
    }
}

// ---------------------------------------------------------------------------
// Canned language model
// ---------------------------------------------------------------------------

/// Language model that pops canned JSON responses in FIFO order. When the
/// queue is empty it returns the fallback value (an empty object unless
/// overridden).
#[derive(Debug)]
pub struct CannedModel {
    responses: Mutex<VecDeque<serde_json::Value>>,
    fallback: serde_json::Value,
}

impl CannedModel {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            fallback: serde_json::json!({}),
        }
    }

    pub fn respond(self, value: serde_json::Value) -> Self {
        self.responses.lock().expect("responses lock").push_back(value);
        self
    }

    pub fn with_fallback(mut self, value: serde_json::Value) -> Self {
        self.fallback = value;
        self
    }
}

impl Default for CannedModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for CannedModel {
    async fn structured_call(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _result_schema: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let popped = self.responses.lock().expect("responses lock").pop_front();
        Ok(popped.unwrap_or_else(|| self.fallback.clone()))
    }

    async fn structured_call_with_tools(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        result_schema: &serde_json::Value,
        _tools: &[ToolSpec],
    ) -> Result<serde_json::Value> {
        self.structured_call(system_prompt, user_prompt, result_schema).await
    }
}

/// Canned classifier + clarifier + spec + plan responses that walk a
/// mission straight to `awaiting_approval` with the given task plans.
pub fn planning_model(plans: serde_json::Value) -> CannedModel {
    CannedModel::new()
        .respond(serde_json::json!({
            "category": "feature",
            "complexity": 2,
            "affectedComponents": ["core"],
            "planningStrategy": "parallel"
        }))
        .respond(serde_json::json!({ "questions": [] }))
        .respond(serde_json::json!({
            "title": "Test mission",
            "overview": "Generated by fixtures.",
            "goals": [], "nonGoals": [], "technicalRequirements": [],
            "edgeCases": [], "acceptanceCriteria": [], "components": []
        }))
        .respond(plans)
        .with_fallback(serde_json::json!({ "summary": "done" }))
}
