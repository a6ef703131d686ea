//! Remote task-runner provider.
//!
//! Work is exchanged through git branches: the task branch is already on
//! the remote when `execute` is called, the runner command launches a
//! container on the task platform, and the worker pushes its result back
//! to the same branch. After the runner returns, the branch is fetched
//! into a scratch clone and diffed against the base branch to observe the
//! changed files.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio::sync::Mutex;

use worldmind_store::models::{ContainerInfo, FileChange, TaskStatus};

use crate::git::{parse_diff_stat, task_branch};

use super::{DispatchOutcome, DispatchRequest, Dispatcher};

/// Configuration for the remote task-runner provider.
#[derive(Debug, Clone)]
pub struct RemoteRunnerConfig {
    /// Program that submits a task run and blocks until it finishes.
    pub runner_command: String,
    /// Argument template. `{task_id}`, `{branch}`, `{remote}`, `{role}`,
    /// `{reasoning}`, and `{runtime}` are substituted per task.
    pub runner_args: Vec<String>,
    /// Base branch the task branches are diffed against.
    pub base_branch: String,
    /// Directory for the scratch clone used to observe results.
    pub scratch_dir: PathBuf,
}

/// Dispatcher that delegates execution to a remote task platform.
#[derive(Debug)]
pub struct RemoteTaskDispatcher {
    config: RemoteRunnerConfig,
    /// Serialises scratch-clone operations.
    scratch_lock: Mutex<()>,
}

impl RemoteTaskDispatcher {
    pub fn new(config: RemoteRunnerConfig) -> Self {
        Self {
            config,
            scratch_lock: Mutex::new(()),
        }
    }

    fn substitute(template: &str, request: &DispatchRequest, branch: &str) -> String {
        template
            .replace("{task_id}", &request.task.id)
            .replace("{branch}", branch)
            .replace("{remote}", request.git_remote_url.as_deref().unwrap_or(""))
            .replace("{role}", &request.task.role.to_string())
            .replace("{reasoning}", &request.reasoning_level.to_string())
            .replace("{runtime}", request.runtime_tag.as_deref().unwrap_or(""))
    }

    async fn git(dir: &Path, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .with_context(|| format!("failed to run git {}", args.join(" ")))
    }

    /// Fetch the task branch into the scratch clone and diff it against
    /// the base branch.
    async fn observe_changes(&self, remote: &str, branch: &str) -> Result<Vec<FileChange>> {
        let _guard = self.scratch_lock.lock().await;

        let scratch = &self.config.scratch_dir;
        if !scratch.join(".git").exists() {
            let parent = scratch.parent().unwrap_or(Path::new("."));
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
            let dest = scratch.to_string_lossy().into_owned();
            let clone = Self::git(parent, &["clone", "--bare", remote, &dest]).await?;
            if !clone.status.success() {
                bail!(
                    "git clone failed: {}",
                    String::from_utf8_lossy(&clone.stderr)
                );
            }
        }

        let refspec = "+refs/heads/*:refs/heads/*";
        let fetch = Self::git(scratch, &["fetch", remote, refspec]).await?;
        if !fetch.status.success() {
            bail!(
                "git fetch failed: {}",
                String::from_utf8_lossy(&fetch.stderr)
            );
        }

        let range = format!("{}...{branch}", self.config.base_branch);
        let diff = Self::git(scratch, &["diff", "--stat", "--summary", &range]).await?;
        if !diff.status.success() {
            bail!(
                "git diff failed: {}",
                String::from_utf8_lossy(&diff.stderr)
            );
        }

        Ok(parse_diff_stat(&String::from_utf8_lossy(&diff.stdout)))
    }
}

#[async_trait]
impl Dispatcher for RemoteTaskDispatcher {
    fn name(&self) -> &str {
        "remote-runner"
    }

    async fn execute(&self, request: DispatchRequest) -> Result<DispatchOutcome> {
        if request.git_remote_url.is_none() {
            bail!("remote dispatch requires a git remote");
        }

        let mut task = request.task.clone();
        let branch = task_branch(&task.id);
        let started = std::time::Instant::now();
        let started_at_ms = Utc::now().timestamp_millis();

        let args: Vec<String> = self
            .config
            .runner_args
            .iter()
            .map(|a| Self::substitute(a, &request, &branch))
            .collect();

        tracing::info!(
            task_id = %task.id,
            runner = %self.config.runner_command,
            branch = %branch,
            "submitting task to remote runner"
        );

        let run = Command::new(&self.config.runner_command)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.config.runner_command))?;

        let mut output = String::from_utf8_lossy(&run.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&run.stderr));

        let remote = request.git_remote_url.as_deref().unwrap_or_default();
        if run.status.success() {
            match self.observe_changes(remote, &branch).await {
                Ok(changes) => task.files_affected = changes,
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "failed to observe remote changes");
                }
            }
        }

        task.status = if run.status.success() {
            TaskStatus::Passed
        } else {
            TaskStatus::Failed
        };
        task.elapsed_ms = started.elapsed().as_millis() as u64;

        Ok(DispatchOutcome {
            container: ContainerInfo {
                container_id: format!("remote:{branch}"),
                task_id: task.id.clone(),
                provider: self.name().to_owned(),
                started_at_ms,
                completed_at_ms: Some(Utc::now().timestamp_millis()),
            },
            task,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldmind_store::models::{AgentRole, ReasoningLevel, Task};

    fn request() -> DispatchRequest {
        DispatchRequest {
            task: Task::new("TASK-003", AgentRole::Coder, "do it"),
            project_context: None,
            project_path: PathBuf::from("/tmp/unused"),
            git_remote_url: Some("git@example.com:org/repo.git".into()),
            runtime_tag: Some("jvm21".into()),
            reasoning_level: ReasoningLevel::High,
        }
    }

    #[test]
    fn substitution_fills_all_placeholders() {
        let req = request();
        let branch = task_branch(&req.task.id);
        let rendered = RemoteTaskDispatcher::substitute(
            "run --task {task_id} --branch {branch} --remote {remote} --role {role} --reasoning {reasoning} --runtime {runtime}",
            &req,
            &branch,
        );
        assert_eq!(
            rendered,
            "run --task TASK-003 --branch worldmind/TASK-003 --remote git@example.com:org/repo.git --role coder --reasoning high --runtime jvm21"
        );
    }

    #[tokio::test]
    async fn remote_without_git_remote_is_an_error() {
        let dispatcher = RemoteTaskDispatcher::new(RemoteRunnerConfig {
            runner_command: "true".into(),
            runner_args: vec![],
            base_branch: "main".into(),
            scratch_dir: PathBuf::from("/tmp/worldmind-scratch"),
        });
        let mut req = request();
        req.git_remote_url = None;
        assert!(dispatcher.execute(req).await.is_err());
    }
}
