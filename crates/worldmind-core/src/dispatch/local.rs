//! Local container provider.
//!
//! Runs the worker image with the task workdir bind-mounted at
//! `/workspace`. The task brief is written under the reserved internal
//! directory before the container starts, so the brief itself never counts
//! as code output. Output is collected from the container log after the
//! container exits.

use std::path::Path;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;

use worldmind_store::models::{ContainerInfo, TaskStatus};

use crate::git::parse_diff_stat;

use super::{DispatchOutcome, DispatchRequest, Dispatcher, render_task_brief};

/// Configuration for the local container provider.
#[derive(Debug, Clone)]
pub struct LocalContainerConfig {
    /// Worker image, e.g. `worldmind-worker:latest`.
    pub image: String,
    /// Extra flags passed to `docker create`.
    pub extra_flags: Vec<String>,
}

/// Dispatcher that runs each task in a local container with a bind-mounted
/// workdir.
#[derive(Debug)]
pub struct LocalContainerDispatcher {
    config: LocalContainerConfig,
}

impl LocalContainerDispatcher {
    pub fn new(config: LocalContainerConfig) -> Self {
        Self { config }
    }

    /// Container names accept only alphanumerics and hyphens.
    fn container_name(task_id: &str) -> String {
        let sanitized: String = task_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        format!("worldmind-{}", sanitized.to_lowercase())
    }

    async fn docker(args: &[&str]) -> Result<std::process::Output> {
        Command::new("docker")
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to run docker {}", args.join(" ")))
    }

    /// Stage the working tree and diff it against HEAD so created files
    /// appear in the stat output.
    async fn collect_changes(workdir: &Path) -> Result<String> {
        let add = Command::new("git")
            .args(["add", "-A"])
            .current_dir(workdir)
            .output()
            .await
            .context("failed to run git add -A")?;
        if !add.status.success() {
            bail!(
                "git add -A failed: {}",
                String::from_utf8_lossy(&add.stderr)
            );
        }

        let diff = Command::new("git")
            .args(["diff", "--cached", "--stat", "--summary"])
            .current_dir(workdir)
            .output()
            .await
            .context("failed to run git diff --stat")?;
        if !diff.status.success() {
            bail!(
                "git diff --stat failed: {}",
                String::from_utf8_lossy(&diff.stderr)
            );
        }

        Ok(String::from_utf8_lossy(&diff.stdout).into_owned())
    }
}

#[async_trait]
impl Dispatcher for LocalContainerDispatcher {
    fn name(&self) -> &str {
        "local-container"
    }

    async fn execute(&self, request: DispatchRequest) -> Result<DispatchOutcome> {
        let mut task = request.task;
        let started = std::time::Instant::now();
        let started_at_ms = Utc::now().timestamp_millis();

        // Write the brief under the reserved internal directory.
        let brief_dir = request.project_path.join(".worldmind");
        tokio::fs::create_dir_all(&brief_dir)
            .await
            .with_context(|| format!("failed to create {}", brief_dir.display()))?;
        let mut brief = render_task_brief(&task);
        if let Some(ref ctx) = request.project_context {
            brief.push_str("\n## Project Context\n\n");
            brief.push_str(ctx);
            brief.push('\n');
        }
        tokio::fs::write(brief_dir.join("task.md"), brief)
            .await
            .context("failed to write task brief")?;

        // Create the container with the workdir bind-mounted.
        let name = Self::container_name(&task.id);
        let mount = format!("{}:/workspace", request.project_path.display());
        let role_env = format!("WORLDMIND_ROLE={}", task.role);
        let task_env = format!("WORLDMIND_TASK_ID={}", task.id);
        let reasoning_env = format!("WORLDMIND_REASONING={}", request.reasoning_level);

        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            name.clone(),
            "-v".into(),
            mount,
            "-w".into(),
            "/workspace".into(),
            "-e".into(),
            role_env,
            "-e".into(),
            task_env,
            "-e".into(),
            reasoning_env,
        ];
        if let Some(ref tag) = request.runtime_tag {
            args.push("-e".into());
            args.push(format!("WORLDMIND_RUNTIME={tag}"));
        }
        args.extend(self.config.extra_flags.iter().cloned());
        args.push(self.config.image.clone());

        // Stale container from an interrupted run; replace it.
        let _ = Self::docker(&["rm", "-f", &name]).await;

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let create = Self::docker(&arg_refs).await?;
        if !create.status.success() {
            bail!(
                "docker create failed: {}",
                String::from_utf8_lossy(&create.stderr)
            );
        }
        let container_id = String::from_utf8_lossy(&create.stdout).trim().to_owned();

        let start = Self::docker(&["start", &container_id]).await?;
        if !start.status.success() {
            let stderr = String::from_utf8_lossy(&start.stderr).into_owned();
            let _ = Self::docker(&["rm", "-f", &container_id]).await;
            bail!("docker start failed: {stderr}");
        }

        // Block until the worker exits.
        let wait = Self::docker(&["wait", &container_id]).await?;
        let exit_code: i32 = String::from_utf8_lossy(&wait.stdout)
            .trim()
            .parse()
            .unwrap_or(-1);

        let logs = Self::docker(&["logs", &container_id]).await?;
        let mut output = String::from_utf8_lossy(&logs.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&logs.stderr));

        let _ = Self::docker(&["rm", "-f", &container_id]).await;

        // Observe the worker's file changes.
        match Self::collect_changes(&request.project_path).await {
            Ok(stat) => task.files_affected = parse_diff_stat(&stat),
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "failed to collect file changes");
            }
        }

        task.status = if exit_code == 0 {
            TaskStatus::Passed
        } else {
            TaskStatus::Failed
        };
        task.elapsed_ms = started.elapsed().as_millis() as u64;

        Ok(DispatchOutcome {
            container: ContainerInfo {
                container_id,
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
