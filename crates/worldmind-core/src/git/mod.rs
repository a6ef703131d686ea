//! Git workspace management.
//!
//! Owns the branch-naming convention, per-task worktree lifecycle, the
//! wave-level sequential merge into the base branch, and the parse of
//! `diff --stat` output into structured file records.
//!
//! Git does not tolerate concurrent mutating operations on one repository
//! (a lock file guards the shared object store), so every mutating method
//! serialises through an internal mutex.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;

use worldmind_store::models::{FileAction, FileChange};

/// Branch prefix of the external contract: workers push to these branches.
pub const BRANCH_PREFIX: &str = "worldmind/";

/// Build the branch name for a task: `worldmind/<task-id>`.
pub fn task_branch(task_id: &str) -> String {
    format!("{BRANCH_PREFIX}{task_id}")
}

/// Errors from git operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// A git command could not be executed at all.
    #[error("git command failed: {message}")]
    CommandIo {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// An operation that needs a remote was attempted without one.
    #[error("mission has no git remote configured")]
    NoRemote,
}

/// Outcome of merging one wave into the base branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Task ids whose branches were merged and pushed, in merge order.
    pub merged: Vec<String>,
    /// Task ids whose rebase conflicted; their tasks must be reset.
    pub conflicted: Vec<String>,
}

/// Manages the shared mission checkout, per-task worktrees, and the wave
/// merge workspace.
#[derive(Debug)]
pub struct GitWorkspace {
    /// Path of the shared mission checkout (clone of the remote, or the
    /// project directory itself when no remote is configured).
    root: PathBuf,
    remote_url: Option<String>,
    base_branch: String,
    lock: Arc<Mutex<()>>,
}

impl Clone for GitWorkspace {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            remote_url: self.remote_url.clone(),
            base_branch: self.base_branch.clone(),
            lock: Arc::clone(&self.lock),
        }
    }
}

impl GitWorkspace {
    pub fn new(
        root: impl Into<PathBuf>,
        remote_url: Option<String>,
        base_branch: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            remote_url,
            base_branch: base_branch.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    /// Ensure the shared mission workspace exists.
    ///
    /// Clones the remote into `root` on first use; on later calls just
    /// fetches so worktrees branch off fresh refs. Without a remote the
    /// project directory is used as-is.
    pub async fn ensure_workspace(&self) -> Result<PathBuf, GitError> {
        let _guard = self.lock.lock().await;

        if self.root.join(".git").exists() {
            if self.remote_url.is_some() {
                self.run(&self.root, &["fetch", "origin"]).await?;
            }
            return Ok(self.root.clone());
        }

        let url = self.remote_url.as_deref().ok_or(GitError::NoRemote)?;
        let parent = self.root.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| GitError::CommandIo {
            message: format!("failed to create {}", parent.display()),
            source: e,
        })?;

        let root_str = self.root.to_string_lossy().into_owned();
        self.run(parent, &["clone", url, &root_str]).await?;
        Ok(self.root.clone())
    }

    /// Acquire a worktree for a task's branch under `<root>-worktrees/`.
    ///
    /// Idempotent: an existing worktree for the branch is returned as-is.
    pub async fn acquire_worktree(&self, task_id: &str) -> Result<PathBuf, GitError> {
        let _guard = self.lock.lock().await;

        let branch = task_branch(task_id);
        let base = self.worktree_base();
        let path = base.join(branch.replace('/', "--"));

        if path.join(".git").exists() {
            tracing::debug!(path = %path.display(), branch = %branch, "reusing existing worktree");
            return Ok(path);
        }

        std::fs::create_dir_all(&base).map_err(|e| GitError::CommandIo {
            message: format!("failed to create worktree base {}", base.display()),
            source: e,
        })?;

        let path_str = path.to_string_lossy().into_owned();
        let branch_exists = self
            .try_run(&self.root, &["rev-parse", "--verify", &format!("refs/heads/{branch}")])
            .await?;

        if branch_exists {
            self.run(&self.root, &["worktree", "add", &path_str, &branch]).await?;
        } else {
            self.run(&self.root, &["worktree", "add", "-b", &branch, &path_str]).await?;
        }

        Ok(path)
    }

    /// Remove a task worktree. Idempotent.
    pub async fn remove_worktree(&self, path: &Path) -> Result<(), GitError> {
        let _guard = self.lock.lock().await;

        let path_str = path.to_string_lossy().into_owned();
        match self
            .run(&self.root, &["worktree", "remove", "--force", &path_str])
            .await
        {
            Ok(_) => Ok(()),
            Err(GitError::Exit { stderr, .. }) if stderr.contains("is not a working tree") => {
                if path.exists() {
                    let _ = std::fs::remove_dir_all(path);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Stage everything in a worktree, commit, and push the task branch.
    ///
    /// Returns `Ok(false)` when there was nothing to commit.
    pub async fn commit_and_push(
        &self,
        worktree: &Path,
        task_id: &str,
        iteration: u32,
    ) -> Result<bool, GitError> {
        let _guard = self.lock.lock().await;

        self.ensure_identity(worktree).await?;
        self.run(worktree, &["add", "-A"]).await?;

        let status = self.run(worktree, &["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            return Ok(false);
        }

        let message = format!("worldmind: {task_id} (iteration {iteration})");
        self.run(worktree, &["commit", "-m", &message]).await?;

        if self.remote_url.is_some() {
            // Each task branch has a single writer, so a forced push after
            // a conflict reset cannot lose anyone else's work.
            let branch = task_branch(task_id);
            self.run(worktree, &["push", "-u", "-f", "origin", &branch]).await?;
        }

        Ok(true)
    }

    /// Merge the passed tasks of a wave into the base branch.
    ///
    /// `task_ids` must arrive sorted lexicographically; with the zero-padded
    /// id convention that is creation order, and the order is part of the
    /// determinism contract. Each id is rebased onto the freshly updated
    /// base branch and merged with `--no-ff`; the base branch is pushed
    /// after every successful merge so later rebases see it. A rebase
    /// conflict aborts that id only and reports it in the conflicted set.
    pub async fn merge_wave(
        &self,
        merge_dir: &Path,
        task_ids: &[String],
    ) -> Result<MergeReport, GitError> {
        let _guard = self.lock.lock().await;

        let url = self.remote_url.as_deref().ok_or(GitError::NoRemote)?;
        let mut report = MergeReport::default();

        // 1. Clone or reuse the merge workspace and pin it to origin's base.
        if !merge_dir.join(".git").exists() {
            let parent = merge_dir.parent().unwrap_or(Path::new("."));
            std::fs::create_dir_all(parent).map_err(|e| GitError::CommandIo {
                message: format!("failed to create {}", parent.display()),
                source: e,
            })?;
            let dir_str = merge_dir.to_string_lossy().into_owned();
            self.run(parent, &["clone", url, &dir_str]).await?;
        }
        self.ensure_identity(merge_dir).await?;

        let base = self.base_branch.clone();
        let origin_base = format!("origin/{base}");
        self.run(merge_dir, &["fetch", "origin"]).await?;
        self.run(merge_dir, &["checkout", &base]).await?;
        self.run(merge_dir, &["reset", "--hard", &origin_base]).await?;

        for task_id in task_ids {
            let branch = task_branch(task_id);
            let temp = format!("merge-temp/{task_id}");

            // 2. Fetch the task branch from the remote. Forced refspec:
            // a retried task may have force-pushed its branch.
            if let Err(e) = self
                .run(merge_dir, &["fetch", "origin", &format!("+{branch}:{branch}")])
                .await
            {
                tracing::warn!(task_id = %task_id, error = %e, "task branch missing on remote");
                report.conflicted.push(task_id.clone());
                continue;
            }

            // 3. Check out the branch into a temp branch and rebase onto base.
            self.run(merge_dir, &["checkout", "-B", &temp, &branch]).await?;
            let rebased = self.try_run(merge_dir, &["rebase", &base]).await?;

            if !rebased {
                // 4. Conflict: abort and move on.
                let _ = self.try_run(merge_dir, &["rebase", "--abort"]).await;
                self.run(merge_dir, &["checkout", &base]).await?;
                tracing::info!(task_id = %task_id, "rebase conflict, resetting task");
                report.conflicted.push(task_id.clone());
                continue;
            }

            // 5. No-ff merge into base, then push so the next rebase sees it.
            self.run(merge_dir, &["checkout", &base]).await?;
            let message = format!("merge task {task_id}");
            self.run(merge_dir, &["merge", "--no-ff", "-m", &message, &temp]).await?;

            let pushed = self
                .try_run(merge_dir, &["push", "origin", &base])
                .await?;
            if !pushed {
                // Another mission advanced the remote: rebase and retry once.
                self.run(merge_dir, &["pull", "--rebase", "origin", &base]).await?;
                self.run(merge_dir, &["push", "origin", &base]).await?;
            }

            let _ = self.try_run(merge_dir, &["branch", "-D", &temp]).await;
            report.merged.push(task_id.clone());
        }

        Ok(report)
    }

    /// Path of the clean workspace used for wave merges, a sibling of the
    /// mission checkout.
    pub fn merge_dir(&self) -> PathBuf {
        let name = self
            .root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("workspace");
        self.root
            .parent()
            .map(|p| p.join(format!("{name}-merge")))
            .unwrap_or_else(|| PathBuf::from(format!("{name}-merge")))
    }

    // -- internals ----------------------------------------------------------

    fn worktree_base(&self) -> PathBuf {
        let name = self
            .root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("workspace");
        self.root
            .parent()
            .map(|p| p.join(format!("{name}-worktrees")))
            .unwrap_or_else(|| PathBuf::from(format!("{name}-worktrees")))
    }

    /// Commits need an identity; worktrees and fresh clones may not
    /// inherit one.
    async fn ensure_identity(&self, repo: &Path) -> Result<(), GitError> {
        let has_email = self.try_run(repo, &["config", "user.email"]).await?;
        if !has_email {
            self.run(repo, &["config", "user.email", "orchestrator@worldmind.dev"]).await?;
            self.run(repo, &["config", "user.name", "worldmind"]).await?;
        }
        Ok(())
    }

    /// Run git, returning stdout or a [`GitError::Exit`].
    async fn run(&self, dir: &Path, args: &[&str]) -> Result<String, GitError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| GitError::CommandIo {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })?;

        if !output.status.success() {
            return Err(GitError::Exit {
                command: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run git, mapping a non-zero exit to `Ok(false)` instead of an error.
    async fn try_run(&self, dir: &Path, args: &[&str]) -> Result<bool, GitError> {
        match self.run(dir, args).await {
            Ok(_) => Ok(true),
            Err(GitError::Exit { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// diff --stat parsing
// ---------------------------------------------------------------------------

/// Parse `git diff --stat --summary` output into file-change records.
///
/// Stat lines carry the path and churn:
///
/// ```text
///  src/health.rs | 12 ++++++++----
/// ```
///
/// Summary lines flip the action from the default `modified`:
///
/// ```text
///  create mode 100644 src/health.rs
///  delete mode 100644 src/old.rs
/// ```
///
/// The trailing `N files changed, ...` line and binary-file notations are
/// ignored. Rename stat lines (`src/{old => new}.rs`) resolve to the new
/// path.
pub fn parse_diff_stat(output: &str) -> Vec<FileChange> {
    let mut changes: Vec<FileChange> = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("create mode ") {
            if let Some(path) = rest.split_once(' ').map(|(_, p)| p) {
                set_action(&mut changes, path, FileAction::Created);
            }
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("delete mode ") {
            if let Some(path) = rest.split_once(' ').map(|(_, p)| p) {
                set_action(&mut changes, path, FileAction::Deleted);
            }
            continue;
        }
        if trimmed.starts_with("rename ") || trimmed.starts_with("mode change ") {
            continue;
        }

        // A stat line has the form `<path> | <count> <bars>` (or `Bin` for
        // binary files). The summary `N files changed...` line has no pipe.
        let Some((path_part, stat_part)) = trimmed.rsplit_once('|') else {
            continue;
        };

        let path = resolve_rename(path_part.trim());
        if path.is_empty() {
            continue;
        }

        let stat = stat_part.trim();
        let lines_changed = if stat.starts_with("Bin") {
            0
        } else {
            stat.split_whitespace()
                .next()
                .and_then(|n| n.parse::<u64>().ok())
                .unwrap_or(0)
        };

        changes.push(FileChange {
            path,
            action: FileAction::Modified,
            lines_changed,
        });
    }

    changes
}

fn set_action(changes: &mut [FileChange], path: &str, action: FileAction) {
    if let Some(change) = changes.iter_mut().find(|c| c.path == path) {
        change.action = action;
    }
}

/// Resolve `src/{old => new}.rs` and `old => new` rename forms to the new
/// path.
fn resolve_rename(path: &str) -> String {
    if let (Some(open), Some(close)) = (path.find('{'), path.find('}')) {
        if open < close {
            let inner = &path[open + 1..close];
            if let Some((_, new)) = inner.split_once(" => ") {
                return format!("{}{}{}", &path[..open], new, &path[close + 1..]);
            }
        }
    }
    if let Some((_, new)) = path.split_once(" => ") {
        return new.to_owned();
    }
    path.to_owned()
}
