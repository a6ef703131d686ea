//! Orchestrator configuration.

use std::time::Duration;

use anyhow::{Result, bail};

/// Tunable options for a mission run.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Wave concurrency cap and maximum file-overlap-free wave size.
    pub max_parallel: usize,
    /// Inter-wave pause to respect provider rate limits.
    pub wave_cooldown: Duration,
    /// Minimum reviewer score for a gate grant.
    pub review_score_threshold: u8,
    /// Retry cap per task.
    pub max_iterations: u32,
    /// Use per-task git worktrees in local mode.
    pub worktrees_enabled: bool,
    /// Require deterministic wave selection and merge order.
    pub strict_determinism: bool,
    /// Whether a denied-gate `skip` adds the task to completed-ids so its
    /// dependents unblock.
    pub skip_adds_to_completed: bool,
    /// Wall-clock limit for a single dispatcher call.
    pub task_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            wave_cooldown: Duration::ZERO,
            review_score_threshold: 6,
            max_iterations: 3,
            worktrees_enabled: false,
            strict_determinism: true,
            skip_adds_to_completed: true,
            task_timeout: Duration::from_secs(1800),
        }
    }
}

impl OrchestratorConfig {
    /// Validate option ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            bail!("max_parallel must be a positive integer");
        }
        if self.review_score_threshold > 10 {
            bail!(
                "review_score_threshold must be in 0..=10, got {}",
                self.review_score_threshold
            );
        }
        if self.max_iterations == 0 {
            bail!("max_iterations must be a positive integer");
        }
        Ok(())
    }
}
