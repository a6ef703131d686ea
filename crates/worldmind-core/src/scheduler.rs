//! Wave scheduling.
//!
//! A pure, deterministic function from (tasks, completed ids, strategy,
//! cap) to the next wave. Tasks are considered in creation order, which
//! the `TASK-NNN` id convention makes identical to lexicographic order.

use std::collections::BTreeSet;

use worldmind_store::models::{AgentRole, ExecutionStrategy, Task, TaskStatus};

/// Compute the next wave of task ids.
///
/// A task is eligible when it is not already passed or skipped, its id is
/// not in the completed set, and every dependency is completed. Under the
/// sequential strategy the wave is the first eligible task alone. Under
/// the parallel strategy eligible tasks are added in creation order while
/// their target-files stay disjoint from every task already in the wave
/// and the wave is below `max_parallel`.
///
/// Deployers are the exception: they become eligible only once every
/// other task is finished, and an eligible deployer is always a singleton
/// wave regardless of strategy.
///
/// An empty result signals the wave loop to terminate.
pub fn next_wave(
    tasks: &[Task],
    completed: &BTreeSet<String>,
    strategy: ExecutionStrategy,
    max_parallel: usize,
) -> Vec<String> {
    let open = |t: &Task| {
        !matches!(t.status, TaskStatus::Passed | TaskStatus::Skipped) && !completed.contains(&t.id)
    };

    // Deployers carry no dependency edges but still run after everything
    // else, each in a wave of its own.
    let others_open = tasks.iter().any(|t| t.role != AgentRole::Deployer && open(t));

    let eligible: Vec<&Task> = tasks
        .iter()
        .filter(|&t| open(t))
        .filter(|t| t.role != AgentRole::Deployer || !others_open)
        .filter(|t| t.depends_on.iter().all(|dep| completed.contains(dep)))
        .collect();

    if let Some(deployer) = eligible.iter().find(|t| t.role == AgentRole::Deployer) {
        return vec![deployer.id.clone()];
    }

    match strategy {
        ExecutionStrategy::Sequential => {
            eligible.first().map(|t| vec![t.id.clone()]).unwrap_or_default()
        }
        ExecutionStrategy::Parallel => {
            let mut wave: Vec<String> = Vec::new();
            let mut claimed: BTreeSet<&str> = BTreeSet::new();

            for task in eligible {
                if wave.len() >= max_parallel {
                    break;
                }
                let overlaps = task
                    .target_files
                    .iter()
                    .any(|path| claimed.contains(path.as_str()));
                if overlaps {
                    continue;
                }
                for path in &task.target_files {
                    claimed.insert(path.as_str());
                }
                wave.push(task.id.clone());
            }

            wave
        }
    }
}
