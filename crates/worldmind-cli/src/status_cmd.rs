//! Inspection commands: `status`, `missions`, `delete`.

use anyhow::{Context, Result};
use uuid::Uuid;

use worldmind_store::store::{JsonFileStore, MissionStore};

use crate::config::WorldmindConfig;

/// `worldmind status <id>`: show one mission in detail.
pub async fn status(config: WorldmindConfig, mission_id: Uuid) -> Result<()> {
    let store = JsonFileStore::new(&config.store_dir)?;
    let mission = store
        .load(mission_id)
        .await?
        .with_context(|| format!("mission {mission_id} not found"))?;

    println!("mission:  {}", mission.id);
    println!("request:  {}", mission.request);
    println!("status:   {}", mission.status);
    println!("strategy: {}", mission.strategy);
    if let Some(ref classification) = mission.classification {
        println!(
            "category: {} (complexity {})",
            classification.category, classification.complexity
        );
    }
    if let Some(ref path) = mission.project_path {
        println!("project:  {path}");
    }
    if let Some(ref remote) = mission.git_remote_url {
        println!("remote:   {remote}");
    }

    if !mission.tasks.is_empty() {
        println!("tasks:");
        for task in &mission.tasks {
            let deps = if task.depends_on.is_empty() {
                String::new()
            } else {
                format!(" <- {}", task.depends_on.join(", "))
            };
            println!(
                "  {} [{}] {} (iteration {}/{}){}",
                task.id, task.role, task.status, task.iteration, task.max_iterations, deps
            );
        }
    }

    if let Some(ref metrics) = mission.metrics {
        println!(
            "metrics:  {} completed, {} failed, {} iterations, {} waves",
            metrics.tasks_completed,
            metrics.tasks_failed,
            metrics.total_iterations,
            metrics.waves_executed
        );
        println!(
            "          {} files created, {} modified, {}/{} tests passed",
            metrics.files_created, metrics.files_modified, metrics.tests_passed, metrics.tests_run
        );
    }

    for error in &mission.errors {
        println!("error:    {error}");
    }

    Ok(())
}

/// `worldmind missions`: list every persisted mission.
pub async fn missions(config: WorldmindConfig) -> Result<()> {
    let store = JsonFileStore::new(&config.store_dir)?;
    let missions = store.list().await?;

    if missions.is_empty() {
        println!("no missions");
        return Ok(());
    }

    for mission in missions {
        let done = mission
            .tasks
            .iter()
            .filter(|t| {
                matches!(
                    t.status,
                    worldmind_store::models::TaskStatus::Passed
                        | worldmind_store::models::TaskStatus::Skipped
                )
            })
            .count();
        println!(
            "{}  {:<18} {:>2}/{:<2} tasks  {}",
            mission.id,
            mission.status.to_string(),
            done,
            mission.tasks.len(),
            truncate(&mission.request, 60),
        );
    }
    Ok(())
}

/// `worldmind delete <id>`: remove a mission record and its event log.
pub async fn delete(config: WorldmindConfig, mission_id: Uuid) -> Result<()> {
    let store = JsonFileStore::new(&config.store_dir)?;
    store.delete(mission_id).await?;
    println!("mission {mission_id} deleted");
    Ok(())
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_owned();
    }
    let prefix: String = s.chars().take(max_chars).collect();
    format!("{prefix}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_short_unchanged() {
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn truncate_long_adds_ellipsis() {
        assert_eq!(truncate("abcdefgh", 4), "abcd...");
    }
}
