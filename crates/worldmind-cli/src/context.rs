//! Shallow project-context source.
//!
//! The real project scanner lives outside the orchestrator; this source
//! only contributes a top-level directory listing so the planner knows
//! roughly what it is looking at.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

use worldmind_core::pipeline::ContextSource;

pub struct DirectoryListingSource;

#[async_trait]
impl ContextSource for DirectoryListingSource {
    async fn gather(&self, project_path: Option<&Path>) -> Result<String> {
        let Some(path) = project_path else {
            return Ok(String::new());
        };

        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let suffix = if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                "/"
            } else {
                ""
            };
            entries.push(format!("{name}{suffix}"));
        }
        entries.sort();

        Ok(format!(
            "Top-level entries of {}:\n{}",
            path.display(),
            entries.join("\n")
        ))
    }
}
