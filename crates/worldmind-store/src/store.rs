//! Mission persistence.
//!
//! The store holds one JSON record per mission. Mutation is serialised per
//! mission by the pipeline driver (single-writer), so the store itself only
//! needs atomic whole-record writes, not transactions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::Mission;

/// Persistence interface for missions.
#[async_trait]
pub trait MissionStore: Send + Sync {
    /// Persist the full mission record, replacing any previous version.
    async fn save(&self, mission: &Mission) -> Result<()>;

    /// Load a mission by id. `Ok(None)` if it does not exist.
    async fn load(&self, id: Uuid) -> Result<Option<Mission>>;

    /// List all persisted missions.
    async fn list(&self) -> Result<Vec<Mission>>;

    /// Delete a mission and its event log. Idempotent.
    async fn delete(&self, id: Uuid) -> Result<()>;
}

// Compile-time assertion: MissionStore must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn MissionStore) {}
};

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

/// File-backed store: one `<mission-id>.json` per mission under a directory.
///
/// Writes go to a `.tmp` sibling first and are renamed into place, so a
/// crash mid-write never leaves a truncated record.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create store directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    /// Directory holding the mission records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn mission_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Path of the best-effort event log for a mission.
    pub fn events_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.events.jsonl"))
    }
}

#[async_trait]
impl MissionStore for JsonFileStore {
    async fn save(&self, mission: &Mission) -> Result<()> {
        let path = self.mission_path(mission.id);
        let tmp = path.with_extension("json.tmp");

        let contents = serde_json::to_vec_pretty(mission)
            .with_context(|| format!("failed to serialize mission {}", mission.id))?;

        tokio::fs::write(&tmp, &contents)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move {} into place", tmp.display()))?;

        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<Mission>> {
        let path = self.mission_path(id);
        let contents = match tokio::fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };

        let mission: Mission = serde_json::from_slice(&contents)
            .with_context(|| format!("failed to parse mission record {}", path.display()))?;
        Ok(Some(mission))
    }

    async fn list(&self) -> Result<Vec<Mission>> {
        let mut missions = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to read store directory {}", self.dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<Mission>(&contents) {
                Ok(mission) => missions.push(mission),
                Err(e) => {
                    // A foreign or corrupt file in the store dir should not
                    // make every listing fail.
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "skipping unreadable mission record"
                    );
                }
            }
        }

        missions.sort_by_key(|m| m.created_at_ms);
        Ok(missions)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        for path in [self.mission_path(id), self.events_path(id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to delete {}", path.display()));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-memory store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<Uuid, Mission>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MissionStore for MemoryStore {
    async fn save(&self, mission: &Mission) -> Result<()> {
        self.inner.write().await.insert(mission.id, mission.clone());
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<Mission>> {
        Ok(self.inner.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<Mission>> {
        let mut missions: Vec<Mission> = self.inner.read().await.values().cloned().collect();
        missions.sort_by_key(|m| m.created_at_ms);
        Ok(missions)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.inner.write().await.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_store_save_load_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();

        let mission = Mission::new("add a health endpoint");
        store.save(&mission).await.unwrap();

        let loaded = store.load(mission.id).await.unwrap().expect("mission exists");
        assert_eq!(loaded.id, mission.id);
        assert_eq!(loaded.request, mission.request);
    }

    #[tokio::test]
    async fn json_store_load_missing_is_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();
        assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn json_store_list_sorted_by_creation() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();

        let mut first = Mission::new("first");
        first.created_at_ms = 1_000;
        let mut second = Mission::new("second");
        second.created_at_ms = 2_000;

        // Save out of order.
        store.save(&second).await.unwrap();
        store.save(&first).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].request, "first");
        assert_eq!(listed[1].request, "second");
    }

    #[tokio::test]
    async fn json_store_delete_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();

        let mission = Mission::new("r");
        store.save(&mission).await.unwrap();
        store.delete(mission.id).await.unwrap();
        assert!(store.load(mission.id).await.unwrap().is_none());
        // Second delete is a no-op.
        store.delete(mission.id).await.unwrap();
    }

    #[tokio::test]
    async fn json_store_list_skips_foreign_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path()).unwrap();

        std::fs::write(dir.path().join("notes.json"), b"not a mission").unwrap();
        let mission = Mission::new("r");
        store.save(&mission).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        let mission = Mission::new("r");
        store.save(&mission).await.unwrap();
        assert!(store.load(mission.id).await.unwrap().is_some());
        store.delete(mission.id).await.unwrap();
        assert!(store.load(mission.id).await.unwrap().is_none());
    }
}
