//! File-based state backend.
//!
//! One JSON document per resource per kind under `states/`, `history/`,
//! and `snapshots/`, with a `temp/` scratch area for atomic writes:
//! every write lands in `temp/` first and is renamed over the
//! destination. A sharded lock table keyed by path hash serializes
//! writers per destination while bounding lock memory.
//!
//! On a corrupt read the damaged file is quarantined as
//! `{id}_corrupt_{ts}.json` next to the original and the newest
//! readable history entry is served instead.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};

use crate::domain::errors::DomainResult;
use crate::domain::models::state::{ResourceState, StateEntry, StateSnapshot};
use crate::domain::ports::state_backend::StateBackend;

const LOCK_SHARDS: usize = 64;
const HISTORY_TRIM_BYTES: u64 = 10 * 1024 * 1024;
const HISTORY_TRIM_KEEP: usize = 100;
const SNAPSHOT_KEEP: usize = 10;

/// File-backed persistence rooted at a configurable directory.
pub struct FileStateBackend {
    states_dir: PathBuf,
    history_dir: PathBuf,
    snapshots_dir: PathBuf,
    temp_dir: PathBuf,
    path_locks: Vec<Mutex<()>>,
}

impl FileStateBackend {
    pub async fn new(storage_dir: impl AsRef<Path>) -> DomainResult<Self> {
        let root = storage_dir.as_ref().to_path_buf();
        let backend = Self {
            states_dir: root.join("states"),
            history_dir: root.join("history"),
            snapshots_dir: root.join("snapshots"),
            temp_dir: root.join("temp"),
            path_locks: (0..LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
        };
        for dir in [
            &backend.states_dir,
            &backend.history_dir,
            &backend.snapshots_dir,
            &backend.temp_dir,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(backend)
    }

    async fn lock_path(&self, path: &Path) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        let shard = (hasher.finish() as usize) % LOCK_SHARDS;
        self.path_locks[shard].lock().await
    }

    fn state_path(&self, resource_id: &str) -> PathBuf {
        self.states_dir.join(format!("{resource_id}.json"))
    }

    fn history_path(&self, resource_id: &str) -> PathBuf {
        self.history_dir.join(format!("{resource_id}.json"))
    }

    fn snapshot_path(&self, resource_id: &str) -> PathBuf {
        self.snapshots_dir.join(format!("{resource_id}.json"))
    }

    /// Write to temp, then rename over the destination. Callers hold
    /// the destination's path lock.
    async fn atomic_write<T: Serialize>(
        &self,
        dest: &Path,
        tag: &str,
        value: &T,
    ) -> DomainResult<()> {
        let stem = dest
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unnamed");
        let temp = self
            .temp_dir
            .join(format!("{stem}_{tag}_{}.json", Utc::now().timestamp_micros()));
        let bytes = serde_json::to_vec(value)?;
        if let Err(e) = tokio::fs::write(&temp, &bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&temp, dest).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> DomainResult<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Copy a damaged file aside so its bytes survive for forensics.
    async fn quarantine(path: &Path) {
        let Some(parent) = path.parent() else { return };
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unnamed");
        let backup = parent.join(format!(
            "{stem}_corrupt_{}.json",
            Utc::now().timestamp_micros()
        ));
        if let Err(e) = tokio::fs::copy(path, &backup).await {
            tracing::error!("failed to quarantine corrupt file {}: {e}", path.display());
        }
    }

    async fn read_history_unlocked(&self, resource_id: &str) -> Vec<StateEntry> {
        let path = self.history_path(resource_id);
        match Self::read_json::<Vec<StateEntry>>(&path).await {
            Ok(Some(history)) => history,
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::error!("corrupt history file for {resource_id}: {e}");
                Self::quarantine(&path).await;
                Vec::new()
            }
        }
    }

    /// Keep the first entry, the most recent `max_entries`, and one
    /// representative per calendar day from the middle.
    pub async fn compact_history(
        &self,
        resource_id: &str,
        max_entries: usize,
    ) -> DomainResult<bool> {
        let path = self.history_path(resource_id);
        let _guard = self.lock_path(&path).await;
        let history = self.read_history_unlocked(resource_id).await;
        if history.len() <= max_entries {
            return Ok(false);
        }

        let first = history[0].clone();
        let recent = &history[history.len() - max_entries..];
        let middle = &history[1..history.len() - max_entries];

        let mut by_day: BTreeMap<String, StateEntry> = BTreeMap::new();
        for entry in middle {
            let day = entry.timestamp.format("%Y-%m-%d").to_string();
            by_day.entry(day).or_insert_with(|| entry.clone());
        }

        let mut compacted = Vec::with_capacity(1 + by_day.len() + recent.len());
        compacted.push(first);
        compacted.extend(by_day.into_values());
        compacted.extend(recent.iter().cloned());

        let before = history.len();
        self.atomic_write(&path, "history_compact", &compacted).await?;
        tracing::info!(
            resource_id,
            before,
            after = compacted.len(),
            "compacted history"
        );
        Ok(true)
    }

    fn is_corrupt_marker(stem: &str) -> bool {
        stem.contains("_corrupt_")
    }
}

#[async_trait]
impl StateBackend for FileStateBackend {
    async fn save_state(&self, resource_id: &str, entry: &StateEntry) -> DomainResult<()> {
        let state_path = self.state_path(resource_id);
        {
            let _guard = self.lock_path(&state_path).await;
            self.atomic_write(&state_path, "state", entry).await?;
        }

        let history_path = self.history_path(resource_id);
        let _guard = self.lock_path(&history_path).await;
        let mut history = self.read_history_unlocked(resource_id).await;
        history.push(entry.clone());
        self.atomic_write(&history_path, "history", &history).await
    }

    async fn save_snapshot(&self, resource_id: &str, snapshot: &StateSnapshot) -> DomainResult<()> {
        let path = self.snapshot_path(resource_id);
        let _guard = self.lock_path(&path).await;
        let mut snapshots = match Self::read_json::<Vec<StateSnapshot>>(&path).await {
            Ok(Some(snapshots)) => snapshots,
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::error!("corrupt snapshot file for {resource_id}: {e}");
                Self::quarantine(&path).await;
                Vec::new()
            }
        };
        snapshots.push(snapshot.clone());
        self.atomic_write(&path, "snapshot", &snapshots).await
    }

    async fn load_state(&self, resource_id: &str) -> DomainResult<Option<StateEntry>> {
        let path = self.state_path(resource_id);
        let _guard = self.lock_path(&path).await;
        match Self::read_json::<StateEntry>(&path).await {
            Ok(entry) => Ok(entry),
            Err(e) => {
                tracing::error!("corrupt state file for {resource_id}: {e}");
                Self::quarantine(&path).await;
                drop(_guard);
                // Serve the newest history entry in place of the
                // damaged current-state file.
                let history = self.load_history(resource_id, Some(1)).await?;
                if let Some(entry) = history.into_iter().next_back() {
                    tracing::info!("recovered state for {resource_id} from history");
                    return Ok(Some(entry));
                }
                Ok(None)
            }
        }
    }

    async fn load_history(
        &self,
        resource_id: &str,
        limit: Option<usize>,
    ) -> DomainResult<Vec<StateEntry>> {
        let path = self.history_path(resource_id);
        let _guard = self.lock_path(&path).await;
        let mut history = self.read_history_unlocked(resource_id).await;
        if let Some(limit) = limit {
            if history.len() > limit {
                history.drain(..history.len() - limit);
            }
        }
        Ok(history)
    }

    async fn load_snapshots(
        &self,
        resource_id: &str,
        limit: Option<usize>,
    ) -> DomainResult<Vec<StateSnapshot>> {
        let path = self.snapshot_path(resource_id);
        let _guard = self.lock_path(&path).await;
        let mut snapshots = match Self::read_json::<Vec<StateSnapshot>>(&path).await {
            Ok(Some(snapshots)) => snapshots,
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::error!("corrupt snapshot file for {resource_id}: {e}");
                Self::quarantine(&path).await;
                Vec::new()
            }
        };
        if let Some(limit) = limit {
            if snapshots.len() > limit {
                snapshots.drain(..snapshots.len() - limit);
            }
        }
        Ok(snapshots)
    }

    async fn get_all_resource_ids(&self) -> DomainResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.states_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !Self::is_corrupt_marker(stem) {
                    ids.push(stem.to_string());
                }
            }
        }
        Ok(ids)
    }

    async fn cleanup(&self, older_than: Option<DateTime<Utc>>) -> DomainResult<u64> {
        let cutoff = older_than.unwrap_or_else(|| Utc::now() - chrono::Duration::days(30));
        let mut removed: u64 = 0;

        // Scratch files are always safe to discard.
        let mut dir = tokio::fs::read_dir(&self.temp_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            if tokio::fs::remove_file(entry.path()).await.is_ok() {
                removed += 1;
            }
        }

        for resource_id in self.get_all_resource_ids().await? {
            // Terminated and expired: purge every trace of the resource.
            match self.load_state(&resource_id).await {
                Ok(Some(entry))
                    if entry.state.as_resource() == Some(ResourceState::Terminated)
                        && entry.timestamp < cutoff =>
                {
                    for path in [
                        self.state_path(&resource_id),
                        self.history_path(&resource_id),
                        self.snapshot_path(&resource_id),
                    ] {
                        let _guard = self.lock_path(&path).await;
                        if tokio::fs::remove_file(&path).await.is_ok() {
                            removed += 1;
                        }
                    }
                    tracing::info!("completely removed terminated resource {resource_id}");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("error checking {resource_id} for cleanup: {e}");
                }
            }

            // Oversized history: keep only the newest entries.
            let history_path = self.history_path(&resource_id);
            {
                let _guard = self.lock_path(&history_path).await;
                if let Ok(meta) = tokio::fs::metadata(&history_path).await {
                    if meta.len() > HISTORY_TRIM_BYTES {
                        let history = self.read_history_unlocked(&resource_id).await;
                        if history.len() > HISTORY_TRIM_KEEP {
                            let trimmed = history.len() - HISTORY_TRIM_KEEP;
                            let kept: Vec<StateEntry> =
                                history[history.len() - HISTORY_TRIM_KEEP..].to_vec();
                            self.atomic_write(&history_path, "history_trim", &kept)
                                .await?;
                            removed += trimmed as u64;
                            tracing::info!(
                                resource_id,
                                trimmed,
                                "trimmed oversized history file"
                            );
                        }
                    }
                }
            }

            // Snapshot cap.
            let snapshot_path = self.snapshot_path(&resource_id);
            let _guard = self.lock_path(&snapshot_path).await;
            if let Ok(Some(snapshots)) =
                Self::read_json::<Vec<StateSnapshot>>(&snapshot_path).await
            {
                if snapshots.len() > SNAPSHOT_KEEP {
                    let trimmed = snapshots.len() - SNAPSHOT_KEEP;
                    let kept: Vec<StateSnapshot> =
                        snapshots[snapshots.len() - SNAPSHOT_KEEP..].to_vec();
                    self.atomic_write(&snapshot_path, "snapshot_trim", &kept)
                        .await?;
                    removed += trimmed as u64;
                    tracing::info!(resource_id, trimmed, "trimmed snapshots");
                }
            }
        }

        Ok(removed)
    }

    async fn delete_state(&self, resource_id: &str) -> DomainResult<bool> {
        let mut existed = false;
        for path in [
            self.state_path(resource_id),
            self.history_path(resource_id),
            self.snapshot_path(resource_id),
        ] {
            let _guard = self.lock_path(&path).await;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => existed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(existed)
    }

    async fn clear_all_states(&self) -> DomainResult<u64> {
        let ids = self.get_all_resource_ids().await?;
        let count = ids.len() as u64;
        for resource_id in ids {
            self.delete_state(&resource_id).await?;
        }
        Ok(count)
    }

    /// Scan every kind for unreadable files. Corrupt current-state
    /// files are rebuilt from the newest history entry when possible;
    /// anything else is quarantined and removed.
    async fn repair(&self) -> DomainResult<HashMap<String, u64>> {
        let mut results: HashMap<String, u64> = HashMap::new();
        results.insert("state_repaired".to_string(), 0);
        results.insert("history_quarantined".to_string(), 0);
        results.insert("snapshot_quarantined".to_string(), 0);
        results.insert("failed".to_string(), 0);

        let mut dir = tokio::fs::read_dir(&self.states_dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if Self::is_corrupt_marker(stem)
                || path.extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }
            if Self::read_json::<StateEntry>(&path).await.is_ok() {
                continue;
            }

            let resource_id = stem.to_string();
            tracing::warn!("found corrupt state file for {resource_id}, attempting repair");
            let history = self.read_history_unlocked(&resource_id).await;
            if let Some(most_recent) = history.last() {
                let _guard = self.lock_path(&path).await;
                self.atomic_write(&path, "state_repair", most_recent).await?;
                *results.entry("state_repaired".to_string()).or_insert(0) += 1;
                tracing::info!("repaired state file for {resource_id} from history");
            } else {
                Self::quarantine(&path).await;
                let _ = tokio::fs::remove_file(&path).await;
                *results.entry("failed".to_string()).or_insert(0) += 1;
                tracing::warn!("could not repair state file for {resource_id}, removed");
            }
        }

        for (dir_path, counter) in [
            (&self.history_dir, "history_quarantined"),
            (&self.snapshots_dir, "snapshot_quarantined"),
        ] {
            let mut dir = tokio::fs::read_dir(dir_path).await?;
            while let Some(entry) = dir.next_entry().await? {
                let path = entry.path();
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if Self::is_corrupt_marker(stem)
                    || path.extension().and_then(|e| e.to_str()) != Some("json")
                {
                    continue;
                }
                let readable = if counter == "history_quarantined" {
                    Self::read_json::<Vec<StateEntry>>(&path).await.is_ok()
                } else {
                    Self::read_json::<Vec<StateSnapshot>>(&path).await.is_ok()
                };
                if !readable {
                    Self::quarantine(&path).await;
                    let _ = tokio::fs::remove_file(&path).await;
                    *results.entry(counter.to_string()).or_insert(0) += 1;
                }
            }
        }

        Ok(results)
    }

    async fn compact(&self) -> DomainResult<HashMap<String, u64>> {
        let mut results = HashMap::new();
        let mut compacted: u64 = 0;
        for resource_id in self.get_all_resource_ids().await? {
            if self
                .compact_history(&resource_id, HISTORY_TRIM_KEEP)
                .await?
            {
                compacted += 1;
            }
        }
        results.insert("histories_compacted".to_string(), compacted);
        Ok(results)
    }
}
