//! In-memory state backend. No persistence between restarts.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::errors::DomainResult;
use crate::domain::models::state::{StateEntry, StateSnapshot};
use crate::domain::ports::state_backend::StateBackend;

#[derive(Default)]
struct Store {
    states: HashMap<String, StateEntry>,
    history: HashMap<String, Vec<StateEntry>>,
    snapshots: HashMap<String, Vec<StateSnapshot>>,
}

/// Maps kept in RAM behind a single lock. Reads hand out copies so
/// callers never alias the stored history.
#[derive(Default)]
pub struct MemoryStateBackend {
    store: Mutex<Store>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn save_state(&self, resource_id: &str, entry: &StateEntry) -> DomainResult<()> {
        let mut store = self.store.lock().await;
        store
            .states
            .insert(resource_id.to_string(), entry.clone());
        store
            .history
            .entry(resource_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn save_snapshot(&self, resource_id: &str, snapshot: &StateSnapshot) -> DomainResult<()> {
        let mut store = self.store.lock().await;
        store
            .snapshots
            .entry(resource_id.to_string())
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn load_state(&self, resource_id: &str) -> DomainResult<Option<StateEntry>> {
        let store = self.store.lock().await;
        Ok(store.states.get(resource_id).cloned())
    }

    async fn load_history(
        &self,
        resource_id: &str,
        limit: Option<usize>,
    ) -> DomainResult<Vec<StateEntry>> {
        let store = self.store.lock().await;
        let history = store.history.get(resource_id).cloned().unwrap_or_default();
        Ok(tail(history, limit))
    }

    async fn load_snapshots(
        &self,
        resource_id: &str,
        limit: Option<usize>,
    ) -> DomainResult<Vec<StateSnapshot>> {
        let store = self.store.lock().await;
        let snapshots = store
            .snapshots
            .get(resource_id)
            .cloned()
            .unwrap_or_default();
        Ok(tail(snapshots, limit))
    }

    async fn get_all_resource_ids(&self) -> DomainResult<Vec<String>> {
        let store = self.store.lock().await;
        Ok(store.states.keys().cloned().collect())
    }

    async fn cleanup(&self, _older_than: Option<DateTime<Utc>>) -> DomainResult<u64> {
        // Nothing ages out of a RAM-only store.
        Ok(0)
    }

    async fn delete_state(&self, resource_id: &str) -> DomainResult<bool> {
        let mut store = self.store.lock().await;
        let existed = store.states.remove(resource_id).is_some();
        if existed {
            store.history.remove(resource_id);
            store.snapshots.remove(resource_id);
        }
        Ok(existed)
    }

    async fn clear_all_states(&self) -> DomainResult<u64> {
        let mut store = self.store.lock().await;
        let count = store.states.len() as u64;
        store.states.clear();
        store.history.clear();
        store.snapshots.clear();
        Ok(count)
    }
}

fn tail<T>(mut items: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        if items.len() > limit {
            items.drain(..items.len() - limit);
        }
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::state::{ResourceState, ResourceType};

    fn entry(version: u64) -> StateEntry {
        StateEntry::new(ResourceState::Active, ResourceType::State).with_version(version)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let backend = MemoryStateBackend::new();
        backend.save_state("r1", &entry(1)).await.unwrap();
        backend.save_state("r1", &entry(2)).await.unwrap();

        let current = backend.load_state("r1").await.unwrap().unwrap();
        assert_eq!(current.version, 2);
        let history = backend.load_history("r1", None).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_history_limit_keeps_newest() {
        let backend = MemoryStateBackend::new();
        for v in 1..=5 {
            backend.save_state("r1", &entry(v)).await.unwrap();
        }
        let tail = backend.load_history("r1", Some(2)).await.unwrap();
        let versions: Vec<u64> = tail.iter().map(|e| e.version).collect();
        assert_eq!(versions, [4, 5]);
    }

    #[tokio::test]
    async fn test_returned_history_is_a_copy() {
        let backend = MemoryStateBackend::new();
        backend.save_state("r1", &entry(1)).await.unwrap();
        let mut history = backend.load_history("r1", None).await.unwrap();
        history.clear();
        assert_eq!(backend.load_history("r1", None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let backend = MemoryStateBackend::new();
        backend.save_state("r1", &entry(1)).await.unwrap();
        let snapshot = StateSnapshot::from_entry(&entry(1), "test").unwrap();
        backend.save_snapshot("r1", &snapshot).await.unwrap();

        assert!(backend.delete_state("r1").await.unwrap());
        assert!(backend.load_state("r1").await.unwrap().is_none());
        assert!(backend.load_history("r1", None).await.unwrap().is_empty());
        assert!(backend.load_snapshots("r1", None).await.unwrap().is_empty());
        assert!(!backend.delete_state("r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_all() {
        let backend = MemoryStateBackend::new();
        backend.save_state("r1", &entry(1)).await.unwrap();
        backend.save_state("r2", &entry(1)).await.unwrap();
        assert_eq!(backend.clear_all_states().await.unwrap(), 2);
        assert!(backend.get_all_resource_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_is_noop() {
        let backend = MemoryStateBackend::new();
        backend.save_state("r1", &entry(1)).await.unwrap();
        assert_eq!(backend.cleanup(Some(Utc::now())).await.unwrap(), 0);
        assert!(backend.load_state("r1").await.unwrap().is_some());
    }
}
