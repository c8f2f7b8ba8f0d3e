//! Storage port for the state manager.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::errors::DomainResult;
use crate::domain::models::state::{StateEntry, StateSnapshot};

/// Pluggable persistence behind the state manager. Backends own their
/// internal concurrency; callers may invoke these from any task.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Persist the current state and append it to history.
    async fn save_state(&self, resource_id: &str, entry: &StateEntry) -> DomainResult<()>;

    /// Append a snapshot for a resource.
    async fn save_snapshot(&self, resource_id: &str, snapshot: &StateSnapshot) -> DomainResult<()>;

    /// Load the latest state for a resource, if any.
    async fn load_state(&self, resource_id: &str) -> DomainResult<Option<StateEntry>>;

    /// Load history in chronological order; `limit` keeps the newest entries.
    async fn load_history(
        &self,
        resource_id: &str,
        limit: Option<usize>,
    ) -> DomainResult<Vec<StateEntry>>;

    /// Load snapshots in chronological order; `limit` keeps the newest.
    async fn load_snapshots(
        &self,
        resource_id: &str,
        limit: Option<usize>,
    ) -> DomainResult<Vec<StateSnapshot>>;

    /// All resource ids known to this backend.
    async fn get_all_resource_ids(&self) -> DomainResult<Vec<String>>;

    /// Remove expired data; returns the number of items removed.
    async fn cleanup(&self, older_than: Option<DateTime<Utc>>) -> DomainResult<u64>;

    /// Delete a resource's state, history, and snapshots.
    async fn delete_state(&self, resource_id: &str) -> DomainResult<bool>;

    /// Wipe everything; returns the number of resources removed.
    async fn clear_all_states(&self) -> DomainResult<u64>;

    /// Attempt to repair damaged storage. Default is a no-op for
    /// backends that cannot be damaged.
    async fn repair(&self) -> DomainResult<HashMap<String, u64>> {
        Ok(HashMap::new())
    }

    /// Backend-specific maintenance (compaction, vacuum). Default no-op.
    async fn compact(&self) -> DomainResult<HashMap<String, u64>> {
        Ok(HashMap::new())
    }

    /// Backend statistics for monitoring, when available.
    async fn stats(&self) -> DomainResult<HashMap<String, serde_json::Value>> {
        Ok(HashMap::new())
    }
}
