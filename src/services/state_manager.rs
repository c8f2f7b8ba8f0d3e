//! Versioned, snapshot-capable keyed state store.
//!
//! The state manager validates transitions, appends every change to a
//! per-resource history, keeps an LRU cache in front of the configured
//! backend, snapshots every tenth transition, and emits
//! RESOURCE_STATE_CHANGED after each append is visible to readers.
//! Mutations for one resource serialize behind a per-resource lock
//! whose creation is guarded by a global lock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::adapters::state::file::FileStateBackend;
use crate::adapters::state::memory::MemoryStateBackend;
use crate::adapters::state::sqlite::SqliteStateBackend;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::config::{PersistenceKind, StateManagerConfig};
use crate::domain::models::health::{HealthLevel, HealthStatus};
use crate::domain::models::state::{
    ResourceState, ResourceType, StateEntry, StateSnapshot, StateValue, StoreSnapshot,
    TransitionValidator,
};
use crate::domain::ports::state_backend::StateBackend;
use crate::services::event_bus::{
    EventBus, EventKind, EventPayload, EventPriority, MetricPayload, MonitoringErrorPayload,
    ResourceStatePayload,
};

const SOURCE_ID: &str = "state_manager";

/// How often a transition triggers a periodic snapshot.
const SNAPSHOT_CADENCE: usize = 10;

/// Hand-rolled LRU keyed by resource id. Reads refresh recency;
/// eviction removes the least-recently-used entry.
struct LruCache {
    entries: HashMap<String, StateEntry>,
    order: VecDeque<String>,
    capacity: usize,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&mut self, key: &str) -> Option<StateEntry> {
        if let Some(entry) = self.entries.get(key) {
            let entry = entry.clone();
            self.touch(key);
            Some(entry)
        } else {
            None
        }
    }

    fn insert(&mut self, key: String, entry: StateEntry) {
        self.entries.insert(key.clone(), entry);
        self.touch(&key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.order.retain(|k| k != key);
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }
}

#[derive(Debug, Default, Clone)]
struct StateMetrics {
    set_state_count: u64,
    get_state_count: u64,
    get_history_count: u64,
    cache_hits: u64,
    cache_misses: u64,
    transition_failures: u64,
    backend_errors: u64,
    resource_count: u64,
}

/// The state manager. Construct one per process and share it as an
/// `Arc`; all concurrent mutation goes through per-resource locks.
pub struct StateManager {
    backend: Arc<dyn StateBackend>,
    bus: Arc<EventBus>,
    config: StateManagerConfig,
    cache: StdMutex<LruCache>,
    validator: TransitionValidator,
    resource_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    metrics: Option<StdMutex<StateMetrics>>,
    cleanup_shutdown: watch::Sender<bool>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl StateManager {
    /// Build a manager with the backend named by the configuration and
    /// run first-time initialization (cache warm-up, auto-repair).
    pub async fn new(bus: Arc<EventBus>, config: StateManagerConfig) -> DomainResult<Arc<Self>> {
        let backend: Arc<dyn StateBackend> = match &config.persistence {
            PersistenceKind::Memory => Arc::new(MemoryStateBackend::new()),
            PersistenceKind::File { storage_dir } => {
                Arc::new(FileStateBackend::new(storage_dir).await?)
            }
            PersistenceKind::Sqlite { db_path } => {
                Arc::new(SqliteStateBackend::new(db_path).await?)
            }
            PersistenceKind::Custom => {
                return Err(DomainError::Storage(
                    "custom persistence requires with_backend".to_string(),
                ))
            }
        };
        Self::with_backend(bus, config, backend).await
    }

    /// Build a manager around a caller-supplied backend.
    pub async fn with_backend(
        bus: Arc<EventBus>,
        config: StateManagerConfig,
        backend: Arc<dyn StateBackend>,
    ) -> DomainResult<Arc<Self>> {
        let metrics = config
            .enable_metrics
            .then(|| StdMutex::new(StateMetrics::default()));
        let (cleanup_shutdown, _) = watch::channel(false);
        let manager = Arc::new(Self {
            backend,
            bus,
            cache: StdMutex::new(LruCache::new(config.cache_size)),
            validator: TransitionValidator::new(),
            resource_locks: Mutex::new(HashMap::new()),
            metrics,
            cleanup_shutdown,
            cleanup_task: Mutex::new(None),
            config,
        });
        manager.initialize().await;
        Ok(manager)
    }

    /// Load recent entries into the cache and run repair if configured.
    async fn initialize(&self) {
        match self.backend.get_all_resource_ids().await {
            Ok(resource_ids) => {
                tracing::info!(
                    count = resource_ids.len(),
                    "loading resources from persistence"
                );
                for resource_id in resource_ids.iter().take(self.config.cache_size) {
                    match self.backend.load_state(resource_id).await {
                        Ok(Some(entry)) => {
                            self.cache
                                .lock()
                                .expect("cache lock poisoned")
                                .insert(resource_id.clone(), entry);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!("error warming cache for {resource_id}: {e}");
                            self.count_backend_error();
                        }
                    }
                }
                if let Some(metrics) = &self.metrics {
                    metrics.lock().expect("metrics lock poisoned").resource_count =
                        resource_ids.len() as u64;
                }
            }
            Err(e) => {
                tracing::error!("error initializing state manager: {e}");
                self.count_backend_error();
            }
        }

        if self.config.auto_repair {
            match self.backend.repair().await {
                Ok(results) if !results.is_empty() => {
                    tracing::info!(?results, "auto-repair completed");
                }
                Ok(_) => {}
                Err(e) => tracing::error!("auto-repair failed: {e}"),
            }
        }
    }

    async fn resource_lock(&self, resource_id: &str) -> Arc<Mutex<()>> {
        // Lock-map construction happens under the global lock so two
        // tasks can never race to create different locks for one id.
        let mut locks = self.resource_locks.lock().await;
        Arc::clone(
            locks
                .entry(resource_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Set state with transition validation, history append, cache
    /// update, snapshot cadence, and change event emission.
    pub async fn set_state(
        &self,
        resource_id: &str,
        state: impl Into<StateValue>,
        resource_type: ResourceType,
        metadata: Option<HashMap<String, Value>>,
        transition_reason: Option<String>,
        failure_info: Option<HashMap<String, Value>>,
    ) -> DomainResult<StateEntry> {
        let state = state.into();
        if let Some(metrics) = &self.metrics {
            metrics.lock().expect("metrics lock poisoned").set_state_count += 1;
        }

        let lock = self.resource_lock(resource_id).await;
        let _guard = lock.lock().await;

        let current = {
            let cached = self
                .cache
                .lock()
                .expect("cache lock poisoned")
                .get(resource_id);
            match cached {
                Some(entry) => Some(entry),
                None => match self.backend.load_state(resource_id).await {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::error!("error loading state for {resource_id}: {e}");
                        self.count_backend_error();
                        None
                    }
                },
            }
        };

        let state_changed = current.as_ref().is_none_or(|c| c.state != state);

        if let Some(current) = &current {
            if current.state.is_enum() && state.is_enum() {
                if let Err(e) = self.validator.check(&current.state, &state) {
                    tracing::warn!("invalid transition for {resource_id}: {e}");
                    if let Some(metrics) = &self.metrics {
                        metrics
                            .lock()
                            .expect("metrics lock poisoned")
                            .transition_failures += 1;
                    }
                    return Err(e);
                }
            }
        }

        let entry = StateEntry {
            state: state.clone(),
            resource_type,
            timestamp: Utc::now(),
            metadata: metadata.clone().unwrap_or_default(),
            version: current.as_ref().map_or(1, |c| c.version + 1),
            previous_state: current.as_ref().map(|c| c.state.to_string()),
            transition_reason: transition_reason.clone(),
            failure_info: failure_info.clone(),
        };

        self.cache
            .lock()
            .expect("cache lock poisoned")
            .insert(resource_id.to_string(), entry.clone());

        if let Err(e) = self.backend.save_state(resource_id, &entry).await {
            tracing::error!("error persisting state for {resource_id}: {e}");
            self.count_backend_error();
        }

        // Periodic snapshot every Nth transition.
        match self.backend.load_history(resource_id, None).await {
            Ok(history) if !history.is_empty() && history.len() % SNAPSHOT_CADENCE == 0 => {
                self.create_snapshot(resource_id, &entry, "periodic").await;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("error checking snapshot cadence for {resource_id}: {e}");
                self.count_backend_error();
            }
        }

        if state_changed {
            self.emit_state_changed(resource_id, &entry);
        }

        Ok(entry)
    }

    fn emit_state_changed(&self, resource_id: &str, entry: &StateEntry) {
        let failure_info = entry
            .failure_info
            .as_ref()
            .and_then(|info| serde_json::to_value(info).ok());
        self.bus.emit(
            EventKind::ResourceStateChanged,
            SOURCE_ID,
            EventPayload::ResourceState(ResourceStatePayload {
                resource_id: resource_id.to_string(),
                state: entry.state.to_string(),
                resource_type: entry.resource_type.to_string(),
                previous_state: entry.previous_state.clone(),
                transition_reason: entry.transition_reason.clone(),
                failure_info,
                metadata: entry.metadata.clone(),
            }),
        );
    }

    /// Get the current state, or a specific version from history.
    /// Version lookups always bypass the cache.
    pub async fn get_state(
        &self,
        resource_id: &str,
        version: Option<u64>,
        use_cache: bool,
    ) -> Option<StateEntry> {
        if let Some(metrics) = &self.metrics {
            metrics.lock().expect("metrics lock poisoned").get_state_count += 1;
        }

        if let Some(version) = version {
            return match self.backend.load_history(resource_id, None).await {
                Ok(history) => history.into_iter().find(|e| e.version == version),
                Err(e) => {
                    tracing::error!("error loading history for {resource_id}: {e}");
                    self.count_backend_error();
                    None
                }
            };
        }

        if use_cache {
            let cached = self
                .cache
                .lock()
                .expect("cache lock poisoned")
                .get(resource_id);
            if let Some(entry) = cached {
                if let Some(metrics) = &self.metrics {
                    metrics.lock().expect("metrics lock poisoned").cache_hits += 1;
                }
                return Some(entry);
            }
            if let Some(metrics) = &self.metrics {
                metrics.lock().expect("metrics lock poisoned").cache_misses += 1;
            }
        }

        match self.backend.load_state(resource_id).await {
            Ok(Some(entry)) => {
                if use_cache {
                    self.cache
                        .lock()
                        .expect("cache lock poisoned")
                        .insert(resource_id.to_string(), entry.clone());
                }
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::error!("error loading state for {resource_id}: {e}");
                self.count_backend_error();
                None
            }
        }
    }

    /// Chronological transition history.
    pub async fn get_history(&self, resource_id: &str, limit: Option<usize>) -> Vec<StateEntry> {
        if let Some(metrics) = &self.metrics {
            metrics
                .lock()
                .expect("metrics lock poisoned")
                .get_history_count += 1;
        }
        match self.backend.load_history(resource_id, limit).await {
            Ok(history) => history,
            Err(e) => {
                tracing::error!("error loading history for {resource_id}: {e}");
                self.count_backend_error();
                Vec::new()
            }
        }
    }

    pub async fn get_snapshots(
        &self,
        resource_id: &str,
        limit: Option<usize>,
    ) -> Vec<StateSnapshot> {
        match self.backend.load_snapshots(resource_id, limit).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                tracing::error!("error loading snapshots for {resource_id}: {e}");
                self.count_backend_error();
                Vec::new()
            }
        }
    }

    async fn create_snapshot(&self, resource_id: &str, entry: &StateEntry, reason: &str) {
        match StateSnapshot::from_entry(entry, reason) {
            Ok(snapshot) => {
                if let Err(e) = self.backend.save_snapshot(resource_id, &snapshot).await {
                    tracing::error!("error creating snapshot for {resource_id}: {e}");
                    self.count_backend_error();
                } else {
                    tracing::debug!("created snapshot for {resource_id}");
                }
            }
            Err(e) => tracing::error!("error serializing snapshot for {resource_id}: {e}"),
        }
    }

    /// Re-apply a per-resource snapshot as a fresh state entry.
    /// Negative indexes count from the newest snapshot.
    pub async fn recover_from_snapshot(
        &self,
        resource_id: &str,
        snapshot_index: isize,
    ) -> Option<StateEntry> {
        let snapshots = self.get_snapshots(resource_id, None).await;
        if snapshots.is_empty() {
            tracing::warn!("no snapshots found for {resource_id}");
            return None;
        }
        let index = if snapshot_index < 0 {
            snapshots.len().checked_sub(snapshot_index.unsigned_abs())?
        } else {
            snapshot_index.unsigned_abs()
        };
        let snapshot = snapshots.get(index)?;

        let state: StateValue = snapshot
            .state
            .get("state")
            .and_then(|v| serde_json::from_value(v.clone()).ok())?;
        let metadata: HashMap<String, Value> = snapshot
            .state
            .get("metadata")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        self.set_state(
            resource_id,
            state,
            snapshot.resource_type,
            Some(metadata),
            Some("recovered_from_snapshot".to_string()),
            None,
        )
        .await
        .ok()
    }

    /// Whole-store capture.
    pub async fn get_snapshot(&self) -> StoreSnapshot {
        let mut states = HashMap::new();
        if let Ok(resource_ids) = self.backend.get_all_resource_ids().await {
            for resource_id in resource_ids {
                if let Some(entry) = self.get_state(&resource_id, None, false).await {
                    states.insert(resource_id, entry);
                }
            }
        }
        StoreSnapshot {
            states,
            timestamp: Utc::now(),
        }
    }

    /// Replace the whole store with the captured one.
    pub async fn restore_snapshot(&self, snapshot: &StoreSnapshot) -> DomainResult<()> {
        self.backend.clear_all_states().await?;
        self.cache.lock().expect("cache lock poisoned").clear();
        for (resource_id, entry) in &snapshot.states {
            self.backend.save_state(resource_id, entry).await?;
            self.cache
                .lock()
                .expect("cache lock poisoned")
                .insert(resource_id.clone(), entry.clone());
        }
        Ok(())
    }

    /// Per-resource or global wipe.
    pub async fn clear_state(&self, resource_id: Option<&str>) -> bool {
        match resource_id {
            Some(resource_id) => {
                self.cache
                    .lock()
                    .expect("cache lock poisoned")
                    .remove(resource_id);
                self.backend.delete_state(resource_id).await.unwrap_or(false)
            }
            None => {
                self.cache.lock().expect("cache lock poisoned").clear();
                self.backend.clear_all_states().await.is_ok()
            }
        }
    }

    /// Mark a resource FAILED with structured failure info.
    pub async fn mark_as_failed(
        &self,
        resource_id: &str,
        reason: &str,
        error_info: Option<HashMap<String, Value>>,
    ) -> Option<StateEntry> {
        let current = self.get_state(resource_id, None, true).await?;
        let StateValue::Resource(state) = current.state else {
            tracing::warn!("cannot mark non-resource state {resource_id} as failed");
            return None;
        };
        if !self
            .validator
            .is_valid(&state.into(), &ResourceState::Failed.into())
        {
            tracing::warn!("cannot transition {resource_id} from {state} to FAILED");
            return None;
        }

        let mut failure_info = error_info.unwrap_or_default();
        failure_info.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        failure_info.insert("reason".to_string(), Value::String(reason.to_string()));

        self.set_state(
            resource_id,
            ResourceState::Failed,
            current.resource_type,
            Some(current.metadata),
            Some(reason.to_string()),
            Some(failure_info),
        )
        .await
        .ok()
    }

    /// Move a FAILED resource to RECOVERED.
    pub async fn mark_as_recovered(&self, resource_id: &str, reason: &str) -> Option<StateEntry> {
        let current = self.get_state(resource_id, None, true).await?;
        if current.state.as_resource() != Some(ResourceState::Failed) {
            tracing::warn!("cannot recover {resource_id}: not in FAILED state");
            return None;
        }
        self.set_state(
            resource_id,
            ResourceState::Recovered,
            current.resource_type,
            Some(current.metadata),
            Some(reason.to_string()),
            None,
        )
        .await
        .ok()
    }

    /// Transition to TERMINATED and take a final snapshot.
    pub async fn terminate_resource(&self, resource_id: &str, reason: &str) -> Option<StateEntry> {
        let current = self.get_state(resource_id, None, true).await?;
        let StateValue::Resource(state) = current.state else {
            tracing::warn!("cannot terminate non-resource state {resource_id}");
            return None;
        };
        if state == ResourceState::Terminated {
            return Some(current);
        }
        let entry = self
            .set_state(
                resource_id,
                ResourceState::Terminated,
                current.resource_type,
                Some(current.metadata),
                Some(reason.to_string()),
                None,
            )
            .await
            .ok()?;
        self.create_snapshot(resource_id, &entry, "terminated").await;
        Some(entry)
    }

    pub async fn count_resources_by_state(&self) -> HashMap<String, u64> {
        let mut counts: HashMap<String, u64> = HashMap::new();
        if let Ok(resource_ids) = self.backend.get_all_resource_ids().await {
            for resource_id in resource_ids {
                if let Some(entry) = self.get_state(&resource_id, None, true).await {
                    *counts.entry(entry.state.to_string()).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    pub async fn get_resources_by_state(&self, state: &StateValue) -> Vec<String> {
        let target = state.to_string();
        let mut matching = Vec::new();
        if let Ok(resource_ids) = self.backend.get_all_resource_ids().await {
            for resource_id in resource_ids {
                if let Some(entry) = self.get_state(&resource_id, None, true).await {
                    if entry.state.to_string() == target {
                        matching.push(resource_id);
                    }
                }
            }
        }
        matching
    }

    pub async fn get_keys_by_prefix(&self, prefix: &str) -> Vec<String> {
        match self.backend.get_all_resource_ids().await {
            Ok(ids) => ids.into_iter().filter(|id| id.starts_with(prefix)).collect(),
            Err(e) => {
                tracing::error!("error listing keys by prefix: {e}");
                Vec::new()
            }
        }
    }

    /// Keys with the prefix together with their current entries.
    pub async fn get_states_by_prefix(&self, prefix: &str) -> Vec<(String, StateEntry)> {
        let mut results = Vec::new();
        for key in self.get_keys_by_prefix(prefix).await {
            if let Some(entry) = self.get_state(&key, None, true).await {
                results.push((key, entry));
            }
        }
        results
    }

    /// Remove expired data through the backend. Forced cleanup halves
    /// the effective TTL.
    pub async fn cleanup(&self, force: bool) -> u64 {
        let Some(cleanup) = &self.config.cleanup else {
            tracing::debug!("no cleanup config, skipping cleanup");
            return 0;
        };
        let ttl = if force {
            (cleanup.ttl_seconds / 2).max(1)
        } else {
            cleanup.ttl_seconds
        };
        let older_than = Utc::now() - ChronoDuration::seconds(ttl as i64);

        match self.backend.cleanup(Some(older_than)).await {
            Ok(removed) => {
                if let Some(metrics) = &self.metrics {
                    if let Ok(resource_ids) = self.backend.get_all_resource_ids().await {
                        metrics.lock().expect("metrics lock poisoned").resource_count =
                            resource_ids.len() as u64;
                    }
                }
                tracing::info!(removed, force, "state manager cleanup completed");
                let mut metadata = HashMap::new();
                metadata.insert("forced".to_string(), Value::Bool(force));
                self.bus.emit(
                    EventKind::MetricRecorded,
                    SOURCE_ID,
                    EventPayload::Metric(MetricPayload {
                        metric: "state_cleanup".to_string(),
                        value: removed as f64,
                        metadata,
                    }),
                );
                removed
            }
            Err(e) => {
                tracing::error!("error during state manager cleanup: {e}");
                self.bus.emit_with_priority(
                    EventKind::ResourceErrorOccurred,
                    SOURCE_ID,
                    EventPayload::MonitoringError(MonitoringErrorPayload {
                        component_id: SOURCE_ID.to_string(),
                        operation: "cleanup".to_string(),
                        error_type: "cleanup_error".to_string(),
                        severity: "DEGRADED".to_string(),
                        message: e.to_string(),
                    }),
                    EventPriority::High,
                );
                0
            }
        }
    }

    /// Start the periodic cleanup loop. Idempotent.
    pub async fn start_cleanup_task(self: &Arc<Self>) {
        let Some(cleanup) = self.config.cleanup.clone() else {
            tracing::warn!("no cleanup configuration provided, cleanup task not started");
            return;
        };
        let mut guard = self.cleanup_task.lock().await;
        if guard.is_some() {
            tracing::warn!("cleanup task already running");
            return;
        }
        let manager = Arc::clone(self);
        let mut shutdown_rx = self.cleanup_shutdown.subscribe();
        let interval = std::time::Duration::from_secs(cleanup.interval_seconds());
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
                let removed = manager.cleanup(false).await;
                tracing::debug!(removed, "cleanup pass finished");
            }
        }));
        tracing::info!(policy = ?cleanup.policy, "started state cleanup task");
    }

    /// Stop the cleanup loop, waiting for an in-flight pass to drain.
    pub async fn stop_cleanup_task(&self) {
        let handle = self.cleanup_task.lock().await.take();
        if let Some(handle) = handle {
            let _ = self.cleanup_shutdown.send(true);
            if let Err(e) = handle.await {
                tracing::error!("cleanup task panicked: {e}");
            }
            tracing::info!("stopped state cleanup task");
        }
    }

    /// Backend-specific maintenance: history compaction, vacuum.
    pub async fn compact_storage(&self) -> HashMap<String, u64> {
        match self.backend.compact().await {
            Ok(results) => results,
            Err(e) => {
                tracing::error!("error during storage compaction: {e}");
                HashMap::new()
            }
        }
    }

    /// Operation counters plus backend and cache statistics.
    pub async fn get_metrics(&self) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        let Some(metrics) = &self.metrics else {
            out.insert("metrics_disabled".to_string(), Value::Bool(true));
            return out;
        };
        let snapshot = metrics.lock().expect("metrics lock poisoned").clone();
        out.insert("set_state_count".into(), json!(snapshot.set_state_count));
        out.insert("get_state_count".into(), json!(snapshot.get_state_count));
        out.insert(
            "get_history_count".into(),
            json!(snapshot.get_history_count),
        );
        out.insert("cache_hits".into(), json!(snapshot.cache_hits));
        out.insert("cache_misses".into(), json!(snapshot.cache_misses));
        out.insert(
            "transition_failures".into(),
            json!(snapshot.transition_failures),
        );
        out.insert("backend_errors".into(), json!(snapshot.backend_errors));
        out.insert("resource_count".into(), json!(snapshot.resource_count));

        if let Ok(stats) = self.backend.stats().await {
            out.extend(stats);
        }
        out.insert(
            "cache_size".into(),
            json!(self.cache.lock().expect("cache lock poisoned").len()),
        );
        out.insert("cache_capacity".into(), json!(self.config.cache_size));
        out
    }

    /// Health heuristics: high resource counts, repeated backend
    /// errors, or an oversized database degrade the status.
    pub async fn get_health_status(&self) -> HealthStatus {
        let mut status = HealthLevel::Healthy;
        let mut description = "State manager operating normally".to_string();
        let mut metadata = HashMap::new();

        let (resource_count, backend_errors) = if let Some(metrics) = &self.metrics {
            let snapshot = metrics.lock().expect("metrics lock poisoned").clone();
            (snapshot.resource_count, snapshot.backend_errors)
        } else {
            let count = self
                .backend
                .get_all_resource_ids()
                .await
                .map(|ids| ids.len() as u64)
                .unwrap_or(0);
            (count, 0)
        };
        metadata.insert("resource_count".to_string(), json!(resource_count));
        metadata.insert("backend_errors".to_string(), json!(backend_errors));

        if resource_count > 10_000 {
            status = HealthLevel::Degraded;
            description = "High resource count, performance may be affected".to_string();
        }
        if backend_errors > 100 {
            status = HealthLevel::Degraded;
            description = "Multiple backend errors detected".to_string();
        }
        if let Ok(stats) = self.backend.stats().await {
            if let Some(size) = stats
                .get("database_size_bytes")
                .and_then(serde_json::Value::as_u64)
            {
                if size > 100 * 1024 * 1024 {
                    status = HealthLevel::Degraded;
                    description = "Database size is large, consider optimization".to_string();
                }
            }
            metadata.extend(stats);
        }

        HealthStatus::new(status, SOURCE_ID, description).with_metadata(metadata)
    }

    pub fn backend(&self) -> Arc<dyn StateBackend> {
        Arc::clone(&self.backend)
    }

    fn count_backend_error(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.lock().expect("metrics lock poisoned").backend_errors += 1;
        }
    }
}

/// Event handler that reacts to high-water alerts by forcing an
/// aggressive cleanup pass. Register it against RESOURCE_ALERT_CREATED.
pub struct AlertCleanupHandler {
    manager: std::sync::Weak<StateManager>,
}

impl AlertCleanupHandler {
    pub fn new(manager: &Arc<StateManager>) -> Arc<Self> {
        Arc::new(Self {
            manager: Arc::downgrade(manager),
        })
    }
}

#[async_trait::async_trait]
impl crate::services::event_bus::EventHandler for AlertCleanupHandler {
    fn name(&self) -> &str {
        "state_manager_alert_cleanup"
    }

    async fn handle(&self, event: crate::services::event_bus::Event) -> anyhow::Result<()> {
        if let Some(manager) = self.manager.upgrade() {
            tracing::warn!(event = %event.kind, "alert received, forcing cleanup");
            manager.cleanup(true).await;
        }
        Ok(())
    }
}
