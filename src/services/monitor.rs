//! System monitoring: in-flight operations, health rollups, memory
//! tracking, and metric recording.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::domain::models::health::{HealthLevel, HealthStatus};
use crate::services::event_bus::{
    AlertPayload, EventBus, EventKind, EventPayload, EventPriority, HealthPayload, MetricPayload,
};

/// One registered long-running operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub operation_id: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

/// Ledger of in-flight operations, used by timeout isolation to make
/// stuck stages visible.
#[derive(Default)]
pub struct SystemMonitor {
    operations: StdMutex<HashMap<String, OperationRecord>>,
}

impl SystemMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_operation(&self, operation_id: &str, metadata: HashMap<String, Value>) {
        let now = Utc::now();
        self.operations.lock().expect("operations poisoned").insert(
            operation_id.to_string(),
            OperationRecord {
                operation_id: operation_id.to_string(),
                status: "running".to_string(),
                started_at: now,
                updated_at: now,
                metadata,
            },
        );
    }

    pub fn update_operation(
        &self,
        operation_id: &str,
        status: &str,
        updates: HashMap<String, Value>,
    ) {
        let mut operations = self.operations.lock().expect("operations poisoned");
        if let Some(record) = operations.get_mut(operation_id) {
            record.status = status.to_string();
            record.updated_at = Utc::now();
            record.metadata.extend(updates);
        }
    }

    pub fn operation(&self, operation_id: &str) -> Option<OperationRecord> {
        self.operations
            .lock()
            .expect("operations poisoned")
            .get(operation_id)
            .cloned()
    }

    /// Operations still marked running.
    pub fn running_operations(&self) -> Vec<OperationRecord> {
        self.operations
            .lock()
            .expect("operations poisoned")
            .values()
            .filter(|r| r.status == "running")
            .cloned()
            .collect()
    }

    pub fn clear_finished(&self) {
        self.operations
            .lock()
            .expect("operations poisoned")
            .retain(|_, r| r.status == "running");
    }
}

/// Worst-status aggregation over per-source health samples.
pub struct HealthTracker {
    bus: Arc<EventBus>,
    samples: StdMutex<HashMap<String, HealthStatus>>,
}

impl HealthTracker {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            samples: StdMutex::new(HashMap::new()),
        })
    }

    /// Record a sample and broadcast the change.
    pub fn update_health(&self, source_key: &str, status: HealthStatus) {
        let mut metrics = HashMap::new();
        metrics.insert("source_key".to_string(), json!(source_key));
        self.bus.emit(
            EventKind::ResourceHealthChanged,
            "health_tracker",
            EventPayload::Health(HealthPayload {
                component: status.source.clone(),
                status: status.status.to_string(),
                description: status.description.clone(),
                metrics,
            }),
        );
        self.samples
            .lock()
            .expect("health samples poisoned")
            .insert(source_key.to_string(), status);
    }

    pub fn health(&self, source_key: &str) -> Option<HealthStatus> {
        self.samples
            .lock()
            .expect("health samples poisoned")
            .get(source_key)
            .cloned()
    }

    /// System-wide rollup: the worst status across all sources.
    pub fn system_health(&self) -> HealthStatus {
        let samples = self.samples.lock().expect("health samples poisoned");
        let Some(worst) = samples.values().max_by_key(|s| s.status) else {
            return HealthStatus::healthy("health_tracker", "No health samples recorded");
        };
        let mut metadata = HashMap::new();
        metadata.insert("sources".to_string(), json!(samples.len()));
        metadata.insert("worst_source".to_string(), json!(worst.source));
        HealthStatus::new(
            worst.status,
            "health_tracker",
            format!("Worst status from {}: {}", worst.source, worst.description),
        )
        .with_metadata(metadata)
    }
}

/// Configuration for the memory monitor.
#[derive(Debug, Clone)]
pub struct MemoryMonitorConfig {
    /// Aggregate tracked size that triggers the high-water alert.
    pub high_water_mb: f64,
    /// Values below this size are not worth tracking.
    pub min_tracked_kb: f64,
}

impl Default for MemoryMonitorConfig {
    fn default() -> Self {
        Self {
            high_water_mb: 100.0,
            min_tracked_kb: 1.0,
        }
    }
}

struct MemoryState {
    tracked: HashMap<String, f64>,
    alert_active: bool,
}

/// Tracks the serialized size of large values held by agents and
/// managers. Crossing the high-water mark emits a HIGH-priority
/// RESOURCE_ALERT_CREATED, which downstream wiring answers with an
/// aggressive cleanup pass.
pub struct MemoryMonitor {
    bus: Arc<EventBus>,
    config: MemoryMonitorConfig,
    state: StdMutex<MemoryState>,
}

impl MemoryMonitor {
    pub fn new(bus: Arc<EventBus>, config: MemoryMonitorConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            state: StdMutex::new(MemoryState {
                tracked: HashMap::new(),
                alert_active: false,
            }),
        })
    }

    pub fn with_defaults(bus: Arc<EventBus>) -> Arc<Self> {
        Self::new(bus, MemoryMonitorConfig::default())
    }

    /// Track a JSON value by its serialized size. Trivial values are
    /// ignored.
    pub fn track_value(&self, resource_id: &str, value: &Value) {
        let size_mb = serde_json::to_string(value)
            .map(|s| s.len() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0);
        if size_mb * 1024.0 < self.config.min_tracked_kb {
            return;
        }
        self.track_resource(resource_id, size_mb);
    }

    pub fn track_resource(&self, resource_id: &str, size_mb: f64) {
        let crossed = {
            let mut state = self.state.lock().expect("memory state poisoned");
            state.tracked.insert(resource_id.to_string(), size_mb);
            let total: f64 = state.tracked.values().sum();
            if total > self.config.high_water_mb && !state.alert_active {
                state.alert_active = true;
                Some(total)
            } else {
                if total <= self.config.high_water_mb {
                    state.alert_active = false;
                }
                None
            }
        };

        if let Some(total) = crossed {
            tracing::warn!(
                total_mb = total,
                high_water_mb = self.config.high_water_mb,
                "tracked memory crossed high-water mark"
            );
            let mut metadata = HashMap::new();
            metadata.insert("total_mb".to_string(), json!(total));
            metadata.insert(
                "high_water_mb".to_string(),
                json!(self.config.high_water_mb),
            );
            self.bus.emit_with_priority(
                EventKind::ResourceAlertCreated,
                "memory_monitor",
                EventPayload::Alert(AlertPayload {
                    alert_type: "memory_high_water".to_string(),
                    level: "CRITICAL".to_string(),
                    description: format!(
                        "Tracked memory {total:.1} MiB exceeds high-water mark {:.1} MiB",
                        self.config.high_water_mb
                    ),
                    metadata,
                }),
                EventPriority::High,
            );
        }
    }

    pub fn remove_resource(&self, resource_id: &str) {
        let mut state = self.state.lock().expect("memory state poisoned");
        state.tracked.remove(resource_id);
        let total: f64 = state.tracked.values().sum();
        if total <= self.config.high_water_mb {
            state.alert_active = false;
        }
    }

    pub fn total_tracked_mb(&self) -> f64 {
        self.state
            .lock()
            .expect("memory state poisoned")
            .tracked
            .values()
            .sum()
    }

    pub fn tracked_count(&self) -> usize {
        self.state
            .lock()
            .expect("memory state poisoned")
            .tracked
            .len()
    }
}

/// Rolling statistics for one metric.
#[derive(Debug, Clone, Serialize)]
pub struct MetricStats {
    pub count: u64,
    pub last: f64,
    pub average: f64,
}

/// Records named metric samples, emitting METRIC_RECORDED for each and
/// keeping a bounded window for quick stats.
pub struct MetricsRecorder {
    bus: Arc<EventBus>,
    windows: StdMutex<HashMap<String, VecDeque<f64>>>,
    counts: StdMutex<HashMap<String, u64>>,
    window_size: usize,
}

impl MetricsRecorder {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            windows: StdMutex::new(HashMap::new()),
            counts: StdMutex::new(HashMap::new()),
            window_size: 100,
        })
    }

    pub fn record_metric(&self, metric: &str, value: f64, metadata: HashMap<String, Value>) {
        {
            let mut windows = self.windows.lock().expect("metric windows poisoned");
            let window = windows.entry(metric.to_string()).or_default();
            window.push_back(value);
            while window.len() > self.window_size {
                window.pop_front();
            }
        }
        {
            let mut counts = self.counts.lock().expect("metric counts poisoned");
            *counts.entry(metric.to_string()).or_insert(0) += 1;
        }
        self.bus.emit(
            EventKind::MetricRecorded,
            "metrics_recorder",
            EventPayload::Metric(MetricPayload {
                metric: metric.to_string(),
                value,
                metadata,
            }),
        );
    }

    pub fn stats(&self, metric: &str) -> Option<MetricStats> {
        let windows = self.windows.lock().expect("metric windows poisoned");
        let window = windows.get(metric)?;
        let last = *window.back()?;
        let average = window.iter().sum::<f64>() / window.len() as f64;
        let counts = self.counts.lock().expect("metric counts poisoned");
        Some(MetricStats {
            count: counts.get(metric).copied().unwrap_or(0),
            last,
            average,
        })
    }
}
