//! Event system health monitoring and tracing.
//!
//! [`EventSystemMonitor`] watches the bus through a wildcard
//! subscription, keeps emission-rate and error-rate windows, and
//! periodically emits a SYSTEM_HEALTH_CHANGED rollup plus saturation
//! alerts. [`EventTracer`] records correlation-keyed event traces for
//! debugging.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::event_bus::{
    AlertPayload, Event, EventBus, EventHandler, EventKind, EventPayload, HealthPayload, WILDCARD,
};

const MONITOR_HANDLER: &str = "event_system_monitor";
const TRACER_HANDLER: &str = "event_tracer";

/// Health metrics for the event system.
#[derive(Debug, Clone, Serialize)]
pub struct EventSystemHealth {
    /// Counts by event type.
    pub event_counts: HashMap<String, u64>,
    /// Events per second by type over the sample window.
    pub emission_rates: HashMap<String, f64>,
    /// Queue depths by priority: [high, normal, low].
    pub queue_depths: [usize; 3],
    /// Error counts by source event type.
    pub error_counts: HashMap<String, u64>,
}

impl EventSystemHealth {
    /// Compressed view for the periodic health event.
    pub fn summary(&self) -> serde_json::Value {
        let mut busiest: Vec<(&String, &u64)> = self.event_counts.iter().collect();
        busiest.sort_by(|a, b| b.1.cmp(a.1));
        busiest.truncate(5);
        json!({
            "total_events_processed": self.event_counts.values().sum::<u64>(),
            "event_types": self.event_counts.len(),
            "max_emission_rate": self
                .emission_rates
                .values()
                .fold(0.0_f64, |acc, &r| acc.max(r)),
            "queue_status": {
                "high": self.queue_depths[0],
                "normal": self.queue_depths[1],
                "low": self.queue_depths[2],
            },
            "busy_event_types": busiest
                .into_iter()
                .map(|(k, v)| json!([k, v]))
                .collect::<Vec<_>>(),
        })
    }
}

struct MonitorState {
    active: AtomicBool,
    counts: StdMutex<HashMap<String, u64>>,
    timestamps: StdMutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    error_counts: StdMutex<HashMap<String, u64>>,
    sample_window: usize,
}

struct MonitorHandler {
    state: Arc<MonitorState>,
}

#[async_trait]
impl EventHandler for MonitorHandler {
    fn name(&self) -> &str {
        MONITOR_HANDLER
    }

    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        if !self.state.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        // Skip our own health events to avoid recursion.
        if event.kind == EventKind::SystemHealthChanged {
            return Ok(());
        }

        let type_name = event.kind.as_str().to_string();
        {
            let mut counts = self.state.counts.lock().expect("monitor lock poisoned");
            *counts.entry(type_name.clone()).or_insert(0) += 1;
        }
        {
            let mut stamps = self.state.timestamps.lock().expect("monitor lock poisoned");
            let window = stamps.entry(type_name.clone()).or_default();
            window.push_back(event.timestamp);
            while window.len() > self.state.sample_window {
                window.pop_front();
            }
        }
        if matches!(
            event.kind,
            EventKind::MonitoringErrorOccurred | EventKind::ResourceErrorOccurred
        ) {
            let source = match &event.payload {
                EventPayload::MonitoringError(p) => p.component_id.clone(),
                _ => event.source_id.clone(),
            };
            let mut errors = self
                .state
                .error_counts
                .lock()
                .expect("monitor lock poisoned");
            *errors.entry(source).or_insert(0) += 1;
        }
        Ok(())
    }
}

/// Monitor for the event system's health and metrics.
pub struct EventSystemMonitor {
    bus: Arc<EventBus>,
    state: Arc<MonitorState>,
    check_interval: Duration,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventSystemMonitor {
    pub fn new(bus: Arc<EventBus>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bus,
            state: Arc::new(MonitorState {
                active: AtomicBool::new(false),
                counts: StdMutex::new(HashMap::new()),
                timestamps: StdMutex::new(HashMap::new()),
                error_counts: StdMutex::new(HashMap::new()),
                sample_window: 100,
            }),
            check_interval: Duration::from_secs(60),
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Subscribe to the bus and start the periodic health check.
    pub async fn start_monitoring(&self) {
        if self.state.active.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bus
            .subscribe(
                WILDCARD,
                Arc::new(MonitorHandler {
                    state: Arc::clone(&self.state),
                }),
            )
            .await;

        let bus = Arc::clone(&self.bus);
        let state = Arc::clone(&self.state);
        let interval = self.check_interval;
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut guard = self.task.lock().await;
        *guard = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
                let health = compute_health(&state, &bus);
                let mut metrics = HashMap::new();
                metrics.insert("summary".to_string(), health.summary());
                bus.emit(
                    EventKind::SystemHealthChanged,
                    MONITOR_HANDLER,
                    EventPayload::Health(HealthPayload {
                        component: "event_system".to_string(),
                        status: "HEALTHY".to_string(),
                        description: "Event system health check".to_string(),
                        metrics,
                    }),
                );

                let [high, normal, _] = health.queue_depths;
                if high > 100 || normal > 500 {
                    tracing::warn!(high, normal, "event queue saturation");
                    bus.emit(
                        EventKind::ResourceAlertCreated,
                        MONITOR_HANDLER,
                        EventPayload::Alert(AlertPayload {
                            alert_type: "event_queue_saturation".to_string(),
                            level: "WARNING".to_string(),
                            description: format!(
                                "Event queue saturation detected: high={high}, normal={normal}"
                            ),
                            metadata: HashMap::new(),
                        }),
                    );
                }
            }
        }));
        tracing::info!("event system monitoring started");
    }

    /// Unsubscribe and stop the periodic check.
    pub async fn stop_monitoring(&self) {
        if !self.state.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.bus.unsubscribe(WILDCARD, MONITOR_HANDLER).await;
        let _ = self.shutdown.send(true);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!("event system monitoring stopped");
    }

    pub fn health_metrics(&self) -> EventSystemHealth {
        compute_health(&self.state, &self.bus)
    }

    pub fn reset_metrics(&self) {
        self.state
            .counts
            .lock()
            .expect("monitor lock poisoned")
            .clear();
        self.state
            .timestamps
            .lock()
            .expect("monitor lock poisoned")
            .clear();
        self.state
            .error_counts
            .lock()
            .expect("monitor lock poisoned")
            .clear();
    }
}

fn compute_health(state: &MonitorState, bus: &EventBus) -> EventSystemHealth {
    let counts = state
        .counts
        .lock()
        .expect("monitor lock poisoned")
        .clone();
    let error_counts = state
        .error_counts
        .lock()
        .expect("monitor lock poisoned")
        .clone();

    let mut emission_rates = HashMap::new();
    let stamps = state.timestamps.lock().expect("monitor lock poisoned");
    for (event_type, window) in stamps.iter() {
        if window.len() >= 2 {
            let span = (*window.back().expect("nonempty") - *window.front().expect("nonempty"))
                .num_milliseconds() as f64
                / 1_000.0;
            if span > 0.0 {
                emission_rates.insert(event_type.clone(), window.len() as f64 / span);
            }
        }
    }

    EventSystemHealth {
        event_counts: counts,
        emission_rates,
        queue_depths: bus.queue_depths(),
        error_counts,
    }
}

/// One recorded event within a trace.
#[derive(Debug, Clone, Serialize)]
pub struct TracedEvent {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub payload: serde_json::Value,
}

struct TracerState {
    active: AtomicBool,
    traces: StdMutex<HashMap<String, VecDeque<TracedEvent>>>,
    max_trace_size: usize,
    max_traces: usize,
}

struct TracerHandler {
    state: Arc<TracerState>,
}

#[async_trait]
impl EventHandler for TracerHandler {
    fn name(&self) -> &str {
        TRACER_HANDLER
    }

    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        if !self.state.active.load(Ordering::SeqCst) {
            return Ok(());
        }
        let key = event
            .correlation_id
            .map_or_else(|| "untracked".to_string(), |id| id.to_string());
        let traced = TracedEvent {
            event_type: event.kind.as_str().to_string(),
            timestamp: event.timestamp,
            source_id: event.source_id.clone(),
            payload: serde_json::to_value(&event.payload)?,
        };

        let mut traces = self.state.traces.lock().expect("tracer lock poisoned");
        if !traces.contains_key(&key) && traces.len() >= self.state.max_traces {
            // Evict an arbitrary existing trace to bound memory.
            if let Some(oldest) = traces.keys().next().cloned() {
                traces.remove(&oldest);
            }
        }
        let trace = traces.entry(key).or_default();
        trace.push_back(traced);
        while trace.len() > self.state.max_trace_size {
            trace.pop_front();
        }
        Ok(())
    }
}

/// Correlation-keyed event tracing for debugging and analysis.
pub struct EventTracer {
    bus: Arc<EventBus>,
    state: Arc<TracerState>,
    tracked_types: Mutex<Vec<String>>,
}

impl EventTracer {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            state: Arc::new(TracerState {
                active: AtomicBool::new(false),
                traces: StdMutex::new(HashMap::new()),
                max_trace_size: 1_000,
                max_traces: 100,
            }),
            tracked_types: Mutex::new(Vec::new()),
        }
    }

    /// Start tracing the given event types, or all events when `None`.
    pub async fn start_tracing(&self, event_types: Option<Vec<String>>) {
        if self.state.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let handler = Arc::new(TracerHandler {
            state: Arc::clone(&self.state),
        });
        let mut tracked = self.tracked_types.lock().await;
        match event_types {
            Some(types) => {
                for event_type in &types {
                    self.bus
                        .subscribe(event_type, Arc::clone(&handler) as Arc<dyn EventHandler>)
                        .await;
                }
                *tracked = types;
            }
            None => {
                self.bus.subscribe(WILDCARD, handler).await;
                *tracked = vec![WILDCARD.to_string()];
            }
        }
    }

    pub async fn stop_tracing(&self) {
        if !self.state.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let tracked = {
            let mut guard = self.tracked_types.lock().await;
            std::mem::take(&mut *guard)
        };
        for event_type in tracked {
            self.bus.unsubscribe(&event_type, TRACER_HANDLER).await;
        }
    }

    pub fn trace(&self, correlation_id: &str) -> Vec<TracedEvent> {
        self.state
            .traces
            .lock()
            .expect("tracer lock poisoned")
            .get(correlation_id)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_traces(&self) {
        self.state
            .traces
            .lock()
            .expect("tracer lock poisoned")
            .clear();
    }
}
