//! Prioritized event bus for cross-subsystem communication.
//!
//! Publishers enqueue into one of three priority queues; a dispatcher
//! task services HIGH until empty, then NORMAL, then LOW, yielding
//! between tiers so a full pass never starves the lower ones. Each
//! subscriber owns a bounded mailbox drained by its own worker task, so
//! a slow handler never blocks the rest. When a mailbox overflows, the
//! oldest LOW event is dropped first, then NORMAL, then HIGH, and every
//! drop is counted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::event_registry::EventRegistry;
use crate::domain::models::guideline::DetectedIssue;

/// Delivery priority of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    High,
    Normal,
    Low,
}

impl EventPriority {
    fn queue_index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

impl std::fmt::Display for EventPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        write!(f, "{name}")
    }
}

/// Catalogued event types plus an extension escape hatch for types the
/// registry has never seen. Emitting an extension type is permitted but
/// counted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    ResourceStateChanged,
    ResourceHealthChanged,
    ResourceCleanup,
    ResourceErrorOccurred,
    ResourceErrorResolved,
    ResourceErrorRecoveryStarted,
    ResourceErrorRecoveryCompleted,
    InterfaceStateChanged,
    AgentContextUpdated,
    ValidationCompleted,
    EarthValidationStarted,
    EarthValidationComplete,
    EarthValidationFailed,
    WaterPropagationStarted,
    WaterPropagationComplete,
    WaterPropagationRejected,
    WaterPropagationFailed,
    ComponentRefinementCreated,
    ComponentRefinementUpdated,
    ComponentRefinementIteration,
    ComponentValidationStateChanged,
    MetricRecorded,
    ResourceMetricRecorded,
    SystemHealthChanged,
    MonitoringErrorOccurred,
    ResourceAlertCreated,
    ResourceAlertUpdated,
    SystemAlert,
    AgentUpdateRequest,
    AgentUpdateComplete,
    AgentUpdateFailed,
    Extension(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ResourceStateChanged => "RESOURCE_STATE_CHANGED",
            Self::ResourceHealthChanged => "RESOURCE_HEALTH_CHANGED",
            Self::ResourceCleanup => "RESOURCE_CLEANUP",
            Self::ResourceErrorOccurred => "RESOURCE_ERROR_OCCURRED",
            Self::ResourceErrorResolved => "RESOURCE_ERROR_RESOLVED",
            Self::ResourceErrorRecoveryStarted => "RESOURCE_ERROR_RECOVERY_STARTED",
            Self::ResourceErrorRecoveryCompleted => "RESOURCE_ERROR_RECOVERY_COMPLETED",
            Self::InterfaceStateChanged => "INTERFACE_STATE_CHANGED",
            Self::AgentContextUpdated => "AGENT_CONTEXT_UPDATED",
            Self::ValidationCompleted => "VALIDATION_COMPLETED",
            Self::EarthValidationStarted => "EARTH_VALIDATION_STARTED",
            Self::EarthValidationComplete => "EARTH_VALIDATION_COMPLETE",
            Self::EarthValidationFailed => "EARTH_VALIDATION_FAILED",
            Self::WaterPropagationStarted => "WATER_PROPAGATION_STARTED",
            Self::WaterPropagationComplete => "WATER_PROPAGATION_COMPLETE",
            Self::WaterPropagationRejected => "WATER_PROPAGATION_REJECTED",
            Self::WaterPropagationFailed => "WATER_PROPAGATION_FAILED",
            Self::ComponentRefinementCreated => "COMPONENT_REFINEMENT_CREATED",
            Self::ComponentRefinementUpdated => "COMPONENT_REFINEMENT_UPDATED",
            Self::ComponentRefinementIteration => "COMPONENT_REFINEMENT_ITERATION",
            Self::ComponentValidationStateChanged => "COMPONENT_VALIDATION_STATE_CHANGED",
            Self::MetricRecorded => "METRIC_RECORDED",
            Self::ResourceMetricRecorded => "RESOURCE_METRIC_RECORDED",
            Self::SystemHealthChanged => "SYSTEM_HEALTH_CHANGED",
            Self::MonitoringErrorOccurred => "MONITORING_ERROR_OCCURRED",
            Self::ResourceAlertCreated => "RESOURCE_ALERT_CREATED",
            Self::ResourceAlertUpdated => "RESOURCE_ALERT_UPDATED",
            Self::SystemAlert => "SYSTEM_ALERT",
            Self::AgentUpdateRequest => "AGENT_UPDATE_REQUEST",
            Self::AgentUpdateComplete => "AGENT_UPDATE_COMPLETE",
            Self::AgentUpdateFailed => "AGENT_UPDATE_FAILED",
            Self::Extension(name) => name.as_str(),
        }
    }

    /// Parse a type string; unknown names become extensions.
    pub fn parse(s: &str) -> Self {
        match s {
            "RESOURCE_STATE_CHANGED" => Self::ResourceStateChanged,
            "RESOURCE_HEALTH_CHANGED" => Self::ResourceHealthChanged,
            "RESOURCE_CLEANUP" => Self::ResourceCleanup,
            "RESOURCE_ERROR_OCCURRED" => Self::ResourceErrorOccurred,
            "RESOURCE_ERROR_RESOLVED" => Self::ResourceErrorResolved,
            "RESOURCE_ERROR_RECOVERY_STARTED" => Self::ResourceErrorRecoveryStarted,
            "RESOURCE_ERROR_RECOVERY_COMPLETED" => Self::ResourceErrorRecoveryCompleted,
            "INTERFACE_STATE_CHANGED" => Self::InterfaceStateChanged,
            "AGENT_CONTEXT_UPDATED" => Self::AgentContextUpdated,
            "VALIDATION_COMPLETED" => Self::ValidationCompleted,
            "EARTH_VALIDATION_STARTED" => Self::EarthValidationStarted,
            "EARTH_VALIDATION_COMPLETE" => Self::EarthValidationComplete,
            "EARTH_VALIDATION_FAILED" => Self::EarthValidationFailed,
            "WATER_PROPAGATION_STARTED" => Self::WaterPropagationStarted,
            "WATER_PROPAGATION_COMPLETE" => Self::WaterPropagationComplete,
            "WATER_PROPAGATION_REJECTED" => Self::WaterPropagationRejected,
            "WATER_PROPAGATION_FAILED" => Self::WaterPropagationFailed,
            "COMPONENT_REFINEMENT_CREATED" => Self::ComponentRefinementCreated,
            "COMPONENT_REFINEMENT_UPDATED" => Self::ComponentRefinementUpdated,
            "COMPONENT_REFINEMENT_ITERATION" => Self::ComponentRefinementIteration,
            "COMPONENT_VALIDATION_STATE_CHANGED" => Self::ComponentValidationStateChanged,
            "METRIC_RECORDED" => Self::MetricRecorded,
            "RESOURCE_METRIC_RECORDED" => Self::ResourceMetricRecorded,
            "SYSTEM_HEALTH_CHANGED" => Self::SystemHealthChanged,
            "MONITORING_ERROR_OCCURRED" => Self::MonitoringErrorOccurred,
            "RESOURCE_ALERT_CREATED" => Self::ResourceAlertCreated,
            "RESOURCE_ALERT_UPDATED" => Self::ResourceAlertUpdated,
            "SYSTEM_ALERT" => Self::SystemAlert,
            "AGENT_UPDATE_REQUEST" => Self::AgentUpdateRequest,
            "AGENT_UPDATE_COMPLETE" => Self::AgentUpdateComplete,
            "AGENT_UPDATE_FAILED" => Self::AgentUpdateFailed,
            other => Self::Extension(other.to_string()),
        }
    }

    /// Monitoring events are never re-wrapped when a handler fails on
    /// them, to avoid recursion.
    pub fn is_monitoring(&self) -> bool {
        matches!(
            self,
            Self::MonitoringErrorOccurred | Self::SystemHealthChanged
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

// --- Typed payload schemas ---------------------------------------------

/// Payload for resource and interface state changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceStatePayload {
    pub resource_id: String,
    pub state: String,
    pub resource_type: String,
    #[serde(default)]
    pub previous_state: Option<String>,
    #[serde(default)]
    pub transition_reason: Option<String>,
    #[serde(default)]
    pub failure_info: Option<Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Payload for health change events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthPayload {
    pub component: String,
    pub status: String,
    pub description: String,
    #[serde(default)]
    pub metrics: HashMap<String, Value>,
}

/// Payload for earth validation events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationEventPayload {
    pub validation_id: String,
    pub agent_id: String,
    pub is_valid: bool,
    pub validation_category: String,
    #[serde(default)]
    pub detected_issues: Vec<DetectedIssue>,
    pub tier: String,
    #[serde(default)]
    pub corrected_update: Option<Value>,
}

/// Per-agent failure inside a propagation payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationFailure {
    pub agent: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Payload for water propagation events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropagationEventPayload {
    pub propagation_id: String,
    pub origin_agent: String,
    #[serde(default)]
    pub affected_agents: Vec<String>,
    #[serde(default)]
    pub failures: Vec<PropagationFailure>,
    #[serde(default)]
    pub metrics: HashMap<String, Value>,
}

/// Payload for refinement context lifecycle events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefinementContextPayload {
    pub context_id: String,
    pub component_id: String,
    pub validation_state: String,
    #[serde(default)]
    pub responsible_agent: Option<String>,
    pub error_count: usize,
    /// created, updated, cleaned_up
    pub state: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Payload for refinement iteration events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefinementIterationPayload {
    pub context_id: String,
    pub iteration_number: u32,
    pub refinement_type: String,
    pub success: bool,
    pub duration_seconds: f64,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Payload for metric events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricPayload {
    pub metric: String,
    pub value: f64,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Payload for alert events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertPayload {
    pub alert_type: String,
    pub level: String,
    pub description: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Payload for agent update request/response events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentUpdatePayload {
    pub agent_id: String,
    pub update_type: String,
    #[serde(default)]
    pub content: Value,
    pub request_id: String,
}

/// Payload for monitoring error events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringErrorPayload {
    pub component_id: String,
    pub operation: String,
    pub error_type: String,
    pub severity: String,
    pub message: String,
}

/// Sum of all registered payload schemas, keyed by schema family.
/// Unregistered types travel in the `Extension` variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "schema", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    ResourceState(ResourceStatePayload),
    Health(HealthPayload),
    Validation(ValidationEventPayload),
    Propagation(PropagationEventPayload),
    RefinementContext(RefinementContextPayload),
    RefinementIteration(RefinementIterationPayload),
    Metric(MetricPayload),
    Alert(AlertPayload),
    AgentUpdate(AgentUpdatePayload),
    MonitoringError(MonitoringErrorPayload),
    Extension(Value),
}

impl EventPayload {
    pub fn schema_name(&self) -> &'static str {
        match self {
            Self::ResourceState(_) => "resource_state",
            Self::Health(_) => "health",
            Self::Validation(_) => "validation",
            Self::Propagation(_) => "propagation",
            Self::RefinementContext(_) => "refinement_context",
            Self::RefinementIteration(_) => "refinement_iteration",
            Self::Metric(_) => "metric",
            Self::Alert(_) => "alert",
            Self::AgentUpdate(_) => "agent_update",
            Self::MonitoringError(_) => "monitoring_error",
            Self::Extension(_) => "extension",
        }
    }
}

/// Event envelope. Handlers receive clones; the bus never hands out
/// mutable access to queued data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub kind: EventKind,
    pub priority: EventPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(kind: EventKind, source_id: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source_id: source_id.into(),
            kind,
            priority: EventPriority::Normal,
            correlation_id: None,
            payload,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Subscriber callback. `name()` identifies the handler: subscribing
/// the same name to the same event type twice is idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

/// Configuration for the event bus.
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Capacity of each per-subscriber mailbox.
    pub mailbox_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
        }
    }
}

/// Subscription key for wildcard matching.
pub const WILDCARD: &str = "*";

#[derive(Debug, Default)]
struct DropCounters {
    high: AtomicU64,
    normal: AtomicU64,
    low: AtomicU64,
}

impl DropCounters {
    fn record(&self, priority: EventPriority) {
        let counter = match priority {
            EventPriority::High => &self.high,
            EventPriority::Normal => &self.normal,
            EventPriority::Low => &self.low,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn total(&self) -> u64 {
        self.high.load(Ordering::Relaxed)
            + self.normal.load(Ordering::Relaxed)
            + self.low.load(Ordering::Relaxed)
    }
}

/// Bounded per-subscriber mailbox. On overflow the oldest LOW event is
/// evicted first, then the oldest NORMAL, then the oldest HIGH.
struct Mailbox {
    queue: StdMutex<VecDeque<Event>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    drops: DropCounters,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: StdMutex::new(VecDeque::new()),
            capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            drops: DropCounters::default(),
        }
    }

    fn push(&self, event: Event) {
        {
            let mut queue = self.queue.lock().expect("mailbox lock poisoned");
            if queue.len() >= self.capacity {
                let victim = queue
                    .iter()
                    .position(|e| e.priority == EventPriority::Low)
                    .or_else(|| {
                        queue
                            .iter()
                            .position(|e| e.priority == EventPriority::Normal)
                    })
                    .unwrap_or(0);
                if let Some(dropped) = queue.remove(victim) {
                    self.drops.record(dropped.priority);
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Returns `None` once the mailbox is closed and drained.
    async fn pop(&self) -> Option<Event> {
        loop {
            {
                let mut queue = self.queue.lock().expect("mailbox lock poisoned");
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn dropped(&self) -> u64 {
        self.drops.total()
    }
}

struct Subscriber {
    handler_name: String,
    mailbox: Arc<Mailbox>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between the bus facade, the dispatcher, and workers.
struct BusShared {
    queues: StdMutex<[VecDeque<Event>; 3]>,
    queue_notify: Notify,
    subscribers: RwLock<HashMap<String, Vec<Arc<Subscriber>>>>,
    registry: Arc<EventRegistry>,
    running: AtomicBool,
    draining: AtomicBool,
    emitted: AtomicU64,
    delivered: AtomicU64,
    handler_errors: AtomicU64,
    unregistered_emissions: AtomicU64,
    config: EventBusConfig,
}

impl BusShared {
    fn enqueue(&self, event: Event) {
        {
            let mut queues = self.queues.lock().expect("bus queue lock poisoned");
            queues[event.priority.queue_index()].push_back(event);
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
        self.queue_notify.notify_one();
    }

    async fn deliver(&self, event: Event) {
        let subscribers = self.subscribers.read().await;
        let mut targets: Vec<Arc<Subscriber>> = Vec::new();
        if let Some(list) = subscribers.get(event.kind.as_str()) {
            targets.extend(list.iter().cloned());
        }
        if let Some(list) = subscribers.get(WILDCARD) {
            targets.extend(list.iter().cloned());
        }
        drop(subscribers);

        for subscriber in targets {
            subscriber.mailbox.push(event.clone());
            self.delivered.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Aggregated counters for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct EventBusMetrics {
    pub emitted: u64,
    pub delivered: u64,
    pub handler_errors: u64,
    pub mailbox_drops: u64,
    pub unregistered_emissions: u64,
    pub queue_depths: [usize; 3],
    pub subscription_count: usize,
}

/// The prioritized asynchronous event bus.
pub struct EventBus {
    shared: Arc<BusShared>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(config: EventBusConfig, registry: Arc<EventRegistry>) -> Self {
        Self {
            shared: Arc::new(BusShared {
                queues: StdMutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
                queue_notify: Notify::new(),
                subscribers: RwLock::new(HashMap::new()),
                registry,
                running: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                emitted: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                handler_errors: AtomicU64::new(0),
                unregistered_emissions: AtomicU64::new(0),
                config,
            }),
            dispatcher: Mutex::new(None),
        }
    }

    /// Bus with the default configuration and the standard catalogue.
    pub fn with_defaults() -> Self {
        Self::new(
            EventBusConfig::default(),
            Arc::new(EventRegistry::with_catalogue()),
        )
    }

    /// Start the dispatcher. Idempotent.
    pub async fn start(&self) {
        let mut guard = self.dispatcher.lock().await;
        if guard.is_some() {
            return;
        }
        self.shared.draining.store(false, Ordering::SeqCst);
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        *guard = Some(tokio::spawn(async move {
            dispatcher_loop(shared).await;
        }));
        tracing::debug!("event bus dispatcher started");
    }

    /// Stop the bus, draining queued events and letting every
    /// subscriber finish its mailbox before returning.
    pub async fn stop(&self) {
        let handle = {
            let mut guard = self.dispatcher.lock().await;
            guard.take()
        };
        if let Some(handle) = handle {
            self.shared.draining.store(true, Ordering::SeqCst);
            self.shared.queue_notify.notify_one();
            if let Err(e) = handle.await {
                tracing::error!("event bus dispatcher panicked: {e}");
            }
        }
        self.shared.running.store(false, Ordering::SeqCst);

        // Close mailboxes and join workers so handlers finish cleanly.
        let mut subscribers = self.shared.subscribers.write().await;
        let mut workers = Vec::new();
        for list in subscribers.values() {
            for subscriber in list {
                subscriber.mailbox.close();
                if let Some(worker) = subscriber.worker.lock().await.take() {
                    workers.push(worker);
                }
            }
        }
        for joined in futures::future::join_all(workers).await {
            if let Err(e) = joined {
                tracing::error!("event bus worker panicked: {e}");
            }
        }
        subscribers.clear();
        tracing::debug!("event bus stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Enqueue an event for asynchronous delivery at the catalogue's
    /// default priority. Returns after the enqueue; delivery happens on
    /// the dispatcher.
    pub fn emit(&self, kind: EventKind, source_id: impl Into<String>, payload: EventPayload) {
        let priority = self
            .shared
            .registry
            .default_priority(&kind)
            .unwrap_or(EventPriority::Normal);
        self.publish(Event::new(kind, source_id, payload).with_priority(priority));
    }

    /// Enqueue with an explicit priority, overriding the catalogue.
    pub fn emit_with_priority(
        &self,
        kind: EventKind,
        source_id: impl Into<String>,
        payload: EventPayload,
        priority: EventPriority,
    ) {
        self.publish(Event::new(kind, source_id, payload).with_priority(priority));
    }

    /// Enqueue a fully built envelope as-is.
    pub fn publish(&self, event: Event) {
        if !self.shared.registry.is_registered(&event.kind) {
            self.shared
                .unregistered_emissions
                .fetch_add(1, Ordering::Relaxed);
        }
        self.shared.enqueue(event);
    }

    /// Subscribe a handler to an event type; `"*"` subscribes to all.
    /// Duplicate `(event_type, handler_name)` pairs are idempotent.
    pub async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) {
        let mut subscribers = self.shared.subscribers.write().await;
        let list = subscribers.entry(event_type.to_string()).or_default();
        if list.iter().any(|s| s.handler_name == handler.name()) {
            return;
        }

        let mailbox = Arc::new(Mailbox::new(self.shared.config.mailbox_capacity));
        let subscriber = Arc::new(Subscriber {
            handler_name: handler.name().to_string(),
            mailbox: Arc::clone(&mailbox),
            worker: Mutex::new(None),
        });

        let shared = Arc::downgrade(&self.shared);
        let worker = tokio::spawn(subscriber_loop(mailbox, handler, shared));
        *subscriber.worker.lock().await = Some(worker);
        list.push(subscriber);
    }

    /// Remove a handler from an event type. No-op when absent.
    pub async fn unsubscribe(&self, event_type: &str, handler_name: &str) {
        let removed = {
            let mut subscribers = self.shared.subscribers.write().await;
            let Some(list) = subscribers.get_mut(event_type) else {
                return;
            };
            let Some(idx) = list.iter().position(|s| s.handler_name == handler_name) else {
                return;
            };
            let subscriber = list.remove(idx);
            if list.is_empty() {
                subscribers.remove(event_type);
            }
            subscriber
        };
        removed.mailbox.close();
        let worker = removed.worker.lock().await.take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    /// Current queue depths by priority: [high, normal, low].
    pub fn queue_depths(&self) -> [usize; 3] {
        let queues = self.shared.queues.lock().expect("bus queue lock poisoned");
        [queues[0].len(), queues[1].len(), queues[2].len()]
    }

    pub async fn metrics(&self) -> EventBusMetrics {
        let subscribers = self.shared.subscribers.read().await;
        let subscription_count = subscribers.values().map(Vec::len).sum();
        let mailbox_drops = subscribers
            .values()
            .flat_map(|list| list.iter())
            .map(|s| s.mailbox.dropped())
            .sum();
        EventBusMetrics {
            emitted: self.shared.emitted.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            handler_errors: self.shared.handler_errors.load(Ordering::Relaxed),
            mailbox_drops,
            unregistered_emissions: self.shared.unregistered_emissions.load(Ordering::Relaxed),
            queue_depths: self.queue_depths(),
            subscription_count,
        }
    }

    pub fn registry(&self) -> Arc<EventRegistry> {
        Arc::clone(&self.shared.registry)
    }

    /// Number of subscribers currently listening to an event type
    /// (wildcard subscribers not included).
    pub async fn subscriber_count(&self, event_type: &str) -> usize {
        let subscribers = self.shared.subscribers.read().await;
        subscribers.get(event_type).map_or(0, Vec::len)
    }
}

/// Strict priority service order with a yield between tiers so a full
/// pass cannot starve lower priorities indefinitely.
async fn dispatcher_loop(shared: Arc<BusShared>) {
    loop {
        let draining = shared.draining.load(Ordering::SeqCst);

        let mut delivered_any = false;
        for tier in 0..3 {
            loop {
                let event = {
                    let mut queues = shared.queues.lock().expect("bus queue lock poisoned");
                    queues[tier].pop_front()
                };
                match event {
                    Some(event) => {
                        shared.deliver(event).await;
                        delivered_any = true;
                    }
                    None => break,
                }
            }
            tokio::task::yield_now().await;
        }

        if draining && !delivered_any {
            let empty = {
                let queues = shared.queues.lock().expect("bus queue lock poisoned");
                queues.iter().all(VecDeque::is_empty)
            };
            if empty {
                break;
            }
        }

        if !delivered_any && !draining {
            shared.queue_notify.notified().await;
        }
    }
}

/// Per-subscriber delivery loop. Handler failures are caught, logged,
/// counted, and surfaced as MONITORING_ERROR_OCCURRED events; the
/// monitoring family itself is never re-wrapped.
async fn subscriber_loop(
    mailbox: Arc<Mailbox>,
    handler: Arc<dyn EventHandler>,
    shared: Weak<BusShared>,
) {
    while let Some(event) = mailbox.pop().await {
        let kind = event.kind.clone();
        if let Err(error) = handler.handle(event).await {
            tracing::error!(
                handler = handler.name(),
                event_type = %kind,
                "event handler failed: {error:#}"
            );
            if let Some(shared) = shared.upgrade() {
                shared.handler_errors.fetch_add(1, Ordering::Relaxed);
                if !kind.is_monitoring() {
                    let priority = shared
                        .registry
                        .default_priority(&EventKind::MonitoringErrorOccurred)
                        .unwrap_or(EventPriority::High);
                    shared.enqueue(
                        Event::new(
                            EventKind::MonitoringErrorOccurred,
                            handler.name(),
                            EventPayload::MonitoringError(MonitoringErrorPayload {
                                component_id: handler.name().to_string(),
                                operation: "handle_event".to_string(),
                                error_type: "handler_error".to_string(),
                                severity: "DEGRADED".to_string(),
                                message: format!("{kind}: {error:#}"),
                            }),
                        )
                        .with_priority(priority),
                    );
                }
            }
        }
    }
}
