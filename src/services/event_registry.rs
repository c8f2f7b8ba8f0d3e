//! Catalogue of event types and their wiring.
//!
//! The registry documents who publishes and subscribes to each event
//! type, which payload schema it carries, and its default priority.
//! Emitting an uncatalogued type is allowed (the bus counts it); the
//! registry exists for documentation, validation tooling, and the
//! health monitor.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Serialize;
use serde_json::{json, Value};

use super::event_bus::{EventKind, EventPriority};

/// Metadata describing one catalogued event type.
#[derive(Debug, Clone, Serialize)]
pub struct EventTypeMetadata {
    pub description: String,
    pub publisher_components: Vec<String>,
    pub subscriber_components: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example_payload: Option<Value>,
    /// Name of the payload schema variant this type carries.
    pub schema: &'static str,
    pub default_priority: EventPriority,
}

/// Registry of event types. One instance is shared by the bus and any
/// tooling that wants to introspect the catalogue.
#[derive(Default)]
pub struct EventRegistry {
    entries: RwLock<HashMap<String, EventTypeMetadata>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the standard Arbor catalogue.
    pub fn with_catalogue() -> Self {
        let registry = Self::new();
        registry.register_catalogue();
        registry
    }

    pub fn register_event(&self, kind: &EventKind, metadata: EventTypeMetadata) {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .insert(kind.as_str().to_string(), metadata);
    }

    pub fn get(&self, kind: &EventKind) -> Option<EventTypeMetadata> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(kind.as_str())
            .cloned()
    }

    pub fn is_registered(&self, kind: &EventKind) -> bool {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .contains_key(kind.as_str())
    }

    pub fn default_priority(&self, kind: &EventKind) -> Option<EventPriority> {
        self.get(kind).map(|m| m.default_priority)
    }

    pub fn all_event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .entries
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    pub fn events_by_publisher(&self, publisher: &str) -> Vec<String> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut types: Vec<String> = entries
            .iter()
            .filter(|(_, m)| m.publisher_components.iter().any(|p| p == publisher))
            .map(|(k, _)| k.clone())
            .collect();
        types.sort();
        types
    }

    pub fn events_by_subscriber(&self, subscriber: &str) -> Vec<String> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut types: Vec<String> = entries
            .iter()
            .filter(|(_, m)| m.subscriber_components.iter().any(|s| s == subscriber))
            .map(|(k, _)| k.clone())
            .collect();
        types.sort();
        types
    }

    /// Summary for documentation: totals plus the distinct publishers
    /// and subscribers across the catalogue.
    pub fn summary(&self) -> RegistrySummary {
        let entries = self.entries.read().expect("registry lock poisoned");
        let mut publishers: Vec<String> = entries
            .values()
            .flat_map(|m| m.publisher_components.iter().cloned())
            .collect();
        publishers.sort();
        publishers.dedup();
        let mut subscribers: Vec<String> = entries
            .values()
            .flat_map(|m| m.subscriber_components.iter().cloned())
            .collect();
        subscribers.sort();
        subscribers.dedup();
        RegistrySummary {
            total_events: entries.len(),
            publishers,
            subscribers,
        }
    }

    fn register_catalogue(&self) {
        let register = |kind: EventKind,
                            description: &str,
                            publishers: &[&str],
                            subscribers: &[&str],
                            schema: &'static str,
                            default_priority: EventPriority,
                            example: Option<Value>| {
            self.register_event(
                &kind,
                EventTypeMetadata {
                    description: description.to_string(),
                    publisher_components: publishers.iter().map(ToString::to_string).collect(),
                    subscriber_components: subscribers.iter().map(ToString::to_string).collect(),
                    example_payload: example,
                    schema,
                    default_priority,
                },
            );
        };

        // Resource lifecycle
        register(
            EventKind::ResourceStateChanged,
            "A resource moved to a new lifecycle state",
            &["state_manager"],
            &["system_monitor", "agent_scaffold"],
            "resource_state",
            EventPriority::Normal,
            Some(json!({
                "resource_id": "agent:garden_planner",
                "state": "ACTIVE",
                "resource_type": "AGENT"
            })),
        );
        register(
            EventKind::ResourceHealthChanged,
            "Health rollup for a single resource changed",
            &["health_tracker"],
            &["system_monitor"],
            "health",
            EventPriority::Normal,
            None,
        );
        register(
            EventKind::ResourceCleanup,
            "A cleanup pass removed resource data",
            &["state_manager"],
            &["system_monitor"],
            "metric",
            EventPriority::Low,
            None,
        );
        register(
            EventKind::ResourceErrorOccurred,
            "A resource operation failed",
            &["state_manager", "agent_scaffold"],
            &["system_monitor"],
            "monitoring_error",
            EventPriority::High,
            None,
        );
        register(
            EventKind::ResourceErrorResolved,
            "A previously reported resource error was resolved",
            &["agent_scaffold"],
            &["system_monitor"],
            "monitoring_error",
            EventPriority::Normal,
            None,
        );
        register(
            EventKind::ResourceErrorRecoveryStarted,
            "Recovery from a resource error began",
            &["state_manager"],
            &["system_monitor"],
            "monitoring_error",
            EventPriority::Normal,
            None,
        );
        register(
            EventKind::ResourceErrorRecoveryCompleted,
            "Recovery from a resource error finished",
            &["state_manager"],
            &["system_monitor"],
            "monitoring_error",
            EventPriority::Normal,
            None,
        );

        // Interfaces
        register(
            EventKind::InterfaceStateChanged,
            "An agent interface moved to a new workflow state",
            &["agent_scaffold"],
            &["system_monitor"],
            "resource_state",
            EventPriority::Normal,
            None,
        );
        register(
            EventKind::AgentContextUpdated,
            "An agent's working context was replaced",
            &["agent_scaffold"],
            &["system_monitor"],
            "agent_update",
            EventPriority::Low,
            None,
        );

        // Validation
        register(
            EventKind::ValidationCompleted,
            "A validation pass finished",
            &["earth_validator"],
            &["water_propagator", "refinement_manager"],
            "validation",
            EventPriority::Normal,
            None,
        );
        register(
            EventKind::EarthValidationStarted,
            "Tiered guideline validation began",
            &["earth_validator"],
            &["system_monitor"],
            "validation",
            EventPriority::Normal,
            None,
        );
        register(
            EventKind::EarthValidationComplete,
            "Tiered guideline validation finished",
            &["earth_validator"],
            &["water_propagator"],
            "validation",
            EventPriority::Normal,
            Some(json!({
                "validation_id": "earth_validation:op-1",
                "agent_id": "garden_planner",
                "is_valid": true,
                "validation_category": "APPROVED",
                "tier": "COMPONENT"
            })),
        );
        register(
            EventKind::EarthValidationFailed,
            "Tiered guideline validation hit a system error",
            &["earth_validator"],
            &["system_monitor"],
            "validation",
            EventPriority::High,
            None,
        );

        // Propagation
        register(
            EventKind::WaterPropagationStarted,
            "Downstream propagation of an accepted update began",
            &["water_propagator"],
            &["system_monitor"],
            "propagation",
            EventPriority::Normal,
            None,
        );
        register(
            EventKind::WaterPropagationComplete,
            "Downstream propagation finished with no failures",
            &["water_propagator"],
            &["system_monitor"],
            "propagation",
            EventPriority::Normal,
            None,
        );
        register(
            EventKind::WaterPropagationRejected,
            "Propagation was rejected before any delivery",
            &["water_propagator"],
            &["system_monitor"],
            "propagation",
            EventPriority::Normal,
            None,
        );
        register(
            EventKind::WaterPropagationFailed,
            "Propagation finished with at least one per-agent failure",
            &["water_propagator"],
            &["system_monitor"],
            "propagation",
            EventPriority::High,
            None,
        );

        // Refinement
        register(
            EventKind::ComponentRefinementCreated,
            "A refinement context was created",
            &["refinement_manager"],
            &["system_monitor"],
            "refinement_context",
            EventPriority::Normal,
            None,
        );
        register(
            EventKind::ComponentRefinementUpdated,
            "A refinement context changed state or was cleaned up",
            &["refinement_manager"],
            &["system_monitor"],
            "refinement_context",
            EventPriority::Normal,
            None,
        );
        register(
            EventKind::ComponentRefinementIteration,
            "One refinement iteration completed",
            &["refinement_manager"],
            &["system_monitor"],
            "refinement_iteration",
            EventPriority::Low,
            None,
        );
        register(
            EventKind::ComponentValidationStateChanged,
            "The component validation pipeline moved to a new state",
            &["refinement_manager"],
            &["system_monitor"],
            "resource_state",
            EventPriority::Normal,
            None,
        );

        // Metrics & health
        register(
            EventKind::MetricRecorded,
            "A named metric sample was recorded",
            &["metrics_recorder", "state_manager"],
            &["system_monitor"],
            "metric",
            EventPriority::Low,
            None,
        );
        register(
            EventKind::ResourceMetricRecorded,
            "A per-resource metric sample was recorded",
            &["metrics_recorder"],
            &["system_monitor"],
            "metric",
            EventPriority::Low,
            None,
        );
        register(
            EventKind::SystemHealthChanged,
            "System-wide health rollup changed",
            &["event_monitor", "health_tracker"],
            &["system_monitor"],
            "health",
            EventPriority::Normal,
            None,
        );
        register(
            EventKind::MonitoringErrorOccurred,
            "An event handler or monitor failed",
            &["event_bus"],
            &["system_monitor"],
            "monitoring_error",
            EventPriority::High,
            None,
        );

        // Alerts
        register(
            EventKind::ResourceAlertCreated,
            "A resource crossed an alert threshold",
            &["memory_monitor", "event_monitor"],
            &["state_manager", "system_monitor"],
            "alert",
            EventPriority::High,
            None,
        );
        register(
            EventKind::ResourceAlertUpdated,
            "An existing resource alert changed level",
            &["memory_monitor"],
            &["system_monitor"],
            "alert",
            EventPriority::Normal,
            None,
        );
        register(
            EventKind::SystemAlert,
            "A system-level fault requiring attention",
            &["agent_scaffold", "refinement_manager"],
            &["system_monitor"],
            "alert",
            EventPriority::High,
            None,
        );

        // Agent updates
        register(
            EventKind::AgentUpdateRequest,
            "An update was requested from an agent",
            &["water_propagator"],
            &["agent_scaffold"],
            "agent_update",
            EventPriority::Normal,
            None,
        );
        register(
            EventKind::AgentUpdateComplete,
            "An agent finished applying an update",
            &["agent_scaffold"],
            &["water_propagator"],
            "agent_update",
            EventPriority::Normal,
            None,
        );
        register(
            EventKind::AgentUpdateFailed,
            "An agent failed to apply an update",
            &["agent_scaffold"],
            &["water_propagator", "refinement_manager"],
            "agent_update",
            EventPriority::High,
            None,
        );
    }
}

/// Documentation summary of the catalogue.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub total_events: usize,
    pub publishers: Vec<String>,
    pub subscribers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_is_populated() {
        let registry = EventRegistry::with_catalogue();
        assert!(registry.is_registered(&EventKind::ResourceStateChanged));
        assert!(registry.is_registered(&EventKind::WaterPropagationFailed));
        assert!(!registry.is_registered(&EventKind::Extension("BESPOKE".into())));
        assert!(registry.all_event_types().len() >= 28);
    }

    #[test]
    fn test_default_priorities() {
        let registry = EventRegistry::with_catalogue();
        assert_eq!(
            registry.default_priority(&EventKind::ResourceAlertCreated),
            Some(EventPriority::High)
        );
        assert_eq!(
            registry.default_priority(&EventKind::MetricRecorded),
            Some(EventPriority::Low)
        );
    }

    #[test]
    fn test_publisher_and_subscriber_queries() {
        let registry = EventRegistry::with_catalogue();
        let published = registry.events_by_publisher("water_propagator");
        assert!(published.contains(&"WATER_PROPAGATION_STARTED".to_string()));
        let subscribed = registry.events_by_subscriber("water_propagator");
        assert!(subscribed.contains(&"EARTH_VALIDATION_COMPLETE".to_string()));
    }

    #[test]
    fn test_summary_dedupes() {
        let registry = EventRegistry::with_catalogue();
        let summary = registry.summary();
        assert!(summary.total_events >= 28);
        let count = summary
            .publishers
            .iter()
            .filter(|p| p.as_str() == "state_manager")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_custom_registration() {
        let registry = EventRegistry::new();
        let kind = EventKind::Extension("PIPELINE_TICK".into());
        registry.register_event(
            &kind,
            EventTypeMetadata {
                description: "Pipeline heartbeat".into(),
                publisher_components: vec!["pipeline".into()],
                subscriber_components: vec![],
                example_payload: None,
                schema: "extension",
                default_priority: EventPriority::Low,
            },
        );
        assert!(registry.is_registered(&kind));
    }
}
