//! Agent scaffold: the uniform processing shell around every
//! analysis/orchestration agent.
//!
//! The scaffold keeps a four-state machine (idle, analyzing, complete,
//! error) persisted through the state manager, runs domain logic under
//! a per-agent circuit breaker, tracks the memory footprint of the
//! payloads it handles, and records timing and error metrics. A tripped
//! breaker produces a structured rejection instead of an error.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use crate::domain::models::state::{InterfaceState, ResourceType};
use crate::domain::ports::agent::AnalysisAgent;
use crate::services::circuit_breaker::{guarded, CircuitBreakerRegistry, GuardedError};
use crate::services::event_bus::{
    EventBus, EventKind, EventPayload, ResourceStatePayload,
};
use crate::services::monitor::{MemoryMonitor, MetricsRecorder};
use crate::services::resource_registry::{ResourceRegistry, TrackedResource};
use crate::services::state_manager::StateManager;

/// Outcome envelope of one scaffolded processing run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentProcessResult {
    Complete {
        output: Value,
        duration_seconds: f64,
    },
    /// The processing breaker is open; nothing ran.
    RejectedByCircuitBreaker {
        agent_id: String,
        retry_after: DateTime<Utc>,
    },
    Failed {
        error: String,
        duration_seconds: f64,
    },
}

impl AgentProcessResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }
}

/// The scaffold wrapping one domain agent.
pub struct AgentScaffold {
    agent: Arc<dyn AnalysisAgent>,
    state: Arc<StateManager>,
    bus: Arc<EventBus>,
    breakers: Arc<CircuitBreakerRegistry>,
    memory: Arc<MemoryMonitor>,
    metrics: Arc<MetricsRecorder>,
    resource: Arc<TrackedResource>,
    breaker_name: String,
    state_key: String,
}

impl AgentScaffold {
    /// Build a scaffold, registering the agent as a tracked resource
    /// and creating its processing breaker name.
    pub async fn new(
        agent: Arc<dyn AnalysisAgent>,
        state: Arc<StateManager>,
        bus: Arc<EventBus>,
        breakers: Arc<CircuitBreakerRegistry>,
        memory: Arc<MemoryMonitor>,
        metrics: Arc<MetricsRecorder>,
        registry: &ResourceRegistry,
    ) -> Self {
        let agent_id = agent.agent_id().to_string();
        let resource = registry.register(&format!("agent:{agent_id}"));
        resource.initialize();
        let scaffold = Self {
            agent,
            state,
            bus,
            breakers,
            memory,
            metrics,
            resource,
            breaker_name: format!("agent:{agent_id}:processing"),
            state_key: format!("agent:{agent_id}:state"),
        };
        scaffold.transition(InterfaceState::Idle, None, None).await;
        scaffold
    }

    pub fn agent_id(&self) -> &str {
        self.agent.agent_id()
    }

    pub fn resource(&self) -> Arc<TrackedResource> {
        Arc::clone(&self.resource)
    }

    /// Current interface state, as persisted.
    pub async fn current_state(&self) -> Option<InterfaceState> {
        self.state
            .get_state(&self.state_key, None, true)
            .await
            .and_then(|entry| entry.state.as_interface())
    }

    /// Run the agent's domain logic inside the uniform shell.
    pub async fn process(&self, inputs: &Value) -> AgentProcessResult {
        let agent_id = self.agent.agent_id().to_string();

        // A tripped breaker rejects before any state changes. This
        // peek never consumes the half-open probe slot; the guarded
        // run below decides recovery.
        if let Some(retry_after) = self.breakers.blocked_until(&self.breaker_name).await {
            tracing::warn!(agent_id, "processing rejected by open circuit breaker");
            self.record_metric("rejected_by_breaker", 1.0);
            return AgentProcessResult::RejectedByCircuitBreaker {
                agent_id,
                retry_after,
            };
        }

        self.memory
            .track_value(&format!("agent:{agent_id}:inputs"), inputs);
        self.transition(InterfaceState::Analyzing, None, None).await;

        let started = std::time::Instant::now();
        let result = guarded(&self.breakers, &self.breaker_name, self.agent.analyze(inputs)).await;
        let duration = started.elapsed().as_secs_f64();

        match result {
            Ok(output) => {
                self.memory
                    .track_value(&format!("agent:{agent_id}:output"), &output);
                self.transition(InterfaceState::Complete, None, None).await;
                self.record_metric("processing_duration_seconds", duration);
                AgentProcessResult::Complete {
                    output,
                    duration_seconds: duration,
                }
            }
            Err(GuardedError::CircuitOpen { retry_after, .. }) => {
                // The breaker opened between the check and the run.
                self.transition(InterfaceState::Error, Some("circuit open".to_string()), None)
                    .await;
                self.record_metric("rejected_by_breaker", 1.0);
                AgentProcessResult::RejectedByCircuitBreaker {
                    agent_id,
                    retry_after,
                }
            }
            Err(GuardedError::Operation(e)) => {
                let message = format!("{e:#}");
                tracing::error!(agent_id, "agent processing failed: {message}");
                let mut failure_info = HashMap::new();
                failure_info.insert("error".to_string(), json!(message));
                self.transition(
                    InterfaceState::Error,
                    Some("processing failed".to_string()),
                    Some(failure_info),
                )
                .await;
                self.record_metric("processing_errors", 1.0);
                AgentProcessResult::Failed {
                    error: message,
                    duration_seconds: duration,
                }
            }
        }
    }

    /// Return the agent to idle, e.g. between pipeline phases.
    pub async fn reset(&self) {
        self.transition(InterfaceState::Idle, Some("reset".to_string()), None)
            .await;
    }

    async fn transition(
        &self,
        to: InterfaceState,
        reason: Option<String>,
        failure_info: Option<HashMap<String, Value>>,
    ) {
        match self
            .state
            .set_state(
                &self.state_key,
                to,
                ResourceType::Agent,
                None,
                reason.clone(),
                failure_info,
            )
            .await
        {
            Ok(entry) => {
                self.bus.emit(
                    EventKind::InterfaceStateChanged,
                    self.agent.agent_id(),
                    EventPayload::ResourceState(ResourceStatePayload {
                        resource_id: self.state_key.clone(),
                        state: to.to_string(),
                        resource_type: ResourceType::Agent.to_string(),
                        previous_state: entry.previous_state,
                        transition_reason: reason,
                        ..Default::default()
                    }),
                );
            }
            Err(e) => {
                tracing::error!(
                    agent_id = self.agent.agent_id(),
                    "failed to persist agent state transition to {to}: {e}"
                );
            }
        }
    }

    fn record_metric(&self, name: &str, value: f64) {
        let mut metadata = HashMap::new();
        metadata.insert("agent_id".to_string(), json!(self.agent.agent_id()));
        self.metrics
            .record_metric(&format!("agent:{name}"), value, metadata);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::StateManagerConfig;
    use crate::services::circuit_breaker::CircuitBreakerConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ToggleAgent {
        id: String,
        fail: AtomicBool,
    }

    impl ToggleAgent {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl AnalysisAgent for ToggleAgent {
        fn agent_id(&self) -> &str {
            &self.id
        }

        async fn analyze(&self, inputs: &Value) -> anyhow::Result<Value> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("analysis crashed");
            }
            Ok(json!({"analyzed": inputs}))
        }
    }

    async fn scaffold(agent: Arc<ToggleAgent>) -> AgentScaffold {
        let bus = Arc::new(EventBus::with_defaults());
        let state = StateManager::new(Arc::clone(&bus), StateManagerConfig::default())
            .await
            .unwrap();
        let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        });
        let memory = MemoryMonitor::with_defaults(Arc::clone(&bus));
        let metrics = MetricsRecorder::new(Arc::clone(&bus));
        let registry = ResourceRegistry::new(Arc::clone(&bus));
        AgentScaffold::new(agent, state, bus, breakers, memory, metrics, &registry).await
    }

    #[tokio::test]
    async fn test_process_happy_path() {
        let agent = ToggleAgent::new("garden_planner");
        let scaffold = scaffold(agent).await;
        assert_eq!(scaffold.current_state().await, Some(InterfaceState::Idle));

        let result = scaffold.process(&json!({"task": "plan"})).await;
        match result {
            AgentProcessResult::Complete { output, .. } => {
                assert_eq!(output, json!({"analyzed": {"task": "plan"}}));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(
            scaffold.current_state().await,
            Some(InterfaceState::Complete)
        );
    }

    #[tokio::test]
    async fn test_process_failure_marks_error_state() {
        let agent = ToggleAgent::new("garden_planner");
        agent.fail.store(true, Ordering::SeqCst);
        let scaffold = scaffold(Arc::clone(&agent)).await;

        let result = scaffold.process(&json!({})).await;
        assert!(matches!(result, AgentProcessResult::Failed { .. }));
        assert_eq!(scaffold.current_state().await, Some(InterfaceState::Error));

        // History carries the failure info.
        let history = scaffold
            .state
            .get_history("agent:garden_planner:state", None)
            .await;
        let error_entry = history
            .iter()
            .find(|e| e.state.as_interface() == Some(InterfaceState::Error))
            .unwrap();
        assert!(error_entry.failure_info.is_some());
    }

    #[tokio::test]
    async fn test_breaker_rejection_after_repeated_failures() {
        let agent = ToggleAgent::new("garden_planner");
        agent.fail.store(true, Ordering::SeqCst);
        let scaffold = scaffold(Arc::clone(&agent)).await;

        // Threshold is 2: two failures trip the breaker.
        scaffold.process(&json!({})).await;
        scaffold.reset().await;
        scaffold.process(&json!({})).await;

        agent.fail.store(false, Ordering::SeqCst);
        let result = scaffold.process(&json!({})).await;
        assert!(matches!(
            result,
            AgentProcessResult::RejectedByCircuitBreaker { .. }
        ));
        // Rejection happens before any state change.
        assert_eq!(scaffold.current_state().await, Some(InterfaceState::Error));
    }

    #[tokio::test]
    async fn test_reprocessing_after_completion() {
        let agent = ToggleAgent::new("garden_planner");
        let scaffold = scaffold(agent).await;
        assert!(scaffold.process(&json!({"n": 1})).await.is_complete());
        assert!(scaffold.process(&json!({"n": 2})).await.is_complete());
        let history = scaffold
            .state
            .get_history("agent:garden_planner:state", None)
            .await;
        // idle, analyzing, complete, analyzing, complete.
        assert_eq!(history.len(), 5);
    }

    #[tokio::test]
    async fn test_scaffold_registers_resource() {
        let agent = ToggleAgent::new("root_system");
        let scaffold = scaffold(agent).await;
        let resource = scaffold.resource();
        assert_eq!(resource.resource_id(), "agent:root_system");
        assert!(resource.is_initialized());
    }
}
