//! Water layer: downstream propagation of accepted guideline updates.
//!
//! After the earth layer accepts an update, the propagator resolves the
//! transitive downstream set from the pipeline dependency chain (or an
//! explicit override), builds a per-target adaptation context, and
//! delivers the update to each target's apply hook sequentially.
//! Partial failures are surfaced per agent; there are no retries.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::models::guideline::ValidationOutcome;
use crate::domain::models::health::{HealthLevel, HealthStatus};
use crate::domain::models::state::{ResourceType, StateValue};
use crate::domain::ports::agent::{DownstreamAgent, IntegrationGuidance, PropagationContext};
use crate::services::event_bus::{
    AgentUpdatePayload, EventBus, EventKind, EventPayload, PropagationEventPayload,
    PropagationFailure,
};
use crate::services::monitor::HealthTracker;
use crate::services::state_manager::StateManager;

const SOURCE_ID: &str = "water_propagator";

/// Fixed dependency chain of the top-level pipeline.
const PIPELINE_CHAIN: [&str; 4] = [
    "garden_planner",
    "environmental_analysis",
    "root_system",
    "tree_placement",
];

/// Transitive-forward set for an origin in the pipeline chain. Unknown
/// origins have no downstream agents.
pub fn downstream_agents(origin: &str) -> Vec<String> {
    PIPELINE_CHAIN
        .iter()
        .position(|agent| *agent == origin)
        .map(|idx| {
            PIPELINE_CHAIN[idx + 1..]
                .iter()
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Per-agent delivery record.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateRecord {
    pub agent: String,
    pub success: bool,
    pub context_provided: bool,
    pub timestamp: DateTime<Utc>,
}

/// Per-agent failure record.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub agent: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Result envelope for one propagation run. `success` is true iff
/// `failures` is empty.
#[derive(Debug, Clone, Serialize)]
pub struct PropagationResult {
    pub success: bool,
    pub affected_agents: Vec<String>,
    pub updates: Vec<UpdateRecord>,
    pub failures: Vec<FailureRecord>,
    pub metadata: HashMap<String, Value>,
}

/// The water propagator.
pub struct WaterPropagator {
    targets: RwLock<HashMap<String, Arc<dyn DownstreamAgent>>>,
    state: Arc<StateManager>,
    bus: Arc<EventBus>,
    health: Arc<HealthTracker>,
}

impl WaterPropagator {
    pub fn new(state: Arc<StateManager>, bus: Arc<EventBus>, health: Arc<HealthTracker>) -> Self {
        Self {
            targets: RwLock::new(HashMap::new()),
            state,
            bus,
            health,
        }
    }

    /// Register a downstream agent's apply hook.
    pub async fn register_target(&self, agent: Arc<dyn DownstreamAgent>) {
        self.targets
            .write()
            .await
            .insert(agent.agent_id().to_string(), agent);
    }

    /// Propagate only when the validator accepted the update; rejected
    /// outcomes short-circuit with a WATER_PROPAGATION_REJECTED event.
    pub async fn propagate_validated(
        &self,
        origin_agent: &str,
        updated_guideline: &Value,
        outcome: &ValidationOutcome,
        affected_agents: Option<Vec<String>>,
    ) -> PropagationResult {
        if !outcome.is_accepted() {
            let propagation_id = format!("guideline_propagation_{}", Uuid::new_v4());
            tracing::warn!(origin_agent, "refusing to propagate rejected update");
            self.emit_propagation_event(
                EventKind::WaterPropagationRejected,
                &propagation_id,
                origin_agent,
                &[],
                &[],
                HashMap::new(),
            );
            let mut metadata = HashMap::new();
            metadata.insert("propagation_id".to_string(), json!(propagation_id));
            metadata.insert("origin_agent".to_string(), json!(origin_agent));
            metadata.insert(
                "rejected_category".to_string(),
                json!(outcome.validation_result.validation_category.to_string()),
            );
            return PropagationResult {
                success: false,
                affected_agents: Vec::new(),
                updates: Vec::new(),
                failures: vec![FailureRecord {
                    agent: "all".to_string(),
                    reason: "validation outcome was not accepted".to_string(),
                    timestamp: Utc::now(),
                }],
                metadata,
            };
        }
        self.propagate_guideline_update(
            origin_agent,
            updated_guideline,
            affected_agents,
            Some(outcome),
        )
        .await
    }

    /// Deliver an accepted update to each downstream agent with a
    /// target-specific adaptation context.
    pub async fn propagate_guideline_update(
        &self,
        origin_agent: &str,
        updated_guideline: &Value,
        affected_agents: Option<Vec<String>>,
        outcome: Option<&ValidationOutcome>,
    ) -> PropagationResult {
        let propagation_id = format!("guideline_propagation_{}", Uuid::new_v4());
        let started_at = Utc::now();
        tracing::info!(origin_agent, propagation_id, "propagating guideline update");

        self.health.update_health(
            &format!("water_propagation_{propagation_id}"),
            HealthStatus::healthy(
                SOURCE_ID,
                format!("Propagating update from {origin_agent}"),
            ),
        );
        self.track_state(
            &format!("guideline_propagation:{propagation_id}"),
            json!({
                "agent_id": origin_agent,
                "timestamp": started_at.to_rfc3339(),
                "status": "propagating",
            }),
        )
        .await;

        let affected = affected_agents.unwrap_or_else(|| downstream_agents(origin_agent));
        self.emit_propagation_event(
            EventKind::WaterPropagationStarted,
            &propagation_id,
            origin_agent,
            &affected,
            &[],
            HashMap::new(),
        );

        let mut updates = Vec::new();
        let mut failures = Vec::new();

        for target in &affected {
            let context = build_propagation_context(origin_agent, target, outcome);
            self.bus.emit(
                EventKind::AgentUpdateRequest,
                SOURCE_ID,
                EventPayload::AgentUpdate(AgentUpdatePayload {
                    agent_id: target.clone(),
                    update_type: "guideline".to_string(),
                    content: updated_guideline.clone(),
                    request_id: propagation_id.clone(),
                }),
            );
            let handler = {
                let targets = self.targets.read().await;
                targets.get(target).cloned()
            };
            match handler {
                Some(agent) => match agent.apply_update(&context, updated_guideline).await {
                    Ok(()) => {
                        updates.push(UpdateRecord {
                            agent: target.clone(),
                            success: true,
                            context_provided: true,
                            timestamp: Utc::now(),
                        });
                    }
                    Err(e) => {
                        tracing::error!("error propagating to agent {target}: {e:#}");
                        updates.push(UpdateRecord {
                            agent: target.clone(),
                            success: false,
                            context_provided: true,
                            timestamp: Utc::now(),
                        });
                        failures.push(FailureRecord {
                            agent: target.clone(),
                            reason: e.to_string(),
                            timestamp: Utc::now(),
                        });
                    }
                },
                None => {
                    tracing::error!("no registered apply hook for agent {target}");
                    updates.push(UpdateRecord {
                        agent: target.clone(),
                        success: false,
                        context_provided: false,
                        timestamp: Utc::now(),
                    });
                    failures.push(FailureRecord {
                        agent: target.clone(),
                        reason: "no registered apply hook".to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }
        }

        let success = failures.is_empty();
        let duration = (Utc::now() - started_at).num_milliseconds();

        let mut metadata = HashMap::new();
        metadata.insert("propagation_id".to_string(), json!(propagation_id));
        metadata.insert("origin_agent".to_string(), json!(origin_agent));
        metadata.insert("timestamp".to_string(), json!(started_at.to_rfc3339()));

        self.track_state(
            &format!("guideline_propagation:{propagation_id}"),
            json!({
                "agent_id": origin_agent,
                "status": "completed",
                "success": success,
                "affected_agents": affected,
                "failure_count": failures.len(),
            }),
        )
        .await;

        self.health.update_health(
            &format!("water_propagation_{propagation_id}"),
            HealthStatus::new(
                if success {
                    HealthLevel::Healthy
                } else {
                    HealthLevel::Warning
                },
                SOURCE_ID,
                format!(
                    "Guideline propagation completed with {} updates and {} failures",
                    updates.len(),
                    failures.len()
                ),
            ),
        );

        let mut event_metrics = HashMap::new();
        event_metrics.insert("affected_count".to_string(), json!(affected.len()));
        event_metrics.insert("failure_count".to_string(), json!(failures.len()));
        event_metrics.insert("duration_ms".to_string(), json!(duration));
        self.emit_propagation_event(
            if success {
                EventKind::WaterPropagationComplete
            } else {
                EventKind::WaterPropagationFailed
            },
            &propagation_id,
            origin_agent,
            &affected,
            &failures,
            event_metrics,
        );

        PropagationResult {
            success,
            affected_agents: affected,
            updates,
            failures,
            metadata,
        }
    }

    async fn track_state(&self, key: &str, value: Value) {
        if let Err(e) = self
            .state
            .set_state(
                key,
                StateValue::Mapping(value),
                ResourceType::State,
                None,
                None,
                None,
            )
            .await
        {
            tracing::error!("failed to track propagation state {key}: {e}");
        }
    }

    fn emit_propagation_event(
        &self,
        kind: EventKind,
        propagation_id: &str,
        origin_agent: &str,
        affected: &[String],
        failures: &[FailureRecord],
        metrics: HashMap<String, Value>,
    ) {
        self.bus.emit(
            kind,
            SOURCE_ID,
            EventPayload::Propagation(PropagationEventPayload {
                propagation_id: propagation_id.to_string(),
                origin_agent: origin_agent.to_string(),
                affected_agents: affected.to_vec(),
                failures: failures
                    .iter()
                    .map(|f| PropagationFailure {
                        agent: f.agent.clone(),
                        reason: f.reason.clone(),
                        timestamp: f.timestamp,
                    })
                    .collect(),
                metrics,
            }),
        );
    }
}

/// Build the adaptation context delivered alongside the update.
fn build_propagation_context(
    origin_agent: &str,
    target_agent: &str,
    outcome: Option<&ValidationOutcome>,
) -> PropagationContext {
    let direct_impacts = outcome
        .map(|o| {
            o.detected_issues
                .iter()
                .filter(|issue| {
                    issue.affected_elements.is_empty()
                        || issue
                            .affected_elements
                            .iter()
                            .any(|e| e == target_agent)
                })
                .map(|issue| issue.description.clone())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let integration_guidance = outcome.map(|o| IntegrationGuidance {
        approach: "merge_upstream_changes".to_string(),
        complexity: if o.detected_issues.len() > 2 {
            "high".to_string()
        } else if o.detected_issues.is_empty() {
            "low".to_string()
        } else {
            "medium".to_string()
        },
    });

    PropagationContext {
        origin_agent: origin_agent.to_string(),
        update_summary: format!("Update from {origin_agent} that affects {target_agent}"),
        timestamp: Utc::now(),
        direct_impacts,
        integration_guidance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::StateManagerConfig;
    use crate::domain::models::guideline::{ValidationCategory, ValidationVerdict};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct RecordingTarget {
        id: String,
        applied: StdMutex<Vec<Value>>,
        fail: bool,
    }

    impl RecordingTarget {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                applied: StdMutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                applied: StdMutex::new(Vec::new()),
                fail: true,
            })
        }

        fn applied_count(&self) -> usize {
            self.applied.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DownstreamAgent for RecordingTarget {
        fn agent_id(&self) -> &str {
            &self.id
        }

        async fn apply_update(
            &self,
            _context: &PropagationContext,
            update: &Value,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("apply hook exploded");
            }
            self.applied.lock().unwrap().push(update.clone());
            Ok(())
        }
    }

    async fn propagator() -> WaterPropagator {
        let bus = Arc::new(EventBus::with_defaults());
        let state = StateManager::new(Arc::clone(&bus), StateManagerConfig::default())
            .await
            .unwrap();
        let health = HealthTracker::new(Arc::clone(&bus));
        WaterPropagator::new(state, bus, health)
    }

    fn approved_outcome() -> ValidationOutcome {
        ValidationOutcome {
            validation_result: ValidationVerdict {
                is_valid: true,
                validation_category: ValidationCategory::Approved,
                explanation: "fine".to_string(),
            },
            detected_issues: vec![],
            corrected_update: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_downstream_chain() {
        assert_eq!(
            downstream_agents("garden_planner"),
            ["environmental_analysis", "root_system", "tree_placement"]
        );
        assert_eq!(downstream_agents("root_system"), ["tree_placement"]);
        assert!(downstream_agents("tree_placement").is_empty());
        assert!(downstream_agents("unknown").is_empty());
    }

    #[tokio::test]
    async fn test_successful_propagation() {
        let water = propagator().await;
        let env = RecordingTarget::new("environmental_analysis");
        let root = RecordingTarget::new("root_system");
        let tree = RecordingTarget::new("tree_placement");
        for target in [&env, &root, &tree] {
            water
                .register_target(Arc::clone(target) as Arc<dyn DownstreamAgent>)
                .await;
        }

        let result = water
            .propagate_guideline_update("garden_planner", &json!({"v": 1}), None, None)
            .await;
        assert!(result.success);
        assert_eq!(result.affected_agents.len(), 3);
        assert_eq!(result.updates.len(), result.affected_agents.len());
        assert!(result.failures.is_empty());
        assert_eq!(env.applied_count(), 1);
        assert_eq!(tree.applied_count(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_surfaces_per_agent() {
        let water = propagator().await;
        let env = RecordingTarget::new("environmental_analysis");
        let root = RecordingTarget::failing("root_system");
        let tree = RecordingTarget::new("tree_placement");
        for target in [&env, &root, &tree] {
            water
                .register_target(Arc::clone(target) as Arc<dyn DownstreamAgent>)
                .await;
        }

        let result = water
            .propagate_guideline_update("garden_planner", &json!({"v": 1}), None, None)
            .await;
        assert!(!result.success);
        assert_eq!(result.affected_agents.len(), 3);
        assert_eq!(result.updates.len(), 3);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].agent, "root_system");
        let succeeded: Vec<&str> = result
            .updates
            .iter()
            .filter(|u| u.success)
            .map(|u| u.agent.as_str())
            .collect();
        assert_eq!(succeeded, ["environmental_analysis", "tree_placement"]);
    }

    #[tokio::test]
    async fn test_missing_target_is_a_failure() {
        let water = propagator().await;
        let result = water
            .propagate_guideline_update("root_system", &json!({}), None, None)
            .await;
        assert!(!result.success);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].reason, "no registered apply hook");
        assert!(!result.updates[0].context_provided);
    }

    #[tokio::test]
    async fn test_explicit_override_list() {
        let water = propagator().await;
        let tree = RecordingTarget::new("tree_placement");
        water
            .register_target(Arc::clone(&tree) as Arc<dyn DownstreamAgent>)
            .await;

        let result = water
            .propagate_guideline_update(
                "garden_planner",
                &json!({}),
                Some(vec!["tree_placement".to_string()]),
                None,
            )
            .await;
        assert!(result.success);
        assert_eq!(result.affected_agents, ["tree_placement"]);
    }

    #[tokio::test]
    async fn test_second_pass_is_safe() {
        let water = propagator().await;
        let tree = RecordingTarget::new("tree_placement");
        water
            .register_target(Arc::clone(&tree) as Arc<dyn DownstreamAgent>)
            .await;

        let update = json!({"v": 7});
        let first = water
            .propagate_guideline_update("root_system", &update, None, None)
            .await;
        let second = water
            .propagate_guideline_update("root_system", &update, None, None)
            .await;
        assert!(first.success && second.success);
        let applied = tree.applied.lock().unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0], applied[1]);
    }

    #[tokio::test]
    async fn test_rejected_outcome_short_circuits() {
        let water = propagator().await;
        let mut outcome = approved_outcome();
        outcome.validation_result.validation_category = ValidationCategory::Rejected;
        outcome.validation_result.is_valid = false;

        let result = water
            .propagate_validated("garden_planner", &json!({}), &outcome, None)
            .await;
        assert!(!result.success);
        assert!(result.affected_agents.is_empty());
        assert_eq!(result.failures[0].agent, "all");
    }

    #[tokio::test]
    async fn test_accepted_outcome_flows_through() {
        let water = propagator().await;
        let tree = RecordingTarget::new("tree_placement");
        water
            .register_target(Arc::clone(&tree) as Arc<dyn DownstreamAgent>)
            .await;
        let result = water
            .propagate_validated("root_system", &json!({}), &approved_outcome(), None)
            .await;
        assert!(result.success);
    }

    #[test]
    fn test_context_carries_guidance_when_outcome_present() {
        let context = build_propagation_context("garden_planner", "root_system", Some(&approved_outcome()));
        assert_eq!(context.origin_agent, "garden_planner");
        assert!(context.update_summary.contains("root_system"));
        let guidance = context.integration_guidance.unwrap();
        assert_eq!(guidance.complexity, "low");

        let bare = build_propagation_context("garden_planner", "root_system", None);
        assert!(bare.integration_guidance.is_none());
        assert!(bare.direct_impacts.is_empty());
    }
}
