//! Refinement lifecycle manager.
//!
//! Drives the three-stage improvement loop (refine, reflect, revise)
//! when an agent's output fails validation, tracks every iteration,
//! arbitrates when several agents could be at fault, and purges
//! obsolete refinement contexts on backtracking transitions. Stage
//! timeouts are first-class results, not exceptions: a timed-out stage
//! yields an error mapping with `success = false`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::domain::models::health::{HealthLevel, HealthStatus};
use crate::domain::models::refinement::{
    Confidence, RefinementContext, RefinementIteration, RefinementStage, ValidationState,
};
use crate::domain::models::state::{ResourceType, StateValue};
use crate::domain::ports::agent::RefinementAgent;
use crate::services::event_bus::{
    EventBus, EventKind, EventPayload, RefinementContextPayload, RefinementIterationPayload,
    ResourceStatePayload,
};
use crate::services::monitor::{MemoryMonitor, MetricsRecorder, SystemMonitor};
use crate::services::state_manager::StateManager;

const SOURCE_ID: &str = "refinement_manager";

const CONTEXT_KEY_PREFIX: &str = "refinement_context:";
const ITERATION_KEY_PREFIX: &str = "refinement_iteration:";
const VALIDATION_STATE_KEY_PREFIX: &str = "component_validation_state:";

/// Default arbitration budget.
const ARBITRATION_TIMEOUT: Duration = Duration::from_secs(240);

/// Per-stage timeout budgets.
#[derive(Debug, Clone, Copy)]
pub struct RefinementTimeouts {
    pub refinement: Duration,
    pub reflection: Duration,
    pub revision: Duration,
}

impl Default for RefinementTimeouts {
    fn default() -> Self {
        Self {
            refinement: Duration::from_secs(120),
            reflection: Duration::from_secs(60),
            revision: Duration::from_secs(90),
        }
    }
}

/// Result of one timed stage.
#[derive(Debug, Clone)]
pub enum StageOutcome<T> {
    Completed(T),
    /// The stage overran its budget; carries the structured error.
    TimedOut(Value),
    /// The stage failed outright; carries the structured error.
    Failed(Value),
}

impl<T> StageOutcome<T> {
    pub fn success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// The structured error mapping for non-completed stages.
    pub fn error_value(&self) -> Option<&Value> {
        match self {
            Self::Completed(_) => None,
            Self::TimedOut(v) | Self::Failed(v) => Some(v),
        }
    }

    pub fn into_completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Outcome of an arbitration call.
#[derive(Debug, Clone)]
pub struct ArbitrationDecision {
    pub responsible_agent: String,
    pub root_cause_agent: Option<String>,
    pub revision_state: ValidationState,
}

/// The refinement lifecycle manager. Owns every context exclusively;
/// callers receive context ids, never mutable contexts.
pub struct RefinementManager {
    state: Arc<StateManager>,
    bus: Arc<EventBus>,
    metrics: Arc<MetricsRecorder>,
    memory: Option<Arc<MemoryMonitor>>,
    monitor: Option<Arc<SystemMonitor>>,
    contexts: Mutex<HashMap<String, RefinementContext>>,
    iterations: Mutex<HashMap<String, Vec<RefinementIteration>>>,
}

impl RefinementManager {
    pub fn new(
        state: Arc<StateManager>,
        bus: Arc<EventBus>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            state,
            bus,
            metrics,
            memory: None,
            monitor: None,
            contexts: Mutex::new(HashMap::new()),
            iterations: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_memory_monitor(mut self, memory: Arc<MemoryMonitor>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_system_monitor(mut self, monitor: Arc<SystemMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Create and register a refinement context.
    pub async fn create_refinement_context(
        &self,
        component_id: &str,
        validation_state: ValidationState,
        responsible_agent: Option<String>,
        validation_errors: Vec<HashMap<String, Value>>,
        metadata: Option<HashMap<String, Value>>,
    ) -> RefinementContext {
        let mut context =
            RefinementContext::new(component_id, validation_state, responsible_agent);
        context.validation_errors = validation_errors;
        context.metadata = metadata.unwrap_or_default();

        if let Ok(serialized) = serde_json::to_value(&context) {
            self.track_state(
                &format!("{CONTEXT_KEY_PREFIX}{}", context.context_id),
                serialized.clone(),
            )
            .await;
            if let Some(memory) = &self.memory {
                memory.track_value(
                    &format!("{CONTEXT_KEY_PREFIX}{}", context.context_id),
                    &serialized,
                );
            }
        }

        self.emit_context_event(&context, "created");

        let mut metric_meta = HashMap::new();
        metric_meta.insert("context_id".to_string(), json!(context.context_id));
        metric_meta.insert("component_id".to_string(), json!(component_id));
        metric_meta.insert(
            "validation_state".to_string(),
            json!(validation_state.as_str()),
        );
        metric_meta.insert(
            "error_count".to_string(),
            json!(context.validation_errors.len()),
        );
        self.metrics
            .record_metric("refinement:context_created", 1.0, metric_meta);

        self.contexts
            .lock()
            .await
            .insert(context.context_id.clone(), context.clone());
        context
    }

    /// Record one iteration within a context.
    pub async fn track_refinement_iteration(
        &self,
        context_id: &str,
        iteration_number: u32,
        refinement_type: RefinementStage,
        success: bool,
        duration_seconds: f64,
        metadata: Option<HashMap<String, Value>>,
    ) -> RefinementIteration {
        let iteration = RefinementIteration {
            context_id: context_id.to_string(),
            iteration_number,
            refinement_type,
            timestamp: Utc::now(),
            success,
            duration_seconds,
            metadata: metadata.unwrap_or_default(),
        };

        self.iterations
            .lock()
            .await
            .entry(context_id.to_string())
            .or_default()
            .push(iteration.clone());

        if let Ok(serialized) = serde_json::to_value(&iteration) {
            self.track_state(
                &format!(
                    "{ITERATION_KEY_PREFIX}{context_id}:{iteration_number}:{refinement_type}"
                ),
                serialized,
            )
            .await;
        }

        let mut metric_meta = HashMap::new();
        metric_meta.insert("context_id".to_string(), json!(context_id));
        metric_meta.insert("iteration".to_string(), json!(iteration_number));
        metric_meta.insert("success".to_string(), json!(success));
        self.metrics.record_metric(
            &format!("refinement:{refinement_type}"),
            duration_seconds,
            metric_meta,
        );

        self.bus.emit(
            EventKind::ComponentRefinementIteration,
            SOURCE_ID,
            EventPayload::RefinementIteration(RefinementIterationPayload {
                context_id: context_id.to_string(),
                iteration_number,
                refinement_type: refinement_type.to_string(),
                success,
                duration_seconds,
                metadata: HashMap::new(),
            }),
        );

        iteration
    }

    pub async fn get_context(&self, context_id: &str) -> Option<RefinementContext> {
        self.contexts.lock().await.get(context_id).cloned()
    }

    pub async fn active_context_ids(&self) -> Vec<String> {
        self.contexts.lock().await.keys().cloned().collect()
    }

    pub async fn iterations_for(&self, context_id: &str) -> Vec<RefinementIteration> {
        self.iterations
            .lock()
            .await
            .get(context_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Mark a context finished after a validation pass and drop it.
    pub async fn complete_context(&self, context_id: &str) {
        let Some(context) = self.contexts.lock().await.remove(context_id) else {
            return;
        };
        self.discard_context_data(&context, "completed").await;
    }

    /// Remove every context made obsolete by a backtracking transition.
    ///
    /// A context is obsolete when the new state strictly precedes its
    /// own in the canonical ordering; the arbitration exception wins,
    /// so a context parked in ARBITRATION survives a move into any
    /// revising state. Contexts owned by `preserve_agent` are kept
    /// regardless.
    pub async fn cleanup_obsolete_contexts(
        &self,
        new_state: ValidationState,
        preserve_agent: Option<&str>,
    ) -> usize {
        let obsolete: Vec<RefinementContext> = {
            let contexts = self.contexts.lock().await;
            contexts
                .values()
                .filter(|context| {
                    if let Some(agent) = preserve_agent {
                        if context.responsible_agent.as_deref() == Some(agent) {
                            return false;
                        }
                    }
                    is_context_obsolete(context.validation_state, new_state)
                })
                .cloned()
                .collect()
        };

        let mut removed_contexts = 0;
        let mut removed_iterations = 0;
        for context in obsolete {
            // Context and iterations go together or not at all.
            {
                let mut contexts = self.contexts.lock().await;
                let mut iterations = self.iterations.lock().await;
                contexts.remove(&context.context_id);
                removed_iterations += iterations
                    .remove(&context.context_id)
                    .map_or(0, |list| list.len());
            }
            self.discard_context_data(&context, "cleaned_up").await;
            removed_contexts += 1;
        }

        if removed_contexts > 0 {
            let mut metric_meta = HashMap::new();
            metric_meta.insert("iterations_cleaned".to_string(), json!(removed_iterations));
            metric_meta.insert(
                "new_validation_state".to_string(),
                json!(new_state.as_str()),
            );
            metric_meta.insert(
                "agent_filter".to_string(),
                json!(preserve_agent.unwrap_or("none")),
            );
            self.metrics
                .record_metric("refinement:contexts_cleaned", removed_contexts as f64, metric_meta);
        }
        removed_contexts
    }

    /// Delete persisted context/iteration state and announce the
    /// context's final disposition.
    async fn discard_context_data(&self, context: &RefinementContext, disposition: &str) {
        let context_key = format!("{CONTEXT_KEY_PREFIX}{}", context.context_id);
        let iteration_prefix = format!("{ITERATION_KEY_PREFIX}{}:", context.context_id);
        for key in self.state.get_keys_by_prefix(&iteration_prefix).await {
            self.state.clear_state(Some(&key)).await;
        }
        self.state.clear_state(Some(&context_key)).await;
        if let Some(memory) = &self.memory {
            memory.remove_resource(&context_key);
        }
        self.emit_context_event(context, disposition);
    }

    /// Move a component's validation pipeline to a new state,
    /// triggering obsolete-context cleanup when the move backtracks.
    pub async fn transition_validation_state(
        &self,
        component_id: &str,
        new_state: ValidationState,
        preserve_agent: Option<&str>,
    ) -> usize {
        let key = format!("{VALIDATION_STATE_KEY_PREFIX}{component_id}");
        let old_state = self
            .state
            .get_state(&key, None, true)
            .await
            .and_then(|entry| match entry.state {
                StateValue::Mapping(value) => value
                    .get("state")
                    .and_then(|s| serde_json::from_value::<ValidationState>(s.clone()).ok()),
                _ => None,
            })
            .unwrap_or(ValidationState::NotStarted);

        self.track_state(
            &key,
            json!({
                "state": new_state.as_str(),
                "previous": old_state.as_str(),
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await;

        self.bus.emit(
            EventKind::ComponentValidationStateChanged,
            SOURCE_ID,
            EventPayload::ResourceState(ResourceStatePayload {
                resource_id: component_id.to_string(),
                state: new_state.as_str().to_string(),
                resource_type: "COMPONENT".to_string(),
                previous_state: Some(old_state.as_str().to_string()),
                ..Default::default()
            }),
        );

        // Any precedence-decreasing move sweeps obsolete contexts; the
        // arbitration handoff is included even though the ordering does
        // not call it backtracking, since contexts beyond the target
        // state are stale either way.
        if new_state.precedence() < old_state.precedence() {
            tracing::info!(
                component_id,
                from = old_state.as_str(),
                to = new_state.as_str(),
                "cleaning obsolete contexts after precedence drop"
            );
            self.cleanup_obsolete_contexts(new_state, preserve_agent).await
        } else {
            0
        }
    }

    /// Race a stage against its budget, keeping the system monitor's
    /// operation ledger current. Returns the outcome, the wall-clock
    /// duration, and whether the stage completed.
    pub async fn run_with_timeout<T, F>(
        &self,
        future: F,
        timeout: Duration,
        context_id: &str,
        operation_type: &str,
    ) -> (StageOutcome<T>, f64, bool)
    where
        F: std::future::Future<Output = anyhow::Result<T>>,
    {
        let operation_id = format!("refinement_{operation_type}_{context_id}");
        let started = std::time::Instant::now();
        if let Some(monitor) = &self.monitor {
            let mut metadata = HashMap::new();
            metadata.insert("operation_type".to_string(), json!(operation_type));
            metadata.insert("context_id".to_string(), json!(context_id));
            metadata.insert(
                "timeout_seconds".to_string(),
                json!(timeout.as_secs_f64()),
            );
            monitor.register_operation(&operation_id, metadata);
        }

        let result = tokio::time::timeout(timeout, future).await;
        let duration = started.elapsed().as_secs_f64();

        match result {
            Ok(Ok(value)) => {
                if let Some(monitor) = &self.monitor {
                    let mut updates = HashMap::new();
                    updates.insert("duration_seconds".to_string(), json!(duration));
                    monitor.update_operation(&operation_id, "completed", updates);
                }
                (StageOutcome::Completed(value), duration, true)
            }
            Ok(Err(e)) => {
                if let Some(monitor) = &self.monitor {
                    let mut updates = HashMap::new();
                    updates.insert("error".to_string(), json!(e.to_string()));
                    monitor.update_operation(&operation_id, "error", updates);
                }
                tracing::error!("error in {operation_type} for context {context_id}: {e:#}");
                (
                    StageOutcome::Failed(json!({
                        "error": format!("Operation failed: {e}"),
                    })),
                    duration,
                    false,
                )
            }
            Err(_) => {
                if let Some(monitor) = &self.monitor {
                    let mut updates = HashMap::new();
                    updates.insert("duration_seconds".to_string(), json!(duration));
                    monitor.update_operation(&operation_id, "timeout", updates);
                }
                let mut metric_meta = HashMap::new();
                metric_meta.insert("context_id".to_string(), json!(context_id));
                metric_meta.insert(
                    "timeout_seconds".to_string(),
                    json!(timeout.as_secs_f64()),
                );
                self.metrics.record_metric(
                    &format!("refinement:{operation_type}_timeout"),
                    1.0,
                    metric_meta,
                );
                tracing::warn!(
                    "timeout in {operation_type} for context {context_id} after {duration:.1}s"
                );
                (
                    StageOutcome::TimedOut(json!({
                        "error": format!(
                            "Operation timed out after {} seconds",
                            timeout.as_secs_f64()
                        ),
                    })),
                    duration,
                    false,
                )
            }
        }
    }

    /// The three-stage loop. Each iteration refines, reflects, and
    /// revises under separate budgets; the best-scoring revision so far
    /// wins when no iteration meets the quality bar. Stage failures
    /// fall back to the last good artifact (or surface the stage error
    /// when the very first refine fails).
    pub async fn three_stage_refinement(
        &self,
        context_id: &str,
        agent: Arc<dyn RefinementAgent>,
        initial_input: Value,
        timeouts: RefinementTimeouts,
        max_iterations: u32,
    ) -> Value {
        let mut current_input = initial_input;
        let mut best: Option<(f64, Value)> = None;
        let mut last_revision: Option<Value> = None;

        for iteration in 1..=max_iterations {
            // 1. Refine.
            let (outcome, duration, success) = self
                .run_with_timeout(
                    agent.refine(&current_input),
                    timeouts.refinement,
                    context_id,
                    "refine",
                )
                .await;
            self.track_refinement_iteration(
                context_id,
                iteration,
                RefinementStage::Refine,
                success,
                duration,
                None,
            )
            .await;
            let refined = match outcome {
                StageOutcome::Completed(refined) => refined,
                other => {
                    tracing::warn!(
                        "refine failed on iteration {iteration}, stopping refinement"
                    );
                    return best
                        .map(|(_, artifact)| artifact)
                        .or(last_revision)
                        .unwrap_or_else(|| other.error_value().cloned().unwrap_or(Value::Null));
                }
            };

            // 2. Reflect.
            let (outcome, duration, success) = self
                .run_with_timeout(
                    agent.reflect(&refined),
                    timeouts.reflection,
                    context_id,
                    "reflect",
                )
                .await;
            self.track_refinement_iteration(
                context_id,
                iteration,
                RefinementStage::Reflect,
                success,
                duration,
                None,
            )
            .await;
            let reflection = match outcome {
                StageOutcome::Completed(reflection) => reflection,
                _ => {
                    tracing::warn!(
                        "reflect failed on iteration {iteration}, using best result so far"
                    );
                    return best
                        .map(|(_, artifact)| artifact)
                        .or(last_revision)
                        .unwrap_or(refined);
                }
            };

            // 3. Revise.
            let (outcome, duration, success) = self
                .run_with_timeout(
                    agent.revise(&refined, &reflection),
                    timeouts.revision,
                    context_id,
                    "revise",
                )
                .await;
            self.track_refinement_iteration(
                context_id,
                iteration,
                RefinementStage::Revise,
                success,
                duration,
                None,
            )
            .await;
            let revision = match outcome {
                StageOutcome::Completed(revision) => revision,
                _ => {
                    tracing::warn!(
                        "revise failed on iteration {iteration}, using best result so far"
                    );
                    return best
                        .map(|(_, artifact)| artifact)
                        .or(last_revision)
                        .unwrap_or(refined);
                }
            };

            let score = revision.confidence_assessment.score();
            if best.as_ref().is_none_or(|(b, _)| score > *b) {
                best = Some((score, revision.artifact.clone()));
            }
            last_revision = Some(revision.artifact.clone());

            if revision.confidence_assessment == Confidence::High
                && revision.remaining_uncertainties.len() <= 1
            {
                tracing::info!(
                    "refinement meets quality threshold on iteration {iteration}, stopping early"
                );
                return revision.artifact;
            }

            current_input = revision.artifact;
        }

        best.map(|(_, artifact)| artifact)
            .or(last_revision)
            .unwrap_or(Value::Null)
    }

    /// Ask the arbitration agent which pipeline agent must revise, and
    /// map its answer onto the corresponding revising state. A missing
    /// or unusable answer defaults to description revision.
    pub async fn arbitrate(
        &self,
        component_id: &str,
        agent: Arc<dyn RefinementAgent>,
        arbitration_context: Value,
        timeout: Option<Duration>,
    ) -> ArbitrationDecision {
        let context = self
            .create_refinement_context(
                component_id,
                ValidationState::Arbitration,
                Some(agent.agent_id().to_string()),
                Vec::new(),
                None,
            )
            .await;

        let (outcome, duration, success) = self
            .run_with_timeout(
                agent.arbitrate(&arbitration_context),
                timeout.unwrap_or(ARBITRATION_TIMEOUT),
                &context.context_id,
                "arbitrate",
            )
            .await;
        self.track_refinement_iteration(
            &context.context_id,
            1,
            RefinementStage::Arbitrate,
            success,
            duration,
            None,
        )
        .await;

        let decided = outcome.into_completed().and_then(|result| {
            result
                .responsible_agent
                .as_ref()
                .and_then(|agent_id| {
                    revision_state_for_agent(agent_id)
                        .map(|state| (agent_id.clone(), result.root_cause_agent.clone(), state))
                })
        });

        let decision = match decided {
            Some((responsible_agent, root_cause_agent, revision_state)) => ArbitrationDecision {
                responsible_agent,
                root_cause_agent,
                revision_state,
            },
            None => {
                tracing::warn!(
                    component_id,
                    "arbitration produced no usable mapping, defaulting to description revision"
                );
                ArbitrationDecision {
                    responsible_agent: "garden_planner".to_string(),
                    root_cause_agent: None,
                    revision_state: ValidationState::DescriptionRevising,
                }
            }
        };

        let mut metric_meta = HashMap::new();
        metric_meta.insert("component_id".to_string(), json!(component_id));
        metric_meta.insert(
            "responsible_agent".to_string(),
            json!(decision.responsible_agent),
        );
        self.metrics
            .record_metric("refinement:arbitration_completed", 1.0, metric_meta);

        decision
    }

    pub async fn get_health_status(&self) -> HealthStatus {
        let active = self.contexts.lock().await.len();
        let iteration_count: usize = self
            .iterations
            .lock()
            .await
            .values()
            .map(Vec::len)
            .sum();
        let avg = iteration_count as f64 / active.max(1) as f64;

        let mut status = HealthLevel::Healthy;
        let mut description = "Refinement manager operating normally".to_string();
        if avg > 7.5 {
            status = HealthLevel::Degraded;
            description =
                "High average iteration count, refinement may be struggling".to_string();
        }
        if active > 10 {
            status = HealthLevel::Degraded;
            description = "High number of active refinement contexts".to_string();
        }

        let mut metadata = HashMap::new();
        metadata.insert("active_contexts".to_string(), json!(active));
        metadata.insert("total_iterations".to_string(), json!(iteration_count));
        metadata.insert("avg_iterations".to_string(), json!(avg));
        HealthStatus::new(status, SOURCE_ID, description).with_metadata(metadata)
    }

    fn emit_context_event(&self, context: &RefinementContext, disposition: &str) {
        self.bus.emit(
            if disposition == "created" {
                EventKind::ComponentRefinementCreated
            } else {
                EventKind::ComponentRefinementUpdated
            },
            SOURCE_ID,
            EventPayload::RefinementContext(RefinementContextPayload {
                context_id: context.context_id.clone(),
                component_id: context.component_id.clone(),
                validation_state: context.validation_state.as_str().to_string(),
                responsible_agent: context.responsible_agent.clone(),
                error_count: context.validation_errors.len(),
                state: disposition.to_string(),
                metadata: HashMap::new(),
            }),
        );
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
            tracing::error!("failed to track refinement state {key}: {e}");
        }
    }
}

/// A context is obsolete when the new state strictly precedes its own,
/// except that arbitration handing off to a revising state keeps every
/// parked context alive.
fn is_context_obsolete(context_state: ValidationState, new_state: ValidationState) -> bool {
    if context_state == ValidationState::Arbitration && new_state.is_revising() {
        return false;
    }
    new_state.precedence() < context_state.precedence()
}

/// Which revising state each pipeline agent's deliverable maps to.
fn revision_state_for_agent(agent_id: &str) -> Option<ValidationState> {
    match agent_id {
        "garden_planner" => Some(ValidationState::DescriptionRevising),
        "environmental_analysis" => Some(ValidationState::RequirementsRevising),
        "root_system" => Some(ValidationState::DataFlowRevising),
        "tree_placement" => Some(ValidationState::FeaturesRevising),
        _ => None,
    }
}
