//! Earth layer: tiered guideline-update validation.
//!
//! For a proposed update at one of three abstraction tiers, the
//! validator enriches the input with dependency context (affected
//! downstream elements, cycle and undefined-reference impacts), asks
//! the validation agent to decide, and optionally runs a
//! reflection/revision loop over that decision. Failures anywhere in
//! the path come back as REJECTED envelopes, never as errors.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::domain::models::guideline::{
    AbstractionTier, ComponentManifest, DependencyContext, DependencyImpact, FeatureSet,
    FunctionalitySet, ScopedElement, ValidationCategory, ValidationOutcome,
};
use crate::domain::models::state::{ResourceType, StateValue};
use crate::domain::ports::agent::{ValidationAgent, ValidationRequest};
use crate::services::event_bus::{
    EventBus, EventKind, EventPayload, ValidationEventPayload,
};
use crate::services::monitor::MetricsRecorder;
use crate::services::state_manager::StateManager;

const SOURCE_ID: &str = "earth_validator";

/// Early-exit threshold for reflection quality (0-10).
const REFLECTION_QUALITY_THRESHOLD: f64 = 7.0;
/// Early-exit threshold for revision confidence (0-10).
const REVISION_CONFIDENCE_THRESHOLD: f64 = 8.0;

/// One remembered validation, kept per originating agent.
#[derive(Debug, Clone)]
pub struct ValidationRecord {
    pub operation_id: String,
    pub tier: AbstractionTier,
    pub timestamp: chrono::DateTime<Utc>,
    pub is_valid: bool,
}

/// Aggregate statistics over all validations this validator has run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationStats {
    pub total_validations: usize,
    pub validations_by_agent: HashMap<String, usize>,
    pub validations_by_tier: HashMap<String, usize>,
    pub approval_rate: f64,
}

/// Configuration for the earth validator.
#[derive(Debug, Clone)]
pub struct EarthConfig {
    /// Reflection/revision cycles per operation.
    pub max_iterations: u32,
}

impl Default for EarthConfig {
    fn default() -> Self {
        Self { max_iterations: 3 }
    }
}

/// The earth validator.
pub struct EarthValidator {
    agent: Arc<dyn ValidationAgent>,
    state: Arc<StateManager>,
    bus: Arc<EventBus>,
    metrics: Arc<MetricsRecorder>,
    config: EarthConfig,
    validation_history: StdMutex<HashMap<String, Vec<ValidationRecord>>>,
    revision_attempts: StdMutex<HashMap<String, u32>>,
}

impl EarthValidator {
    pub fn new(
        agent: Arc<dyn ValidationAgent>,
        state: Arc<StateManager>,
        bus: Arc<EventBus>,
        metrics: Arc<MetricsRecorder>,
        config: EarthConfig,
    ) -> Self {
        Self {
            agent,
            state,
            bus,
            metrics,
            config,
            validation_history: StdMutex::new(HashMap::new()),
            revision_attempts: StdMutex::new(HashMap::new()),
        }
    }

    /// Validate with a tier arriving as a raw string, producing the
    /// `invalid_abstraction_tier` rejection for unknown names.
    pub async fn validate_guideline_update_raw(
        &self,
        tier: &str,
        agent_id: &str,
        current_guideline: &Value,
        proposed_update: &Value,
        operation_id: Option<String>,
        with_reflection: bool,
    ) -> ValidationOutcome {
        match tier.parse::<AbstractionTier>() {
            Ok(tier) => {
                self.validate_guideline_update(
                    tier,
                    agent_id,
                    current_guideline,
                    proposed_update,
                    operation_id,
                    with_reflection,
                )
                .await
            }
            Err(_) => {
                tracing::error!("invalid abstraction tier: {tier}");
                ValidationOutcome::invalid_tier(agent_id, tier)
            }
        }
    }

    /// Validate a proposed guideline update for the given tier.
    pub async fn validate_guideline_update(
        &self,
        tier: AbstractionTier,
        agent_id: &str,
        current_guideline: &Value,
        proposed_update: &Value,
        operation_id: Option<String>,
        with_reflection: bool,
    ) -> ValidationOutcome {
        tracing::info!(
            tier = %tier,
            agent_id,
            "validating guideline update"
        );
        let operation_id = operation_id
            .unwrap_or_else(|| format!("validation_{agent_id}_{}", Uuid::new_v4()));
        let validation_id = format!("earth_validation:{operation_id}");

        self.track_state(
            &validation_id,
            json!({
                "status": "in_progress",
                "tier": tier.as_str(),
                "agent_id": agent_id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await;
        self.emit_validation_event(
            EventKind::EarthValidationStarted,
            &validation_id,
            agent_id,
            tier,
            None,
        );

        let request = prepare_validation_request(tier, agent_id, current_guideline, proposed_update);

        let outcome = match self.agent.validate(tier, &request).await {
            Ok(initial) => {
                if with_reflection {
                    self.reflect_and_revise(tier, &request, initial, &operation_id)
                        .await
                } else {
                    initial
                }
            }
            Err(e) => {
                tracing::error!("error validating guideline update: {e:#}");
                self.track_state(
                    &validation_id,
                    json!({
                        "status": "error",
                        "tier": tier.as_str(),
                        "agent_id": agent_id,
                        "error": e.to_string(),
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                )
                .await;
                let outcome = ValidationOutcome::system_error(agent_id, e);
                self.emit_validation_event(
                    EventKind::EarthValidationFailed,
                    &validation_id,
                    agent_id,
                    tier,
                    Some(&outcome),
                );
                return outcome;
            }
        };

        self.track_state(
            &validation_id,
            json!({
                "status": "completed",
                "tier": tier.as_str(),
                "agent_id": agent_id,
                "is_valid": outcome.validation_result.is_valid,
                "category": outcome.validation_result.validation_category.to_string(),
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await;

        self.validation_history
            .lock()
            .expect("history lock poisoned")
            .entry(agent_id.to_string())
            .or_default()
            .push(ValidationRecord {
                operation_id: operation_id.clone(),
                tier,
                timestamp: Utc::now(),
                is_valid: outcome.validation_result.is_valid,
            });

        let mut metadata = HashMap::new();
        metadata.insert("agent_id".to_string(), json!(agent_id));
        metadata.insert("tier".to_string(), json!(tier.as_str()));
        metadata.insert(
            "is_valid".to_string(),
            json!(outcome.validation_result.is_valid),
        );
        self.metrics
            .record_metric("earth_agent:validation_count", 1.0, metadata);

        self.emit_validation_event(
            EventKind::EarthValidationComplete,
            &validation_id,
            agent_id,
            tier,
            Some(&outcome),
        );
        outcome
    }

    /// Reflection/revision loop over an initial decision.
    ///
    /// Each cycle asks for a reflection, exits early on a high-quality
    /// decision with no critical improvements, otherwise requests a
    /// revision; high confidence without a category change also exits.
    /// Every completed pair is persisted under
    /// `earth_validation:{op}:revision:{n}`.
    async fn reflect_and_revise(
        &self,
        tier: AbstractionTier,
        request: &ValidationRequest,
        initial: ValidationOutcome,
        operation_id: &str,
    ) -> ValidationOutcome {
        let mut current = initial;
        loop {
            let attempt = {
                let mut attempts = self
                    .revision_attempts
                    .lock()
                    .expect("revision attempts poisoned");
                let counter = attempts.entry(operation_id.to_string()).or_insert(0);
                if *counter >= self.config.max_iterations {
                    break;
                }
                *counter += 1;
                *counter
            };
            tracing::info!(
                operation_id,
                attempt,
                max = self.config.max_iterations,
                "starting reflection/revision iteration"
            );

            let reflection = match self.agent.reflect(tier, request, &current, attempt).await {
                Ok(reflection) => reflection,
                Err(e) => {
                    tracing::error!("error in reflection iteration {attempt}: {e:#}");
                    break;
                }
            };
            if reflection.decision_quality_score >= REFLECTION_QUALITY_THRESHOLD
                && reflection.critical_improvements.is_empty()
            {
                tracing::info!(
                    score = reflection.decision_quality_score,
                    "reflection indicates high quality decision, stopping revision"
                );
                break;
            }

            let revision = match self
                .agent
                .revise(tier, request, &current, &reflection, attempt)
                .await
            {
                Ok(revision) => revision,
                Err(e) => {
                    tracing::error!("error in revision iteration {attempt}: {e:#}");
                    break;
                }
            };
            let Some(revised) = revision.revised_validation.clone() else {
                tracing::warn!("revision produced no revised validation in iteration {attempt}");
                break;
            };
            current = revised;

            self.track_state(
                &format!("earth_validation:{operation_id}:revision:{attempt}"),
                json!({
                    "reflection": {
                        "decision_quality_score": reflection.decision_quality_score,
                        "critical_improvements": reflection.critical_improvements,
                    },
                    "revision": {
                        "confidence_score": revision.confidence_score,
                        "category_changed": revision.category_changed,
                    },
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            )
            .await;

            let mut metadata = HashMap::new();
            metadata.insert("operation_id".to_string(), json!(operation_id));
            metadata.insert("attempt".to_string(), json!(attempt));
            metadata.insert(
                "decision_quality".to_string(),
                json!(reflection.decision_quality_score),
            );
            metadata.insert("confidence".to_string(), json!(revision.confidence_score));
            self.metrics
                .record_metric("earth_agent:revision_completed", 1.0, metadata);

            if revision.confidence_score >= REVISION_CONFIDENCE_THRESHOLD
                && !revision.category_changed
            {
                tracing::info!(
                    confidence = revision.confidence_score,
                    "revision indicates high confidence, stopping"
                );
                break;
            }
        }
        current
    }

    /// Validate, then hand back the guideline downstream consumers
    /// should adopt: the corrected mapping on CORRECTED, the proposal
    /// on APPROVED, the current guideline otherwise.
    pub async fn process_guideline_update(
        &self,
        tier: AbstractionTier,
        agent_id: &str,
        current_guideline: &Value,
        proposed_update: &Value,
        operation_id: Option<String>,
        with_reflection: bool,
        auto_propagate: bool,
    ) -> (bool, Value, ValidationOutcome) {
        let operation_id =
            operation_id.unwrap_or_else(|| format!("validation_{agent_id}_{}", Uuid::new_v4()));
        let outcome = self
            .validate_guideline_update(
                tier,
                agent_id,
                current_guideline,
                proposed_update,
                Some(operation_id.clone()),
                with_reflection,
            )
            .await;

        let (accepted, final_guideline) = match outcome.validation_result.validation_category {
            ValidationCategory::Approved => (true, proposed_update.clone()),
            ValidationCategory::Corrected => match &outcome.corrected_update {
                Some(corrected) => (true, corrected.clone()),
                None => {
                    tracing::warn!(
                        "validation reported CORRECTED but no corrected_update for {agent_id}"
                    );
                    (false, current_guideline.clone())
                }
            },
            ValidationCategory::Rejected => (false, current_guideline.clone()),
        };

        if accepted && auto_propagate {
            self.bus.emit(
                EventKind::ValidationCompleted,
                SOURCE_ID,
                EventPayload::Validation(ValidationEventPayload {
                    validation_id: format!("earth_validation:{operation_id}"),
                    agent_id: agent_id.to_string(),
                    is_valid: true,
                    validation_category: outcome
                        .validation_result
                        .validation_category
                        .to_string(),
                    detected_issues: outcome.detected_issues.clone(),
                    tier: tier.as_str().to_string(),
                    corrected_update: Some(final_guideline.clone()),
                }),
            );
            tracing::info!("emitted validation complete for auto-propagation from {agent_id}");
        }

        (accepted, final_guideline, outcome)
    }

    pub fn validation_history(&self, agent_id: &str) -> Vec<ValidationRecord> {
        self.validation_history
            .lock()
            .expect("history lock poisoned")
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn validation_stats(&self) -> ValidationStats {
        let history = self.validation_history.lock().expect("history lock poisoned");
        let mut by_agent = HashMap::new();
        let mut by_tier: HashMap<String, usize> = HashMap::new();
        let mut total = 0;
        let mut approved = 0;
        for (agent_id, records) in history.iter() {
            by_agent.insert(agent_id.clone(), records.len());
            for record in records {
                total += 1;
                *by_tier.entry(record.tier.as_str().to_string()).or_insert(0) += 1;
                if record.is_valid {
                    approved += 1;
                }
            }
        }
        ValidationStats {
            total_validations: total,
            validations_by_agent: by_agent,
            validations_by_tier: by_tier,
            approval_rate: if total > 0 {
                approved as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Revision attempts consumed for an operation so far.
    pub fn revision_count(&self, operation_id: &str) -> u32 {
        self.revision_attempts
            .lock()
            .expect("revision attempts poisoned")
            .get(operation_id)
            .copied()
            .unwrap_or(0)
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
            tracing::error!("failed to track validation state {key}: {e}");
        }
    }

    fn emit_validation_event(
        &self,
        kind: EventKind,
        validation_id: &str,
        agent_id: &str,
        tier: AbstractionTier,
        outcome: Option<&ValidationOutcome>,
    ) {
        let payload = ValidationEventPayload {
            validation_id: validation_id.to_string(),
            agent_id: agent_id.to_string(),
            is_valid: outcome.is_some_and(|o| o.validation_result.is_valid),
            validation_category: outcome.map_or_else(
                || "undefined".to_string(),
                |o| o.validation_result.validation_category.to_string(),
            ),
            detected_issues: outcome.map(|o| o.detected_issues.clone()).unwrap_or_default(),
            tier: tier.as_str().to_string(),
            corrected_update: outcome.and_then(|o| o.corrected_update.clone()),
        };
        self.bus.emit(kind, SOURCE_ID, EventPayload::Validation(payload));
    }
}

/// Build the enriched request the validation agent sees.
pub fn prepare_validation_request(
    tier: AbstractionTier,
    agent_id: &str,
    current_guideline: &Value,
    proposed_update: &Value,
) -> ValidationRequest {
    let dependency_context = match tier {
        AbstractionTier::Component => component_dependency_context(proposed_update),
        AbstractionTier::Feature => feature_dependency_context(proposed_update),
        AbstractionTier::Functionality => functionality_dependency_context(proposed_update),
    };
    ValidationRequest {
        agent_id: agent_id.to_string(),
        current_guideline: current_guideline.clone(),
        proposed_update: proposed_update.clone(),
        dependency_context,
        timestamp: Utc::now(),
    }
}

/// Component tier: who sits downstream of each changed component, plus
/// cycle and undefined-reference impacts over required dependencies.
fn component_dependency_context(proposed_update: &Value) -> DependencyContext {
    let manifest = ComponentManifest::parse(proposed_update);
    let names: HashSet<&str> = manifest
        .ordered_components
        .iter()
        .map(|c| c.name.as_str())
        .filter(|n| !n.is_empty())
        .collect();

    let mut affected: HashSet<String> = HashSet::new();
    for component in &manifest.ordered_components {
        if component.name.is_empty() {
            continue;
        }
        for other in &manifest.ordered_components {
            if other.name.is_empty() || other.name == component.name {
                continue;
            }
            if other
                .dependencies
                .required
                .iter()
                .any(|dep| dep == &component.name)
            {
                affected.insert(other.name.clone());
            }
        }
    }

    let mut impacts = Vec::new();
    let mut graph: HashMap<String, Vec<String>> = HashMap::new();
    for component in &manifest.ordered_components {
        if component.name.is_empty() {
            continue;
        }
        for dep in &component.dependencies.required {
            if !names.contains(dep.as_str()) {
                impacts.push(DependencyImpact {
                    impact_type: "undefined_dependency".to_string(),
                    source: Some(component.name.clone()),
                    target: Some(dep.clone()),
                    description: format!(
                        "Component {} depends on undefined component {dep}",
                        component.name
                    ),
                });
            }
        }
        graph.insert(component.name.clone(), component.dependencies.required.clone());
    }
    detect_cycles(&graph, "dependency_cycle", "Component", &mut impacts);

    let mut affected: Vec<String> = affected.into_iter().collect();
    affected.sort();
    DependencyContext {
        scope_id: None,
        affected_elements: affected,
        potential_dependency_impacts: impacts,
    }
}

fn feature_dependency_context(proposed_update: &Value) -> DependencyContext {
    let set = FeatureSet::parse(proposed_update);
    scoped_dependency_context(
        set.component_id,
        &set.features,
        "feature_dependency_cycle",
        "missing_feature_dependency",
        "Feature",
    )
}

fn functionality_dependency_context(proposed_update: &Value) -> DependencyContext {
    let set = FunctionalitySet::parse(proposed_update);
    scoped_dependency_context(
        set.feature_id,
        &set.functionalities,
        "functionality_dependency_cycle",
        "missing_functionality_dependency",
        "Functionality",
    )
}

fn scoped_dependency_context(
    scope_id: Option<String>,
    elements: &[ScopedElement],
    cycle_type: &str,
    missing_type: &str,
    noun: &str,
) -> DependencyContext {
    let ids: HashSet<&str> = elements
        .iter()
        .map(|e| e.id.as_str())
        .filter(|id| !id.is_empty())
        .collect();

    let mut affected: HashSet<String> = HashSet::new();
    for element in elements {
        if element.id.is_empty() {
            continue;
        }
        for other in elements {
            if other.id.is_empty() || other.id == element.id {
                continue;
            }
            if other.dependencies.iter().any(|dep| dep == &element.id) {
                affected.insert(other.id.clone());
            }
        }
    }

    let mut impacts = Vec::new();
    let mut graph: HashMap<String, Vec<String>> = HashMap::new();
    for element in elements {
        if element.id.is_empty() {
            continue;
        }
        for dep in &element.dependencies {
            if !ids.contains(dep.as_str()) {
                impacts.push(DependencyImpact {
                    impact_type: missing_type.to_string(),
                    source: Some(element.id.clone()),
                    target: Some(dep.clone()),
                    description: format!(
                        "{noun} {} depends on undefined {} {dep}",
                        element.id,
                        noun.to_lowercase()
                    ),
                });
            }
        }
        graph.insert(element.id.clone(), element.dependencies.clone());
    }
    detect_cycles(&graph, cycle_type, noun, &mut impacts);

    let mut affected: Vec<String> = affected.into_iter().collect();
    affected.sort();
    DependencyContext {
        scope_id,
        affected_elements: affected,
        potential_dependency_impacts: impacts,
    }
}

/// Depth-first cycle scan over a dependency graph; one impact per
/// back edge found.
fn detect_cycles(
    graph: &HashMap<String, Vec<String>>,
    impact_type: &str,
    noun: &str,
    impacts: &mut Vec<DependencyImpact>,
) {
    fn visit(
        node: &str,
        graph: &HashMap<String, Vec<String>>,
        visited: &mut HashSet<String>,
        path: &mut HashSet<String>,
        impact_type: &str,
        noun: &str,
        impacts: &mut Vec<DependencyImpact>,
    ) -> bool {
        visited.insert(node.to_string());
        path.insert(node.to_string());
        if let Some(deps) = graph.get(node) {
            for dep in deps {
                if !visited.contains(dep) {
                    if graph.contains_key(dep)
                        && visit(dep, graph, visited, path, impact_type, noun, impacts)
                    {
                        return true;
                    }
                } else if path.contains(dep) {
                    impacts.push(DependencyImpact {
                        impact_type: impact_type.to_string(),
                        source: Some(node.to_string()),
                        target: Some(dep.to_string()),
                        description: format!(
                            "{noun} dependency cycle detected: {node} -> {dep}"
                        ),
                    });
                    return true;
                }
            }
        }
        path.remove(node);
        false
    }

    let mut visited = HashSet::new();
    let mut nodes: Vec<&String> = graph.keys().collect();
    nodes.sort();
    for node in nodes {
        if !visited.contains(node.as_str()) {
            let mut path = HashSet::new();
            visit(
                node,
                graph,
                &mut visited,
                &mut path,
                impact_type,
                noun,
                impacts,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::config::StateManagerConfig;
    use crate::domain::models::guideline::{DetectedIssue, ValidationVerdict};
    use crate::domain::ports::agent::{Reflection, Revision};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted validation agent: rejects whenever the dependency
    /// context carries impacts, approves otherwise.
    struct ImpactSensitiveAgent {
        reflections: AtomicU32,
        revisions: AtomicU32,
        reflection_quality: f64,
        revision_confidence: f64,
        fail_validate: bool,
    }

    impl ImpactSensitiveAgent {
        fn approving() -> Self {
            Self {
                reflections: AtomicU32::new(0),
                revisions: AtomicU32::new(0),
                reflection_quality: 9.0,
                revision_confidence: 9.0,
                fail_validate: false,
            }
        }

        fn low_quality(reflection_quality: f64, revision_confidence: f64) -> Self {
            Self {
                reflection_quality,
                revision_confidence,
                ..Self::approving()
            }
        }

        fn failing() -> Self {
            Self {
                fail_validate: true,
                ..Self::approving()
            }
        }
    }

    #[async_trait]
    impl ValidationAgent for ImpactSensitiveAgent {
        async fn validate(
            &self,
            _tier: AbstractionTier,
            request: &ValidationRequest,
        ) -> anyhow::Result<ValidationOutcome> {
            if self.fail_validate {
                anyhow::bail!("model backend unreachable");
            }
            let impacts = &request.dependency_context.potential_dependency_impacts;
            if impacts.is_empty() {
                Ok(ValidationOutcome {
                    validation_result: ValidationVerdict {
                        is_valid: true,
                        validation_category: ValidationCategory::Approved,
                        explanation: "No structural issues detected".to_string(),
                    },
                    detected_issues: vec![],
                    corrected_update: None,
                    metadata: HashMap::new(),
                })
            } else {
                Ok(ValidationOutcome {
                    validation_result: ValidationVerdict {
                        is_valid: false,
                        validation_category: ValidationCategory::Rejected,
                        explanation: "Dependency impacts detected".to_string(),
                    },
                    detected_issues: impacts
                        .iter()
                        .map(|i| {
                            DetectedIssue::critical(i.impact_type.clone(), i.description.clone())
                                .affecting(
                                    [i.source.clone(), i.target.clone()]
                                        .into_iter()
                                        .flatten()
                                        .collect(),
                                )
                        })
                        .collect(),
                    corrected_update: None,
                    metadata: HashMap::new(),
                })
            }
        }

        async fn reflect(
            &self,
            _tier: AbstractionTier,
            _request: &ValidationRequest,
            _current: &ValidationOutcome,
            _iteration: u32,
        ) -> anyhow::Result<Reflection> {
            self.reflections.fetch_add(1, Ordering::SeqCst);
            Ok(Reflection {
                decision_quality_score: self.reflection_quality,
                critical_improvements: if self.reflection_quality >= 7.0 {
                    vec![]
                } else {
                    vec!["tighten explanation".to_string()]
                },
            })
        }

        async fn revise(
            &self,
            _tier: AbstractionTier,
            _request: &ValidationRequest,
            current: &ValidationOutcome,
            _reflection: &Reflection,
            _iteration: u32,
        ) -> anyhow::Result<Revision> {
            self.revisions.fetch_add(1, Ordering::SeqCst);
            Ok(Revision {
                revised_validation: Some(current.clone()),
                confidence_score: self.revision_confidence,
                category_changed: false,
            })
        }
    }

    async fn validator(agent: Arc<ImpactSensitiveAgent>) -> EarthValidator {
        let bus = Arc::new(EventBus::with_defaults());
        let state = StateManager::new(Arc::clone(&bus), StateManagerConfig::default())
            .await
            .unwrap();
        let metrics = MetricsRecorder::new(Arc::clone(&bus));
        EarthValidator::new(agent, state, bus, metrics, EarthConfig::default())
    }

    fn manifest(components: Value) -> Value {
        json!({ "ordered_components": components })
    }

    #[tokio::test]
    async fn test_approves_consistent_manifest() {
        let agent = Arc::new(ImpactSensitiveAgent::approving());
        let earth = validator(Arc::clone(&agent)).await;
        let proposed = manifest(json!([
            {"name": "a", "dependencies": {"required": []}},
            {"name": "b", "dependencies": {"required": ["a"]}}
        ]));

        let outcome = earth
            .validate_guideline_update(
                AbstractionTier::Component,
                "garden_planner",
                &json!({}),
                &proposed,
                Some("op-1".to_string()),
                true,
            )
            .await;
        assert_eq!(
            outcome.validation_result.validation_category,
            ValidationCategory::Approved
        );
        // One reflection, high quality, no revision needed.
        assert_eq!(agent.reflections.load(Ordering::SeqCst), 1);
        assert_eq!(agent.revisions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejects_circular_dependency() {
        let agent = Arc::new(ImpactSensitiveAgent::approving());
        let earth = validator(agent).await;
        let proposed = manifest(json!([
            {"name": "a", "dependencies": {"required": ["b"]}},
            {"name": "b", "dependencies": {"required": ["a"]}}
        ]));

        let outcome = earth
            .validate_guideline_update(
                AbstractionTier::Component,
                "garden_planner",
                &json!({}),
                &proposed,
                None,
                false,
            )
            .await;
        assert_eq!(
            outcome.validation_result.validation_category,
            ValidationCategory::Rejected
        );
        assert!(outcome
            .detected_issues
            .iter()
            .any(|i| i.issue_type == "dependency_cycle"
                && i.affected_elements.contains(&"a".to_string())
                && i.affected_elements.contains(&"b".to_string())));
        assert!(outcome.corrected_update.is_none());
    }

    #[tokio::test]
    async fn test_undefined_dependency_impact() {
        let context = component_dependency_context(&manifest(json!([
            {"name": "a", "dependencies": {"required": ["ghost"]}}
        ])));
        assert_eq!(context.potential_dependency_impacts.len(), 1);
        assert_eq!(
            context.potential_dependency_impacts[0].impact_type,
            "undefined_dependency"
        );
    }

    #[tokio::test]
    async fn test_affected_downstream_components() {
        let context = component_dependency_context(&manifest(json!([
            {"name": "a", "dependencies": {"required": []}},
            {"name": "b", "dependencies": {"required": ["a"]}},
            {"name": "c", "dependencies": {"required": ["b"]}}
        ])));
        assert_eq!(context.affected_elements, ["b", "c"]);
        assert!(context.potential_dependency_impacts.is_empty());
    }

    #[tokio::test]
    async fn test_feature_tier_cycle_detection() {
        let context = feature_dependency_context(&json!({
            "component_id": "comp-1",
            "features": [
                {"id": "f1", "dependencies": ["f2"]},
                {"id": "f2", "dependencies": ["f1"]}
            ]
        }));
        assert_eq!(context.scope_id.as_deref(), Some("comp-1"));
        assert!(context
            .potential_dependency_impacts
            .iter()
            .any(|i| i.impact_type == "feature_dependency_cycle"));
    }

    #[tokio::test]
    async fn test_functionality_tier_missing_dependency() {
        let context = functionality_dependency_context(&json!({
            "feature_id": "feat-1",
            "functionalities": [
                {"id": "fn1", "dependencies": ["fn404"]}
            ]
        }));
        assert!(context
            .potential_dependency_impacts
            .iter()
            .any(|i| i.impact_type == "missing_functionality_dependency"));
    }

    #[tokio::test]
    async fn test_agent_failure_returns_rejected_envelope() {
        let agent = Arc::new(ImpactSensitiveAgent::failing());
        let earth = validator(agent).await;
        let outcome = earth
            .validate_guideline_update(
                AbstractionTier::Component,
                "garden_planner",
                &json!({}),
                &manifest(json!([])),
                None,
                true,
            )
            .await;
        assert!(!outcome.validation_result.is_valid);
        assert_eq!(outcome.detected_issues[0].issue_type, "system_error");
    }

    #[tokio::test]
    async fn test_invalid_tier_string() {
        let agent = Arc::new(ImpactSensitiveAgent::approving());
        let earth = validator(agent).await;
        let outcome = earth
            .validate_guideline_update_raw(
                "GALAXY",
                "garden_planner",
                &json!({}),
                &json!({}),
                None,
                true,
            )
            .await;
        assert_eq!(
            outcome.metadata.get("error"),
            Some(&json!("invalid_abstraction_tier"))
        );
    }

    #[tokio::test]
    async fn test_revision_loop_respects_max_iterations() {
        // Low quality and low confidence: the loop never exits early.
        let agent = Arc::new(ImpactSensitiveAgent::low_quality(3.0, 4.0));
        let earth = validator(Arc::clone(&agent)).await;
        earth
            .validate_guideline_update(
                AbstractionTier::Component,
                "garden_planner",
                &json!({}),
                &manifest(json!([])),
                Some("op-loop".to_string()),
                true,
            )
            .await;
        assert_eq!(agent.reflections.load(Ordering::SeqCst), 3);
        assert_eq!(agent.revisions.load(Ordering::SeqCst), 3);
        assert_eq!(earth.revision_count("op-loop"), 3);
    }

    #[tokio::test]
    async fn test_high_confidence_revision_exits_early() {
        let agent = Arc::new(ImpactSensitiveAgent::low_quality(3.0, 9.0));
        let earth = validator(Arc::clone(&agent)).await;
        earth
            .validate_guideline_update(
                AbstractionTier::Component,
                "garden_planner",
                &json!({}),
                &manifest(json!([])),
                Some("op-early".to_string()),
                true,
            )
            .await;
        assert_eq!(agent.revisions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_process_guideline_update_returns_proposal_on_approval() {
        let agent = Arc::new(ImpactSensitiveAgent::approving());
        let earth = validator(agent).await;
        let proposed = manifest(json!([{"name": "a", "dependencies": {"required": []}}]));
        let (accepted, final_guideline, outcome) = earth
            .process_guideline_update(
                AbstractionTier::Component,
                "garden_planner",
                &json!({"old": true}),
                &proposed,
                None,
                false,
                true,
            )
            .await;
        assert!(accepted);
        assert_eq!(final_guideline, proposed);
        assert!(outcome.is_accepted());
    }

    /// Agent that repairs undefined required dependencies by dropping
    /// them, returning a CORRECTED outcome.
    struct CorrectingAgent;

    #[async_trait]
    impl ValidationAgent for CorrectingAgent {
        async fn validate(
            &self,
            _tier: AbstractionTier,
            request: &ValidationRequest,
        ) -> anyhow::Result<ValidationOutcome> {
            let impacts = &request.dependency_context.potential_dependency_impacts;
            if impacts.is_empty() {
                return Ok(ValidationOutcome {
                    validation_result: ValidationVerdict {
                        is_valid: true,
                        validation_category: ValidationCategory::Approved,
                        explanation: "clean".to_string(),
                    },
                    detected_issues: vec![],
                    corrected_update: None,
                    metadata: HashMap::new(),
                });
            }
            let mut manifest = ComponentManifest::parse(&request.proposed_update);
            let names: std::collections::HashSet<String> = manifest
                .ordered_components
                .iter()
                .map(|c| c.name.clone())
                .collect();
            for component in &mut manifest.ordered_components {
                component
                    .dependencies
                    .required
                    .retain(|dep| names.contains(dep));
            }
            Ok(ValidationOutcome {
                validation_result: ValidationVerdict {
                    is_valid: true,
                    validation_category: ValidationCategory::Corrected,
                    explanation: "Dropped undefined dependencies".to_string(),
                },
                detected_issues: impacts
                    .iter()
                    .map(|i| DetectedIssue::critical(i.impact_type.clone(), i.description.clone()))
                    .collect(),
                corrected_update: Some(serde_json::to_value(&manifest)?),
                metadata: HashMap::new(),
            })
        }

        async fn reflect(
            &self,
            _tier: AbstractionTier,
            _request: &ValidationRequest,
            _current: &ValidationOutcome,
            _iteration: u32,
        ) -> anyhow::Result<Reflection> {
            Ok(Reflection {
                decision_quality_score: 9.0,
                critical_improvements: vec![],
            })
        }

        async fn revise(
            &self,
            _tier: AbstractionTier,
            _request: &ValidationRequest,
            current: &ValidationOutcome,
            _reflection: &Reflection,
            _iteration: u32,
        ) -> anyhow::Result<Revision> {
            Ok(Revision {
                revised_validation: Some(current.clone()),
                confidence_score: 9.0,
                category_changed: false,
            })
        }
    }

    #[tokio::test]
    async fn test_corrected_update_is_substituted_and_revalidates() {
        let bus = Arc::new(EventBus::with_defaults());
        let state = StateManager::new(Arc::clone(&bus), StateManagerConfig::default())
            .await
            .unwrap();
        let metrics = MetricsRecorder::new(Arc::clone(&bus));
        let earth = EarthValidator::new(
            Arc::new(CorrectingAgent),
            state,
            bus,
            metrics,
            EarthConfig::default(),
        );

        let proposed = manifest(json!([
            {"name": "a", "dependencies": {"required": ["ghost"]}},
            {"name": "b", "dependencies": {"required": ["a"]}}
        ]));
        let (accepted, final_guideline, outcome) = earth
            .process_guideline_update(
                AbstractionTier::Component,
                "garden_planner",
                &json!({}),
                &proposed,
                None,
                false,
                false,
            )
            .await;
        assert!(accepted);
        assert_eq!(
            outcome.validation_result.validation_category,
            ValidationCategory::Corrected
        );
        assert_ne!(final_guideline, proposed);

        // Correction is idempotent: the corrected mapping validates
        // clean on a second pass.
        let second = earth
            .validate_guideline_update(
                AbstractionTier::Component,
                "garden_planner",
                &proposed,
                &final_guideline,
                None,
                false,
            )
            .await;
        assert_eq!(
            second.validation_result.validation_category,
            ValidationCategory::Approved
        );
    }

    #[tokio::test]
    async fn test_validation_stats() {
        let agent = Arc::new(ImpactSensitiveAgent::approving());
        let earth = validator(agent).await;
        earth
            .validate_guideline_update(
                AbstractionTier::Component,
                "garden_planner",
                &json!({}),
                &manifest(json!([])),
                None,
                false,
            )
            .await;
        earth
            .validate_guideline_update(
                AbstractionTier::Feature,
                "root_system",
                &json!({}),
                &json!({"features": [{"id": "f", "dependencies": ["nope"]}]}),
                None,
                false,
            )
            .await;

        let stats = earth.validation_stats();
        assert_eq!(stats.total_validations, 2);
        assert_eq!(stats.validations_by_agent["garden_planner"], 1);
        assert_eq!(stats.validations_by_tier["COMPONENT"], 1);
        assert!((stats.approval_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(earth.validation_history("root_system").len(), 1);
    }
}
