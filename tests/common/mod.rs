//! Shared scripted agents for integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use arbor::domain::models::guideline::{
    DetectedIssue, ValidationCategory, ValidationOutcome, ValidationVerdict,
};
use arbor::domain::models::refinement::Confidence;
use arbor::domain::ports::agent::{
    ArbitrationOutcome, DownstreamAgent, PropagationContext, RefinementAgent, Reflection,
    Revision, RevisionOutput, ValidationAgent, ValidationRequest,
};
use arbor::domain::models::guideline::AbstractionTier;
use arbor::services::event_bus::{Event, EventHandler};

/// Validation agent that approves structurally clean proposals and
/// rejects anything whose dependency context carries impacts.
pub struct StructuralValidationAgent;

#[async_trait]
impl ValidationAgent for StructuralValidationAgent {
    async fn validate(
        &self,
        _tier: AbstractionTier,
        request: &ValidationRequest,
    ) -> anyhow::Result<ValidationOutcome> {
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
                    explanation: "Structural issues detected in proposal".to_string(),
                },
                detected_issues: impacts
                    .iter()
                    .map(|impact| {
                        DetectedIssue::critical(
                            impact.impact_type.clone(),
                            impact.description.clone(),
                        )
                        .affecting(
                            [impact.source.clone(), impact.target.clone()]
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

/// Downstream agent that records applied updates, optionally failing.
pub struct ScriptedTarget {
    id: String,
    pub applied: Mutex<Vec<Value>>,
    fail: bool,
}

impl ScriptedTarget {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            applied: Mutex::new(Vec::new()),
            fail: false,
        })
    }

    pub fn failing(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            applied: Mutex::new(Vec::new()),
            fail: true,
        })
    }
}

#[async_trait]
impl DownstreamAgent for ScriptedTarget {
    fn agent_id(&self) -> &str {
        &self.id
    }

    async fn apply_update(
        &self,
        _context: &PropagationContext,
        update: &Value,
    ) -> anyhow::Result<()> {
        if self.fail {
            anyhow::bail!("downstream apply hook raised");
        }
        self.applied.lock().unwrap().push(update.clone());
        Ok(())
    }
}

/// Refinement agent that converges immediately with high confidence.
pub struct ConfidentRefiner {
    pub refines: AtomicU32,
    pub reflects: AtomicU32,
    pub revises: AtomicU32,
}

impl ConfidentRefiner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            refines: AtomicU32::new(0),
            reflects: AtomicU32::new(0),
            revises: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl RefinementAgent for ConfidentRefiner {
    fn agent_id(&self) -> &str {
        "environmental_analysis"
    }

    async fn refine(&self, input: &Value) -> anyhow::Result<Value> {
        self.refines.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"refined": input}))
    }

    async fn reflect(&self, refined: &Value) -> anyhow::Result<Value> {
        self.reflects.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"critique": "minor wording", "of": refined}))
    }

    async fn revise(&self, refined: &Value, _reflection: &Value) -> anyhow::Result<RevisionOutput> {
        self.revises.fetch_add(1, Ordering::SeqCst);
        Ok(RevisionOutput {
            artifact: json!({"revised": refined}),
            confidence_assessment: Confidence::High,
            remaining_uncertainties: vec![],
            decision_changes: vec![],
        })
    }

    async fn arbitrate(&self, _context: &Value) -> anyhow::Result<ArbitrationOutcome> {
        Ok(ArbitrationOutcome {
            responsible_agent: Some("environmental_analysis".to_string()),
            root_cause_agent: Some("garden_planner".to_string()),
        })
    }
}

/// Event handler that records every event it sees.
pub struct CapturingHandler {
    name: String,
    pub events: Mutex<Vec<Event>>,
}

impl CapturingHandler {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn captured(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for CapturingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}
