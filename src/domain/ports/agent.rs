//! Agent seams: the LLM-backed collaborators the substrate coordinates.
//!
//! The substrate never reasons about designs itself. These ports are
//! the full contract it holds with the agents that do; tests drive them
//! with scripted fakes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::models::guideline::{AbstractionTier, DependencyContext, ValidationOutcome};
use crate::domain::models::refinement::Confidence;

/// Input handed to the validation agent, enriched with dependency context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub agent_id: String,
    pub current_guideline: Value,
    pub proposed_update: Value,
    pub dependency_context: DependencyContext,
    pub timestamp: DateTime<Utc>,
}

/// The agent's self-critique of a validation decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    /// 0-10; opaque to the substrate beyond the early-exit threshold.
    pub decision_quality_score: f64,
    #[serde(default)]
    pub critical_improvements: Vec<String>,
}

/// A revision of a previous validation decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    /// Absent when the agent could not produce a revision; the loop
    /// then keeps the prior result.
    pub revised_validation: Option<ValidationOutcome>,
    /// 0-10 confidence in the revised decision.
    pub confidence_score: f64,
    /// Whether the validation category changed from the prior result.
    pub category_changed: bool,
}

/// The earth layer's view of its validating agent.
#[async_trait]
pub trait ValidationAgent: Send + Sync {
    async fn validate(
        &self,
        tier: AbstractionTier,
        request: &ValidationRequest,
    ) -> anyhow::Result<ValidationOutcome>;

    async fn reflect(
        &self,
        tier: AbstractionTier,
        request: &ValidationRequest,
        current: &ValidationOutcome,
        iteration: u32,
    ) -> anyhow::Result<Reflection>;

    async fn revise(
        &self,
        tier: AbstractionTier,
        request: &ValidationRequest,
        current: &ValidationOutcome,
        reflection: &Reflection,
        iteration: u32,
    ) -> anyhow::Result<Revision>;
}

/// Output of the revise stage in the three-stage refinement loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisionOutput {
    pub artifact: Value,
    pub confidence_assessment: Confidence,
    #[serde(default)]
    pub remaining_uncertainties: Vec<String>,
    #[serde(default)]
    pub decision_changes: Vec<String>,
}

/// Arbitration decision naming the agent that must revise.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArbitrationOutcome {
    pub responsible_agent: Option<String>,
    pub root_cause_agent: Option<String>,
}

/// The refinement manager's view of a responsible agent.
#[async_trait]
pub trait RefinementAgent: Send + Sync {
    fn agent_id(&self) -> &str;

    /// Produce an improved artifact from the current input.
    async fn refine(&self, input: &Value) -> anyhow::Result<Value>;

    /// Self-critique the refined artifact.
    async fn reflect(&self, refined: &Value) -> anyhow::Result<Value>;

    /// Combine refinement and reflection into a revised artifact.
    async fn revise(&self, refined: &Value, reflection: &Value) -> anyhow::Result<RevisionOutput>;

    /// Decide which of several candidate agents is at fault.
    async fn arbitrate(&self, context: &Value) -> anyhow::Result<ArbitrationOutcome>;
}

/// Adaptation guidance delivered alongside a propagated update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationContext {
    pub origin_agent: String,
    pub update_summary: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub direct_impacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_guidance: Option<IntegrationGuidance>,
}

/// How the target should fold the upstream change in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationGuidance {
    pub approach: String,
    pub complexity: String,
}

/// Target-side apply hook for propagated updates.
#[async_trait]
pub trait DownstreamAgent: Send + Sync {
    fn agent_id(&self) -> &str;

    async fn apply_update(
        &self,
        context: &PropagationContext,
        update: &Value,
    ) -> anyhow::Result<()>;
}

/// Domain logic slot for the agent scaffold.
#[async_trait]
pub trait AnalysisAgent: Send + Sync {
    fn agent_id(&self) -> &str;

    async fn analyze(&self, inputs: &Value) -> anyhow::Result<Value>;
}
