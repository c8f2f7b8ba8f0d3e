//! Refinement lifecycle models.
//!
//! A [`RefinementContext`] scopes one attempt to repair an agent's
//! output after a validation failure; [`RefinementIteration`] records
//! each step inside it. [`ValidationState`] carries the canonical
//! ordering used for backtracking detection.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Validation pipeline states in canonical order. The discriminant
/// order is the precedence used for backtracking detection.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ValidationState {
    NotStarted,
    DescriptionValidating,
    DescriptionRevising,
    RequirementsValidating,
    RequirementsRevising,
    DataFlowValidating,
    DataFlowRevising,
    FeaturesValidating,
    FeaturesRevising,
    Arbitration,
    Completed,
}

impl ValidationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::DescriptionValidating => "description_validating",
            Self::DescriptionRevising => "description_revising",
            Self::RequirementsValidating => "requirements_validating",
            Self::RequirementsRevising => "requirements_revising",
            Self::DataFlowValidating => "data_flow_validating",
            Self::DataFlowRevising => "data_flow_revising",
            Self::FeaturesValidating => "features_validating",
            Self::FeaturesRevising => "features_revising",
            Self::Arbitration => "arbitration",
            Self::Completed => "completed",
        }
    }

    /// Numeric precedence in the canonical ordering.
    pub fn precedence(&self) -> u8 {
        *self as u8
    }

    pub fn is_revising(&self) -> bool {
        matches!(
            self,
            Self::DescriptionRevising
                | Self::RequirementsRevising
                | Self::DataFlowRevising
                | Self::FeaturesRevising
        )
    }

    /// Whether moving to `new` from `self` is a backtracking transition.
    /// Arbitration handing off to a revising state is a directed action,
    /// not backtracking.
    pub fn is_backtracking_to(&self, new: ValidationState) -> bool {
        if *self == Self::Arbitration && new.is_revising() {
            return false;
        }
        new.precedence() < self.precedence()
    }
}

impl std::fmt::Display for ValidationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stage of the refinement loop an iteration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefinementStage {
    Refine,
    Reflect,
    Revise,
    Arbitrate,
}

impl RefinementStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refine => "refine",
            Self::Reflect => "reflect",
            Self::Revise => "revise",
            Self::Arbitrate => "arbitrate",
        }
    }
}

impl std::fmt::Display for RefinementStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Confidence grade reported by a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    #[default]
    Low,
}

impl Confidence {
    /// Quality score used to rank competing revisions.
    pub fn score(&self) -> f64 {
        match self {
            Self::High => 1.0,
            Self::Medium => 0.7,
            Self::Low => 0.4,
        }
    }
}

/// Scoped record of one refinement attempt. Owned exclusively by the
/// refinement manager; agents only ever see the `context_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementContext {
    pub context_id: String,
    pub component_id: String,
    pub validation_state: ValidationState,
    /// May be unset while arbitration is still deciding.
    pub responsible_agent: Option<String>,
    pub validation_errors: Vec<HashMap<String, Value>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl RefinementContext {
    pub fn new(
        component_id: impl Into<String>,
        validation_state: ValidationState,
        responsible_agent: Option<String>,
    ) -> Self {
        let component_id = component_id.into();
        Self {
            context_id: format!("refinement:{component_id}:{}", Uuid::new_v4()),
            component_id,
            validation_state,
            responsible_agent,
            validation_errors: Vec::new(),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

/// One step within a refinement context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementIteration {
    pub context_id: String,
    /// 1-based.
    pub iteration_number: u32,
    pub refinement_type: RefinementStage,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub duration_seconds: f64,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}
