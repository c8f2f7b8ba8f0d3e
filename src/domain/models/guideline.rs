//! Guideline artifacts and validation outcome types.
//!
//! A guideline is a structured design artifact at one of three
//! abstraction tiers. Proposals arrive as free-form JSON; the typed
//! views below are deserialized tolerantly so dependency analysis can
//! work over whatever shape the proposing agent produced.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::errors::DomainError;

/// Abstraction tier of a guideline update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AbstractionTier {
    Component,
    Feature,
    Functionality,
}

impl AbstractionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Component => "COMPONENT",
            Self::Feature => "FEATURE",
            Self::Functionality => "FUNCTIONALITY",
        }
    }

    /// Lowercase name used in state keys and metric labels.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Component => "component",
            Self::Feature => "feature",
            Self::Functionality => "functionality",
        }
    }
}

impl std::fmt::Display for AbstractionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AbstractionTier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "COMPONENT" => Ok(Self::Component),
            "FEATURE" => Ok(Self::Feature),
            "FUNCTIONALITY" => Ok(Self::Functionality),
            other => Err(DomainError::UnknownTier(other.to_string())),
        }
    }
}

/// Validator verdict on a proposed update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCategory {
    Approved,
    /// Accepted with modifications; `corrected_update` carries them.
    Corrected,
    Rejected,
}

impl std::fmt::Display for ValidationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Approved => "APPROVED",
            Self::Corrected => "CORRECTED",
            Self::Rejected => "REJECTED",
        };
        write!(f, "{name}")
    }
}

/// Severity of a detected issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueSeverity {
    Info,
    Warning,
    Critical,
}

/// One failure descriptor attached to a validation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedIssue {
    pub issue_type: String,
    pub severity: IssueSeverity,
    pub description: String,
    #[serde(default)]
    pub affected_elements: Vec<String>,
    #[serde(default)]
    pub suggested_resolution: Option<String>,
}

impl DetectedIssue {
    pub fn critical(issue_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            issue_type: issue_type.into(),
            severity: IssueSeverity::Critical,
            description: description.into(),
            affected_elements: Vec::new(),
            suggested_resolution: None,
        }
    }

    pub fn affecting(mut self, elements: Vec<String>) -> Self {
        self.affected_elements = elements;
        self
    }
}

/// The validator's core decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub is_valid: bool,
    pub validation_category: ValidationCategory,
    pub explanation: String,
}

/// Full validation envelope returned by the earth layer. Never raised
/// across subsystem boundaries: failures become REJECTED envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub validation_result: ValidationVerdict,
    #[serde(default)]
    pub detected_issues: Vec<DetectedIssue>,
    #[serde(default)]
    pub corrected_update: Option<Value>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ValidationOutcome {
    /// Rejection envelope for a failure inside the validation path.
    pub fn system_error(agent_id: &str, message: impl std::fmt::Display) -> Self {
        let message = message.to_string();
        Self::rejection(
            format!("Validation error: {message}"),
            DetectedIssue {
                issue_type: "system_error".to_string(),
                severity: IssueSeverity::Critical,
                description: format!("System error during validation: {message}"),
                affected_elements: vec![agent_id.to_string()],
                suggested_resolution: Some(
                    "Retry validation or inspect the validator logs".to_string(),
                ),
            },
            [("error".to_string(), Value::String(message))],
        )
    }

    /// Rejection envelope for an unrecognized tier string.
    pub fn invalid_tier(agent_id: &str, tier: &str) -> Self {
        Self::rejection(
            format!("Invalid abstraction tier: {tier}"),
            DetectedIssue {
                issue_type: "system_error".to_string(),
                severity: IssueSeverity::Critical,
                description: format!("Invalid abstraction tier: {tier}"),
                affected_elements: vec![agent_id.to_string()],
                suggested_resolution: Some(
                    "Use a valid abstraction tier: COMPONENT, FEATURE, or FUNCTIONALITY"
                        .to_string(),
                ),
            },
            [(
                "error".to_string(),
                Value::String("invalid_abstraction_tier".to_string()),
            )],
        )
    }

    fn rejection(
        explanation: String,
        issue: DetectedIssue,
        extra_metadata: impl IntoIterator<Item = (String, Value)>,
    ) -> Self {
        let mut metadata: HashMap<String, Value> = extra_metadata.into_iter().collect();
        metadata.insert(
            "validation_timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        Self {
            validation_result: ValidationVerdict {
                is_valid: false,
                validation_category: ValidationCategory::Rejected,
                explanation,
            },
            detected_issues: vec![issue],
            corrected_update: None,
            metadata,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(
            self.validation_result.validation_category,
            ValidationCategory::Approved | ValidationCategory::Corrected
        )
    }
}

/// Impact record produced by dependency analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyImpact {
    pub impact_type: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    pub description: String,
}

/// Dependency context the validator attaches before consulting the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyContext {
    /// Scope id: component id at the feature tier, feature id at the
    /// functionality tier, absent at the component tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    pub affected_elements: Vec<String>,
    pub potential_dependency_impacts: Vec<DependencyImpact>,
}

// --- Typed guideline views ---------------------------------------------

/// Declared dependencies of a component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentDependencies {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub optional: Vec<String>,
}

/// One component in a top-level manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: ComponentDependencies,
}

/// Top-level component graph as proposed at the COMPONENT tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentManifest {
    #[serde(default)]
    pub ordered_components: Vec<ComponentSpec>,
}

impl ComponentManifest {
    pub fn parse(update: &Value) -> Self {
        serde_json::from_value(update.clone()).unwrap_or_default()
    }
}

/// One feature or functionality element with flat dependency ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopedElement {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Features proposed inside a named component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureSet {
    #[serde(default)]
    pub component_id: Option<String>,
    #[serde(default)]
    pub features: Vec<ScopedElement>,
}

impl FeatureSet {
    pub fn parse(update: &Value) -> Self {
        serde_json::from_value(update.clone()).unwrap_or_default()
    }
}

/// Functionalities proposed inside a named feature.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionalitySet {
    #[serde(default)]
    pub feature_id: Option<String>,
    #[serde(default)]
    pub functionalities: Vec<ScopedElement>,
}

impl FunctionalitySet {
    pub fn parse(update: &Value) -> Self {
        serde_json::from_value(update.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tier_from_str() {
        assert_eq!(
            "component".parse::<AbstractionTier>().unwrap(),
            AbstractionTier::Component
        );
        assert_eq!(
            "FEATURE".parse::<AbstractionTier>().unwrap(),
            AbstractionTier::Feature
        );
        assert!(matches!(
            "GALAXY".parse::<AbstractionTier>(),
            Err(DomainError::UnknownTier(_))
        ));
    }

    #[test]
    fn test_invalid_tier_envelope() {
        let outcome = ValidationOutcome::invalid_tier("garden_planner", "GALAXY");
        assert!(!outcome.validation_result.is_valid);
        assert_eq!(
            outcome.validation_result.validation_category,
            ValidationCategory::Rejected
        );
        assert_eq!(outcome.detected_issues[0].issue_type, "system_error");
        assert_eq!(
            outcome.metadata.get("error"),
            Some(&Value::String("invalid_abstraction_tier".into()))
        );
        assert!(outcome.corrected_update.is_none());
    }

    #[test]
    fn test_manifest_parses_tolerantly() {
        let manifest = ComponentManifest::parse(&json!({
            "ordered_components": [
                {"name": "a", "dependencies": {"required": ["b"]}},
                {"name": "b"}
            ],
            "unrelated": true
        }));
        assert_eq!(manifest.ordered_components.len(), 2);
        assert_eq!(manifest.ordered_components[0].dependencies.required, ["b"]);
    }

    #[test]
    fn test_manifest_parse_of_garbage_is_empty() {
        let manifest = ComponentManifest::parse(&json!("not an object"));
        assert!(manifest.ordered_components.is_empty());
    }

    #[test]
    fn test_accepted_categories() {
        let mut outcome = ValidationOutcome::system_error("x", "boom");
        assert!(!outcome.is_accepted());
        outcome.validation_result.validation_category = ValidationCategory::Corrected;
        assert!(outcome.is_accepted());
    }
}
