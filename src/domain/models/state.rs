//! State model for the versioned resource store.
//!
//! A resource's timeline is a sequence of [`StateEntry`] values, each
//! carrying either a lifecycle state, a workflow interface state, or a
//! free-form JSON mapping. Transitions between enum-typed states are
//! governed by [`TransitionValidator`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::errors::{DomainError, DomainResult};

/// Lifecycle state of a long-lived resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    Initializing,
    Active,
    Paused,
    Failed,
    Recovered,
    Terminated,
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Active => "ACTIVE",
            Self::Paused => "PAUSED",
            Self::Failed => "FAILED",
            Self::Recovered => "RECOVERED",
            Self::Terminated => "TERMINATED",
        }
    }
}

/// Composite workflow state for agent interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterfaceState {
    Idle,
    Analyzing,
    Validating,
    Propagating,
    Complete,
    Error,
}

impl std::fmt::Display for InterfaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl InterfaceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Analyzing => "ANALYZING",
            Self::Validating => "VALIDATING",
            Self::Propagating => "PROPAGATING",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
        }
    }
}

/// Category tag used for cleanup and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    State,
    Monitor,
    Metric,
    Agent,
    Compute,
    Cache,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::State => "STATE",
            Self::Monitor => "MONITOR",
            Self::Metric => "METRIC",
            Self::Agent => "AGENT",
            Self::Compute => "COMPUTE",
            Self::Cache => "CACHE",
        };
        write!(f, "{name}")
    }
}

/// The tagged union a resource's state can take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum StateValue {
    Resource(ResourceState),
    Interface(InterfaceState),
    Mapping(Value),
}

impl StateValue {
    /// Whether this value participates in transition validation.
    pub fn is_enum(&self) -> bool {
        matches!(self, Self::Resource(_) | Self::Interface(_))
    }

    pub fn as_resource(&self) -> Option<ResourceState> {
        match self {
            Self::Resource(s) => Some(*s),
            _ => None,
        }
    }

    pub fn as_interface(&self) -> Option<InterfaceState> {
        match self {
            Self::Interface(s) => Some(*s),
            _ => None,
        }
    }
}

impl std::fmt::Display for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resource(s) => write!(f, "{s}"),
            Self::Interface(s) => write!(f, "{s}"),
            Self::Mapping(v) => write!(f, "{v}"),
        }
    }
}

impl From<ResourceState> for StateValue {
    fn from(state: ResourceState) -> Self {
        Self::Resource(state)
    }
}

impl From<InterfaceState> for StateValue {
    fn from(state: InterfaceState) -> Self {
        Self::Interface(state)
    }
}

impl From<Value> for StateValue {
    fn from(value: Value) -> Self {
        Self::Mapping(value)
    }
}

/// One point in a resource's timeline. Entries are append-only; updates
/// never mutate a stored entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub state: StateValue,
    pub resource_type: ResourceType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    /// Monotonic, 1-based per resource.
    pub version: u64,
    #[serde(default)]
    pub previous_state: Option<String>,
    #[serde(default)]
    pub transition_reason: Option<String>,
    /// Populated only when entering FAILED.
    #[serde(default)]
    pub failure_info: Option<HashMap<String, Value>>,
}

impl StateEntry {
    pub fn new(state: impl Into<StateValue>, resource_type: ResourceType) -> Self {
        Self {
            state: state.into(),
            resource_type,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
            version: 1,
            previous_state: None,
            transition_reason: None,
            failure_info: None,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }
}

/// Coarse-grained archival of a resource's full state at a moment,
/// independent of transition boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub resource_type: ResourceType,
    pub version: u64,
}

impl StateSnapshot {
    pub fn from_entry(entry: &StateEntry, reason: &str) -> DomainResult<Self> {
        let mut state = HashMap::new();
        state.insert("state".to_string(), serde_json::to_value(&entry.state)?);
        state.insert(
            "metadata".to_string(),
            serde_json::to_value(&entry.metadata)?,
        );
        let mut metadata = HashMap::new();
        metadata.insert(
            "snapshot_reason".to_string(),
            Value::String(reason.to_string()),
        );
        Ok(Self {
            state,
            timestamp: Utc::now(),
            metadata,
            resource_type: entry.resource_type,
            version: entry.version,
        })
    }
}

/// Whole-store capture used by `get_snapshot` / `restore_snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub states: HashMap<String, StateEntry>,
    pub timestamp: DateTime<Utc>,
}

/// Declared matrix of legal enum-typed transitions.
///
/// The default policy allows every forward lifecycle step, self
/// transitions for live states, and the FAILED -> RECOVERED -> ACTIVE
/// recovery path. TERMINATED is a sink: nothing leaves it except an
/// explicit purge during cleanup.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransitionValidator;

impl TransitionValidator {
    pub fn new() -> Self {
        Self
    }

    /// Check a transition between two state values. Mapping states and
    /// cross-kind transitions are always allowed; only enum-to-enum
    /// pairs of the same kind are constrained.
    pub fn is_valid(&self, from: &StateValue, to: &StateValue) -> bool {
        match (from, to) {
            (StateValue::Resource(a), StateValue::Resource(b)) => Self::resource_step(*a, *b),
            (StateValue::Interface(a), StateValue::Interface(b)) => Self::interface_step(*a, *b),
            _ => true,
        }
    }

    /// Validate or fail with a typed error.
    pub fn check(&self, from: &StateValue, to: &StateValue) -> DomainResult<()> {
        if self.is_valid(from, to) {
            Ok(())
        } else {
            Err(DomainError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    fn resource_step(from: ResourceState, to: ResourceState) -> bool {
        use ResourceState::*;
        if from == Terminated {
            return false;
        }
        if from == to {
            return true;
        }
        matches!(
            (from, to),
            (Initializing, Active)
                | (Initializing, Failed)
                | (Initializing, Terminated)
                | (Active, Paused)
                | (Active, Failed)
                | (Active, Terminated)
                | (Paused, Active)
                | (Paused, Failed)
                | (Paused, Terminated)
                | (Failed, Recovered)
                | (Failed, Terminated)
                | (Recovered, Active)
                | (Recovered, Failed)
                | (Recovered, Terminated)
        )
    }

    fn interface_step(from: InterfaceState, to: InterfaceState) -> bool {
        use InterfaceState::*;
        if from == to {
            return true;
        }
        matches!(
            (from, to),
            (Idle, Analyzing)
                | (Idle, Validating)
                | (Analyzing, Validating)
                | (Analyzing, Complete)
                | (Analyzing, Error)
                | (Validating, Propagating)
                | (Validating, Complete)
                | (Validating, Error)
                | (Propagating, Complete)
                | (Propagating, Error)
                | (Complete, Idle)
                | (Complete, Analyzing)
                | (Error, Idle)
                | (Error, Analyzing)
        )
    }
}
