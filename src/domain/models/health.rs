//! Health status reporting shared by monitors and managers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity ladder for health rollups. Ordering matters: the tracker
/// aggregates to the worst level seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Warning,
    Critical,
    Error,
}

impl std::fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
            Self::Error => "ERROR",
        };
        write!(f, "{name}")
    }
}

/// A health sample from one source component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthLevel,
    pub source: String,
    pub description: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl HealthStatus {
    pub fn new(
        status: HealthLevel,
        source: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            status,
            source: source.into(),
            description: description.into(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn healthy(source: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(HealthLevel::Healthy, source, description)
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(HealthLevel::Healthy < HealthLevel::Degraded);
        assert!(HealthLevel::Degraded < HealthLevel::Critical);
        assert!(HealthLevel::Critical < HealthLevel::Error);
    }

    #[test]
    fn test_status_builder() {
        let status = HealthStatus::healthy("state_manager", "operating normally");
        assert_eq!(status.status, HealthLevel::Healthy);
        assert_eq!(status.source, "state_manager");
    }
}
