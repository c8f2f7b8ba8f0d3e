//! Configuration for the state manager and its cleanup scheduler.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which persistence backend the state manager should construct.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum PersistenceKind {
    #[default]
    Memory,
    File {
        storage_dir: PathBuf,
    },
    Sqlite {
        db_path: PathBuf,
    },
    /// A backend supplied by the caller at construction time.
    Custom,
}

/// Governs cleanup cadence and TTL interpretation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanupPolicy {
    #[default]
    Ttl,
    MaxSize,
    Hybrid,
    Aggressive,
}

/// Cleanup scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub policy: CleanupPolicy,
    /// Base TTL; forced cleanup halves it.
    pub ttl_seconds: u64,
    /// Seconds between passes. When unset, the policy decides:
    /// AGGRESSIVE every 60s, TTL every 300s, otherwise hourly.
    pub check_interval: Option<u64>,
    /// Max items a single pass may touch.
    pub batch_size: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            policy: CleanupPolicy::Ttl,
            ttl_seconds: 86_400,
            check_interval: None,
            batch_size: 100,
        }
    }
}

impl CleanupConfig {
    /// Seconds to sleep between passes.
    pub fn interval_seconds(&self) -> u64 {
        if let Some(interval) = self.check_interval {
            return interval;
        }
        match self.policy {
            CleanupPolicy::Aggressive => 60,
            CleanupPolicy::Ttl => 300,
            CleanupPolicy::MaxSize | CleanupPolicy::Hybrid => 3_600,
        }
    }
}

/// Configuration recognized by the state manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateManagerConfig {
    pub persistence: PersistenceKind,
    /// LRU capacity for the in-process entry cache.
    pub cache_size: usize,
    /// Run backend repair during initialization.
    pub auto_repair: bool,
    /// Populate operation counters.
    pub enable_metrics: bool,
    pub cleanup: Option<CleanupConfig>,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            persistence: PersistenceKind::Memory,
            cache_size: 1_000,
            auto_repair: true,
            enable_metrics: true,
            cleanup: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StateManagerConfig::default();
        assert_eq!(config.cache_size, 1_000);
        assert!(config.auto_repair);
        assert!(config.enable_metrics);
        assert_eq!(config.persistence, PersistenceKind::Memory);
    }

    #[test]
    fn test_cleanup_interval_by_policy() {
        let mut config = CleanupConfig {
            policy: CleanupPolicy::Aggressive,
            ..Default::default()
        };
        assert_eq!(config.interval_seconds(), 60);
        config.policy = CleanupPolicy::Ttl;
        assert_eq!(config.interval_seconds(), 300);
        config.policy = CleanupPolicy::Hybrid;
        assert_eq!(config.interval_seconds(), 3_600);
        config.check_interval = Some(5);
        assert_eq!(config.interval_seconds(), 5);
    }
}
