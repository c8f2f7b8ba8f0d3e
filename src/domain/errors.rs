//! Domain errors for the Arbor coordination substrate.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Domain-level errors that can occur across Arbor subsystems.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Circuit breaker open for {name}, retry after {retry_after}")]
    CircuitOpen {
        name: String,
        retry_after: DateTime<Utc>,
    },

    #[error("Lock acquisition timed out for {track_id} after {timeout_secs}s")]
    LockTimeout { track_id: String, timeout_secs: f64 },

    #[error("Operation timed out after {0}s")]
    OperationTimeout(f64),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Agent failure from {agent_id}: {message}")]
    AgentFailure { agent_id: String, message: String },

    #[error("Event bus is not running")]
    BusNotRunning,

    #[error("Unknown abstraction tier: {0}")]
    UnknownTier(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for DomainError {
    fn from(err: std::io::Error) -> Self {
        DomainError::Storage(err.to_string())
    }
}

impl DomainError {
    /// Shorthand for an agent failure carried across a port boundary.
    pub fn agent(agent_id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        DomainError::AgentFailure {
            agent_id: agent_id.into(),
            message: err.to_string(),
        }
    }
}
