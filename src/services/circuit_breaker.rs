//! Circuit breakers for failure isolation.
//!
//! Each named breaker is a CLOSED/OPEN/HALF_OPEN state machine.
//! Failures inside the failure window accumulate while CLOSED; at the
//! threshold the circuit opens for the recovery timeout, then moves to
//! HALF_OPEN where a single trial call decides the next state. Calls
//! against an open circuit fail immediately with `CircuitOpen`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::domain::errors::DomainError;
use crate::domain::models::health::{HealthLevel, HealthStatus};

/// Configuration for circuit breakers.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the window before opening the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe.
    pub recovery_timeout: Duration,
    /// Failures older than this are forgotten.
    pub failure_window: Duration,
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::seconds(30),
            failure_window: Duration::seconds(120),
            enabled: true,
        }
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// A recorded failure.
#[derive(Debug, Clone)]
struct FailureRecord {
    timestamp: DateTime<Utc>,
    error: String,
}

/// Individual breaker state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: CircuitState,
    failures: Vec<FailureRecord>,
    opened_at: Option<DateTime<Utc>>,
    state_changed_at: DateTime<Utc>,
    open_count: u32,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: CircuitState::Closed,
            failures: Vec::new(),
            opened_at: None,
            state_changed_at: Utc::now(),
            open_count: 0,
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    fn record_failure(&mut self, error: String, config: &CircuitBreakerConfig) {
        self.failures.push(FailureRecord {
            timestamp: Utc::now(),
            error,
        });
        let cutoff = Utc::now() - config.failure_window;
        self.failures.retain(|f| f.timestamp > cutoff);

        match self.state {
            CircuitState::Closed => {
                if self.failures.len() as u32 >= config.failure_threshold {
                    self.open();
                }
            }
            // The trial call failed: back to OPEN for another timeout.
            CircuitState::HalfOpen => self.open(),
            CircuitState::Open => {}
        }
    }

    fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.close();
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Utc::now());
        self.state_changed_at = Utc::now();
        self.open_count += 1;
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.state_changed_at = Utc::now();
        self.failures.clear();
        self.probe_in_flight = false;
    }

    fn half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.state_changed_at = Utc::now();
        self.probe_in_flight = false;
    }

    /// Whether a call may proceed right now. In HALF_OPEN exactly one
    /// probe is admitted at a time.
    fn allows(&mut self, config: &CircuitBreakerConfig) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let Some(opened_at) = self.opened_at else {
                    return false;
                };
                if Utc::now() > opened_at + config.recovery_timeout {
                    self.half_open();
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    fn recent_failure_count(&self, config: &CircuitBreakerConfig) -> usize {
        let cutoff = Utc::now() - config.failure_window;
        self.failures.iter().filter(|f| f.timestamp > cutoff).count()
    }

    fn reset(&mut self) {
        self.close();
        self.open_count = 0;
    }

    fn retry_after(&self, config: &CircuitBreakerConfig) -> DateTime<Utc> {
        self.opened_at.unwrap_or_else(Utc::now) + config.recovery_timeout
    }
}

/// Statistics for one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub name: String,
    pub state: &'static str,
    pub failure_count: usize,
    pub open_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub state_changed_at: DateTime<Utc>,
}

/// Registry of named breakers sharing one configuration.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: RwLock<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            circuits: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Check whether a call for `name` may proceed.
    pub async fn check(&self, name: &str) -> Result<(), DomainError> {
        if !self.config.enabled {
            return Ok(());
        }
        let mut circuits = self.circuits.write().await;
        let circuit = circuits
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name));
        if circuit.allows(&self.config) {
            Ok(())
        } else {
            Err(DomainError::CircuitOpen {
                name: name.to_string(),
                retry_after: circuit.retry_after(&self.config),
            })
        }
    }

    pub async fn record_failure(&self, name: &str, error: impl Into<String>) {
        if !self.config.enabled {
            return;
        }
        let mut circuits = self.circuits.write().await;
        let circuit = circuits
            .entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name));
        let was_closed = circuit.state == CircuitState::Closed;
        circuit.record_failure(error.into(), &self.config);
        if was_closed && circuit.state == CircuitState::Open {
            tracing::warn!(name, open_count = circuit.open_count, "circuit opened");
        }
    }

    pub async fn record_success(&self, name: &str) {
        if !self.config.enabled {
            return;
        }
        let mut circuits = self.circuits.write().await;
        if let Some(circuit) = circuits.get_mut(name) {
            circuit.record_success();
        }
    }

    pub async fn state(&self, name: &str) -> Option<CircuitState> {
        let circuits = self.circuits.read().await;
        circuits.get(name).map(CircuitBreaker::state)
    }

    /// When the circuit is open and not yet eligible for a probe,
    /// returns the earliest retry time. Unlike [`check`], this never
    /// admits or consumes a half-open probe.
    pub async fn blocked_until(&self, name: &str) -> Option<DateTime<Utc>> {
        if !self.config.enabled {
            return None;
        }
        let circuits = self.circuits.read().await;
        let circuit = circuits.get(name)?;
        if circuit.state != CircuitState::Open {
            return None;
        }
        let opened_at = circuit.opened_at?;
        if Utc::now() > opened_at + self.config.recovery_timeout {
            None
        } else {
            Some(circuit.retry_after(&self.config))
        }
    }

    pub async fn stats(&self) -> Vec<CircuitStats> {
        let circuits = self.circuits.read().await;
        circuits
            .values()
            .map(|c| CircuitStats {
                name: c.name.clone(),
                state: c.state.as_str(),
                failure_count: c.recent_failure_count(&self.config),
                open_count: c.open_count,
                opened_at: c.opened_at,
                state_changed_at: c.state_changed_at,
            })
            .collect()
    }

    pub async fn open_circuits(&self) -> Vec<String> {
        let circuits = self.circuits.read().await;
        circuits
            .iter()
            .filter(|(_, c)| c.state == CircuitState::Open)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub async fn reset(&self, name: &str) {
        let mut circuits = self.circuits.write().await;
        if let Some(circuit) = circuits.get_mut(name) {
            circuit.reset();
        }
    }

    pub async fn reset_all(&self) {
        let mut circuits = self.circuits.write().await;
        for circuit in circuits.values_mut() {
            circuit.reset();
        }
    }

    /// Aggregated health: any open circuit degrades the rollup.
    pub async fn health_status(&self) -> HealthStatus {
        let open = self.open_circuits().await;
        if open.is_empty() {
            HealthStatus::healthy("circuit_breakers", "All circuits closed")
        } else {
            let mut metadata = HashMap::new();
            metadata.insert("open_circuits".to_string(), serde_json::json!(open));
            HealthStatus::new(
                HealthLevel::Degraded,
                "circuit_breakers",
                format!("{} circuit(s) open", open.len()),
            )
            .with_metadata(metadata)
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

/// Error from a breaker-guarded operation.
#[derive(Debug)]
pub enum GuardedError<E> {
    /// The circuit is open and the call never ran.
    CircuitOpen {
        name: String,
        retry_after: DateTime<Utc>,
    },
    /// The underlying operation failed (and was recorded).
    Operation(E),
}

impl<E: std::fmt::Display> std::fmt::Display for GuardedError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CircuitOpen { name, retry_after } => {
                write!(f, "circuit breaker open for {name}, retry after {retry_after}")
            }
            Self::Operation(e) => write!(f, "operation failed: {e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardedError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CircuitOpen { .. } => None,
            Self::Operation(e) => Some(e),
        }
    }
}

/// Run an operation under a named breaker, recording the outcome.
pub async fn guarded<F, T, E>(
    registry: &CircuitBreakerRegistry,
    name: &str,
    operation: F,
) -> Result<T, GuardedError<E>>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    if let Err(DomainError::CircuitOpen { name, retry_after }) = registry.check(name).await {
        return Err(GuardedError::CircuitOpen { name, retry_after });
    }
    match operation.await {
        Ok(value) => {
            registry.record_success(name).await;
            Ok(value)
        }
        Err(e) => {
            registry.record_failure(name, e.to_string()).await;
            Err(GuardedError::Operation(e))
        }
    }
}
