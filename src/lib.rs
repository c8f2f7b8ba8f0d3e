//! Arbor - coordination substrate for a multi-agent design pipeline.
//!
//! Arbor gives LLM-backed design agents safe, observable, recoverable,
//! concurrent operation:
//! - Prioritized pub/sub event bus with typed payloads and monitoring
//! - Versioned, snapshot-capable state store with memory, file, and
//!   SQLite backends
//! - Circuit breakers, prioritized locks, and resource lifecycle
//!   tracking
//! - Tiered guideline validation (earth) and downstream propagation
//!   (water)
//! - A three-stage refinement lifecycle with arbitration and
//!   backtracking cleanup

pub mod adapters;
pub mod domain;
pub mod services;

// Re-export key types for convenience
pub use domain::errors::{DomainError, DomainResult};
pub use domain::models::{
    AbstractionTier, CleanupConfig, CleanupPolicy, HealthLevel, HealthStatus, InterfaceState,
    PersistenceKind, ResourceState, ResourceType, StateEntry, StateManagerConfig, StateSnapshot,
    ValidationCategory, ValidationOutcome, ValidationState,
};
pub use services::{
    EarthValidator, EventBus, EventKind, EventPriority, RefinementManager, StateManager,
    WaterPropagator,
};
