//! Core services: event substrate, state management, fault isolation,
//! validation, propagation, and the refinement lifecycle.

pub mod agent;
pub mod circuit_breaker;
pub mod earth;
pub mod event_bus;
pub mod event_monitor;
pub mod event_registry;
pub mod lock_manager;
pub mod monitor;
pub mod refinement;
pub mod resource_registry;
pub mod state_manager;
pub mod water;

pub use agent::{AgentProcessResult, AgentScaffold};
pub use circuit_breaker::{
    guarded, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, GuardedError,
};
pub use earth::{EarthConfig, EarthValidator, ValidationStats};
pub use event_bus::{
    Event, EventBus, EventBusConfig, EventHandler, EventKind, EventPayload, EventPriority,
};
pub use event_monitor::{EventSystemMonitor, EventTracer};
pub use event_registry::{EventRegistry, EventTypeMetadata};
pub use lock_manager::{LockMetrics, LockMode, OwnerInfo, PrioritizedLockManager};
pub use monitor::{
    HealthTracker, MemoryMonitor, MemoryMonitorConfig, MetricsRecorder, SystemMonitor,
};
pub use refinement::{
    ArbitrationDecision, RefinementManager, RefinementTimeouts, StageOutcome,
};
pub use resource_registry::{ResourceRegistry, TrackedResource};
pub use state_manager::{AlertCleanupHandler, StateManager};
pub use water::{downstream_agents, PropagationResult, WaterPropagator};
