//! End-to-end scenarios across the coordination substrate: state
//! progression with snapshot cadence, transition rejection, validation
//! with dependency analysis, propagation with partial failure, the
//! three-stage refinement loop, and backtracking cleanup.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use arbor::domain::errors::DomainError;
use arbor::domain::models::config::{PersistenceKind, StateManagerConfig};
use arbor::domain::models::guideline::{AbstractionTier, ValidationCategory};
use arbor::domain::models::refinement::ValidationState;
use arbor::domain::models::state::{ResourceState, ResourceType};
use arbor::domain::ports::agent::{DownstreamAgent, RefinementAgent};
use arbor::services::earth::{EarthConfig, EarthValidator};
use arbor::services::event_bus::{Event, EventBus, EventPayload};
use arbor::services::monitor::{HealthTracker, MetricsRecorder};
use arbor::services::refinement::{RefinementManager, RefinementTimeouts};
use arbor::services::state_manager::StateManager;
use arbor::services::water::WaterPropagator;

use common::{CapturingHandler, ConfidentRefiner, ScriptedTarget, StructuralValidationAgent};

async fn settle(bus: &EventBus) {
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if bus.queue_depths().iter().all(|&d| d == 0) {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(25)).await;
}

struct Fixture {
    bus: Arc<EventBus>,
    state: Arc<StateManager>,
    metrics: Arc<MetricsRecorder>,
}

impl Fixture {
    async fn new() -> Self {
        let bus = Arc::new(EventBus::with_defaults());
        bus.start().await;
        let state = StateManager::new(Arc::clone(&bus), StateManagerConfig::default())
            .await
            .unwrap();
        let metrics = MetricsRecorder::new(Arc::clone(&bus));
        Self { bus, state, metrics }
    }

    fn earth(&self) -> EarthValidator {
        EarthValidator::new(
            Arc::new(StructuralValidationAgent),
            Arc::clone(&self.state),
            Arc::clone(&self.bus),
            Arc::clone(&self.metrics),
            EarthConfig::default(),
        )
    }

    fn water(&self) -> WaterPropagator {
        WaterPropagator::new(
            Arc::clone(&self.state),
            Arc::clone(&self.bus),
            HealthTracker::new(Arc::clone(&self.bus)),
        )
    }

    fn refinement(&self) -> RefinementManager {
        RefinementManager::new(
            Arc::clone(&self.state),
            Arc::clone(&self.bus),
            Arc::clone(&self.metrics),
        )
    }
}

// Scenario: ten legal transitions leave ten history entries with
// versions 1..10 and exactly one periodic snapshot.
#[tokio::test]
async fn legal_state_progression_with_snapshot_cadence() {
    let fixture = Fixture::new().await;
    for k in 0..10 {
        let mut metadata = HashMap::new();
        metadata.insert("v".to_string(), json!(k));
        fixture
            .state
            .set_state(
                "r1",
                ResourceState::Active,
                ResourceType::Compute,
                Some(metadata),
                None,
                None,
            )
            .await
            .unwrap();
    }

    let history = fixture.state.get_history("r1", None).await;
    assert_eq!(history.len(), 10);
    let versions: Vec<u64> = history.iter().map(|e| e.version).collect();
    assert_eq!(versions, (1..=10).collect::<Vec<u64>>());
    assert_eq!(fixture.state.get_snapshots("r1", None).await.len(), 1);
    fixture.bus.stop().await;
}

// Scenario: a TERMINATED resource rejects further transitions, leaves
// history untouched, and emits no state-change event.
#[tokio::test]
async fn illegal_transition_rejected_without_event() {
    let fixture = Fixture::new().await;
    let capture = CapturingHandler::new("state-watcher");
    fixture
        .bus
        .subscribe("RESOURCE_STATE_CHANGED", Arc::clone(&capture) as _)
        .await;

    fixture
        .state
        .set_state("r1", ResourceState::Active, ResourceType::Compute, None, None, None)
        .await
        .unwrap();
    fixture.state.terminate_resource("r1", "done").await.unwrap();
    settle(&fixture.bus).await;
    let events_before = capture.captured().len();
    let history_before = fixture.state.get_history("r1", None).await.len();

    let err = fixture
        .state
        .set_state("r1", ResourceState::Active, ResourceType::Compute, None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::InvalidStateTransition { .. }));

    settle(&fixture.bus).await;
    assert_eq!(fixture.state.get_history("r1", None).await.len(), history_before);
    assert_eq!(capture.captured().len(), events_before);
    fixture.bus.stop().await;
}

// Scenario: a proposal with components A<->B in a cycle is rejected
// with a dependency_cycle issue naming both, and no correction.
#[tokio::test]
async fn validation_rejects_circular_dependency() {
    let fixture = Fixture::new().await;
    let earth = fixture.earth();

    let proposed = json!({
        "ordered_components": [
            {"name": "A", "dependencies": {"required": ["B"]}},
            {"name": "B", "dependencies": {"required": ["A"]}}
        ]
    });
    let outcome = earth
        .validate_guideline_update(
            AbstractionTier::Component,
            "garden_planner",
            &json!({}),
            &proposed,
            None,
            true,
        )
        .await;

    assert_eq!(
        outcome.validation_result.validation_category,
        ValidationCategory::Rejected
    );
    let cycle_issue = outcome
        .detected_issues
        .iter()
        .find(|i| i.issue_type == "dependency_cycle")
        .expect("cycle issue present");
    assert!(cycle_issue.affected_elements.contains(&"A".to_string()));
    assert!(cycle_issue.affected_elements.contains(&"B".to_string()));
    assert!(outcome.corrected_update.is_none());
    fixture.bus.stop().await;
}

// Scenario: three downstream targets, the middle one raising. Overall
// failure, three affected agents, one failure record, two successes.
#[tokio::test]
async fn propagation_with_partial_failure() {
    let fixture = Fixture::new().await;
    let water = fixture.water();
    let env = ScriptedTarget::new("environmental_analysis");
    let root = ScriptedTarget::failing("root_system");
    let tree = ScriptedTarget::new("tree_placement");
    for target in [&env, &root, &tree] {
        water
            .register_target(Arc::clone(target) as Arc<dyn DownstreamAgent>)
            .await;
    }
    let capture = CapturingHandler::new("propagation-watcher");
    fixture
        .bus
        .subscribe("WATER_PROPAGATION_FAILED", Arc::clone(&capture) as _)
        .await;

    let result = water
        .propagate_guideline_update("garden_planner", &json!({"v": 1}), None, None)
        .await;

    assert!(!result.success);
    assert_eq!(result.affected_agents.len(), 3);
    assert_eq!(result.updates.len(), result.affected_agents.len());
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].agent, "root_system");
    let successes: Vec<&str> = result
        .updates
        .iter()
        .filter(|u| u.success)
        .map(|u| u.agent.as_str())
        .collect();
    assert_eq!(successes, ["environmental_analysis", "tree_placement"]);

    settle(&fixture.bus).await;
    let events = capture.captured();
    assert_eq!(events.len(), 1);
    if let EventPayload::Propagation(payload) = &events[0].payload {
        assert_eq!(payload.failures.len(), 1);
        assert_eq!(payload.failures[0].agent, "root_system");
    } else {
        panic!("expected propagation payload");
    }
    fixture.bus.stop().await;
}

// Scenario: a high-confidence revision with no remaining uncertainties
// exits after one refine, one reflect, one revise.
#[tokio::test]
async fn three_stage_refinement_early_exit() {
    let fixture = Fixture::new().await;
    let manager = fixture.refinement();
    let agent = ConfidentRefiner::new();
    let context = manager
        .create_refinement_context(
            "comp-1",
            ValidationState::RequirementsRevising,
            Some("environmental_analysis".to_string()),
            vec![],
            None,
        )
        .await;

    let artifact = manager
        .three_stage_refinement(
            &context.context_id,
            Arc::clone(&agent) as Arc<dyn RefinementAgent>,
            json!({"draft": "requirements"}),
            RefinementTimeouts::default(),
            3,
        )
        .await;

    use std::sync::atomic::Ordering;
    assert_eq!(agent.refines.load(Ordering::SeqCst), 1);
    assert_eq!(agent.reflects.load(Ordering::SeqCst), 1);
    assert_eq!(agent.revises.load(Ordering::SeqCst), 1);
    assert_eq!(
        artifact,
        json!({"revised": {"refined": {"draft": "requirements"}}})
    );
    let iterations = manager.iterations_for(&context.context_id).await;
    assert_eq!(iterations.len(), 3);
    fixture.bus.stop().await;
}

// Scenario: arbitration hands off to requirements revising for context
// A's agent; context B (features revising) and its iterations vanish
// and a cleaned_up refinement event is emitted for it.
#[tokio::test]
async fn backtracking_cleanup_removes_obsolete_contexts() {
    let fixture = Fixture::new().await;
    let manager = fixture.refinement();
    let capture = CapturingHandler::new("refinement-watcher");
    fixture
        .bus
        .subscribe("COMPONENT_REFINEMENT_UPDATED", Arc::clone(&capture) as _)
        .await;

    let a = manager
        .create_refinement_context(
            "comp-1",
            ValidationState::RequirementsRevising,
            Some("environmental_analysis".to_string()),
            vec![],
            None,
        )
        .await;
    let b = manager
        .create_refinement_context(
            "comp-1",
            ValidationState::FeaturesRevising,
            Some("tree_placement".to_string()),
            vec![],
            None,
        )
        .await;
    manager
        .track_refinement_iteration(
            &b.context_id,
            1,
            arbor::domain::models::refinement::RefinementStage::Refine,
            true,
            1.0,
            None,
        )
        .await;

    manager
        .transition_validation_state("comp-1", ValidationState::Arbitration, None)
        .await;
    let removed = manager
        .transition_validation_state(
            "comp-1",
            ValidationState::RequirementsRevising,
            Some("environmental_analysis"),
        )
        .await;

    assert_eq!(removed, 1);
    assert!(manager.get_context(&a.context_id).await.is_some());
    assert!(manager.get_context(&b.context_id).await.is_none());
    assert!(manager.iterations_for(&b.context_id).await.is_empty());

    settle(&fixture.bus).await;
    let cleaned: Vec<Event> = capture
        .captured()
        .into_iter()
        .filter(|event| {
            matches!(
                &event.payload,
                EventPayload::RefinementContext(payload)
                    if payload.state == "cleaned_up" && payload.context_id == b.context_id
            )
        })
        .collect();
    assert_eq!(cleaned.len(), 1);
    fixture.bus.stop().await;
}

// Full cycle: an originating agent proposes, earth validates, water
// fans out with per-target context, a downstream failure feeds the
// refinement manager, which converges on a revised artifact.
#[tokio::test]
async fn end_to_end_validation_propagation_refinement_cycle() {
    let fixture = Fixture::new().await;
    let earth = fixture.earth();
    let water = fixture.water();
    let refinement = fixture.refinement();

    let proposed = json!({
        "ordered_components": [
            {"name": "ingest", "dependencies": {"required": []}},
            {"name": "plan", "dependencies": {"required": ["ingest"]}}
        ]
    });
    let (accepted, final_guideline, outcome) = earth
        .process_guideline_update(
            AbstractionTier::Component,
            "garden_planner",
            &json!({}),
            &proposed,
            None,
            true,
            true,
        )
        .await;
    assert!(accepted);
    assert_eq!(final_guideline, proposed);

    let env = ScriptedTarget::failing("environmental_analysis");
    let root = ScriptedTarget::new("root_system");
    let tree = ScriptedTarget::new("tree_placement");
    for target in [&env, &root, &tree] {
        water
            .register_target(Arc::clone(target) as Arc<dyn DownstreamAgent>)
            .await;
    }
    let propagation = water
        .propagate_validated("garden_planner", &final_guideline, &outcome, None)
        .await;
    assert!(!propagation.success);
    assert_eq!(propagation.failures[0].agent, "environmental_analysis");

    // The failing downstream agent enters refinement.
    let mut error: HashMap<String, Value> = HashMap::new();
    error.insert("reason".to_string(), json!(propagation.failures[0].reason));
    let context = refinement
        .create_refinement_context(
            "plan",
            ValidationState::RequirementsRevising,
            Some("environmental_analysis".to_string()),
            vec![error],
            None,
        )
        .await;
    let agent = ConfidentRefiner::new();
    let artifact = refinement
        .three_stage_refinement(
            &context.context_id,
            agent as Arc<dyn RefinementAgent>,
            final_guideline.clone(),
            RefinementTimeouts::default(),
            3,
        )
        .await;
    assert!(artifact.get("revised").is_some());
    refinement.complete_context(&context.context_id).await;
    assert!(refinement.get_context(&context.context_id).await.is_none());

    fixture.bus.stop().await;
}

// State persisted through the file backend survives a fresh manager.
#[tokio::test]
async fn file_backed_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = StateManagerConfig {
        persistence: PersistenceKind::File {
            storage_dir: dir.path().to_path_buf(),
        },
        ..Default::default()
    };

    {
        let bus = Arc::new(EventBus::with_defaults());
        let state = StateManager::new(bus, config.clone()).await.unwrap();
        state
            .set_state("r1", ResourceState::Active, ResourceType::Compute, None, None, None)
            .await
            .unwrap();
        state
            .set_state("r1", ResourceState::Paused, ResourceType::Compute, None, None, None)
            .await
            .unwrap();
    }

    let bus = Arc::new(EventBus::with_defaults());
    let state = StateManager::new(bus, config).await.unwrap();
    let entry = state.get_state("r1", None, true).await.unwrap();
    assert_eq!(entry.state.as_resource(), Some(ResourceState::Paused));
    assert_eq!(entry.version, 2);
    assert_eq!(state.get_history("r1", None).await.len(), 2);
}

// Same through sqlite, exercising the sqlx-backed schema.
#[tokio::test]
async fn sqlite_backed_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = StateManagerConfig {
        persistence: PersistenceKind::Sqlite {
            db_path: dir.path().join("arbor.db"),
        },
        ..Default::default()
    };

    {
        let bus = Arc::new(EventBus::with_defaults());
        let state = StateManager::new(bus, config.clone()).await.unwrap();
        state
            .set_state("r1", ResourceState::Active, ResourceType::Compute, None, None, None)
            .await
            .unwrap();
    }

    let bus = Arc::new(EventBus::with_defaults());
    let state = StateManager::new(bus, config).await.unwrap();
    let entry = state.get_state("r1", None, true).await.unwrap();
    assert_eq!(entry.state.as_resource(), Some(ResourceState::Active));
}

// Repairing a healthy store changes nothing.
#[tokio::test]
async fn repair_on_healthy_store_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let backend = arbor::adapters::state::FileStateBackend::new(dir.path())
        .await
        .unwrap();
    use arbor::domain::models::state::StateEntry;
    use arbor::domain::ports::state_backend::StateBackend;
    let entry = StateEntry::new(ResourceState::Active, ResourceType::State);
    backend.save_state("r1", &entry).await.unwrap();

    let before = backend.load_state("r1").await.unwrap().unwrap();
    let results = backend.repair().await.unwrap();
    assert_eq!(results["state_repaired"], 0);
    assert_eq!(results["failed"], 0);
    let after = backend.load_state("r1").await.unwrap().unwrap();
    assert_eq!(before, after);
}

// Memory policy: crossing the high-water mark raises a HIGH alert,
// which the alert handler answers with a forced cleanup pass.
#[tokio::test]
async fn memory_high_water_alert_triggers_forced_cleanup() {
    use arbor::domain::models::config::{CleanupConfig, CleanupPolicy};
    use arbor::services::monitor::{MemoryMonitor, MemoryMonitorConfig};
    use arbor::services::state_manager::AlertCleanupHandler;

    let bus = Arc::new(EventBus::with_defaults());
    bus.start().await;
    let state = StateManager::new(
        Arc::clone(&bus),
        StateManagerConfig {
            cleanup: Some(CleanupConfig {
                policy: CleanupPolicy::Aggressive,
                ttl_seconds: 3_600,
                check_interval: Some(3_600),
                batch_size: 100,
            }),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    bus.subscribe("RESOURCE_ALERT_CREATED", AlertCleanupHandler::new(&state))
        .await;
    let capture = CapturingHandler::new("cleanup-watcher");
    bus.subscribe("METRIC_RECORDED", Arc::clone(&capture) as _)
        .await;

    let memory = MemoryMonitor::new(
        Arc::clone(&bus),
        MemoryMonitorConfig {
            high_water_mb: 1.0,
            min_tracked_kb: 0.0,
        },
    );
    memory.track_resource("giant-context", 5.0);
    // Two rounds: alert delivery, then the cleanup metric it causes.
    settle(&bus).await;
    settle(&bus).await;

    let cleanup_metrics: Vec<Event> = capture
        .captured()
        .into_iter()
        .filter(|event| {
            matches!(
                &event.payload,
                EventPayload::Metric(payload) if payload.metric == "state_cleanup"
                    && payload.metadata.get("forced") == Some(&json!(true))
            )
        })
        .collect();
    assert_eq!(cleanup_metrics.len(), 1);
    bus.stop().await;
}

// Whole-store snapshot round trip through the manager.
#[tokio::test]
async fn store_snapshot_restore_round_trip() {
    let fixture = Fixture::new().await;
    fixture
        .state
        .set_state("a", ResourceState::Active, ResourceType::Compute, None, None, None)
        .await
        .unwrap();
    fixture
        .state
        .set_state(
            "b",
            arbor::domain::models::state::StateValue::Mapping(json!({"k": 1})),
            ResourceType::State,
            None,
            None,
            None,
        )
        .await
        .unwrap();

    let snapshot = fixture.state.get_snapshot().await;
    fixture.state.clear_state(None).await;
    fixture.state.restore_snapshot(&snapshot).await.unwrap();

    let a = fixture.state.get_state("a", None, true).await.unwrap();
    assert_eq!(a.state.as_resource(), Some(ResourceState::Active));
    let b = fixture.state.get_state("b", None, true).await.unwrap();
    assert_eq!(
        b.state,
        arbor::domain::models::state::StateValue::Mapping(json!({"k": 1}))
    );
    fixture.bus.stop().await;
}
