//! Process-wide resource registry with task tracking.
//!
//! Every long-lived object registers here under a unique id. A tracked
//! resource owns the background tasks it spawns; terminating the
//! resource cancels them and removes it from the registry.
//! `terminate_all` sweeps everything at shutdown, tolerating individual
//! failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use tokio::task::{AbortHandle, JoinHandle};

use crate::services::event_bus::{
    EventBus, EventKind, EventPayload, ResourceStatePayload,
};

/// A registered resource: identity, creation time, and the background
/// tasks attributable to it.
pub struct TrackedResource {
    resource_id: String,
    created_at: DateTime<Utc>,
    tasks: StdMutex<Vec<AbortHandle>>,
    initialized: AtomicBool,
    terminated: AtomicBool,
}

impl TrackedResource {
    fn new(resource_id: String) -> Self {
        Self {
            resource_id,
            created_at: Utc::now(),
            tasks: StdMutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Mark initialization done. Idempotent; fails after termination.
    pub fn initialize(&self) -> bool {
        if self.terminated.load(Ordering::SeqCst) {
            tracing::error!(
                "cannot initialize terminated resource: {}",
                self.resource_id
            );
            return false;
        }
        self.initialized.store(true, Ordering::SeqCst);
        true
    }

    /// Spawn a task owned by this resource. Tasks spawned after
    /// termination are aborted immediately.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = tokio::spawn(future);
        if self.terminated.load(Ordering::SeqCst) {
            handle.abort();
            return handle;
        }
        let mut tasks = self.tasks.lock().expect("task list poisoned");
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle.abort_handle());
        handle
    }

    /// Cancel every tracked task. Idempotent.
    fn cancel_tasks(&self) {
        let tasks = {
            let mut tasks = self.tasks.lock().expect("task list poisoned");
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.abort();
        }
    }

    pub fn active_task_count(&self) -> usize {
        self.tasks
            .lock()
            .expect("task list poisoned")
            .iter()
            .filter(|t| !t.is_finished())
            .count()
    }
}

/// The registry: a locked map from resource id to tracked resource.
pub struct ResourceRegistry {
    resources: StdMutex<HashMap<String, Arc<TrackedResource>>>,
    bus: Arc<EventBus>,
}

impl ResourceRegistry {
    pub fn new(bus: Arc<EventBus>) -> Arc<Self> {
        Arc::new(Self {
            resources: StdMutex::new(HashMap::new()),
            bus,
        })
    }

    /// Register a resource id, creating its tracker. Re-registering an
    /// id returns the existing tracker.
    pub fn register(&self, resource_id: &str) -> Arc<TrackedResource> {
        let mut resources = self.resources.lock().expect("registry poisoned");
        Arc::clone(
            resources
                .entry(resource_id.to_string())
                .or_insert_with(|| Arc::new(TrackedResource::new(resource_id.to_string()))),
        )
    }

    pub fn get(&self, resource_id: &str) -> Option<Arc<TrackedResource>> {
        self.resources
            .lock()
            .expect("registry poisoned")
            .get(resource_id)
            .cloned()
    }

    pub fn list(&self) -> Vec<String> {
        self.resources
            .lock()
            .expect("registry poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.resources.lock().expect("registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminate a resource: cancel its tasks and drop it from the
    /// registry. Idempotent; returns false when the id is unknown.
    pub fn terminate(&self, resource_id: &str) -> bool {
        let resource = {
            let mut resources = self.resources.lock().expect("registry poisoned");
            resources.remove(resource_id)
        };
        let Some(resource) = resource else {
            return false;
        };
        resource.terminated.store(true, Ordering::SeqCst);
        resource.cancel_tasks();

        self.bus.emit(
            EventKind::ResourceStateChanged,
            "resource_registry",
            EventPayload::ResourceState(ResourceStatePayload {
                resource_id: resource_id.to_string(),
                state: "TERMINATED".to_string(),
                resource_type: "RESOURCE".to_string(),
                transition_reason: Some("terminate".to_string()),
                ..Default::default()
            }),
        );
        true
    }

    /// Terminate everything, tolerating individual failures. Returns
    /// the number of resources terminated.
    pub fn terminate_all(&self) -> usize {
        let ids = self.list();
        let mut terminated = 0;
        for resource_id in ids {
            if self.terminate(&resource_id) {
                terminated += 1;
            } else {
                tracing::error!("failed to terminate resource {resource_id}");
            }
        }
        terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry() -> Arc<ResourceRegistry> {
        ResourceRegistry::new(Arc::new(EventBus::with_defaults()))
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = registry();
        let resource = registry.register("agent:planner");
        assert_eq!(resource.resource_id(), "agent:planner");
        assert!(registry.get("agent:planner").is_some());
        // Re-registration returns the same tracker.
        let again = registry.register("agent:planner");
        assert!(Arc::ptr_eq(&resource, &again));
    }

    #[tokio::test]
    async fn test_initialize_idempotent_until_terminated() {
        let registry = registry();
        let resource = registry.register("r");
        assert!(resource.initialize());
        assert!(resource.initialize());
        registry.terminate("r");
        assert!(!resource.initialize());
    }

    #[tokio::test]
    async fn test_terminate_cancels_tracked_tasks() {
        let registry = registry();
        let resource = registry.register("r");
        let task = resource.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        assert_eq!(resource.active_task_count(), 1);

        assert!(registry.terminate("r"));
        assert!(registry.get("r").is_none());
        let joined = task.await;
        assert!(joined.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_spawn_after_terminate_aborts_immediately() {
        let registry = registry();
        let resource = registry.register("r");
        registry.terminate("r");
        let task = resource.spawn(async { 42 });
        assert!(task.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_terminate_unknown_is_false() {
        let registry = registry();
        assert!(!registry.terminate("ghost"));
    }

    #[tokio::test]
    async fn test_terminate_all() {
        let registry = registry();
        registry.register("a");
        registry.register("b");
        registry.register("c");
        assert_eq!(registry.terminate_all(), 3);
        assert!(registry.is_empty());
    }
}
