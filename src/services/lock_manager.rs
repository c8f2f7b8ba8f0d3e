//! Reader-writer lock with optional writer priority and leak tracking.
//!
//! Multiple readers may hold the lock concurrently; writers are
//! exclusive. With writer priority enabled, a waiting writer blocks new
//! readers. Every acquisition carries a `track_id` and owner info so
//! leaked holds show up in diagnostics instead of silently deadlocking
//! the system.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::domain::errors::{DomainError, DomainResult};

/// Mode of a held lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Read,
    Write,
}

/// Diagnostic record for one active acquisition.
#[derive(Debug, Clone, Serialize)]
pub struct OwnerInfo {
    pub track_id: String,
    pub owner: String,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
}

/// Counters describing lock traffic.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LockMetrics {
    pub read_acquisitions: u64,
    pub write_acquisitions: u64,
    pub timeouts: u64,
    pub contention_waits: u64,
    pub active_readers: usize,
    pub writer_active: bool,
    pub waiting_writers: usize,
}

#[derive(Default)]
struct LockState {
    active_readers: HashMap<String, OwnerInfo>,
    active_writer: Option<OwnerInfo>,
    waiting_writers: usize,
}

#[derive(Debug, Default)]
struct Counters {
    read_acquisitions: u64,
    write_acquisitions: u64,
    timeouts: u64,
    contention_waits: u64,
}

/// The prioritized reader-writer lock manager.
pub struct PrioritizedLockManager {
    state: Mutex<LockState>,
    released: Notify,
    counters: StdMutex<Counters>,
    writer_priority: bool,
}

impl PrioritizedLockManager {
    pub fn new(writer_priority: bool) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            released: Notify::new(),
            counters: StdMutex::new(Counters::default()),
            writer_priority,
        }
    }

    /// Acquire a shared read hold. Fails with `LockTimeout` when the
    /// writer (or a prioritized waiting writer) does not clear in time.
    pub async fn acquire_read(
        &self,
        timeout: Duration,
        track_id: &str,
        owner: &str,
    ) -> DomainResult<()> {
        let deadline = Instant::now() + timeout;
        let mut waited = false;
        loop {
            let mut notified = std::pin::pin!(self.released.notified());
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                let blocked_by_waiting_writer =
                    self.writer_priority && state.waiting_writers > 0;
                if state.active_writer.is_none() && !blocked_by_waiting_writer {
                    state.active_readers.insert(
                        track_id.to_string(),
                        OwnerInfo {
                            track_id: track_id.to_string(),
                            owner: owner.to_string(),
                            mode: LockMode::Read,
                            acquired_at: Utc::now(),
                        },
                    );
                    let mut counters = self.counters.lock().expect("lock counters poisoned");
                    counters.read_acquisitions += 1;
                    if waited {
                        counters.contention_waits += 1;
                    }
                    return Ok(());
                }
            }
            waited = true;
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.counters.lock().expect("lock counters poisoned").timeouts += 1;
                return Err(DomainError::LockTimeout {
                    track_id: track_id.to_string(),
                    timeout_secs: timeout.as_secs_f64(),
                });
            }
        }
    }

    /// Release a read hold. Returns false when the track id held nothing.
    pub async fn release_read(&self, track_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.active_readers.remove(track_id).is_some();
        drop(state);
        if removed {
            self.released.notify_waiters();
        }
        removed
    }

    /// Acquire the exclusive write hold.
    pub async fn acquire_write(
        &self,
        timeout: Duration,
        track_id: &str,
        owner: &str,
    ) -> DomainResult<()> {
        let deadline = Instant::now() + timeout;
        {
            // Announce intent first so writer priority can hold back
            // new readers while this writer waits.
            let mut state = self.state.lock().await;
            state.waiting_writers += 1;
        }
        let mut waited = false;
        loop {
            let mut notified = std::pin::pin!(self.released.notified());
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if state.active_writer.is_none() && state.active_readers.is_empty() {
                    state.waiting_writers -= 1;
                    state.active_writer = Some(OwnerInfo {
                        track_id: track_id.to_string(),
                        owner: owner.to_string(),
                        mode: LockMode::Write,
                        acquired_at: Utc::now(),
                    });
                    let mut counters = self.counters.lock().expect("lock counters poisoned");
                    counters.write_acquisitions += 1;
                    if waited {
                        counters.contention_waits += 1;
                    }
                    return Ok(());
                }
            }
            waited = true;
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let mut state = self.state.lock().await;
                state.waiting_writers -= 1;
                drop(state);
                // Readers held back by this writer's intent can go now.
                self.released.notify_waiters();
                self.counters.lock().expect("lock counters poisoned").timeouts += 1;
                return Err(DomainError::LockTimeout {
                    track_id: track_id.to_string(),
                    timeout_secs: timeout.as_secs_f64(),
                });
            }
        }
    }

    /// Release the write hold. Returns false on a track id mismatch.
    pub async fn release_write(&self, track_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let matches = state
            .active_writer
            .as_ref()
            .is_some_and(|w| w.track_id == track_id);
        if matches {
            state.active_writer = None;
        }
        drop(state);
        if matches {
            self.released.notify_waiters();
        }
        matches
    }

    pub async fn get_lock_metrics(&self) -> LockMetrics {
        let state = self.state.lock().await;
        let counters = self.counters.lock().expect("lock counters poisoned");
        LockMetrics {
            read_acquisitions: counters.read_acquisitions,
            write_acquisitions: counters.write_acquisitions,
            timeouts: counters.timeouts,
            contention_waits: counters.contention_waits,
            active_readers: state.active_readers.len(),
            writer_active: state.active_writer.is_some(),
            waiting_writers: state.waiting_writers,
        }
    }

    /// Everyone currently holding the lock, for leak diagnostics.
    pub async fn get_owner_info(&self) -> Vec<OwnerInfo> {
        let state = self.state.lock().await;
        let mut owners: Vec<OwnerInfo> = state.active_readers.values().cloned().collect();
        owners.extend(state.active_writer.clone());
        owners
    }
}
