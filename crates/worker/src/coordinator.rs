//! Suspension and continuation of callback-driven operations.
//!
//! Some operations pause mid-flight and wait for the client's verdict: an
//! intercepted request cannot proceed until the client says fulfill,
//! continue or abort. The coordinator hands each such pause a fresh
//! correlation id, parks it, and resumes it when `callback.continue`
//! arrives, when the ceiling expires, or when the owning resource goes
//! away. The serving loop is never blocked by a pause; only the task that
//! registered it waits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

/// Ceiling applied to every suspension.
pub const DEFAULT_CONTINUATION_CEILING: Duration = Duration::from_secs(30);

/// How a suspension ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ContinuationOutcome {
    /// The client answered in time; carries its `callbackResult`.
    Resolved(Value),
    /// No continuation arrived before the ceiling.
    TimedOut,
    /// The owning resource went away first.
    Cancelled,
}

struct Slot {
    tx: oneshot::Sender<ContinuationOutcome>,
    owner: String,
}

/// Registry of paused operations, keyed by minted correlation id.
pub struct CallbackCoordinator {
    slots: DashMap<u64, Slot>,
    next_id: AtomicU64,
    ceiling: Duration,
}

/// One registered pause. Awaiting [`wait`](Suspension::wait) yields the
/// outcome; dropping it unregisters the slot.
pub struct Suspension {
    id: u64,
    rx: Option<oneshot::Receiver<ContinuationOutcome>>,
    coordinator: Arc<CallbackCoordinator>,
}

impl CallbackCoordinator {
    pub fn new() -> Arc<Self> {
        Self::with_ceiling(DEFAULT_CONTINUATION_CEILING)
    }

    pub fn with_ceiling(ceiling: Duration) -> Arc<Self> {
        Arc::new(Self {
            slots: DashMap::new(),
            next_id: AtomicU64::new(0),
            ceiling,
        })
    }

    /// Park an operation on behalf of `owner` (a resource id). Returns the
    /// minted correlation id to put on the wire and the suspension to
    /// await.
    pub fn suspend(self: &Arc<Self>, owner: impl Into<String>) -> (u64, Suspension) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.slots.insert(
            id,
            Slot {
                tx,
                owner: owner.into(),
            },
        );
        (
            id,
            Suspension {
                id,
                rx: Some(rx),
                coordinator: Arc::clone(self),
            },
        )
    }

    /// Resume the suspension registered under `id` with the client's
    /// verdict. Returns `false` when the id is unknown or already resolved,
    /// which callers surface as "not completed".
    pub fn continue_after_callback(&self, id: u64, result: Value) -> bool {
        let Some((_, slot)) = self.slots.remove(&id) else {
            return false;
        };
        slot.tx.send(ContinuationOutcome::Resolved(result)).is_ok()
    }

    /// Cancel every suspension owned by `owner`. Returns how many were
    /// cancelled.
    pub fn cancel_owned_by(&self, owner: &str) -> usize {
        let ids: Vec<u64> = self
            .slots
            .iter()
            .filter(|entry| entry.value().owner == owner)
            .map(|entry| *entry.key())
            .collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, slot)) = self.slots.remove(&id) {
                let _ = slot.tx.send(ContinuationOutcome::Cancelled);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::debug!(owner, cancelled, "cancelled suspensions");
        }
        cancelled
    }

    /// Cancel everything; used when the worker shuts down.
    pub fn cancel_all(&self) {
        let ids: Vec<u64> = self.slots.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, slot)) = self.slots.remove(&id) {
                let _ = slot.tx.send(ContinuationOutcome::Cancelled);
            }
        }
    }

    /// Number of suspensions currently parked.
    pub fn outstanding(&self) -> usize {
        self.slots.len()
    }
}

impl Suspension {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Await the continuation, bounded by the coordinator's ceiling.
    pub async fn wait(mut self) -> ContinuationOutcome {
        let Some(rx) = self.rx.take() else {
            return ContinuationOutcome::Cancelled;
        };
        match tokio::time::timeout(self.coordinator.ceiling, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender gone without a verdict; treat like a cancellation.
            Ok(Err(_)) => ContinuationOutcome::Cancelled,
            Err(_) => {
                // Unregister now so a late continuation sees "not
                // completed" instead of resuming nothing.
                self.coordinator.slots.remove(&self.id);
                ContinuationOutcome::TimedOut
            }
        }
    }
}

impl Drop for Suspension {
    fn drop(&mut self) {
        self.coordinator.slots.remove(&self.id);
    }
}
