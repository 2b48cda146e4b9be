//! Two-layer run cancellation, in-process half.
//!
//! The DB flag `runs.cancellation_requested` is the cross-process source of
//! truth; the heartbeat bridges it into this registry so the sequence
//! executor's step-boundary check is a cheap atomic load instead of a
//! database round-trip.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

/// Process-wide map of run → cancellation flag. Entries are registered when
/// a job starts executing and removed in its finally path.
pub struct CancellationRegistry {
    flags: Mutex<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self {
            flags: Mutex::new(HashMap::new()),
        }
    }

    /// Create a fresh (unset) flag for the run.
    pub fn register(&self, run_id: Uuid) {
        self.flags
            .lock()
            .expect("cancellation registry lock")
            .insert(run_id, Arc::new(AtomicBool::new(false)));
        debug!(%run_id, "cancellation registry: registered");
    }

    /// Signal cancellation in-process. No-op if the run is not registered
    /// (it already finished).
    pub fn mark_cancelled(&self, run_id: Uuid) {
        let flag = self
            .flags
            .lock()
            .expect("cancellation registry lock")
            .get(&run_id)
            .cloned();
        if let Some(flag) = flag {
            flag.store(true, Ordering::SeqCst);
            tracing::info!(%run_id, "cancellation registry: signalled");
        }
    }

    /// Fast check used at every step boundary.
    pub fn is_cancelled(&self, run_id: Uuid) -> bool {
        self.flags
            .lock()
            .expect("cancellation registry lock")
            .get(&run_id)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Remove the flag (call when the job's execution ends, on every path).
    pub fn deregister(&self, run_id: Uuid) {
        self.flags
            .lock()
            .expect("cancellation registry lock")
            .remove(&run_id);
        debug!(%run_id, "cancellation registry: deregistered");
    }
}

impl Default for CancellationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
