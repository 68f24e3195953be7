//! Execution guard: the set of jobs currently inside an execution attempt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;

/// Tracks in-flight executions, at most one per job id.
///
/// Cheap to clone; all clones share the same set. The only way to release
/// an id is to drop the [`GuardSlot`] that claimed it.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGuard {
    running: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl ExecutionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `id`. Returns `None` if the job is already running.
    ///
    /// The returned [`GuardSlot`] releases the slot when dropped, so the
    /// release happens on every exit path, panics included.
    pub fn try_enter(&self, id: &str) -> Option<GuardSlot> {
        let mut running = self.running.lock().expect("execution guard poisoned");
        if running.contains_key(id) {
            return None;
        }
        running.insert(id.to_string(), Utc::now());
        Some(GuardSlot {
            id: id.to_string(),
            guard: self.clone(),
        })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.running
            .lock()
            .expect("execution guard poisoned")
            .contains_key(id)
    }

    fn release(&self, id: &str) {
        let mut running = self.running.lock().expect("execution guard poisoned");
        if running.remove(id).is_some() {
            debug!(job_id = %id, "execution slot released");
        }
    }

    /// When the execution of `id` started, if it is running.
    pub fn started_at(&self, id: &str) -> Option<DateTime<Utc>> {
        self.running
            .lock()
            .expect("execution guard poisoned")
            .get(id)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.running.lock().expect("execution guard poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scoped ownership of one job's execution slot.
#[derive(Debug)]
pub struct GuardSlot {
    id: String,
    guard: ExecutionGuard,
}

impl GuardSlot {
    pub fn job_id(&self) -> &str {
        &self.id
    }
}

impl Drop for GuardSlot {
    fn drop(&mut self) {
        self.guard.release(&self.id);
    }
}
