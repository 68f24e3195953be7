//! Due-time index: job id → next due time, ordered by a min-heap.
//!
//! Replaces per-job timers with a single ordered structure. The coordinator
//! sleeps until the earliest entry (or the sweep ceiling) and then claims
//! everything that has come due. An entry is removed from the index before
//! its job is handed to the dispatcher, and claiming happens under the index
//! lock together with the execution-guard check, so two wakeups can never
//! both dispatch the same due occurrence.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::Result;
use crate::guard::{ExecutionGuard, GuardSlot};
use crate::schedule::Calculator;
use crate::types::Job;

/// Shared, cheaply cloneable due-time index.
#[derive(Debug, Clone)]
pub struct DueIndex {
    state: Arc<Mutex<IndexState>>,
    wake: Arc<Notify>,
    calculator: Calculator,
}

#[derive(Debug, Default)]
struct IndexState {
    /// Live entries. The `seq` identifies the heap item that is currently armed.
    entries: HashMap<String, Armed>,
    /// May contain stale items for cancelled or re-armed entries; they are
    /// discarded lazily when they reach the top.
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64, String)>>,
    next_seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct Armed {
    due: DateTime<Utc>,
    seq: u64,
}

/// A job taken out of the index for dispatch, holding its execution slot.
#[derive(Debug)]
pub struct Claimed {
    pub due: DateTime<Utc>,
    pub slot: GuardSlot,
}

impl Claimed {
    pub fn job_id(&self) -> &str {
        self.slot.job_id()
    }
}

impl IndexState {
    fn arm(&mut self, id: &str, due: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(id.to_string(), Armed { due, seq });
        self.heap.push(Reverse((due, seq, id.to_string())));
        self.compact();
    }

    fn is_live(&self, id: &str, seq: u64) -> bool {
        self.entries.get(id).is_some_and(|a| a.seq == seq)
    }

    /// Drop stale items sitting on top of the heap.
    fn prune_top(&mut self) {
        while let Some(Reverse((_, seq, id))) = self.heap.peek() {
            if self.is_live(id, *seq) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Rebuild the heap when stale items dominate it.
    fn compact(&mut self) {
        if self.heap.len() <= 2 * self.entries.len() + 64 {
            return;
        }
        self.heap = self
            .entries
            .iter()
            .map(|(id, a)| Reverse((a.due, a.seq, id.clone())))
            .collect();
    }
}

impl DueIndex {
    pub fn new(calculator: Calculator) -> Self {
        Self {
            state: Arc::new(Mutex::new(IndexState::default())),
            wake: Arc::new(Notify::new()),
            calculator,
        }
    }

    /// Arm `job` at its `next_due_at`, computing one from now if it has none.
    ///
    /// No-op (returns `Ok(None)`) unless the job is Active. Any existing entry
    /// for the job is cancelled first. Due times in the past fire on the next
    /// coordinator wakeup.
    pub fn schedule(&self, job: &Job) -> Result<Option<DateTime<Utc>>> {
        if !job.is_active() {
            return Ok(None);
        }
        self.unschedule(&job.id);

        let due = match job.next_due_at {
            Some(due) => due,
            None => self.calculator.next_run(&job.schedule, Utc::now())?,
        };

        let mut state = self.state.lock().expect("due index poisoned");
        state.arm(&job.id, due);
        drop(state);

        debug!(job_id = %job.id, due = %due, "job scheduled");
        self.wake.notify_one();
        Ok(Some(due))
    }

    /// Arm `id` at an explicit due time, bypassing the calculator.
    ///
    /// Unlike [`schedule`](Self::schedule) this does not look at job status;
    /// the dispatcher re-reads the job before executing it anyway.
    pub fn schedule_at(&self, id: &str, due: DateTime<Utc>) {
        let mut state = self.state.lock().expect("due index poisoned");
        state.arm(id, due);
        drop(state);

        debug!(job_id = %id, due = %due, "job scheduled at explicit time");
        self.wake.notify_one();
    }

    /// Cancel the entry for `id`. Returns whether an entry existed.
    pub fn unschedule(&self, id: &str) -> bool {
        let mut state = self.state.lock().expect("due index poisoned");
        let removed = state.entries.remove(id).is_some();
        if removed {
            debug!(job_id = %id, "job unscheduled");
        }
        removed
    }

    /// Remove up to `limit` entries due at or before `now` and claim their
    /// execution slots.
    ///
    /// Entries whose job is still executing are dropped without dispatch;
    /// the running attempt reschedules the job when it finishes.
    pub fn claim_due(
        &self,
        now: DateTime<Utc>,
        guard: &ExecutionGuard,
        limit: usize,
    ) -> Vec<Claimed> {
        let mut state = self.state.lock().expect("due index poisoned");
        let mut claimed = Vec::new();

        while claimed.len() < limit {
            state.prune_top();
            let due = match state.heap.peek() {
                Some(Reverse((due, _, _))) if *due <= now => *due,
                _ => break,
            };
            let Some(Reverse((_, _, id))) = state.heap.pop() else {
                break;
            };
            state.entries.remove(&id);

            match guard.try_enter(&id) {
                Some(slot) => claimed.push(Claimed { due, slot }),
                None => debug!(job_id = %id, "already executing, duplicate dispatch suppressed"),
            }
        }

        claimed
    }

    /// Earliest live due time, if any.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        let mut state = self.state.lock().expect("due index poisoned");
        state.prune_top();
        state.heap.peek().map(|Reverse((due, _, _))| *due)
    }

    pub fn due_at(&self, id: &str) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .expect("due index poisoned")
            .entries
            .get(id)
            .map(|a| a.due)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.due_at(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("due index poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every entry. Returns how many were live.
    pub fn clear(&self) -> usize {
        let mut state = self.state.lock().expect("due index poisoned");
        let n = state.entries.len();
        state.entries.clear();
        state.heap.clear();
        n
    }

    /// Resolves after the next schedule change.
    pub(crate) async fn changed(&self) {
        self.wake.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobStatus;
    use chrono::Duration;

    fn job(id: &str, due: Option<DateTime<Utc>>) -> Job {
        let now = Utc::now();
        Job {
            id: id.to_string(),
            name: id.to_string(),
            kind: "noop".to_string(),
            payload: "{}".to_string(),
            schedule: "PT1M".to_string(),
            status: JobStatus::Active,
            next_due_at: due,
            last_run_at: None,
            run_count: 0,
            failure_count: 0,
            last_error: None,
            max_runs: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn index() -> DueIndex {
        DueIndex::new(Calculator::default())
    }

    #[test]
    fn inactive_jobs_are_ignored() {
        let idx = index();
        let mut j = job("a", Some(Utc::now()));
        j.status = JobStatus::Paused;
        assert_eq!(idx.schedule(&j).unwrap(), None);
        assert!(idx.is_empty());
    }

    #[test]
    fn missing_due_time_is_computed() {
        let idx = index();
        let before = Utc::now();
        let due = idx.schedule(&job("a", None)).unwrap().unwrap();
        assert!(due >= before + Duration::minutes(1));
        assert_eq!(idx.due_at("a"), Some(due));
    }

    #[test]
    fn invalid_schedule_is_rejected_without_arming() {
        let idx = index();
        let mut j = job("a", None);
        j.schedule = "not a schedule".to_string();
        assert!(idx.schedule(&j).unwrap_err().is_schedule_error());
        assert!(!idx.contains("a"));
    }

    #[test]
    fn rescheduling_keeps_one_entry() {
        let idx = index();
        let now = Utc::now();
        idx.schedule(&job("a", Some(now - Duration::seconds(5)))).unwrap();
        idx.schedule(&job("a", Some(now + Duration::hours(1)))).unwrap();
        assert_eq!(idx.len(), 1);

        // The superseded past-due item must not fire.
        let guard = ExecutionGuard::new();
        assert!(idx.claim_due(now, &guard, 10).is_empty());
        assert_eq!(idx.next_due(), Some(now + Duration::hours(1)));
    }

    #[test]
    fn unscheduled_past_due_job_never_fires() {
        let idx = index();
        let now = Utc::now();
        idx.schedule(&job("a", Some(now - Duration::minutes(5)))).unwrap();
        assert!(idx.unschedule("a"));
        assert!(!idx.unschedule("a"));

        let guard = ExecutionGuard::new();
        assert!(idx.claim_due(now, &guard, 10).is_empty());
        assert_eq!(idx.next_due(), None);
    }

    #[test]
    fn claim_removes_entries_in_due_order_up_to_limit() {
        let idx = index();
        let now = Utc::now();
        idx.schedule(&job("late", Some(now - Duration::seconds(1)))).unwrap();
        idx.schedule(&job("early", Some(now - Duration::seconds(30)))).unwrap();
        idx.schedule(&job("mid", Some(now - Duration::seconds(10)))).unwrap();
        idx.schedule(&job("future", Some(now + Duration::minutes(1)))).unwrap();

        let guard = ExecutionGuard::new();
        let first = idx.claim_due(now, &guard, 2);
        let ids: Vec<_> = first.iter().map(|c| c.job_id().to_string()).collect();
        assert_eq!(ids, ["early", "mid"]);
        assert!(!idx.contains("early"));
        assert!(guard.contains("early"));

        let second = idx.claim_due(now, &guard, 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].job_id(), "late");
        assert!(idx.contains("future"));
    }

    #[test]
    fn running_job_is_not_claimed_twice() {
        let idx = index();
        let guard = ExecutionGuard::new();
        let now = Utc::now();
        let _running = guard.try_enter("a").unwrap();

        idx.schedule(&job("a", Some(now - Duration::seconds(1)))).unwrap();
        assert!(idx.claim_due(now, &guard, 10).is_empty());
        // The stray entry is consumed, not left to spin the coordinator.
        assert!(!idx.contains("a"));
    }

    #[test]
    fn heavy_rescheduling_keeps_heap_bounded() {
        let idx = index();
        let now = Utc::now();
        for i in 0..1_000 {
            idx.schedule(&job("a", Some(now + Duration::seconds(i)))).unwrap();
        }
        let heap_len = idx.state.lock().unwrap().heap.len();
        assert!(heap_len <= 2 + 64 + 1, "heap grew to {heap_len}");
        assert_eq!(idx.next_due(), Some(now + Duration::seconds(999)));
    }

    #[test]
    fn clear_cancels_everything() {
        let idx = index();
        let now = Utc::now();
        idx.schedule(&job("a", Some(now))).unwrap();
        idx.schedule(&job("b", Some(now))).unwrap();
        assert_eq!(idx.clear(), 2);
        assert!(idx.is_empty());
        assert_eq!(idx.next_due(), None);
    }
}
