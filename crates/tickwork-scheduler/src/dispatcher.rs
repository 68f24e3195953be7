//! Dispatcher: runs due jobs in bounded batches and reschedules them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use tickwork_core::SchedulerConfig;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::guard::{ExecutionGuard, GuardSlot};
use crate::index::{Claimed, DueIndex};
use crate::schedule::Calculator;
use crate::store::JobStore;
use crate::types::{Job, JobStatus};

/// Exponent ceiling for the backoff power; 2^32 minutes is far past any cap.
const MAX_BACKOFF_EXPONENT: u32 = 32;

/// Delay before retrying a job whose attempt could not start (store outage,
/// panicked executor).
const RETRY_DELAY_MINUTES: i64 = 1;

/// Per-type business logic behind a job.
///
/// Implementations may be slow; they must not change the job's status.
/// Returning `Err` counts as a failed execution; the message of an
/// [`SchedulerError::ExecutionFailure`] is recorded verbatim.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<()>;
}

/// What a single execution attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The job was gone or no longer active; nothing ran.
    Skipped,
    /// The job could not be loaded; retried at `retry_at`.
    Deferred { retry_at: DateTime<Utc> },
    Succeeded { next_due_at: Option<DateTime<Utc>> },
    Failed { next_due_at: Option<DateTime<Utc>> },
}

/// `min(2^failure_count, max_minutes)` minutes.
///
/// The exponent is clamped before the power is taken so very large failure
/// counts cannot overflow.
pub fn backoff_delay(failure_count: u32, max_minutes: u32) -> Duration {
    let exponent = failure_count.min(MAX_BACKOFF_EXPONENT);
    let minutes = (1u64 << exponent).min(u64::from(max_minutes));
    Duration::minutes(minutes as i64)
}

/// Executes due jobs, at most `max_concurrency` at a time.
///
/// The limit is enforced by one semaphore shared by coordinator batches and
/// on-demand runs alike.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn JobExecutor>,
    index: DueIndex,
    guard: ExecutionGuard,
    calculator: Calculator,
    max_concurrency: usize,
    max_backoff_minutes: u32,
    max_failures: Option<u32>,
    permits: Semaphore,
}

impl Dispatcher {
    pub fn new(
        config: &SchedulerConfig,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn JobExecutor>,
        index: DueIndex,
        guard: ExecutionGuard,
    ) -> Self {
        let max_concurrency = config.max_concurrency.max(1);
        Self {
            store,
            executor,
            index,
            guard,
            calculator: Calculator::new(config.timezone),
            max_concurrency,
            max_backoff_minutes: config.max_backoff_minutes,
            max_failures: config.max_failures,
            permits: Semaphore::new(max_concurrency),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Wait for every in-flight attempt to finish, then refuse new ones.
    ///
    /// Attempts still queued for a permit when this returns are dropped
    /// without running. Safe to call more than once.
    pub async fn close(&self) {
        let all = u32::try_from(self.max_concurrency).unwrap_or(u32::MAX);
        if let Ok(permits) = self.permits.acquire_many(all).await {
            self.permits.close();
            drop(permits);
            debug!("dispatcher closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Execute one claimed batch in parallel and wait for every attempt.
    ///
    /// Each attempt runs in its own task so a panicking executor cannot take
    /// the batch down; its guard slot is released during unwinding and the
    /// job is re-armed for a later retry.
    pub async fn run_batch(self: &Arc<Self>, batch: Vec<Claimed>) {
        if batch.is_empty() {
            return;
        }
        debug!(size = batch.len(), "dispatching batch");

        let mut ids = Vec::with_capacity(batch.len());
        let mut tasks = Vec::with_capacity(batch.len());
        for claimed in batch {
            ids.push(claimed.job_id().to_string());
            let this = Arc::clone(self);
            tasks.push(tokio::spawn(async move { this.attempt(claimed.slot).await }));
        }

        for (id, result) in ids.into_iter().zip(join_all(tasks).await) {
            if let Err(e) = result {
                error!(job_id = %id, "execution task aborted: {e}");
                self.index
                    .schedule_at(&id, Utc::now() + Duration::minutes(RETRY_DELAY_MINUTES));
            }
        }
    }

    /// Claim `id` and run one attempt immediately, regardless of its due time.
    ///
    /// Returns `AlreadyExecuting` if another attempt holds the job.
    pub async fn dispatch(&self, id: &str) -> Result<AttemptOutcome> {
        if self.is_closed() {
            return Err(SchedulerError::InvalidState(
                "scheduler is shut down".to_string(),
            ));
        }
        let Some(slot) = self.guard.try_enter(id) else {
            debug!(job_id = %id, "already executing, duplicate dispatch suppressed");
            return Err(SchedulerError::AlreadyExecuting { id: id.to_string() });
        };
        self.index.unschedule(id);
        Ok(self.attempt(slot).await)
    }

    /// One execution attempt. The slot is released as the very last step.
    ///
    /// Waits for a concurrency permit first; the permit is held until the
    /// job has been re-armed.
    pub async fn attempt(&self, slot: GuardSlot) -> AttemptOutcome {
        let id = slot.job_id().to_string();
        let Ok(_permit) = self.permits.acquire().await else {
            debug!(job_id = %id, "dispatcher closed, attempt dropped");
            return AttemptOutcome::Skipped;
        };

        let mut job = match self.store.find_by_id(&id).await {
            Ok(Some(job)) if job.is_active() => job,
            Ok(Some(job)) => {
                debug!(job_id = %id, status = %job.status, "job no longer active, attempt skipped");
                return AttemptOutcome::Skipped;
            }
            Ok(None) => {
                debug!(job_id = %id, "job no longer exists, attempt skipped");
                return AttemptOutcome::Skipped;
            }
            Err(e) => {
                error!(job_id = %id, "failed to load job before execution: {e}");
                let retry_at = Utc::now() + Duration::minutes(RETRY_DELAY_MINUTES);
                self.index.schedule_at(&id, retry_at);
                return AttemptOutcome::Deferred { retry_at };
            }
        };

        job.run_count = job.run_count.saturating_add(1);
        job.last_run_at = Some(Utc::now());
        info!(job_id = %id, kind = %job.kind, run = job.run_count, "executing job");

        let result = self.executor.execute(&job).await;
        let now = Utc::now();

        // Pick up pause/delete/schedule edits made while the job was running.
        let still_exists = match self.store.find_by_id(&id).await {
            Ok(Some(current)) => {
                absorb_external_changes(&mut job, current);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(job_id = %id, "could not re-read job after execution: {e}");
                true
            }
        };

        let outcome = match result {
            Ok(()) => self.record_success(&mut job, now),
            Err(e) => self.record_failure(&mut job, now, failure_message(e)),
        };
        job.updated_at = now;

        if !still_exists {
            info!(job_id = %id, "job deleted during execution, result discarded");
            drop(slot);
            return outcome;
        }

        // Status and due time only land if nobody paused, deleted or
        // rescheduled the job since it was re-read above.
        let owns_schedule = match self.store.record_attempt(&job).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(job_id = %id, "job changed during execution, not re-armed");
                false
            }
            Err(e) => {
                error!(job_id = %id, "failed to persist execution result: {e}");
                true
            }
        };

        if owns_schedule && job.is_active() && job.next_due_at.is_some() {
            if let Err(e) = self.index.schedule(&job) {
                warn!(job_id = %id, "could not reschedule job: {e}");
            }
        }

        drop(slot);
        outcome
    }

    fn record_success(&self, job: &mut Job, now: DateTime<Utc>) -> AttemptOutcome {
        job.last_error = None;

        if job.is_active() && job.max_runs.is_some_and(|max| job.run_count >= max) {
            job.status = JobStatus::Completed;
            job.next_due_at = None;
            info!(job_id = %job.id, runs = job.run_count, "job reached max runs, completed");
            return AttemptOutcome::Succeeded { next_due_at: None };
        }

        job.next_due_at = if job.is_active() {
            match self.calculator.next_run(&job.schedule, now) {
                Ok(due) => Some(due),
                Err(e) => {
                    warn!(job_id = %job.id, "cannot compute next run, job left unscheduled: {e}");
                    job.last_error = Some(e.to_string());
                    None
                }
            }
        } else {
            None
        };

        info!(job_id = %job.id, next_due_at = ?job.next_due_at, "job succeeded");
        AttemptOutcome::Succeeded {
            next_due_at: job.next_due_at,
        }
    }

    fn record_failure(&self, job: &mut Job, now: DateTime<Utc>, message: String) -> AttemptOutcome {
        job.failure_count = job.failure_count.saturating_add(1);
        job.last_error = Some(message);

        if job.is_active() && self.max_failures.is_some_and(|max| job.failure_count >= max) {
            job.status = JobStatus::Failed;
            job.next_due_at = None;
            warn!(job_id = %job.id, failures = job.failure_count, "job reached failure limit, retired");
            return AttemptOutcome::Failed { next_due_at: None };
        }

        let delay = backoff_delay(job.failure_count, self.max_backoff_minutes);
        job.next_due_at = job.is_active().then(|| now + delay);
        warn!(
            job_id = %job.id,
            failures = job.failure_count,
            backoff_minutes = delay.num_minutes(),
            error = job.last_error.as_deref().unwrap_or_default(),
            "job failed"
        );
        AttemptOutcome::Failed {
            next_due_at: job.next_due_at,
        }
    }
}

/// Fields owned by the management layer win over our in-flight copy.
fn absorb_external_changes(job: &mut Job, current: Job) {
    job.name = current.name;
    job.kind = current.kind;
    job.payload = current.payload;
    job.schedule = current.schedule;
    job.status = current.status;
    job.max_runs = current.max_runs;
}

fn failure_message(err: SchedulerError) -> String {
    match err {
        SchedulerError::ExecutionFailure(msg) => msg,
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteJobStore;
    use crate::store::JobStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Counts calls and fails when the payload asks it to.
    #[derive(Default)]
    struct Recorder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobExecutor for Recorder {
        async fn execute(&self, job: &Job) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if job.payload.contains("fail") {
                return Err(SchedulerError::ExecutionFailure("boom".to_string()));
            }
            Ok(())
        }
    }

    /// Blocks until released, so tests can observe a job mid-execution.
    struct Gate {
        entered: Notify,
        release: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobExecutor for Gate {
        async fn execute(&self, _job: &Job) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    /// Tracks the highest number of executions observed at once.
    #[derive(Default)]
    struct PeakTracker {
        current: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobExecutor for PeakTracker {
        async fn execute(&self, _job: &Job) -> Result<()> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Pauses the row right after the dispatcher's post-execution re-read.
    struct PauseAfterReread {
        inner: SqliteJobStore,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl JobStore for PauseAfterReread {
        async fn load_active(&self) -> Result<Vec<Job>> {
            self.inner.load_active().await
        }
        async fn save(&self, job: &Job) -> Result<Job> {
            self.inner.save(job).await
        }
        async fn save_all(&self, jobs: &[Job]) -> Result<()> {
            self.inner.save_all(jobs).await
        }
        async fn record_attempt(&self, job: &Job) -> Result<bool> {
            self.inner.record_attempt(job).await
        }
        async fn find_by_id(&self, id: &str) -> Result<Option<Job>> {
            let found = self.inner.find_by_id(id).await?;
            if self.reads.fetch_add(1, Ordering::SeqCst) == 1 {
                if let Some(mut paused) = found.clone() {
                    paused.status = JobStatus::Paused;
                    paused.next_due_at = None;
                    self.inner.save(&paused).await?;
                }
            }
            Ok(found)
        }
        async fn list(&self) -> Result<Vec<Job>> {
            self.inner.list().await
        }
        async fn delete(&self, id: &str) -> Result<()> {
            self.inner.delete(id).await
        }
    }

    fn job(id: &str, schedule: &str, payload: &str) -> Job {
        let now = Utc::now();
        Job {
            id: id.to_string(),
            name: id.to_string(),
            kind: "test".to_string(),
            payload: payload.to_string(),
            schedule: schedule.to_string(),
            status: JobStatus::Active,
            next_due_at: Some(now),
            last_run_at: None,
            run_count: 0,
            failure_count: 0,
            last_error: None,
            max_runs: None,
            created_at: now,
            updated_at: now,
        }
    }

    struct Fixture {
        store: Arc<SqliteJobStore>,
        index: DueIndex,
        guard: ExecutionGuard,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture(config: SchedulerConfig, executor: Arc<dyn JobExecutor>) -> Fixture {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let index = DueIndex::new(Calculator::default());
        let guard = ExecutionGuard::new();
        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            store.clone(),
            executor,
            index.clone(),
            guard.clone(),
        ));
        Fixture {
            store,
            index,
            guard,
            dispatcher,
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(1, 60), Duration::minutes(2));
        assert_eq!(backoff_delay(3, 60), Duration::minutes(8));
        assert_eq!(backoff_delay(5, 60), Duration::minutes(32));
        assert_eq!(backoff_delay(6, 60), Duration::minutes(60));
        assert_eq!(backoff_delay(10, 60), Duration::minutes(60));
        assert_eq!(backoff_delay(u32::MAX, 60), Duration::minutes(60));
        assert_eq!(backoff_delay(u32::MAX, u32::MAX), Duration::minutes(1 << 32));
    }

    #[tokio::test]
    async fn success_updates_counters_and_reschedules() {
        let exec = Arc::new(Recorder::default());
        let fx = fixture(SchedulerConfig::default(), exec.clone());
        let mut j = job("a", "PT5M", "{}");
        j.last_error = Some("old".to_string());
        fx.store.save(&j).await.unwrap();

        let before = Utc::now();
        let outcome = fx.dispatcher.dispatch("a").await.unwrap();
        let AttemptOutcome::Succeeded { next_due_at: Some(due) } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(due >= before + Duration::minutes(5));

        let stored = fx.store.find_by_id("a").await.unwrap().unwrap();
        assert_eq!(stored.run_count, 1);
        assert_eq!(stored.failure_count, 0);
        assert!(stored.last_error.is_none());
        assert!(stored.last_run_at.is_some());
        assert_eq!(stored.next_due_at, Some(due));
        assert_eq!(fx.index.due_at("a"), Some(due));
        assert!(fx.guard.is_empty());
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_applies_exponential_backoff() {
        let fx = fixture(SchedulerConfig::default(), Arc::new(Recorder::default()));
        let mut j = job("a", "PT1M", r#"{"fail":true}"#);
        j.failure_count = 2;
        fx.store.save(&j).await.unwrap();

        let before = Utc::now();
        let outcome = fx.dispatcher.dispatch("a").await.unwrap();
        let after = Utc::now();
        let AttemptOutcome::Failed { next_due_at: Some(due) } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        // failure_count is now 3 → 8 minutes
        assert!(due >= before + Duration::minutes(8));
        assert!(due <= after + Duration::minutes(8));

        let stored = fx.store.find_by_id("a").await.unwrap().unwrap();
        assert_eq!(stored.failure_count, 3);
        assert_eq!(stored.run_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert_eq!(stored.status, JobStatus::Active);
        assert_eq!(fx.index.due_at("a"), Some(due));
    }

    #[tokio::test]
    async fn backoff_is_capped_at_configured_maximum() {
        let fx = fixture(SchedulerConfig::default(), Arc::new(Recorder::default()));
        let mut j = job("a", "PT1M", "fail");
        j.failure_count = 9;
        fx.store.save(&j).await.unwrap();

        let before = Utc::now();
        let outcome = fx.dispatcher.dispatch("a").await.unwrap();
        let after = Utc::now();
        let AttemptOutcome::Failed { next_due_at: Some(due) } = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert!(due >= before + Duration::minutes(60));
        assert!(due <= after + Duration::minutes(60));
    }

    #[tokio::test]
    async fn inactive_job_is_not_executed() {
        let exec = Arc::new(Recorder::default());
        let fx = fixture(SchedulerConfig::default(), exec.clone());
        let mut j = job("a", "PT1M", "{}");
        j.status = JobStatus::Paused;
        fx.store.save(&j).await.unwrap();

        assert_eq!(fx.dispatcher.dispatch("a").await.unwrap(), AttemptOutcome::Skipped);
        assert_eq!(fx.dispatcher.dispatch("gone").await.unwrap(), AttemptOutcome::Skipped);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
        assert!(fx.guard.is_empty());
        assert!(!fx.index.contains("a"));
    }

    #[tokio::test]
    async fn concurrent_dispatch_runs_once() {
        let gate = Arc::new(Gate {
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let fx = fixture(SchedulerConfig::default(), gate.clone());
        fx.store.save(&job("a", "PT1M", "{}")).await.unwrap();

        let first = {
            let d = fx.dispatcher.clone();
            tokio::spawn(async move { d.dispatch("a").await })
        };
        gate.entered.notified().await;

        let second = fx.dispatcher.dispatch("a").await;
        assert!(matches!(second, Err(SchedulerError::AlreadyExecuting { .. })));

        gate.release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, AttemptOutcome::Succeeded { .. }));
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
        assert!(fx.guard.is_empty());
    }

    #[tokio::test]
    async fn max_runs_completes_the_job() {
        let fx = fixture(SchedulerConfig::default(), Arc::new(Recorder::default()));
        let mut j = job("a", "PT1M", "{}");
        j.max_runs = Some(2);
        j.run_count = 1;
        fx.store.save(&j).await.unwrap();

        let outcome = fx.dispatcher.dispatch("a").await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Succeeded { next_due_at: None });

        let stored = fx.store.find_by_id("a").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.run_count, 2);
        assert!(stored.next_due_at.is_none());
        assert!(!fx.index.contains("a"));
    }

    #[tokio::test]
    async fn failure_limit_retires_the_job() {
        let config = SchedulerConfig {
            max_failures: Some(3),
            ..SchedulerConfig::default()
        };
        let fx = fixture(config, Arc::new(Recorder::default()));
        let mut j = job("a", "PT1M", "fail");
        j.failure_count = 2;
        fx.store.save(&j).await.unwrap();

        let outcome = fx.dispatcher.dispatch("a").await.unwrap();
        assert_eq!(outcome, AttemptOutcome::Failed { next_due_at: None });

        let stored = fx.store.find_by_id("a").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(!fx.index.contains("a"));
    }

    #[tokio::test]
    async fn pause_during_execution_is_respected() {
        let gate = Arc::new(Gate {
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let fx = fixture(SchedulerConfig::default(), gate.clone());
        fx.store.save(&job("a", "PT1M", "{}")).await.unwrap();

        let running = {
            let d = fx.dispatcher.clone();
            tokio::spawn(async move { d.dispatch("a").await })
        };
        gate.entered.notified().await;

        let mut paused = fx.store.find_by_id("a").await.unwrap().unwrap();
        paused.status = JobStatus::Paused;
        fx.store.save(&paused).await.unwrap();

        gate.release.notify_one();
        running.await.unwrap().unwrap();

        let stored = fx.store.find_by_id("a").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Paused);
        assert_eq!(stored.run_count, 1);
        assert!(!fx.index.contains("a"));
    }

    #[tokio::test]
    async fn batch_runs_all_claimed_jobs() {
        let exec = Arc::new(Recorder::default());
        let fx = fixture(SchedulerConfig::default(), exec.clone());
        for id in ["a", "b", "c"] {
            let j = job(id, "PT1M", "{}");
            fx.store.save(&j).await.unwrap();
            fx.index.schedule(&j).unwrap();
        }

        let batch = fx.index.claim_due(Utc::now(), &fx.guard, 10);
        assert_eq!(batch.len(), 3);
        fx.dispatcher.run_batch(batch).await;

        assert_eq!(exec.calls.load(Ordering::SeqCst), 3);
        assert!(fx.guard.is_empty());
        assert_eq!(fx.index.len(), 3);
    }

    #[tokio::test]
    async fn on_demand_runs_share_the_concurrency_limit() {
        let config = SchedulerConfig {
            max_concurrency: 1,
            ..SchedulerConfig::default()
        };
        let exec = Arc::new(PeakTracker::default());
        let fx = fixture(config, exec.clone());
        let ids = ["a", "b", "c", "d"];
        for id in ids {
            fx.store.save(&job(id, "PT1H", "{}")).await.unwrap();
        }

        let runs = ids.map(|id| {
            let d = fx.dispatcher.clone();
            tokio::spawn(async move { d.dispatch(id).await })
        });
        for run in join_all(runs).await {
            assert!(matches!(run.unwrap(), Ok(AttemptOutcome::Succeeded { .. })));
        }

        assert_eq!(exec.calls.load(Ordering::SeqCst), 4);
        assert_eq!(exec.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pause_after_reread_is_not_overwritten() {
        let store = Arc::new(PauseAfterReread {
            inner: SqliteJobStore::in_memory().unwrap(),
            reads: AtomicUsize::new(0),
        });
        let index = DueIndex::new(Calculator::default());
        let dispatcher = Dispatcher::new(
            &SchedulerConfig::default(),
            store.clone(),
            Arc::new(Recorder::default()),
            index.clone(),
            ExecutionGuard::new(),
        );
        store.inner.save(&job("a", "PT1M", "{}")).await.unwrap();

        let outcome = dispatcher.dispatch("a").await.unwrap();
        assert!(matches!(outcome, AttemptOutcome::Succeeded { .. }));

        let stored = store.inner.find_by_id("a").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Paused);
        assert!(stored.next_due_at.is_none());
        assert_eq!(stored.run_count, 1);
        assert!(!index.contains("a"));
    }

    #[tokio::test]
    async fn close_waits_for_in_flight_attempts() {
        let gate = Arc::new(Gate {
            entered: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let fx = fixture(SchedulerConfig::default(), gate.clone());
        fx.store.save(&job("a", "PT1M", "{}")).await.unwrap();

        let running = {
            let d = fx.dispatcher.clone();
            tokio::spawn(async move { d.dispatch("a").await })
        };
        gate.entered.notified().await;

        let closing = {
            let d = fx.dispatcher.clone();
            tokio::spawn(async move { d.close().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!closing.is_finished());

        gate.release.notify_one();
        closing.await.unwrap();
        running.await.unwrap().unwrap();
        assert!(fx.index.contains("a"));

        assert!(fx.dispatcher.is_closed());
        let late = fx.dispatcher.dispatch("a").await;
        assert!(matches!(late, Err(SchedulerError::InvalidState(_))));
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);
    }
}
