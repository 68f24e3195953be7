use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::dispatcher::{AttemptOutcome, Dispatcher};
use crate::error::{Result, SchedulerError};
use crate::guard::ExecutionGuard;
use crate::index::DueIndex;
use crate::schedule::Calculator;
use crate::store::JobStore;
use crate::types::{Job, JobStatus, NewJob};

/// Job management entry point for the layer that owns create/pause/resume.
///
/// Schedule strings are validated here, synchronously, so a bad expression
/// is rejected to the caller instead of surfacing later in the engine.
/// Cloning is cheap; every clone drives the same engine.
#[derive(Clone)]
pub struct SchedulerHandle {
    store: Arc<dyn JobStore>,
    index: DueIndex,
    guard: ExecutionGuard,
    dispatcher: Arc<Dispatcher>,
    calculator: Calculator,
}

impl SchedulerHandle {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        index: DueIndex,
        guard: ExecutionGuard,
        dispatcher: Arc<Dispatcher>,
        calculator: Calculator,
    ) -> Self {
        Self {
            store,
            index,
            guard,
            dispatcher,
            calculator,
        }
    }

    /// Validate, persist and schedule a new job.
    pub async fn create(&self, req: NewJob) -> Result<Job> {
        let due = self.calculator.next_run(&req.schedule, Utc::now())?;
        let job = self.store.save(&Job::from_request(req, due)).await?;
        self.index.schedule(&job)?;
        info!(job_id = %job.id, name = %job.name, next_due_at = %due, "job created");
        Ok(job)
    }

    pub async fn get(&self, id: &str) -> Result<Job> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        self.store.list().await
    }

    /// Stop scheduling the job. A run already in progress finishes normally.
    pub async fn pause(&self, id: &str) -> Result<Job> {
        let mut job = self.get(id).await?;
        match job.status {
            JobStatus::Paused => return Ok(job),
            JobStatus::Active => {}
            other => {
                return Err(SchedulerError::InvalidState(format!(
                    "cannot pause a {other} job"
                )))
            }
        }

        self.index.unschedule(id);
        job.status = JobStatus::Paused;
        job.next_due_at = None;
        job.updated_at = Utc::now();
        let job = self.store.save(&job).await?;
        info!(job_id = %id, "job paused");
        Ok(job)
    }

    /// Re-activate a paused or failed job, due one period from now.
    ///
    /// A job retired by the failure limit comes back with its failure count
    /// reset, so it gets the full allowance again. `last_error` is kept.
    pub async fn resume(&self, id: &str) -> Result<Job> {
        let mut job = self.get(id).await?;
        match job.status {
            JobStatus::Paused => {}
            JobStatus::Failed => job.failure_count = 0,
            JobStatus::Active => {
                // Make sure it is armed; harmless if it already is.
                if !self.index.contains(id) && !self.guard.contains(id) {
                    self.index.schedule(&job)?;
                }
                return Ok(job);
            }
            JobStatus::Completed => {
                return Err(SchedulerError::InvalidState(
                    "cannot resume a completed job".to_string(),
                ))
            }
        }

        let now = Utc::now();
        job.next_due_at = Some(self.calculator.next_run(&job.schedule, now)?);
        job.status = JobStatus::Active;
        job.updated_at = now;
        let job = self.store.save(&job).await?;
        self.index.schedule(&job)?;
        info!(job_id = %id, next_due_at = ?job.next_due_at, "job resumed");
        Ok(job)
    }

    /// Replace the job's schedule. Active jobs are re-armed on the new one.
    pub async fn update_schedule(&self, id: &str, schedule: &str) -> Result<Job> {
        let now = Utc::now();
        let due = self.calculator.next_run(schedule, now)?;
        let mut job = self.get(id).await?;

        self.index.unschedule(id);
        job.schedule = schedule.to_string();
        job.next_due_at = job.is_active().then_some(due);
        job.updated_at = now;
        let job = self.store.save(&job).await?;
        self.index.schedule(&job)?;
        info!(job_id = %id, schedule, "job schedule updated");
        Ok(job)
    }

    /// Unschedule and remove the job from the store.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.index.unschedule(id);
        self.store.delete(id).await?;
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Run the job now, outside its schedule. Subject to the execution guard.
    pub async fn run_now(&self, id: &str) -> Result<AttemptOutcome> {
        self.get(id).await?;
        self.dispatcher.dispatch(id).await
    }

    /// When the job is next due, if it is currently armed.
    pub fn scheduled_at(&self, id: &str) -> Option<DateTime<Utc>> {
        self.index.due_at(id)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.guard.contains(id)
    }
}
