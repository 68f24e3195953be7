//! Startup and shutdown passes that sync the due-time index with the store.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::index::DueIndex;
use crate::schedule::{Calculator, Schedule};
use crate::store::JobStore;
use crate::types::Job;

/// Counts from one startup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Active jobs read from the store.
    pub loaded: usize,
    /// Jobs that had no due time and were given one.
    pub repaired: usize,
    pub scheduled: usize,
    /// Jobs left out because their schedule is unusable.
    pub skipped: usize,
}

pub struct Reconciler {
    store: Arc<dyn JobStore>,
    index: DueIndex,
    calculator: Calculator,
}

impl Reconciler {
    pub fn new(store: Arc<dyn JobStore>, index: DueIndex, calculator: Calculator) -> Self {
        Self {
            store,
            index,
            calculator,
        }
    }

    /// Load every active job, fill in missing due times (persisted in one
    /// batch), then arm them all.
    ///
    /// Only a failure to read the store is an error. Jobs with unusable
    /// schedules are skipped with a warning.
    pub async fn startup(&self) -> Result<ReconcileReport> {
        let jobs = self.store.load_active().await?;
        let mut report = ReconcileReport {
            loaded: jobs.len(),
            ..ReconcileReport::default()
        };

        let now = Utc::now();
        let mut ready: Vec<Job> = Vec::with_capacity(jobs.len());
        let mut repaired: Vec<Job> = Vec::new();

        for mut job in jobs {
            if let Err(e) = Schedule::parse(&job.schedule) {
                warn!(job_id = %job.id, schedule = %job.schedule, "skipping job with unusable schedule: {e}");
                report.skipped += 1;
                continue;
            }
            if job.next_due_at.is_some() {
                ready.push(job);
                continue;
            }
            match self.calculator.next_run(&job.schedule, now) {
                Ok(due) => {
                    job.next_due_at = Some(due);
                    job.updated_at = now;
                    repaired.push(job);
                }
                Err(e) => {
                    warn!(job_id = %job.id, schedule = %job.schedule, "skipping job with no computable due time: {e}");
                    report.skipped += 1;
                }
            }
        }

        report.repaired = repaired.len();
        if !repaired.is_empty() {
            if let Err(e) = self.store.save_all(&repaired).await {
                // Due times are recomputed on the next start; the dispatcher
                // re-reads each job from the store before running it.
                error!(count = repaired.len(), "failed to persist repaired due times: {e}");
            }
        }
        ready.append(&mut repaired);

        for job in &ready {
            match self.index.schedule(job) {
                Ok(Some(_)) => report.scheduled += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(job_id = %job.id, "skipping job that could not be scheduled: {e}");
                    report.skipped += 1;
                }
            }
        }

        info!(
            loaded = report.loaded,
            repaired = report.repaired,
            scheduled = report.scheduled,
            skipped = report.skipped,
            "reconciled active jobs"
        );
        Ok(report)
    }

    /// Cancel every armed entry. Returns how many were cancelled.
    pub fn shutdown(&self) -> usize {
        let cancelled = self.index.clear();
        info!(cancelled, "due-time index cleared");
        cancelled
    }
}
