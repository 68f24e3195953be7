use async_trait::async_trait;

use crate::error::Result;
use crate::types::Job;

/// Durable job storage, the single source of truth across restarts.
///
/// The engine only ever holds projections of rows it has read through this
/// trait, and writes every state change back before acting on the job again.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// All jobs whose status is `active`.
    async fn load_active(&self) -> Result<Vec<Job>>;

    /// Upsert `job` and return the stored row. Safe to repeat.
    async fn save(&self, job: &Job) -> Result<Job>;

    /// Upsert several jobs atomically.
    async fn save_all(&self, jobs: &[Job]) -> Result<()>;

    /// Persist the outcome of one execution attempt.
    ///
    /// `run_count`, `failure_count`, `last_run_at` and `last_error` are always
    /// written. `status` and `next_due_at` are written only while the stored
    /// row is still active with the same schedule as `job`. Returns whether
    /// that second write applied; `false` means the job was paused, retired,
    /// rescheduled or deleted in the meantime and must not be re-armed.
    async fn record_attempt(&self, job: &Job) -> Result<bool>;

    async fn find_by_id(&self, id: &str) -> Result<Option<Job>>;

    /// All jobs, oldest first.
    async fn list(&self) -> Result<Vec<Job>>;

    /// Delete by id. Returns `JobNotFound` if no row matched.
    async fn delete(&self, id: &str) -> Result<()>;
}
