use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The schedule string is neither a valid cron expression nor a `PT` interval.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The cron expression matched no minute inside the search horizon.
    #[error("No feasible run for schedule: {0}")]
    NoFeasibleRun(String),

    /// Duplicate dispatch suppressed; only ever logged.
    #[error("Job already executing: {id}")]
    AlreadyExecuting { id: String },

    /// The job executor reported a failure.
    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// A persisted row or store backend could not be used.
    #[error("Store error: {0}")]
    Store(String),

    /// Engine settings rejected at startup.
    #[error(transparent)]
    Config(#[from] tickwork_core::TickworkError),

    /// The requested transition is not valid for the job's current status.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl SchedulerError {
    /// `InvalidSchedule` and `NoFeasibleRun` are handled identically by callers.
    pub fn is_schedule_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidSchedule(_) | SchedulerError::NoFeasibleRun(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
