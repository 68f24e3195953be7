use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a job. Only `Active` jobs are scheduled or executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible for scheduling; carries a `next_due_at`.
    Active,
    /// Held by an external request; keeps its counters but never fires.
    Paused,
    /// Reached its `max_runs` limit.
    Completed,
    /// Reached the configured failure limit.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Active => "active",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(JobStatus::Active),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// UUID v4 string, primary key.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    /// Executor routing key (`email`, `report`, ...).
    pub kind: String,
    /// Opaque JSON payload forwarded to the executor.
    pub payload: String,
    /// Cron expression (`m h dom mon dow`) or `PT..` interval, stored verbatim.
    pub schedule: String,
    pub status: JobStatus,
    /// Next planned execution; always set while the job is scheduled.
    pub next_due_at: Option<DateTime<Utc>>,
    /// Start of the most recent execution attempt.
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: u32,
    pub failure_count: u32,
    /// Message from the most recent failure; cleared on success.
    pub last_error: Option<String>,
    /// If set, the job is marked Completed after this many runs.
    pub max_runs: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh Active job from a creation request.
    ///
    /// `next_due_at` must come from a successful next-run calculation, which
    /// is what validates the schedule.
    pub fn from_request(req: NewJob, next_due_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: req.name,
            kind: req.kind,
            payload: req.payload,
            schedule: req.schedule,
            status: JobStatus::Active,
            next_due_at: Some(next_due_at),
            last_run_at: None,
            run_count: 0,
            failure_count: 0,
            last_error: None,
            max_runs: req.max_runs,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == JobStatus::Active
    }
}

/// Creation request for a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub kind: String,
    pub schedule: String,
    #[serde(default = "empty_payload")]
    pub payload: String,
    #[serde(default)]
    pub max_runs: Option<u32>,
}

impl NewJob {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, schedule: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            schedule: schedule.into(),
            payload: empty_payload(),
            max_runs: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }
}

fn empty_payload() -> String {
    "{}".to_string()
}
