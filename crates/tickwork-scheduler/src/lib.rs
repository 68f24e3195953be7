//! `tickwork-scheduler`: recurring job engine with SQLite persistence.
//!
//! # Overview
//!
//! Jobs live in a [`JobStore`]; the engine keeps only an in-memory
//! [`DueIndex`] of when each active job is next due. A single coordinator
//! task sleeps until the earliest due time (never longer than the sweep
//! interval), claims due jobs through the [`ExecutionGuard`] and hands them
//! to the [`Dispatcher`] in batches of at most `max_concurrency`.
//!
//! # Schedules
//!
//! | Form             | Example         | Next due time                          |
//! |------------------|-----------------|----------------------------------------|
//! | `PT` interval    | `PT1H30M`       | reference time + interval              |
//! | 5-field cron     | `*/5 9-17 * * 1-5` | first matching minute after reference |
//!
//! # Failure handling
//!
//! A failed execution bumps `failure_count`, records `last_error`, and
//! re-arms the job after `min(2^failure_count, 60)` minutes.

pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod guard;
pub mod handle;
pub mod index;
pub mod reconciler;
pub mod schedule;
pub mod store;
pub mod types;

pub use db::SqliteJobStore;
pub use dispatcher::{backoff_delay, AttemptOutcome, Dispatcher, JobExecutor};
pub use engine::SchedulerEngine;
pub use error::{Result, SchedulerError};
pub use guard::ExecutionGuard;
pub use handle::SchedulerHandle;
pub use index::DueIndex;
pub use reconciler::{ReconcileReport, Reconciler};
pub use schedule::{next_run, Calculator, Schedule};
pub use store::JobStore;
pub use types::{Job, JobStatus, NewJob};
