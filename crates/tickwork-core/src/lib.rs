//! `tickwork-core`: configuration and process-level errors shared by the
//! scheduler library and the daemon binary.

pub mod config;
pub mod error;

pub use config::{DatabaseConfig, ScheduleTimezone, SchedulerConfig, TickworkConfig};
pub use error::{Result, TickworkError};
