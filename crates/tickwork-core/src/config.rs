use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TickworkError};

pub const DEFAULT_MAX_CONCURRENCY: usize = 10;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_MAX_BACKOFF_MINUTES: u32 = 60;

/// Top-level config (tickwork.toml + TICKWORK_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickworkConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Tuning knobs for the scheduling engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of executions in flight at once (batch width).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Upper bound on how long the coordinator sleeps between due-time checks.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Cap applied to the exponential failure backoff.
    #[serde(default = "default_max_backoff_minutes")]
    pub max_backoff_minutes: u32,
    /// Retire a job as `failed` once its failure count reaches this value.
    /// Unset means jobs retry on backoff forever.
    #[serde(default)]
    pub max_failures: Option<u32>,
    /// Calendar used when matching cron fields.
    #[serde(default)]
    pub timezone: ScheduleTimezone,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            max_backoff_minutes: DEFAULT_MAX_BACKOFF_MINUTES,
            max_failures: None,
            timezone: ScheduleTimezone::default(),
        }
    }
}

impl SchedulerConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(TickworkError::Config(
                "scheduler.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.sweep_interval_secs == 0 {
            return Err(TickworkError::Config(
                "scheduler.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.max_backoff_minutes == 0 {
            return Err(TickworkError::Config(
                "scheduler.max_backoff_minutes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Time zone whose calendar fields cron expressions are matched against.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleTimezone {
    #[default]
    Utc,
    /// The host's local zone. Matching may shift across DST transitions.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}
fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}
fn default_max_backoff_minutes() -> u32 {
    DEFAULT_MAX_BACKOFF_MINUTES
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tickwork/tickwork.db", home)
}

impl TickworkConfig {
    /// Load config from a TOML file with TICKWORK_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `TICKWORK_SCHEDULER__MAX_CONCURRENCY=4`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.tickwork/tickwork.toml
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(path = %path, "loading config");

        let config: TickworkConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("TICKWORK_").split("__"))
            .extract()
            .map_err(|e| TickworkError::Config(e.to_string()))?;

        config.scheduler.validate()?;
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.tickwork/tickwork.toml", home)
}
