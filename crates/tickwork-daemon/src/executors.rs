use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tickwork_scheduler::{Job, JobExecutor, Result, SchedulerError};
use tracing::info;

/// Routes each job to the executor registered for its `kind`.
pub struct ExecutorRouter {
    executors: HashMap<String, Arc<dyn JobExecutor>>,
}

impl ExecutorRouter {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Router with the built-in `email`, `compute` and `report` executors.
    pub fn with_builtins() -> Self {
        let mut router = Self::new();
        for (kind, detail_key) in [("email", "to"), ("compute", "task"), ("report", "report")] {
            router.register(kind, Arc::new(StubExecutor { kind, detail_key }));
        }
        router
    }

    pub fn register(&mut self, kind: impl Into<String>, executor: Arc<dyn JobExecutor>) {
        self.executors.insert(kind.into(), executor);
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for ExecutorRouter {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[async_trait]
impl JobExecutor for ExecutorRouter {
    async fn execute(&self, job: &Job) -> Result<()> {
        match self.executors.get(&job.kind) {
            Some(executor) => executor.execute(job).await,
            None => Err(SchedulerError::ExecutionFailure(format!(
                "no executor registered for kind '{}'",
                job.kind
            ))),
        }
    }
}

/// Logs the job and succeeds, unless the payload carries `"fail": true`.
struct StubExecutor {
    kind: &'static str,
    /// Payload field echoed into the log line.
    detail_key: &'static str,
}

#[async_trait]
impl JobExecutor for StubExecutor {
    async fn execute(&self, job: &Job) -> Result<()> {
        let payload: Value = serde_json::from_str(&job.payload)
            .map_err(|e| SchedulerError::ExecutionFailure(format!("invalid payload: {e}")))?;

        if payload.get("fail").and_then(Value::as_bool) == Some(true) {
            return Err(SchedulerError::ExecutionFailure(format!(
                "{} job '{}' asked to fail",
                self.kind, job.name
            )));
        }

        let detail = payload
            .get(self.detail_key)
            .map(Value::to_string)
            .unwrap_or_default();
        info!(
            job_id = %job.id,
            kind = self.kind,
            run = job.run_count,
            detail = %detail,
            "executed {}",
            job.name
        );
        Ok(())
    }
}
