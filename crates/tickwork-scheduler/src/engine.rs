use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tickwork_core::SchedulerConfig;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::{
    dispatcher::{Dispatcher, JobExecutor},
    error::Result,
    guard::ExecutionGuard,
    handle::SchedulerHandle,
    index::DueIndex,
    reconciler::Reconciler,
    schedule::Calculator,
    store::JobStore,
};

/// Running scheduler: a coordinator task draining the due-time index into
/// the dispatcher, plus the handle used to manage jobs.
pub struct SchedulerEngine {
    handle: SchedulerHandle,
    dispatcher: Arc<Dispatcher>,
    reconciler: Arc<Reconciler>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerEngine {
    /// Reconcile with the store and spawn the coordinator loop.
    ///
    /// A store failure during reconciliation is logged, not returned; the
    /// coordinator retries it on every wakeup until it succeeds.
    pub async fn start(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn JobExecutor>,
    ) -> Result<Self> {
        config.validate()?;

        let calculator = Calculator::new(config.timezone);
        let index = DueIndex::new(calculator);
        let guard = ExecutionGuard::new();
        let dispatcher = Arc::new(Dispatcher::new(
            &config,
            Arc::clone(&store),
            executor,
            index.clone(),
            guard.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&store), index.clone(), calculator));

        let reconciled = match reconciler.startup().await {
            Ok(_) => true,
            Err(e) => {
                error!("startup reconciliation failed, will retry: {e}");
                false
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let coordinator = Coordinator {
            index: index.clone(),
            guard: guard.clone(),
            dispatcher: Arc::clone(&dispatcher),
            reconciler: Arc::clone(&reconciler),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            reconciled,
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(coordinator.run());

        info!(
            max_concurrency = dispatcher.max_concurrency(),
            sweep_interval_secs = config.sweep_interval_secs,
            "scheduler engine started"
        );

        Ok(Self {
            handle: SchedulerHandle::new(
                store,
                index,
                guard,
                Arc::clone(&dispatcher),
                calculator,
            ),
            dispatcher,
            reconciler,
            shutdown_tx,
            task,
        })
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Stop the coordinator and cancel every armed entry.
    ///
    /// In-flight attempts, on-demand runs included, finish first; nothing is
    /// cut short. Only then is the index cleared, so no attempt can re-arm
    /// a job afterwards.
    pub async fn shutdown(self) {
        info!("scheduler engine shutting down");
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            error!("coordinator task ended abnormally: {e}");
        }
        self.dispatcher.close().await;
        self.reconciler.shutdown();
        info!("scheduler engine stopped");
    }
}

struct Coordinator {
    index: DueIndex,
    guard: ExecutionGuard,
    dispatcher: Arc<Dispatcher>,
    reconciler: Arc<Reconciler>,
    sweep_interval: Duration,
    reconciled: bool,
    shutdown: watch::Receiver<bool>,
}

impl Coordinator {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            if !self.reconciled {
                match self.reconciler.startup().await {
                    Ok(_) => self.reconciled = true,
                    Err(e) => error!("reconciliation retry failed: {e}"),
                }
            }

            // Drain everything already due, one bounded batch at a time.
            loop {
                let batch = self.index.claim_due(
                    Utc::now(),
                    &self.guard,
                    self.dispatcher.max_concurrency(),
                );
                if batch.is_empty() {
                    break;
                }
                self.dispatcher.run_batch(batch).await;
                if *self.shutdown.borrow() {
                    return;
                }
            }

            let sleep_for = self.sleep_duration();
            debug!(sleep_ms = sleep_for.as_millis() as u64, "coordinator idle");

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.index.changed() => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Until the earliest due time, never longer than the sweep interval.
    fn sleep_duration(&self) -> Duration {
        match self.index.next_due() {
            Some(due) => (due - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.sweep_interval),
            None => self.sweep_interval,
        }
    }
}
