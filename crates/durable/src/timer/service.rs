//! Timer sweep loop

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::engine::{ExecutorError, WorkflowExecutor};
use crate::persistence::WorkflowEventStore;
use crate::reliability::duration_millis;

/// Timer service configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimerServiceConfig {
    /// Longest the loop sleeps between sweeps
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,

    /// How often running executions are re-advanced
    #[serde(with = "duration_millis")]
    pub reconcile_interval: Duration,
}

impl Default for TimerServiceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(30),
        }
    }
}

impl TimerServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }
}

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub timers_fired: usize,
    pub executions_timed_out: usize,
}

/// Fires due timers, enforces execution timeouts and re-drives stalled runs
///
/// Firing goes through [`WorkflowExecutor::fire_timer`]: the `timer_fired`
/// event and the Pending → Fired transition are one atomic append, so a
/// timer picked up by two sweeps still fires once. Every
/// `reconcile_interval` the loop also calls [`WorkflowExecutor::reconcile`].
pub struct TimerService<S: WorkflowEventStore> {
    executor: Arc<WorkflowExecutor<S>>,
    config: TimerServiceConfig,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: WorkflowEventStore> TimerService<S> {
    pub fn new(executor: Arc<WorkflowExecutor<S>>, config: TimerServiceConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            executor,
            config,
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    /// Fire every timer due at `now` and time out expired executions
    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, ExecutorError> {
        sweep_once(&self.executor, now).await
    }

    /// Startup sweep: timers whose deadline passed while down fire now
    pub async fn recover(&self) -> Result<SweepReport, ExecutorError> {
        let report = self.sweep(Utc::now()).await?;
        info!(
            timers_fired = report.timers_fired,
            executions_timed_out = report.executions_timed_out,
            "recovered timers"
        );
        Ok(report)
    }

    /// Re-advance running executions whose last commit was never acted on
    pub async fn reconcile(&self) -> Result<usize, ExecutorError> {
        self.executor.reconcile().await
    }

    /// Start the background sweep loop
    ///
    /// Calling `start` on a running service is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }

        let _ = self.shutdown_tx.send(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let executor = Arc::clone(&self.executor);
        let config = self.config.clone();

        *handle = Some(tokio::spawn(async move {
            info!(
                sweep_interval_ms = config.sweep_interval.as_millis() as u64,
                reconcile_interval_ms = config.reconcile_interval.as_millis() as u64,
                "Starting timer service"
            );

            let mut last_reconcile = tokio::time::Instant::now();
            loop {
                if let Err(e) = sweep_once(&executor, Utc::now()).await {
                    error!("Timer sweep failed: {}", e);
                }

                if last_reconcile.elapsed() >= config.reconcile_interval {
                    last_reconcile = tokio::time::Instant::now();
                    if let Err(e) = executor.reconcile().await {
                        error!("Reconcile failed: {}", e);
                    }
                }

                let interval = config.sweep_interval.min(config.reconcile_interval);
                let wait = next_wait(&executor, interval).await;
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown_rx.changed() => {
                        debug!("Timer loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Timer loop exited");
        }));
    }

    /// Stop the background loop and wait for it to exit
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Whether the background loop is running
    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

async fn sweep_once<S: WorkflowEventStore>(
    executor: &WorkflowExecutor<S>,
    now: DateTime<Utc>,
) -> Result<SweepReport, ExecutorError> {
    let timers_fired = executor.fire_due_timers(now).await?;
    let executions_timed_out = executor.time_out_expired_executions(now).await?;

    let report = SweepReport {
        timers_fired,
        executions_timed_out,
    };
    if report != SweepReport::default() {
        debug!(timers_fired, executions_timed_out, "timer sweep");
    }
    Ok(report)
}

/// Sleep until the earliest pending deadline or the sweep interval
async fn next_wait<S: WorkflowEventStore>(
    executor: &WorkflowExecutor<S>,
    interval: Duration,
) -> Duration {
    match executor.store().next_timer_at().await {
        Ok(Some(fire_at)) => (fire_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(interval),
        Ok(None) => interval,
        Err(e) => {
            error!("Failed to read next timer deadline: {}", e);
            interval
        }
    }
}
