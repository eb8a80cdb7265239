//! Worker pool for task execution
//!
//! Runs claimed activity attempts concurrently, reports their outcomes to the
//! executor and shuts down gracefully.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{PollerConfig, PollerError, TaskPoller};
use crate::activity::{ActivityContext, ActivityError, ActivityHandler, ActivityRegistry};
use crate::engine::{ReportOutcome, WorkflowExecutor};
use crate::persistence::{ClaimedTask, StoreError, WorkflowEventStore};
use crate::reliability::duration_millis;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Task queue this worker serves, for logging
    pub task_queue: String,

    /// Activity types to claim; empty means every registered activity
    pub activity_types: Vec<String>,

    /// Maximum concurrent task executions
    pub max_concurrency: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// How often expired attempts are swept
    #[serde(with = "duration_millis")]
    pub timeout_sweep_interval: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_queue: "default".to_string(),
            activity_types: vec![],
            max_concurrency: 10,
            poller: PollerConfig::default(),
            timeout_sweep_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            ..Default::default()
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Restrict the activity types this worker claims
    pub fn with_activity_types(mut self, activity_types: Vec<String>) -> Self {
        self.activity_types = activity_types;
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set the expired-attempt sweep interval
    pub fn with_timeout_sweep_interval(mut self, interval: Duration) -> Self {
        self.timeout_sweep_interval = interval;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Worker is running and accepting tasks
    Running,
    /// Worker is draining (completing current tasks, not accepting new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Poller error
    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Nothing to claim
    #[error("worker pool has no activities to run")]
    NoActivities,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Worker pool for executing activities
///
/// # Example
///
/// ```ignore
/// use steadyrun_durable::prelude::*;
///
/// let mut activities = ActivityRegistry::new();
/// activities.register(SendWelcomeEmail::default());
///
/// let pool = WorkerPool::new(executor, activities, WorkerPoolConfig::new("user-onboarding"));
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool<S: WorkflowEventStore> {
    executor: Arc<WorkflowExecutor<S>>,
    activities: ActivityRegistry,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    cancellation: CancellationToken,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: WorkflowEventStore> WorkerPool<S> {
    /// Create a new worker pool
    pub fn new(
        executor: Arc<WorkflowExecutor<S>>,
        activities: ActivityRegistry,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            executor,
            activities,
            active_tasks: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            cancellation: CancellationToken::new(),
            poll_handle: Mutex::new(None),
            sweep_handle: Mutex::new(None),
        }
    }

    /// Start the worker pool
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Running {
                return Err(WorkerPoolError::AlreadyRunning);
            }

            if self.activity_types().is_empty() {
                return Err(WorkerPoolError::NoActivities);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            task_queue = %self.config.task_queue,
            activity_types = ?self.activity_types(),
            max_concurrency = self.config.max_concurrency,
            "Starting worker pool"
        );

        self.start_poll_loop();
        self.start_sweep_loop();

        Ok(())
    }

    /// Shutdown the worker pool gracefully
    ///
    /// Stops claiming, then waits for running attempts up to the shutdown
    /// timeout. Attempts still running after that are asked to cancel.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!("Initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);

        let poll = self.poll_handle.lock().take();
        if let Some(handle) = poll {
            let _ = handle.await;
        }
        let sweep = self.sweep_handle.lock().take();
        if let Some(handle) = sweep {
            let _ = handle.await;
        }

        // Wait for active tasks to complete (with timeout)
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;

        loop {
            let available = self.active_tasks.available_permits();
            if available == self.config.max_concurrency {
                debug!("All tasks completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_tasks = self.config.max_concurrency - available,
                    "Shutdown timeout reached"
                );
                self.cancellation.cancel();
                *self.status.write() = WorkerPoolStatus::Stopped;
                return Err(WorkerPoolError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!("Worker pool stopped");
        Ok(())
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Number of attempts currently running
    pub fn current_load(&self) -> usize {
        self.config.max_concurrency - self.active_tasks.available_permits()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Activity types this pool claims
    pub fn activity_types(&self) -> Vec<String> {
        if self.config.activity_types.is_empty() {
            self.activities.activity_types()
        } else {
            self.config
                .activity_types
                .iter()
                .filter(|t| self.activities.contains(t))
                .cloned()
                .collect()
        }
    }

    /// Start the polling loop
    fn start_poll_loop(&self) {
        let executor = Arc::clone(&self.executor);
        let activities = self.activities.clone();
        let active_tasks = Arc::clone(&self.active_tasks);
        let cancellation = self.cancellation.clone();

        let mut poller = TaskPoller::new(
            executor.shared_store(),
            self.config.worker_id.clone(),
            self.activity_types(),
            self.config.poller.clone(),
            self.shutdown_rx.clone(),
        );

        let handle = tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    debug!("Poll loop: shutdown requested");
                    break;
                }

                let available_slots = active_tasks.available_permits();
                if available_slots == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(available_slots).await {
                    Ok(tasks) => {
                        for task in tasks {
                            let permit = match Arc::clone(&active_tasks).acquire_owned().await {
                                Ok(p) => p,
                                Err(_) => break,
                            };

                            let handler = activities.get(&task.activity_type);
                            let executor = Arc::clone(&executor);
                            let token = cancellation.child_token();

                            tokio::spawn(async move {
                                run_attempt(&executor, handler, task, token).await;
                                drop(permit);
                            });
                        }
                    }
                    Err(PollerError::Shutdown) => break,
                    Err(e) => {
                        error!("Poll error: {}", e);
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("Poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }

    /// Start the expired-attempt sweep loop
    fn start_sweep_loop(&self) {
        let executor = Arc::clone(&self.executor);
        let interval = self.config.timeout_sweep_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = executor.expire_timed_out_tasks(Utc::now()).await {
                            error!("Timeout sweep failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Sweep loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Sweep loop exited");
        });

        *self.sweep_handle.lock() = Some(handle);
    }
}

/// Run one attempt within its deadline and report the outcome
async fn run_attempt<S: WorkflowEventStore>(
    executor: &WorkflowExecutor<S>,
    handler: Option<ActivityHandler>,
    task: ClaimedTask,
    cancellation: CancellationToken,
) {
    let task_id = task.id;

    let Some(handler) = handler else {
        warn!(activity_type = %task.activity_type, "No handler registered");
        let error = ActivityError::non_retryable(format!(
            "no handler registered for activity type {}",
            task.activity_type
        ));
        if let Err(e) = executor.fail_activity(&task, error).await {
            error!(%task_id, "Failed to report task: {}", e);
        }
        return;
    };

    let ctx = ActivityContext::new(&task, cancellation);
    let remaining = ctx.remaining();

    debug!(%task_id, activity_type = %task.activity_type, attempt = task.attempt, "running activity");

    let report = match tokio::time::timeout(remaining, handler(ctx, task.input.clone())).await {
        Ok(Ok(output)) => executor.complete_activity(&task, output).await,
        Ok(Err(error)) => executor.fail_activity(&task, error).await,
        Err(_) => {
            let error = ActivityError::timeout(task.options.start_to_close_timeout);
            executor.fail_activity(&task, error).await
        }
    };

    match report {
        Ok(ReportOutcome::Discarded) => debug!(%task_id, "report discarded"),
        Ok(_) => {}
        Err(e) => error!(%task_id, "Failed to report task: {}", e),
    }
}
