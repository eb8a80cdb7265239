// Onboarding worker process
// Decision: One process runs the executor, the activity pool and the timer service together
// Decision: Startup recovery runs before any new work is claimed

use std::sync::Arc;

use anyhow::{Context, Result};
use steadyrun_durable::activity::ActivityRegistry;
use steadyrun_durable::engine::{ExecutionHandle, StartRequest, WorkflowExecutor};
use steadyrun_durable::persistence::WorkflowEventStore;
use steadyrun_durable::timer::{TimerService, TimerServiceConfig};
use steadyrun_durable::worker::{PollerConfig, WorkerPool, WorkerPoolConfig};
use tracing::info;

use crate::config::WorkerConfig;
use crate::onboarding::{self, UserOnboardingInput, UserOnboardingWorkflow};

/// Runs user onboarding workflows against one store
pub struct DurableWorker<S: WorkflowEventStore> {
    config: WorkerConfig,
    executor: Arc<WorkflowExecutor<S>>,
    pool: WorkerPool<S>,
    timers: TimerService<S>,
}

impl<S: WorkflowEventStore> DurableWorker<S> {
    /// Create a worker with the standard onboarding activities
    pub fn new(config: WorkerConfig, store: S) -> Self {
        Self::with_activities(config, store, onboarding::activities::registry())
    }

    /// Create a worker with a custom activity registry
    pub fn with_activities(config: WorkerConfig, store: S, activities: ActivityRegistry) -> Self {
        let mut executor = WorkflowExecutor::new(store);
        executor.register::<UserOnboardingWorkflow>();
        let executor = Arc::new(executor);

        let pool_config = WorkerPoolConfig::new(config.task_queue.clone())
            .with_worker_id(config.worker_id.clone())
            .with_max_concurrency(config.max_concurrent_activities)
            .with_poller(PollerConfig::new().with_min_interval(config.poll_interval));
        let pool = WorkerPool::new(Arc::clone(&executor), activities, pool_config);

        let timers = TimerService::new(
            Arc::clone(&executor),
            TimerServiceConfig::new()
                .with_sweep_interval(config.timer_sweep_interval)
                .with_reconcile_interval(config.reconcile_interval),
        );

        Self {
            config,
            executor,
            pool,
            timers,
        }
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor<S>> {
        &self.executor
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Recover in-flight executions, then start the timer loop and the pool
    pub async fn start(&self) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            task_queue = %self.config.task_queue,
            max_concurrent = self.config.max_concurrent_activities,
            "Starting durable worker"
        );

        let recovered = self
            .executor
            .recover()
            .await
            .context("Failed to recover running executions")?;
        let report = self
            .timers
            .recover()
            .await
            .context("Failed to recover timers")?;
        info!(
            recovered,
            timers_fired = report.timers_fired,
            "Recovery complete"
        );

        self.timers.start();
        self.pool.start().context("Failed to start worker pool")?;
        Ok(())
    }

    /// Start onboarding for a user
    pub async fn start_onboarding(&self, input: UserOnboardingInput) -> Result<ExecutionHandle> {
        let request = StartRequest::for_workflow::<UserOnboardingWorkflow>(
            onboarding::workflow_id(input.user_id),
            &input,
        )?
        .with_namespace(self.config.namespace.clone());

        let handle = self
            .executor
            .start_execution(request)
            .await
            .with_context(|| format!("Failed to start onboarding for user {}", input.user_id))?;
        Ok(handle)
    }

    /// Stop claiming, drain running activities and stop the timer loop
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down durable worker");
        let drained = self.pool.shutdown().await;
        self.timers.shutdown().await;
        drained.context("Worker pool did not drain cleanly")?;
        info!("Durable worker stopped");
        Ok(())
    }
}
