//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` is responsible for:
//! - Starting executions and keeping the execution registry
//! - Replaying workflow code from event history on every advance
//! - Turning new decisions into events, tasks and timers
//! - Recording activity reports and fired timers, then advancing again

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::persistence::{
    instant_after, ClaimedTask, ExecutionInfo, HistoryAppend, NewExecution, Pagination,
    StoreError, TaskDefinition, TaskStatus, TaskTransition, TimerDefinition, WorkflowEventStore,
    WorkflowStatus,
};
use crate::workflow::{
    error_codes, Workflow, WorkflowAction, WorkflowContext, WorkflowError,
    WorkflowEvent, WorkflowInterrupt,
};

use super::registry::{RegistryError, WorkflowRegistry};

/// Namespace used when a start request names none
pub const DEFAULT_NAMESPACE: &str = "default";

/// Rows handled per batch by the sweeping operations
const SWEEP_BATCH: usize = 100;

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum events per workflow (for safety)
    pub max_events_per_workflow: usize,

    /// Whether to validate actions before persisting
    pub validate_actions: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_events_per_workflow: 10000,
            validate_actions: true,
        }
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Page token not produced by [`WorkflowExecutor::list`]
    #[error("invalid page token: {0}")]
    InvalidPageToken(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ExecutorError {
    /// True if the execution or workflow ID does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Store(StoreError::ExecutionNotFound(_) | StoreError::WorkflowNotFound(_))
        )
    }
}

/// Request to start a new execution
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub workflow_id: String,
    pub workflow_type: String,
    pub input: Value,
    pub namespace: String,

    /// Whole-execution timeout; `None` means unbounded
    pub execution_timeout: Option<Duration>,
}

impl StartRequest {
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            workflow_type: workflow_type.into(),
            input,
            namespace: DEFAULT_NAMESPACE.to_string(),
            execution_timeout: None,
        }
    }

    /// Typed request for a registered workflow
    pub fn for_workflow<W: Workflow>(
        workflow_id: impl Into<String>,
        input: &W::Input,
    ) -> Result<Self, ExecutorError> {
        Ok(Self::new(workflow_id, W::TYPE, serde_json::to_value(input)?))
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}

/// Identity of a started execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionHandle {
    pub workflow_id: String,
    pub run_id: Uuid,
}

/// Result of advancing an execution
#[derive(Debug, Clone, PartialEq)]
pub struct AdvanceResult {
    /// Status after the advance
    pub status: WorkflowStatus,

    /// Number of new events written
    pub events_written: usize,

    /// Number of tasks enqueued
    pub tasks_enqueued: usize,

    /// Number of durable timers started
    pub timers_started: usize,
}

impl AdvanceResult {
    fn unchanged(status: WorkflowStatus) -> Self {
        Self {
            status,
            events_written: 0,
            tasks_enqueued: 0,
            timers_started: 0,
        }
    }
}

/// What happened to an activity report
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    /// The step settled and the execution advanced
    Settled,

    /// The failure was recorded and the next attempt is enqueued
    WillRetry { next_attempt: u32, delay: Duration },

    /// The task was no longer claimed at this attempt, or the execution is closed
    Discarded,
}

/// One page of [`WorkflowExecutor::list`]
#[derive(Debug, Clone)]
pub struct ExecutionPage {
    pub executions: Vec<ExecutionInfo>,
    pub next_page_token: Option<String>,
}

/// Workflow executor
///
/// The executor drives workflow code by replaying history and appending the
/// new decisions it makes. Every advance, report and timer firing for one run
/// is serialized by a per-run lock; writers in other processes are caught by
/// the store's optimistic sequence check.
///
/// # Example
///
/// ```ignore
/// use steadyrun_durable::prelude::*;
///
/// let mut executor = WorkflowExecutor::new(InMemoryWorkflowEventStore::new());
/// executor.register::<UserOnboardingWorkflow>();
///
/// let handle = executor
///     .start_execution(StartRequest::for_workflow::<UserOnboardingWorkflow>("user-42", &input)?)
///     .await?;
/// let info = executor.describe(&handle.workflow_id, Some(handle.run_id)).await?;
/// ```
pub struct WorkflowExecutor<S: WorkflowEventStore> {
    store: Arc<S>,
    registry: WorkflowRegistry,
    config: ExecutorConfig,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl<S: WorkflowEventStore> WorkflowExecutor<S> {
    /// Create a new executor with the given store
    pub fn new(store: S) -> Self {
        Self::with_config(store, ExecutorConfig::default())
    }

    /// Create a new executor with custom config
    pub fn with_config(store: S, config: ExecutorConfig) -> Self {
        Self::with_shared_store(Arc::new(store), config)
    }

    /// Create an executor over a store shared with other components
    pub fn with_shared_store(store: Arc<S>, config: ExecutorConfig) -> Self {
        Self {
            store,
            registry: WorkflowRegistry::new(),
            config,
            locks: DashMap::new(),
        }
    }

    /// Register a workflow type
    pub fn register<W: Workflow>(&mut self) {
        self.registry.register::<W>();
        info!(workflow_type = W::TYPE, "registered workflow type");
    }

    /// Get a reference to the store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Shared handle to the store
    pub fn shared_store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    // =========================================================================
    // Execution registry
    // =========================================================================

    /// Start a new execution and run it up to its first suspension
    ///
    /// Unknown workflow types are rejected before anything is written. Once
    /// the execution is registered the handle is returned even if the first
    /// advance fails; [`WorkflowExecutor::reconcile`] picks it up again.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id, workflow_type = %request.workflow_type))]
    pub async fn start_execution(
        &self,
        request: StartRequest,
    ) -> Result<ExecutionHandle, ExecutorError> {
        if !self.registry.contains(&request.workflow_type) {
            return Err(RegistryError::UnknownWorkflowType(request.workflow_type).into());
        }

        let run_id = Uuid::now_v7();
        let start_time = Utc::now();
        let execution_deadline = request
            .execution_timeout
            .map(|timeout| instant_after(start_time, timeout));

        self.store
            .create_execution(NewExecution {
                workflow_id: request.workflow_id.clone(),
                run_id,
                workflow_type: request.workflow_type,
                namespace: request.namespace,
                input: request.input,
                start_time,
                execution_deadline,
            })
            .await?;

        info!(%run_id, "started execution");

        if let Err(e) = self.advance(run_id).await {
            error!(%run_id, error = %e, "initial advance failed");
        }

        Ok(ExecutionHandle {
            workflow_id: request.workflow_id,
            run_id,
        })
    }

    /// Registry record for a workflow ID; `None` selects the latest run
    pub async fn describe(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
    ) -> Result<ExecutionInfo, ExecutorError> {
        Ok(self.store.find_execution(workflow_id, run_id).await?)
    }

    /// Page through a namespace, newest first
    pub async fn list(
        &self,
        namespace: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<ExecutionPage, ExecutorError> {
        let offset = match page_token {
            Some(token) => token
                .parse::<u32>()
                .map_err(|_| ExecutorError::InvalidPageToken(token.to_string()))?,
            None => 0,
        };
        let page_size = page_size.max(1);

        let mut executions = self
            .store
            .list_executions(
                namespace,
                Pagination {
                    offset,
                    limit: page_size.saturating_add(1),
                },
            )
            .await?;

        let next_page_token = if executions.len() > page_size as usize {
            executions.truncate(page_size as usize);
            Some(offset.saturating_add(page_size).to_string())
        } else {
            None
        };

        Ok(ExecutionPage {
            executions,
            next_page_token,
        })
    }

    /// Full event history of a run
    pub async fn history(&self, run_id: Uuid) -> Result<Vec<(i64, WorkflowEvent)>, ExecutorError> {
        Ok(self.store.load_events(run_id).await?)
    }

    /// Cancel a running execution
    ///
    /// Fails with [`StoreError::ExecutionClosed`] if the run already reached a
    /// terminal status.
    #[instrument(skip(self, reason))]
    pub async fn cancel(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
        reason: &str,
    ) -> Result<ExecutionInfo, ExecutorError> {
        let run_id = self.store.find_execution(workflow_id, run_id).await?.run_id;

        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let execution = self.store.get_execution(run_id).await?;
        if execution.status.is_terminal() {
            return Err(StoreError::ExecutionClosed {
                run_id,
                status: execution.status,
            }
            .into());
        }

        self.store
            .append(
                run_id,
                execution.history_cursor,
                HistoryAppend::new(vec![WorkflowEvent::WorkflowCancelled {
                    reason: reason.to_string(),
                }]),
            )
            .await?;
        self.locks.remove(&run_id);

        info!(%run_id, reason, "cancelled execution");
        Ok(self.store.get_execution(run_id).await?)
    }

    // =========================================================================
    // Advancing
    // =========================================================================

    /// Replay the workflow code and persist whatever it decides next
    ///
    /// Advancing an execution whose history has not changed writes nothing.
    #[instrument(skip(self))]
    pub async fn advance(&self, run_id: Uuid) -> Result<AdvanceResult, ExecutorError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;
        self.advance_locked(run_id).await
    }

    /// Advance every running execution (startup recovery)
    pub async fn recover(&self) -> Result<usize, ExecutorError> {
        let (advanced, _) = self.advance_running().await?;
        info!(advanced, "recovered running executions");
        Ok(advanced)
    }

    /// Re-drive running executions that have recorded outcomes nobody acted on
    ///
    /// A report, fired timer or start commits before the advance that follows
    /// it. When that advance fails the run has no task or timer left to wake
    /// it, so this is run periodically. Returns how many executions moved.
    pub async fn reconcile(&self) -> Result<usize, ExecutorError> {
        let (_, progressed) = self.advance_running().await?;
        if progressed > 0 {
            warn!(progressed, "re-drove stalled executions");
        }
        Ok(progressed)
    }

    /// `(advanced, progressed)` over every running execution
    async fn advance_running(&self) -> Result<(usize, usize), ExecutorError> {
        let running = self.store.running_executions().await?;
        let mut advanced = 0;
        let mut progressed = 0;

        for run_id in running {
            match self.advance(run_id).await {
                Ok(result) => {
                    advanced += 1;
                    if result.events_written > 0 {
                        progressed += 1;
                    }
                }
                Err(e) => warn!(%run_id, error = %e, "failed to advance execution"),
            }
        }

        Ok((advanced, progressed))
    }

    async fn advance_locked(&self, run_id: Uuid) -> Result<AdvanceResult, ExecutorError> {
        let execution = self.store.get_execution(run_id).await?;
        if execution.status.is_terminal() {
            debug!(%run_id, status = %execution.status, "execution already closed");
            self.locks.remove(&run_id);
            return Ok(AdvanceResult::unchanged(execution.status));
        }

        let events = self.store.load_events(run_id).await?;
        let expected_sequence = events.len() as i64;
        if let Some(error) = self.event_cap_error(events.len()) {
            return self.fail_execution(run_id, expected_sequence, error).await;
        }

        let workflow = match self
            .registry
            .create(&execution.workflow_type, execution.input.clone())
        {
            Ok(workflow) => workflow,
            Err(RegistryError::Deserialization(e)) => {
                let error = WorkflowError::new(format!("invalid workflow input: {e}"))
                    .with_code(error_codes::SERIALIZATION);
                return self.fail_execution(run_id, expected_sequence, error).await;
            }
            Err(e) => return Err(e.into()),
        };

        let mut ctx = match WorkflowContext::from_history(&execution.workflow_id, run_id, &events)
        {
            Ok(ctx) => ctx,
            Err(e) => {
                let error = WorkflowError::new(format!("history cannot be replayed: {e}"))
                    .with_code(error_codes::CORRUPT_HISTORY);
                return self.fail_execution(run_id, expected_sequence, error).await;
            }
        };
        let outcome = workflow.run(&mut ctx);
        ctx.finish();

        if let Some(violation) = ctx.violation() {
            warn!(%run_id, violation, "non-deterministic replay");
            let error = WorkflowError::non_deterministic(violation);
            return self.fail_execution(run_id, expected_sequence, error).await;
        }

        let mut actions = ctx.into_actions();
        match outcome {
            Ok(result) => actions.push(WorkflowAction::complete(result)),
            Err(WorkflowInterrupt::Failed(error)) => actions.push(WorkflowAction::fail(error)),
            Err(WorkflowInterrupt::NonDeterministic(message)) => {
                let error = WorkflowError::non_deterministic(message);
                return self.fail_execution(run_id, expected_sequence, error).await;
            }
            Err(WorkflowInterrupt::Suspended) => {}
        }

        if actions.is_empty() {
            return Ok(AdvanceResult::unchanged(WorkflowStatus::Running));
        }

        let append = match self.materialize(run_id, &execution, actions) {
            Ok(append) => append,
            Err(error) => return self.fail_execution(run_id, expected_sequence, error).await,
        };

        // Closing events are always allowed through
        if append.terminal_event().is_none() {
            if let Some(error) = self.event_cap_error(events.len() + append.events.len()) {
                return self.fail_execution(run_id, expected_sequence, error).await;
            }
        }

        let result = AdvanceResult {
            status: append
                .terminal_event()
                .and_then(WorkflowEvent::terminal_status)
                .unwrap_or(WorkflowStatus::Running),
            events_written: append.events.len(),
            tasks_enqueued: append.tasks.len(),
            timers_started: append.timers.len(),
        };
        let carries_timers = !append.timers.is_empty();

        match self.store.append(run_id, expected_sequence, append).await {
            Ok(_) => {}
            Err(e) if carries_timers && e.is_backend_failure() => {
                error!(%run_id, error = %e, "failed to persist timer");
                let error = WorkflowError::timer_persistence(e.to_string());
                if let Err(fail_err) = self
                    .store
                    .append(
                        run_id,
                        expected_sequence,
                        HistoryAppend::new(vec![WorkflowEvent::WorkflowFailed { error }]),
                    )
                    .await
                {
                    error!(
                        %run_id,
                        error = %fail_err,
                        "failed to record timer persistence failure"
                    );
                }
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        }

        match result.status {
            WorkflowStatus::Running => debug!(
                %run_id,
                events = result.events_written,
                tasks = result.tasks_enqueued,
                timers = result.timers_started,
                "advanced execution"
            ),
            WorkflowStatus::Completed => info!(%run_id, "workflow completed"),
            status => warn!(%run_id, %status, "workflow closed"),
        }

        if result.status.is_terminal() {
            self.locks.remove(&run_id);
        }
        Ok(result)
    }

    /// Turn decisions into one atomic append
    ///
    /// Every timer in the batch is anchored at the same instant.
    fn materialize(
        &self,
        run_id: Uuid,
        execution: &ExecutionInfo,
        actions: Vec<WorkflowAction>,
    ) -> Result<HistoryAppend, WorkflowError> {
        let now = Utc::now();
        let mut append = HistoryAppend::default();

        for action in actions {
            match action {
                WorkflowAction::ScheduleActivity {
                    activity_id,
                    activity_type,
                    input,
                    options,
                } => {
                    if self.config.validate_actions {
                        options.retry_policy.validate().map_err(|e| {
                            WorkflowError::new(format!(
                                "activity {activity_id} has an invalid retry policy: {e}"
                            ))
                            .with_code(error_codes::INVALID_ACTION)
                        })?;
                    }

                    debug!(%run_id, %activity_id, %activity_type, "scheduling activity");

                    append.events.push(WorkflowEvent::ActivityScheduled {
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        input: input.clone(),
                        options: options.clone(),
                    });
                    append.tasks.push(TaskDefinition {
                        run_id,
                        workflow_id: execution.workflow_id.clone(),
                        activity_id,
                        activity_type,
                        input,
                        options,
                        attempt: 1,
                        visible_at: now,
                    });
                }

                WorkflowAction::StartTimer { timer_id, duration } => {
                    let fire_at = instant_after(now, duration);
                    debug!(%run_id, %timer_id, %fire_at, "starting timer");

                    append.events.push(WorkflowEvent::TimerStarted {
                        timer_id: timer_id.clone(),
                        fire_at,
                    });
                    append.timers.push(TimerDefinition { timer_id, fire_at });
                }

                WorkflowAction::CompleteWorkflow { result } => {
                    append
                        .events
                        .push(WorkflowEvent::WorkflowCompleted { result });
                }

                WorkflowAction::FailWorkflow { error } => {
                    append.events.push(WorkflowEvent::WorkflowFailed { error });
                }
            }
        }

        Ok(append)
    }

    /// Failure to record once a history would hold `total` events
    fn event_cap_error(&self, total: usize) -> Option<WorkflowError> {
        let max = self.config.max_events_per_workflow;
        (total > max).then(|| {
            WorkflowError::new(format!("history would hold {total} events, cap is {max}"))
                .with_code(error_codes::TOO_MANY_EVENTS)
        })
    }

    async fn fail_execution(
        &self,
        run_id: Uuid,
        expected_sequence: i64,
        error: WorkflowError,
    ) -> Result<AdvanceResult, ExecutorError> {
        error!(%run_id, %error, "failing workflow");

        self.store
            .append(
                run_id,
                expected_sequence,
                HistoryAppend::new(vec![WorkflowEvent::WorkflowFailed { error }]),
            )
            .await?;
        self.locks.remove(&run_id);

        Ok(AdvanceResult {
            status: WorkflowStatus::Failed,
            events_written: 1,
            tasks_enqueued: 0,
            timers_started: 0,
        })
    }

    // =========================================================================
    // Activity reports
    // =========================================================================

    /// Record a successful attempt and advance the execution
    #[instrument(skip(self, task, result), fields(run_id = %task.run_id, activity_id = %task.activity_id, attempt = task.attempt))]
    pub async fn complete_activity(
        &self,
        task: &ClaimedTask,
        result: Value,
    ) -> Result<ReportOutcome, ExecutorError> {
        let lock = self.run_lock(task.run_id);
        let _guard = lock.lock().await;

        let append = HistoryAppend::new(vec![WorkflowEvent::ActivityCompleted {
            activity_id: task.activity_id.clone(),
            attempt: task.attempt,
            result,
        }])
        .with_task_transition(TaskTransition {
            task_id: task.id,
            attempt: task.attempt,
            status: TaskStatus::Completed,
        });

        if !self.record_report(task, append).await? {
            return Ok(ReportOutcome::Discarded);
        }

        debug!("activity completed");
        self.advance_after_commit(task.run_id).await;
        Ok(ReportOutcome::Settled)
    }

    /// Record a failed attempt; retries per the step's policy or settles the step
    #[instrument(skip(self, task, error), fields(run_id = %task.run_id, activity_id = %task.activity_id, attempt = task.attempt))]
    pub async fn fail_activity(
        &self,
        task: &ClaimedTask,
        error: ActivityError,
    ) -> Result<ReportOutcome, ExecutorError> {
        let lock = self.run_lock(task.run_id);
        let _guard = lock.lock().await;

        let policy = &task.options.retry_policy;
        let retry_delay = policy.next_delay_for(task.attempt, &error);
        let task_status = if error.is_timeout() {
            TaskStatus::TimedOut
        } else {
            TaskStatus::Failed
        };

        let mut append = HistoryAppend::new(vec![WorkflowEvent::ActivityFailed {
            activity_id: task.activity_id.clone(),
            attempt: task.attempt,
            error: error.clone(),
            will_retry: retry_delay.is_some(),
        }])
        .with_task_transition(TaskTransition {
            task_id: task.id,
            attempt: task.attempt,
            status: task_status,
        });

        let next_attempt = task.attempt.saturating_add(1);
        if let Some(delay) = retry_delay {
            append = append.with_task(TaskDefinition {
                run_id: task.run_id,
                workflow_id: task.workflow_id.clone(),
                activity_id: task.activity_id.clone(),
                activity_type: task.activity_type.clone(),
                input: task.input.clone(),
                options: task.options.clone(),
                attempt: next_attempt,
                visible_at: instant_after(Utc::now(), delay),
            });
        }

        if !self.record_report(task, append).await? {
            return Ok(ReportOutcome::Discarded);
        }

        match retry_delay {
            Some(delay) => {
                warn!(error = %error, next_attempt, ?delay, "activity failed, will retry");
                Ok(ReportOutcome::WillRetry {
                    next_attempt,
                    delay,
                })
            }
            None => {
                warn!(error = %error, retryable = error.retryable, "activity failed permanently");
                self.advance_after_commit(task.run_id).await;
                Ok(ReportOutcome::Settled)
            }
        }
    }

    /// Fail every claimed task whose start-to-close deadline passed
    pub async fn expire_timed_out_tasks(&self, now: DateTime<Utc>) -> Result<usize, ExecutorError> {
        let expired = self.store.timed_out_tasks(now, SWEEP_BATCH).await?;
        let mut recorded = 0;

        for task in expired {
            let error = ActivityError::timeout(task.options.start_to_close_timeout);
            match self.fail_activity(&task, error).await {
                Ok(ReportOutcome::Discarded) => {}
                Ok(_) => recorded += 1,
                Err(e) => warn!(task_id = %task.id, error = %e, "failed to time out task"),
            }
        }

        if recorded > 0 {
            info!(recorded, "timed out activity attempts");
        }
        Ok(recorded)
    }

    /// Advance after a report or timer was committed
    ///
    /// The committed event stands either way; a failed advance is picked up
    /// by [`WorkflowExecutor::reconcile`].
    async fn advance_after_commit(&self, run_id: Uuid) {
        if let Err(e) = self.advance_locked(run_id).await {
            error!(%run_id, error = %e, "advance after commit failed");
        }
    }

    /// Append the report unless the claim is stale; `false` means discarded
    ///
    /// A report that would push history past the event cap fails the
    /// execution instead and is discarded.
    async fn record_report(
        &self,
        task: &ClaimedTask,
        append: HistoryAppend,
    ) -> Result<bool, ExecutorError> {
        let execution = self.store.get_execution(task.run_id).await?;
        if execution.status.is_terminal() {
            debug!(task_id = %task.id, "discarding report for closed execution");
            return Ok(false);
        }

        let total = execution.history_cursor.max(0) as usize + append.events.len();
        if let Some(error) = self.event_cap_error(total) {
            self.fail_execution(task.run_id, execution.history_cursor, error)
                .await?;
            return Ok(false);
        }

        match self
            .store
            .append(task.run_id, execution.history_cursor, append)
            .await
        {
            Ok(_) => Ok(true),
            Err(StoreError::StaleTask { .. } | StoreError::ExecutionClosed { .. }) => {
                debug!(task_id = %task.id, "discarding stale report");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Timers and execution timeouts
    // =========================================================================

    /// Fire one timer and advance its execution
    ///
    /// Returns `false` without writing anything if the timer is not pending
    /// or its `fire_at` is still after `now`.
    #[instrument(skip(self))]
    pub async fn fire_timer(
        &self,
        run_id: Uuid,
        timer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, ExecutorError> {
        let lock = self.run_lock(run_id);
        let _guard = lock.lock().await;

        let execution = self.store.get_execution(run_id).await?;
        if execution.status.is_terminal() {
            return Ok(false);
        }

        let events = self.store.load_events(run_id).await?;
        let fire_at = events.iter().find_map(|(_, event)| match event {
            WorkflowEvent::TimerStarted {
                timer_id: started,
                fire_at,
            } if started == timer_id => Some(*fire_at),
            _ => None,
        });
        match fire_at {
            None => return Ok(false),
            Some(fire_at) if fire_at > now => {
                debug!(%fire_at, "timer not due yet");
                return Ok(false);
            }
            Some(_) => {}
        }

        if let Some(error) = self.event_cap_error(events.len() + 1) {
            self.fail_execution(run_id, execution.history_cursor, error)
                .await?;
            return Ok(false);
        }

        let append = HistoryAppend::new(vec![WorkflowEvent::TimerFired {
            timer_id: timer_id.to_string(),
        }])
        .with_fired_timer(timer_id);

        match self
            .store
            .append(run_id, execution.history_cursor, append)
            .await
        {
            Ok(_) => {}
            Err(StoreError::StaleTimer { .. } | StoreError::ExecutionClosed { .. }) => {
                return Ok(false)
            }
            Err(e) => return Err(e.into()),
        }

        debug!("timer fired");
        self.advance_after_commit(run_id).await;
        Ok(true)
    }

    /// Fire every pending timer due at `now`
    pub async fn fire_due_timers(&self, now: DateTime<Utc>) -> Result<usize, ExecutorError> {
        let due = self.store.due_timers(now, SWEEP_BATCH).await?;
        let mut fired = 0;

        for timer in due {
            match self.fire_timer(timer.run_id, &timer.timer_id, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    run_id = %timer.run_id,
                    timer_id = %timer.timer_id,
                    error = %e,
                    "failed to fire timer"
                ),
            }
        }

        Ok(fired)
    }

    /// Close running executions whose execution timeout elapsed
    pub async fn time_out_expired_executions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<usize, ExecutorError> {
        let expired = self.store.expired_executions(now, SWEEP_BATCH).await?;
        let mut timed_out = 0;

        for run_id in expired {
            let lock = self.run_lock(run_id);
            let _guard = lock.lock().await;

            let execution = self.store.get_execution(run_id).await?;
            if execution.status.is_terminal() {
                continue;
            }

            let error = WorkflowError::timed_out("execution timeout exceeded");
            match self
                .store
                .append(
                    run_id,
                    execution.history_cursor,
                    HistoryAppend::new(vec![WorkflowEvent::WorkflowTimedOut { error }]),
                )
                .await
            {
                Ok(_) => {
                    warn!(%run_id, "execution timed out");
                    self.locks.remove(&run_id);
                    timed_out += 1;
                }
                Err(e) => warn!(%run_id, error = %e, "failed to time out execution"),
            }
        }

        Ok(timed_out)
    }

    fn run_lock(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(&*self.locks.entry(run_id).or_default())
    }
}
