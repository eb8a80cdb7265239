//! WorkflowEventStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{ActivityOptions, WorkflowError, WorkflowEvent};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No execution with this run ID
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// No execution matches this workflow ID (and run ID, if given)
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Another run with this workflow ID has not closed yet
    #[error("workflow {workflow_id} is already running as run {run_id}")]
    AlreadyRunning { workflow_id: String, run_id: Uuid },

    /// History is closed to further appends
    #[error("execution {run_id} is already {status}")]
    ExecutionClosed { run_id: Uuid, status: WorkflowStatus },

    /// The task is no longer claimed at this attempt (timed out, cancelled or reported)
    #[error("task {task_id} is not claimed at attempt {attempt}")]
    StaleTask { task_id: Uuid, attempt: u32 },

    /// The timer already fired or was cancelled
    #[error("timer {timer_id} of execution {run_id} is not pending")]
    StaleTimer { run_id: Uuid, timer_id: String },

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// True for errors caused by the backend rather than by engine state
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Serialization(_))
    }
}

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Execution is running (possibly waiting on activities or timers)
    Running,

    /// Workflow completed successfully
    Completed,

    /// Workflow failed
    Failed,

    /// Execution timeout elapsed
    TimedOut,

    /// Workflow was cancelled
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses are absorbing
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::Serialization(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Timer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Pending,
    Fired,
    Cancelled,
}

impl TimerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fired => "fired",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A new execution to register
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub namespace: String,
    pub input: serde_json::Value,
    pub start_time: DateTime<Utc>,
    pub execution_deadline: Option<DateTime<Utc>>,
}

impl NewExecution {
    /// First history event of the run
    pub fn started_event(&self) -> WorkflowEvent {
        WorkflowEvent::WorkflowStarted {
            workflow_type: self.workflow_type.clone(),
            input: self.input.clone(),
        }
    }
}

/// Registry record of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub namespace: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub start_time: DateTime<Utc>,
    pub close_time: Option<DateTime<Utc>>,

    /// Sequence number the next appended event will get
    pub history_cursor: i64,

    pub execution_deadline: Option<DateTime<Utc>>,
}

/// Definition of a task to be enqueued
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,

    /// Attempt this task carries (1-based)
    pub attempt: u32,

    /// Not claimable before this instant (retry backoff)
    pub visible_at: DateTime<Utc>,
}

/// A task that has been claimed by a worker
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub run_id: Uuid,
    pub workflow_id: String,
    pub activity_id: String,
    pub activity_type: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    pub attempt: u32,

    /// Claim time + start-to-close timeout
    pub deadline: DateTime<Utc>,
}

/// A durable timer to persist
#[derive(Debug, Clone, PartialEq)]
pub struct TimerDefinition {
    pub timer_id: String,
    pub fire_at: DateTime<Utc>,
}

/// A pending timer whose deadline has passed
#[derive(Debug, Clone, PartialEq)]
pub struct DueTimer {
    pub run_id: Uuid,
    pub timer_id: String,
    pub fire_at: DateTime<Utc>,
}

/// Close a claimed task; rejected with [`StoreError::StaleTask`] unless the
/// task is still claimed at `attempt`
#[derive(Debug, Clone)]
pub struct TaskTransition {
    pub task_id: Uuid,
    pub attempt: u32,
    pub status: TaskStatus,
}

/// Everything written by one atomic history append
///
/// A terminal event in `events` also closes the execution and cancels its
/// remaining tasks and timers within the same write.
#[derive(Debug, Clone, Default)]
pub struct HistoryAppend {
    pub events: Vec<WorkflowEvent>,
    pub tasks: Vec<TaskDefinition>,
    pub timers: Vec<TimerDefinition>,
    pub task_transitions: Vec<TaskTransition>,

    /// Pending timers to mark fired
    pub fired_timers: Vec<String>,
}

impl HistoryAppend {
    pub fn new(events: Vec<WorkflowEvent>) -> Self {
        Self {
            events,
            ..Default::default()
        }
    }

    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_timer(mut self, timer: TimerDefinition) -> Self {
        self.timers.push(timer);
        self
    }

    pub fn with_task_transition(mut self, transition: TaskTransition) -> Self {
        self.task_transitions.push(transition);
        self
    }

    pub fn with_fired_timer(mut self, timer_id: impl Into<String>) -> Self {
        self.fired_timers.push(timer_id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The terminal event in this batch, if any
    pub fn terminal_event(&self) -> Option<&WorkflowEvent> {
        self.events.iter().find(|e| e.is_terminal())
    }
}

/// `now + delay`, saturating instead of overflowing
pub fn instant_after(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Persistence boundary for the engine
///
/// Implementations must make every method durable before returning `Ok`.
/// History only grows through [`WorkflowEventStore::append`], which is atomic
/// and guarded by the expected next sequence number.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    // =========================================================================
    // Execution registry
    // =========================================================================

    /// Register an execution and write its `workflow_started` event at sequence 0
    ///
    /// Fails with [`StoreError::AlreadyRunning`] if a run with the same
    /// workflow ID is still `Running`.
    async fn create_execution(&self, execution: NewExecution) -> Result<(), StoreError>;

    /// Get an execution by run ID
    async fn get_execution(&self, run_id: Uuid) -> Result<ExecutionInfo, StoreError>;

    /// Find an execution by workflow ID; `None` selects the latest run
    async fn find_execution(
        &self,
        workflow_id: &str,
        run_id: Option<Uuid>,
    ) -> Result<ExecutionInfo, StoreError>;

    /// List executions in a namespace, newest first
    async fn list_executions(
        &self,
        namespace: &str,
        pagination: Pagination,
    ) -> Result<Vec<ExecutionInfo>, StoreError>;

    /// Run IDs of every `Running` execution
    async fn running_executions(&self) -> Result<Vec<Uuid>, StoreError>;

    /// Running executions whose execution deadline is at or before `now`
    async fn expired_executions(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, StoreError>;

    // =========================================================================
    // Event history
    // =========================================================================

    /// Atomically append events with their tasks, timers and transitions
    ///
    /// Returns the new history cursor.
    async fn append(
        &self,
        run_id: Uuid,
        expected_sequence: i64,
        append: HistoryAppend,
    ) -> Result<i64, StoreError>;

    /// Load all events for an execution, ordered by sequence
    async fn load_events(&self, run_id: Uuid) -> Result<Vec<(i64, WorkflowEvent)>, StoreError>;

    // =========================================================================
    // Task queue
    // =========================================================================

    /// Claim up to `max_tasks` visible tasks of the given activity types
    ///
    /// Claims are atomic: a task is handed to at most one worker. Tasks are
    /// claimed in `visible_at` order, ties broken by enqueue order.
    async fn claim_tasks(
        &self,
        worker_id: &str,
        activity_types: &[String],
        max_tasks: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    /// Claimed tasks whose deadline is before `now`
    async fn timed_out_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    // =========================================================================
    // Timers
    // =========================================================================

    /// Pending timers with `fire_at <= now`, earliest first
    async fn due_timers(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<DueTimer>, StoreError>;

    /// Earliest pending timer deadline
    async fn next_timer_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
}
