//! Activity execution context

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::persistence::ClaimedTask;

/// Context provided to activities during execution
///
/// The context provides:
/// - Information about the current execution attempt
/// - The attempt deadline (claim time + start-to-close timeout)
/// - Cancellation detection (worker shutdown)
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext, input: Input) -> Result<Output, ActivityError> {
///     tokio::select! {
///         result = send(input) => result.map_err(ActivityError::from),
///         _ = ctx.cancelled() => Err(ActivityError::retryable("worker shutting down")),
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Task that carries this attempt
    pub task_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed, 0 = unlimited
    pub max_attempts: u32,

    /// Caller-supplied workflow ID
    pub workflow_id: String,

    /// Run that owns this activity
    pub run_id: Uuid,

    /// Activity ID within the run
    pub activity_id: String,

    /// When the attempt times out
    pub deadline: DateTime<Utc>,

    cancellation: CancellationToken,
}

impl ActivityContext {
    /// Create a context for a claimed task
    pub fn new(task: &ClaimedTask, cancellation: CancellationToken) -> Self {
        Self {
            task_id: task.id,
            attempt: task.attempt,
            max_attempts: task.options.retry_policy.max_attempts,
            workflow_id: task.workflow_id.clone(),
            run_id: task.run_id,
            activity_id: task.activity_id.clone(),
            deadline: task.deadline,
            cancellation,
        }
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when cancellation is requested
    ///
    /// This is useful for select! patterns.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.max_attempts != 0 && self.attempt >= self.max_attempts
    }

    /// Time left before the attempt times out
    pub fn remaining(&self) -> Duration {
        (self.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}
