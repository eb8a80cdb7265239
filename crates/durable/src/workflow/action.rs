//! Decisions collected from one replay, and per-step activity options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::WorkflowError;
use crate::reliability::{duration_millis, RetryPolicy};

/// What a replay wants done next
///
/// Each action becomes one [`WorkflowEvent`](super::WorkflowEvent); schedule
/// and timer actions also carry a task or timer row into the same append.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    ScheduleActivity {
        /// `"{activity_type}-{k}"` for the k-th command of the run
        activity_id: String,
        activity_type: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },

    StartTimer {
        /// `"timer-{k}"` for the k-th command of the run
        timer_id: String,
        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    CompleteWorkflow { result: serde_json::Value },

    FailWorkflow { error: WorkflowError },
}

impl WorkflowAction {
    pub fn schedule_activity(
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        input: serde_json::Value,
        options: ActivityOptions,
    ) -> Self {
        Self::ScheduleActivity {
            activity_id: activity_id.into(),
            activity_type: activity_type.into(),
            input,
            options,
        }
    }

    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }

    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    /// Closes the execution once appended
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. } | Self::FailWorkflow { .. }
        )
    }
}

/// How one workflow step invokes its activity
///
/// The timeout bounds a single attempt, from claim to report. The retry
/// policy decides whether a failed attempt is followed by another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityOptions {
    pub retry_policy: RetryPolicy,

    #[serde(with = "duration_millis")]
    pub start_to_close_timeout: Duration,
}

impl Default for ActivityOptions {
    /// Five minutes per attempt, default retry policy
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: Duration::from_secs(300),
        }
    }
}

impl ActivityOptions {
    pub fn new(start_to_close_timeout: Duration) -> Self {
        Self {
            start_to_close_timeout,
            ..Self::default()
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }
}
