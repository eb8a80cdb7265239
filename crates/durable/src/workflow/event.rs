//! Workflow events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ActivityOptions, WorkflowError};
use crate::activity::ActivityError;
use crate::persistence::WorkflowStatus;

/// Events stored in an execution's history
///
/// These events form the append-only log for one workflow run. They are used for:
/// - Persisting workflow progress
/// - Replaying workflow code after recovery
/// - Auditing and debugging
///
/// Events are immutable once written. Workflow state is never stored; it is
/// reconstructed by replaying all events in sequence order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// Workflow was started with the given input
    WorkflowStarted {
        /// Registered workflow type
        workflow_type: String,

        /// The input provided when starting the workflow
        input: serde_json::Value,
    },

    /// Workflow completed successfully
    WorkflowCompleted {
        /// The result value
        result: serde_json::Value,
    },

    /// Workflow failed with an error
    WorkflowFailed {
        /// Error details
        error: WorkflowError,
    },

    /// Workflow exceeded its execution timeout
    WorkflowTimedOut {
        /// Error details
        error: WorkflowError,
    },

    /// Workflow was cancelled by a caller
    WorkflowCancelled {
        /// Reason for cancellation
        reason: String,
    },

    // =========================================================================
    // Activity Lifecycle Events
    // =========================================================================
    /// Activity was scheduled for execution
    ActivityScheduled {
        /// Deterministic activity identifier within the run
        activity_id: String,

        /// Registered activity name
        activity_type: String,

        /// Input for the activity
        input: serde_json::Value,

        /// Retry policy and timeout
        options: ActivityOptions,
    },

    /// Activity completed successfully
    ActivityCompleted {
        activity_id: String,

        /// Attempt that produced the result
        attempt: u32,

        /// Result value
        result: serde_json::Value,
    },

    /// One activity attempt failed
    ///
    /// `will_retry = false` marks the final failure that settles the step.
    ActivityFailed {
        activity_id: String,

        /// Attempt that failed (1-based)
        attempt: u32,

        /// Error details
        error: ActivityError,

        /// Whether another attempt was enqueued
        will_retry: bool,
    },

    // =========================================================================
    // Timer Events
    // =========================================================================
    /// Durable timer was started
    TimerStarted {
        timer_id: String,

        /// Absolute deadline, fixed when the timer is first recorded
        fire_at: DateTime<Utc>,
    },

    /// Timer fired
    TimerFired { timer_id: String },
}

impl WorkflowEvent {
    /// Short event name, used as the event_type column
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowTimedOut { .. } => "workflow_timed_out",
            Self::WorkflowCancelled { .. } => "workflow_cancelled",
            Self::ActivityScheduled { .. } => "activity_scheduled",
            Self::ActivityCompleted { .. } => "activity_completed",
            Self::ActivityFailed { .. } => "activity_failed",
            Self::TimerStarted { .. } => "timer_started",
            Self::TimerFired { .. } => "timer_fired",
        }
    }

    /// Get the activity ID if this is an activity event
    pub fn activity_id(&self) -> Option<&str> {
        match self {
            Self::ActivityScheduled { activity_id, .. }
            | Self::ActivityCompleted { activity_id, .. }
            | Self::ActivityFailed { activity_id, .. } => Some(activity_id),
            _ => None,
        }
    }

    /// Check if this is a terminal workflow event
    pub fn is_terminal(&self) -> bool {
        self.terminal_status().is_some()
    }

    /// Status an execution moves to when this event is appended
    pub fn terminal_status(&self) -> Option<WorkflowStatus> {
        match self {
            Self::WorkflowCompleted { .. } => Some(WorkflowStatus::Completed),
            Self::WorkflowFailed { .. } => Some(WorkflowStatus::Failed),
            Self::WorkflowTimedOut { .. } => Some(WorkflowStatus::TimedOut),
            Self::WorkflowCancelled { .. } => Some(WorkflowStatus::Cancelled),
            _ => None,
        }
    }

    /// Error recorded on the execution by a terminal event
    pub fn terminal_error(&self) -> Option<WorkflowError> {
        match self {
            Self::WorkflowFailed { error } | Self::WorkflowTimedOut { error } => {
                Some(error.clone())
            }
            Self::WorkflowCancelled { reason } => Some(WorkflowError::cancelled(reason)),
            _ => None,
        }
    }

    /// Result recorded on the execution by a terminal event
    pub fn terminal_result(&self) -> Option<serde_json::Value> {
        match self {
            Self::WorkflowCompleted { result } => Some(result.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_workflow_event_serialization() {
        let event = WorkflowEvent::WorkflowStarted {
            workflow_type: "onboarding".to_string(),
            input: json!({"user_id": "42"}),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"workflow_started\""));

        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_timer_event_keeps_deadline() {
        let fire_at = Utc::now();
        let event = WorkflowEvent::TimerStarted {
            timer_id: "timer-4".to_string(),
            fire_at,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "timer_started");

        let parsed: WorkflowEvent = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_event_type_matches_serde_tag() {
        let events = vec![
            WorkflowEvent::WorkflowCancelled {
                reason: "user request".into(),
            },
            WorkflowEvent::ActivityFailed {
                activity_id: "send_email-0".into(),
                attempt: 2,
                error: ActivityError::retryable("smtp down"),
                will_retry: true,
            },
            WorkflowEvent::TimerFired {
                timer_id: "timer-1".into(),
            },
        ];

        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["type"], event.event_type());
        }
    }

    #[test]
    fn test_activity_id_extraction() {
        let event = WorkflowEvent::ActivityCompleted {
            activity_id: "my-activity".to_string(),
            attempt: 1,
            result: json!({}),
        };
        assert_eq!(event.activity_id(), Some("my-activity"));

        let timer = WorkflowEvent::TimerFired {
            timer_id: "timer-0".to_string(),
        };
        assert_eq!(timer.activity_id(), None);
    }

    #[test]
    fn test_terminal_events() {
        assert_eq!(
            WorkflowEvent::WorkflowCompleted { result: json!({}) }.terminal_status(),
            Some(WorkflowStatus::Completed)
        );
        assert_eq!(
            WorkflowEvent::WorkflowTimedOut {
                error: WorkflowError::timed_out("deadline passed")
            }
            .terminal_status(),
            Some(WorkflowStatus::TimedOut)
        );

        let cancelled = WorkflowEvent::WorkflowCancelled {
            reason: "operator".to_string(),
        };
        assert!(cancelled.is_terminal());
        assert_eq!(
            cancelled.terminal_error().map(|e| e.code),
            Some(Some(crate::workflow::error_codes::WORKFLOW_CANCELLED.to_string()))
        );

        assert!(!WorkflowEvent::TimerFired {
            timer_id: "t".to_string()
        }
        .is_terminal());
    }
}
