//! Replay context handed to workflow code
//!
//! A [`WorkflowContext`] is built from an execution's full history before each
//! run of the workflow code. Every command the code issues (schedule an
//! activity, start a timer) gets a position; the k-th command is matched
//! against the k-th scheduling event in history:
//!
//! - recorded and settled: the outcome is returned immediately
//! - recorded and unsettled: the code suspends
//! - not recorded yet: a new [`WorkflowAction`] is collected and the code suspends
//!   when it asks for the outcome
//!
//! A command that contradicts history is a non-determinism violation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::definition::error_codes;
use super::{ActivityOptions, WorkflowAction, WorkflowError, WorkflowEvent, WorkflowInterrupt};
use crate::activity::ActivityError;

/// Settled outcome of one activity step
pub type ActivityOutcome = Result<serde_json::Value, ActivityFailure>;

/// Why an activity step settled as failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The retry policy ran out of attempts
    RetriesExhausted,
    /// The error was classified as terminal
    NonRetryable,
}

/// Final failure of an activity step, surfaced to workflow code
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityFailure {
    pub activity_id: String,
    pub activity_type: String,

    /// Error reported by the last attempt
    pub error: ActivityError,

    /// Number of attempts made
    pub attempts: u32,

    pub reason: FailureReason,
}

impl fmt::Display for ActivityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "activity {} failed after {} attempt(s): {}",
            self.activity_type, self.attempts, self.error
        )
    }
}

impl std::error::Error for ActivityFailure {}

/// Reference to a scheduled activity, used to ask for its outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityHandle {
    activity_id: String,
    activity_type: String,
}

impl ActivityHandle {
    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    pub fn activity_type(&self) -> &str {
        &self.activity_type
    }
}

/// History that cannot be interpreted at all
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HistoryError {
    #[error("history does not start with workflow_started")]
    MissingStart,

    #[error("event {sequence} references unknown activity {activity_id}")]
    UnknownActivity { sequence: i64, activity_id: String },

    #[error("event {sequence} fires unknown timer {timer_id}")]
    UnknownTimer { sequence: i64, timer_id: String },

    #[error("event {sequence} settles activity {activity_id} twice")]
    DuplicateOutcome { sequence: i64, activity_id: String },
}

/// A scheduling decision as recorded in history
#[derive(Debug, Clone)]
enum RecordedCommand {
    Activity {
        activity_id: String,
        activity_type: String,
    },
    Timer {
        timer_id: String,
    },
}

impl RecordedCommand {
    fn describe(&self) -> String {
        match self {
            Self::Activity { activity_type, .. } => format!("activity {activity_type}"),
            Self::Timer { .. } => "timer".to_string(),
        }
    }
}

/// Deterministic view of an execution's history for one run of workflow code
#[derive(Debug)]
pub struct WorkflowContext {
    workflow_id: String,
    run_id: Uuid,
    recorded: Vec<RecordedCommand>,
    options: HashMap<String, ActivityOptions>,
    outcomes: HashMap<String, ActivityOutcome>,
    fired_timers: HashSet<String>,
    next_command: usize,
    actions: Vec<WorkflowAction>,
    violation: Option<String>,
}

impl WorkflowContext {
    /// Build a context from an execution's events in sequence order
    pub fn from_history(
        workflow_id: impl Into<String>,
        run_id: Uuid,
        events: &[(i64, WorkflowEvent)],
    ) -> Result<Self, HistoryError> {
        if !matches!(events.first(), Some((_, WorkflowEvent::WorkflowStarted { .. }))) {
            return Err(HistoryError::MissingStart);
        }

        let mut ctx = Self {
            workflow_id: workflow_id.into(),
            run_id,
            recorded: Vec::new(),
            options: HashMap::new(),
            outcomes: HashMap::new(),
            fired_timers: HashSet::new(),
            next_command: 0,
            actions: Vec::new(),
            violation: None,
        };

        let mut types: HashMap<String, String> = HashMap::new();
        let mut timers: HashSet<String> = HashSet::new();

        for (sequence, event) in events {
            match event {
                WorkflowEvent::ActivityScheduled {
                    activity_id,
                    activity_type,
                    options,
                    ..
                } => {
                    ctx.recorded.push(RecordedCommand::Activity {
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                    });
                    types.insert(activity_id.clone(), activity_type.clone());
                    ctx.options.insert(activity_id.clone(), options.clone());
                }
                WorkflowEvent::ActivityCompleted {
                    activity_id,
                    result,
                    ..
                } => {
                    ctx.check_unsettled(*sequence, activity_id, &types)?;
                    ctx.outcomes
                        .insert(activity_id.clone(), Ok(result.clone()));
                }
                WorkflowEvent::ActivityFailed {
                    activity_id,
                    attempt,
                    error,
                    will_retry,
                } => {
                    ctx.check_unsettled(*sequence, activity_id, &types)?;
                    if *will_retry {
                        continue;
                    }
                    let retryable_by_policy = ctx
                        .options
                        .get(activity_id)
                        .map(|o| o.retry_policy.should_retry(error.error_type.as_deref()))
                        .unwrap_or(true);
                    let reason = if error.retryable && retryable_by_policy {
                        FailureReason::RetriesExhausted
                    } else {
                        FailureReason::NonRetryable
                    };
                    let failure = ActivityFailure {
                        activity_id: activity_id.clone(),
                        activity_type: types.get(activity_id).cloned().unwrap_or_default(),
                        error: error.clone(),
                        attempts: *attempt,
                        reason,
                    };
                    ctx.outcomes.insert(activity_id.clone(), Err(failure));
                }
                WorkflowEvent::TimerStarted { timer_id, .. } => {
                    ctx.recorded.push(RecordedCommand::Timer {
                        timer_id: timer_id.clone(),
                    });
                    timers.insert(timer_id.clone());
                }
                WorkflowEvent::TimerFired { timer_id } => {
                    if !timers.contains(timer_id) {
                        return Err(HistoryError::UnknownTimer {
                            sequence: *sequence,
                            timer_id: timer_id.clone(),
                        });
                    }
                    ctx.fired_timers.insert(timer_id.clone());
                }
                _ => {}
            }
        }

        Ok(ctx)
    }

    fn check_unsettled(
        &self,
        sequence: i64,
        activity_id: &str,
        types: &HashMap<String, String>,
    ) -> Result<(), HistoryError> {
        if !types.contains_key(activity_id) {
            return Err(HistoryError::UnknownActivity {
                sequence,
                activity_id: activity_id.to_string(),
            });
        }
        if self.outcomes.contains_key(activity_id) {
            return Err(HistoryError::DuplicateOutcome {
                sequence,
                activity_id: activity_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// True while workflow code is re-issuing commands already in history
    ///
    /// Use it to avoid logging the same step on every advance.
    pub fn is_replaying(&self) -> bool {
        self.next_command < self.recorded.len()
    }

    /// Schedule an activity, or re-attach to the one recorded at this position
    pub fn schedule_activity<I>(
        &mut self,
        activity_type: &str,
        input: &I,
        options: ActivityOptions,
    ) -> Result<ActivityHandle, WorkflowInterrupt>
    where
        I: Serialize + ?Sized,
    {
        self.ensure_consistent()?;

        let position = self.next_command;
        self.next_command += 1;

        match self.recorded.get(position) {
            Some(RecordedCommand::Activity {
                activity_id,
                activity_type: recorded_type,
            }) if recorded_type == activity_type => Ok(ActivityHandle {
                activity_id: activity_id.clone(),
                activity_type: recorded_type.clone(),
            }),
            Some(recorded) => {
                let recorded = recorded.describe();
                Err(self.diverged(position, &recorded, &format!("activity {activity_type}")))
            }
            None => {
                let input = serde_json::to_value(input).map_err(|e| {
                    WorkflowInterrupt::Failed(
                        WorkflowError::new(format!(
                            "failed to serialize input for {activity_type}: {e}"
                        ))
                        .with_code(error_codes::SERIALIZATION),
                    )
                })?;
                let activity_id = format!("{activity_type}-{position}");
                self.actions.push(WorkflowAction::schedule_activity(
                    activity_id.clone(),
                    activity_type,
                    input,
                    options,
                ));
                Ok(ActivityHandle {
                    activity_id,
                    activity_type: activity_type.to_string(),
                })
            }
        }
    }

    /// Outcome of a scheduled activity, or `Suspended` if it has not settled
    pub fn result(&self, handle: &ActivityHandle) -> Result<ActivityOutcome, WorkflowInterrupt> {
        self.ensure_consistent()?;
        self.outcomes
            .get(&handle.activity_id)
            .cloned()
            .ok_or(WorkflowInterrupt::Suspended)
    }

    /// Schedule an activity and wait for its settled outcome
    pub fn execute_activity<I>(
        &mut self,
        activity_type: &str,
        input: &I,
        options: ActivityOptions,
    ) -> Result<ActivityOutcome, WorkflowInterrupt>
    where
        I: Serialize + ?Sized,
    {
        let handle = self.schedule_activity(activity_type, input, options)?;
        self.result(&handle)
    }

    /// Wait until every branch of a fan-out has settled
    ///
    /// Outcomes are returned in the order of `handles`, whatever order the
    /// branches settled in. A failed branch never short-circuits its siblings.
    pub fn join_all(
        &self,
        handles: &[ActivityHandle],
    ) -> Result<Vec<ActivityOutcome>, WorkflowInterrupt> {
        self.ensure_consistent()?;
        handles
            .iter()
            .map(|handle| {
                self.outcomes
                    .get(&handle.activity_id)
                    .cloned()
                    .ok_or(WorkflowInterrupt::Suspended)
            })
            .collect()
    }

    /// Durable sleep; suspends until the timer at this position has fired
    pub fn sleep(&mut self, duration: Duration) -> Result<(), WorkflowInterrupt> {
        self.ensure_consistent()?;

        let position = self.next_command;
        self.next_command += 1;

        match self.recorded.get(position) {
            Some(RecordedCommand::Timer { timer_id }) => {
                if self.fired_timers.contains(timer_id) {
                    Ok(())
                } else {
                    Err(WorkflowInterrupt::Suspended)
                }
            }
            Some(recorded) => {
                let recorded = recorded.describe();
                Err(self.diverged(position, &recorded, "timer"))
            }
            None => {
                self.actions
                    .push(WorkflowAction::timer(format!("timer-{position}"), duration));
                Err(WorkflowInterrupt::Suspended)
            }
        }
    }

    /// Commands issued so far this run
    pub fn commands_issued(&self) -> usize {
        self.next_command
    }

    /// Record that workflow code stopped; flags commands it skipped
    ///
    /// A run that ends having re-issued fewer commands than history records
    /// took a different path than the run that produced the history.
    pub fn finish(&mut self) {
        if self.violation.is_none() && self.next_command < self.recorded.len() {
            self.violation = Some(format!(
                "workflow code issued {} command(s) but history records {}",
                self.next_command,
                self.recorded.len()
            ));
        }
    }

    /// Non-determinism detected during this run, if any
    pub fn violation(&self) -> Option<&str> {
        self.violation.as_deref()
    }

    /// New decisions collected during this run
    pub fn into_actions(self) -> Vec<WorkflowAction> {
        self.actions
    }

    fn ensure_consistent(&self) -> Result<(), WorkflowInterrupt> {
        match &self.violation {
            Some(message) => Err(WorkflowInterrupt::NonDeterministic(message.clone())),
            None => Ok(()),
        }
    }

    fn diverged(&mut self, position: usize, recorded: &str, issued: &str) -> WorkflowInterrupt {
        let message = format!(
            "command {position}: history recorded {recorded} but workflow code issued {issued}"
        );
        self.violation = Some(message.clone());
        WorkflowInterrupt::NonDeterministic(message)
    }
}
