//! Workflow trait definition

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::WorkflowContext;

/// Well-known error codes recorded on failed, timed out and cancelled executions
pub mod error_codes {
    /// Replayed workflow code diverged from the recorded history
    pub const NON_DETERMINISTIC_REPLAY: &str = "NON_DETERMINISTIC_REPLAY";
    /// A durable timer could not be persisted
    pub const TIMER_PERSISTENCE_FAILURE: &str = "TIMER_PERSISTENCE_FAILURE";
    /// Workflow code asked for something the engine rejects
    pub const INVALID_ACTION: &str = "INVALID_ACTION";
    /// Workflow output or input could not be (de)serialized
    pub const SERIALIZATION: &str = "SERIALIZATION";
    /// Execution timeout elapsed
    pub const WORKFLOW_TIMED_OUT: &str = "WORKFLOW_TIMED_OUT";
    /// Caller cancelled the execution
    pub const WORKFLOW_CANCELLED: &str = "WORKFLOW_CANCELLED";
    /// History grew past the executor's event cap
    pub const TOO_MANY_EVENTS: &str = "TOO_MANY_EVENTS";
    /// Stored history cannot be replayed into a context
    pub const CORRUPT_HISTORY: &str = "CORRUPT_HISTORY";
}

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn non_deterministic(message: impl Into<String>) -> Self {
        Self::new(message).with_code(error_codes::NON_DETERMINISTIC_REPLAY)
    }

    pub fn timer_persistence(message: impl Into<String>) -> Self {
        Self::new(message).with_code(error_codes::TIMER_PERSISTENCE_FAILURE)
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self::new(message).with_code(error_codes::WORKFLOW_TIMED_OUT)
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(reason).with_code(error_codes::WORKFLOW_CANCELLED)
    }

    /// Check the error code
    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for WorkflowError {}

/// Why a replay of workflow code stopped before producing an output
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowInterrupt {
    /// Waiting for an activity outcome or timer that is not in history yet
    Suspended,

    /// Workflow code decided to fail the execution
    Failed(WorkflowError),

    /// Workflow code issued a command that contradicts the recorded history
    NonDeterministic(String),
}

impl From<WorkflowError> for WorkflowInterrupt {
    fn from(error: WorkflowError) -> Self {
        Self::Failed(error)
    }
}

/// A workflow is deterministic code driven by its event history
///
/// `run` is called from the top every time the execution advances. Steps whose
/// outcome is already recorded return immediately through the
/// [`WorkflowContext`]; the first step without an outcome returns
/// [`WorkflowInterrupt::Suspended`], which workflow code propagates with `?`.
///
/// # Determinism
///
/// Given the same history, `run` must issue the same sequence of commands.
/// Random values, wall-clock reads and unguarded concurrency are not allowed
/// outside the context primitives.
///
/// # Example
///
/// ```ignore
/// use steadyrun_durable::prelude::*;
///
/// struct GreetWorkflow {
///     input: GreetInput,
/// }
///
/// impl Workflow for GreetWorkflow {
///     const TYPE: &'static str = "greet_workflow";
///     type Input = GreetInput;
///     type Output = GreetOutput;
///
///     fn new(input: Self::Input) -> Self {
///         Self { input }
///     }
///
///     fn run(&self, ctx: &mut WorkflowContext) -> Result<GreetOutput, WorkflowInterrupt> {
///         let sent = ctx
///             .execute_activity("send_greeting", &self.input, ActivityOptions::default())?
///             .is_ok();
///         ctx.sleep(Duration::from_secs(60))?;
///         Ok(GreetOutput { sent })
///     }
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type when workflow completes
    type Output: Serialize + DeserializeOwned + Send;

    /// Create a new workflow instance from its input
    fn new(input: Self::Input) -> Self;

    /// Run the workflow against the history exposed by `ctx`
    fn run(&self, ctx: &mut WorkflowContext) -> Result<Self::Output, WorkflowInterrupt>;
}
