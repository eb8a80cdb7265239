//! Workflow execution engine
//!
//! The engine module provides the `WorkflowExecutor` which replays workflow
//! code against its event history and persists the decisions it makes.

mod executor;
mod registry;

pub use executor::{
    AdvanceResult, ExecutionHandle, ExecutionPage, ExecutorConfig, ExecutorError, ReportOutcome,
    StartRequest, WorkflowExecutor, DEFAULT_NAMESPACE,
};
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
