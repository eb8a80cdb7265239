//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining replayable workflow code
//! - [`WorkflowContext`] for scheduling activities and timers during replay
//! - [`WorkflowAction`] enum for decisions produced by a replay
//! - [`WorkflowEvent`] enum for persisted history

mod action;
mod context;
mod definition;
mod event;

pub use action::{ActivityOptions, WorkflowAction};
pub use context::{
    ActivityFailure, ActivityHandle, ActivityOutcome, FailureReason, HistoryError,
    WorkflowContext,
};
pub use definition::{error_codes, Workflow, WorkflowError, WorkflowInterrupt};
pub use event::WorkflowEvent;
