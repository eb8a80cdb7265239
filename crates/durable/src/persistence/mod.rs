//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowEventStore`] trait for execution, history, task and timer persistence
//! - [`InMemoryWorkflowEventStore`] for testing
//! - [`PostgresWorkflowEventStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowEventStore;
pub use postgres::PostgresWorkflowEventStore;
pub use store::{
    instant_after, ClaimedTask, DueTimer, ExecutionInfo, HistoryAppend, NewExecution, Pagination,
    StoreError, TaskDefinition, TaskStatus, TaskTransition, TimerDefinition, TimerStatus,
    WorkflowEventStore, WorkflowStatus,
};
