//! # Durable Execution Engine
//!
//! A workflow orchestration engine for long-lived, multi-step processes that
//! survive worker crashes and restarts.
//!
//! ## Features
//!
//! - **Event-sourced workflows**: every decision and outcome is an event; state is rebuilt by replay
//! - **Automatic retries**: per-activity retry policies with exponential backoff
//! - **Durable timers**: sleeps of hours or days that fire exactly once, across restarts
//! - **Fan-out/join**: schedule activities in parallel and wait for all of them
//! - **Distributed task queue**: atomic claims with start-to-close timeouts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                        │
//! │  (replays workflow code against history, records decisions) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowEventStore                         │
//! │  (PostgreSQL or in-memory: executions, events, tasks,       │
//! │   timers)                                                   │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                               │
//!                 ▼                               ▼
//! ┌───────────────────────────────┐ ┌───────────────────────────┐
//! │          WorkerPool           │ │       TimerService        │
//! │  (claims tasks, runs          │ │  (fires due timers, times │
//! │   activities, reports back)   │ │   out executions)         │
//! └───────────────────────────────┘ └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use steadyrun_durable::prelude::*;
//!
//! struct ReminderWorkflow {
//!     input: ReminderInput,
//! }
//!
//! impl Workflow for ReminderWorkflow {
//!     const TYPE: &'static str = "reminder_workflow";
//!     type Input = ReminderInput;
//!     type Output = bool;
//!
//!     fn new(input: Self::Input) -> Self {
//!         Self { input }
//!     }
//!
//!     fn run(&self, ctx: &mut WorkflowContext) -> Result<bool, WorkflowInterrupt> {
//!         ctx.sleep(Duration::from_secs(24 * 60 * 60))?;
//!         let sent = ctx
//!             .execute_activity("send_reminder", &self.input, ActivityOptions::default())?
//!             .is_ok();
//!         Ok(sent)
//!     }
//! }
//! ```

pub mod activity;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod timer;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
    pub use crate::engine::{
        ExecutionHandle, ExecutorConfig, ExecutorError, StartRequest, WorkflowExecutor,
        WorkflowRegistry,
    };
    pub use crate::persistence::{
        ClaimedTask, ExecutionInfo, InMemoryWorkflowEventStore, PostgresWorkflowEventStore,
        StoreError, WorkflowEventStore, WorkflowStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::timer::{TimerService, TimerServiceConfig};
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::workflow::{
        ActivityOptions, ActivityOutcome, Workflow, WorkflowAction, WorkflowContext,
        WorkflowError, WorkflowEvent, WorkflowInterrupt,
    };
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
pub use engine::{ExecutorConfig, ExecutorError, StartRequest, WorkflowExecutor, WorkflowRegistry};
pub use persistence::{
    InMemoryWorkflowEventStore, PostgresWorkflowEventStore, StoreError, WorkflowEventStore,
    WorkflowStatus,
};
pub use reliability::RetryPolicy;
pub use timer::{TimerService, TimerServiceConfig};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{
    ActivityOptions, Workflow, WorkflowAction, WorkflowContext, WorkflowError, WorkflowEvent,
    WorkflowInterrupt,
};
