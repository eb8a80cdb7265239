//! Worker pool for task execution
//!
//! This module provides:
//! - [`WorkerPool`] - Runs claimed activity attempts with bounded concurrency
//! - [`TaskPoller`] - Claims visible tasks with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌─────────────┐              ┌──────────────────────────┐  │
//! │  │ TaskPoller  │              │  Expired-attempt sweep   │  │
//! │  │  (polling)  │              │  (start-to-close timer)  │  │
//! │  └──────┬──────┘              └──────────────────────────┘  │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │         Attempt runner (Semaphore-limited)          │    │
//! │  │  [Task 1] [Task 2] [Task 3] ... [Task N]            │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  WorkflowExecutor::complete_activity / fail_activity        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use steadyrun_durable::worker::{WorkerPool, WorkerPoolConfig};
//!
//! let mut activities = ActivityRegistry::new();
//! activities.register_fn("process_order", |_ctx, input| async move {
//!     Ok(json!({ "status": "completed", "order": input }))
//! });
//!
//! let config = WorkerPoolConfig::new("orders").with_max_concurrency(20);
//! let pool = WorkerPool::new(executor, activities, config);
//! pool.start()?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

mod poller;
mod pool;

pub use poller::{PollerConfig, PollerError, TaskPoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
