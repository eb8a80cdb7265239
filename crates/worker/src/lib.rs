//! Onboarding worker
//!
//! Hosts the [`UserOnboardingWorkflow`](onboarding::UserOnboardingWorkflow)
//! and its activities on top of `steadyrun-durable`.

pub mod config;
pub mod durable_worker;
pub mod onboarding;
pub mod telemetry;

pub use config::{LogFormat, WorkerConfig};
pub use durable_worker::DurableWorker;
