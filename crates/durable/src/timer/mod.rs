//! Durable timers
//!
//! Timers are persisted with their `fire_at` instant in the same write as the
//! `timer_started` event, so they survive restarts. The [`TimerService`]
//! fires due timers and closes executions past their execution timeout.

mod service;

pub use service::{SweepReport, TimerService, TimerServiceConfig};
