//! Reliability patterns for durable execution
//!
//! This module provides [`RetryPolicy`], the retry evaluator used for every
//! failed activity attempt.

mod retry;

pub(crate) use retry::duration_millis;
pub use retry::{RetryPolicy, RetryPolicyError};
