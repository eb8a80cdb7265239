//! Activity trait definition

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::ActivityContext;

/// Error type recorded when an attempt exceeds its start-to-close timeout
pub const ACTIVITY_TIMEOUT: &str = "ACTIVITY_TIMEOUT";

/// Where an activity failure came from
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityErrorKind {
    /// The activity returned an error
    #[default]
    Application,
    /// No report arrived within the start-to-close timeout
    Timeout,
}

/// Why an activity attempt failed
///
/// Stored in history as part of `ActivityFailed`, so it must stay
/// serializable. `retryable: false` settles the step on the first failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    pub message: String,

    /// Machine-readable category, matched against a policy's `non_retryable_errors`
    pub error_type: Option<String>,

    pub retryable: bool,

    pub details: Option<serde_json::Value>,

    #[serde(default)]
    pub kind: ActivityErrorKind,
}

impl ActivityError {
    /// Transient failure; the step's retry policy decides what happens next
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
            kind: ActivityErrorKind::Application,
        }
    }

    /// Permanent failure; no further attempts
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::retryable(message)
        }
    }

    /// Timeout of one attempt; retryable
    pub fn timeout(limit: Duration) -> Self {
        Self {
            kind: ActivityErrorKind::Timeout,
            ..Self::retryable(format!(
                "activity did not report within {} ms",
                limit.as_millis()
            ))
            .with_type(ACTIVITY_TIMEOUT)
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ActivityErrorKind::Timeout
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

impl From<anyhow::Error> for ActivityError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

/// Side-effecting step of a workflow, run by a worker
///
/// A step may be attempted more than once (retries, a worker crashing after
/// the side effect but before its report), so implementations should be
/// idempotent. Workflows refer to an activity only by [`Activity::TYPE`].
///
/// ```ignore
/// struct ChargeCard;
///
/// #[async_trait]
/// impl Activity for ChargeCard {
///     const TYPE: &'static str = "charge_card";
///     type Input = ChargeRequest;
///     type Output = ChargeReceipt;
///
///     async fn execute(
///         &self,
///         ctx: &ActivityContext,
///         input: ChargeRequest,
///     ) -> Result<ChargeReceipt, ActivityError> {
///         if input.amount_cents == 0 {
///             return Err(ActivityError::non_retryable("nothing to charge"));
///         }
///         let receipt = gateway::charge(&input, ctx.attempt).await?;
///         Ok(receipt)
///     }
/// }
/// ```
#[async_trait]
pub trait Activity: Send + Sync + 'static {
    /// Name the task queue and registry know this activity by
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send;

    type Output: Serialize + DeserializeOwned + Send;

    async fn execute(
        &self,
        ctx: &ActivityContext,
        input: Self::Input,
    ) -> Result<Self::Output, ActivityError>;
}
