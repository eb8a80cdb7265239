//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activity::ActivityError;

/// Configuration for activity retries
///
/// Delays grow exponentially from `initial_interval` by `backoff_coefficient`
/// and are capped at `max_interval`. `max_attempts` counts the initial
/// attempt; `0` means unlimited.
///
/// # Example
///
/// ```
/// use steadyrun_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(3)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(100));
///
/// assert_eq!(policy.next_delay(1), Some(Duration::from_secs(1)));
/// assert_eq!(policy.next_delay(2), Some(Duration::from_secs(2)));
/// assert_eq!(policy.next_delay(3), None);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial), 0 = unlimited
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier, must be >= 1.0
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness. The jittered delay is still
    /// capped at `max_interval`.
    #[serde(default)]
    pub jitter: f64,

    /// Error types that should NOT be retried
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

/// Invalid retry policy parameters
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetryPolicyError {
    #[error("backoff coefficient must be >= 1.0, got {0}")]
    InvalidBackoffCoefficient(f64),

    #[error("max interval ({max:?}) is shorter than initial interval ({initial:?})")]
    MaxIntervalTooShort { initial: Duration, max: Duration },

    #[error("jitter must be within 0.0..=1.0, got {0}")]
    InvalidJitter(f64),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy with sensible defaults
    ///
    /// - 5 max attempts
    /// - 1 second initial interval
    /// - 100 second max interval
    /// - 2x backoff coefficient
    /// - no jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(100),
            backoff_coefficient: 2.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Set the maximum number of attempts (0 = unlimited)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Add a non-retryable error type
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Whether the policy retries forever
    pub fn is_unlimited(&self) -> bool {
        self.max_attempts == 0
    }

    /// Check the policy parameters
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err(RetryPolicyError::InvalidBackoffCoefficient(
                self.backoff_coefficient,
            ));
        }
        if self.max_interval < self.initial_interval {
            return Err(RetryPolicyError::MaxIntervalTooShort {
                initial: self.initial_interval,
                max: self.max_interval,
            });
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(RetryPolicyError::InvalidJitter(self.jitter));
        }
        Ok(())
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based)
    ///
    /// Returns `None` once the attempt budget is spent. Otherwise the delay is
    /// `min(initial_interval * backoff_coefficient^(attempt-1), max_interval)`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.has_attempts_remaining(attempt) {
            return None;
        }

        let exponent = attempt.max(1) - 1;
        let max_secs = self.max_interval.as_secs_f64();
        let base = self.initial_interval.as_secs_f64()
            * self
                .backoff_coefficient
                .max(1.0)
                .powi(exponent.min(i32::MAX as u32) as i32);
        let capped = if base.is_finite() { base.min(max_secs) } else { max_secs };

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).clamp(0.0, max_secs)
        } else {
            capped
        };

        Some(Duration::try_from_secs_f64(jittered).unwrap_or(self.max_interval))
    }

    /// Delay before retrying after `error`, or `None` if the failure is final
    ///
    /// Errors the activity marked non-retryable, or whose type is listed in
    /// `non_retryable_errors`, are never retried.
    pub fn next_delay_for(&self, attempt: u32, error: &ActivityError) -> Option<Duration> {
        if !error.retryable || !self.should_retry(error.error_type.as_deref()) {
            return None;
        }
        self.next_delay(attempt)
    }

    /// Check if an error type should be retried
    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        match error_type {
            Some(error_type) => !self.non_retryable_errors.iter().any(|e| e == error_type),
            None => true,
        }
    }

    /// Check if there are remaining attempts after `current_attempt`
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        self.is_unlimited() || current_attempt < self.max_attempts
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.max_interval, Duration::from_secs(100));
        assert_eq!(policy.backoff_coefficient, 2.0);
        assert_eq!(policy.jitter, 0.0);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.next_delay(1), None);
    }

    #[test]
    fn test_first_retry_uses_initial_interval() {
        let policy = RetryPolicy::exponential().with_initial_interval(Duration::from_millis(250));
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_next_delay_grows_exponentially() {
        let policy = RetryPolicy::exponential().with_max_attempts(0);

        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.next_delay(4), Some(Duration::from_secs(8)));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(0)
            .with_max_interval(Duration::from_secs(5));

        assert_eq!(policy.next_delay(10), Some(Duration::from_secs(5)));
        assert_eq!(policy.next_delay(10_000), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_bounded_attempts() {
        let policy = RetryPolicy::exponential().with_max_attempts(3);

        assert!(policy.next_delay(1).is_some());
        assert!(policy.next_delay(2).is_some());
        assert_eq!(policy.next_delay(3), None);
        assert_eq!(policy.next_delay(4), None);
    }

    #[test]
    fn test_unlimited_attempts() {
        let policy = RetryPolicy::exponential().with_max_attempts(0);
        assert!(policy.is_unlimited());
        assert!(policy.next_delay(1_000_000).is_some());
    }

    #[test]
    fn test_next_delay_monotonic_until_capped() {
        let cases = [
            (Duration::from_millis(100), 1.0, Duration::from_secs(1)),
            (Duration::from_millis(100), 1.5, Duration::from_secs(30)),
            (Duration::from_secs(1), 2.0, Duration::from_secs(100)),
            (Duration::from_secs(3), 7.25, Duration::from_secs(3600)),
        ];

        for (initial, coefficient, max) in cases {
            let policy = RetryPolicy::exponential()
                .with_max_attempts(40)
                .with_initial_interval(initial)
                .with_backoff_coefficient(coefficient)
                .with_max_interval(max);

            let mut previous = Duration::ZERO;
            for attempt in 1..40 {
                let delay = policy.next_delay(attempt).expect("attempts remain");
                assert!(delay >= previous, "delay shrank at attempt {attempt}");
                assert!(delay <= max);
                previous = delay;
            }
            assert_eq!(policy.next_delay(40), None);
        }
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);

        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(5)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_secs(5)));
        assert_eq!(policy.next_delay(3), None);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(0)
            .with_jitter(0.5)
            .with_max_interval(Duration::from_secs(10));

        for _ in 0..100 {
            let delay = policy.next_delay(3).expect("unlimited");
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(6));
        }
    }

    #[test]
    fn test_non_retryable_errors() {
        let policy = RetryPolicy::exponential()
            .with_non_retryable_error("INVALID_INPUT")
            .with_non_retryable_error("NOT_FOUND");

        assert!(!policy.should_retry(Some("INVALID_INPUT")));
        assert!(!policy.should_retry(Some("NOT_FOUND")));
        assert!(policy.should_retry(Some("TIMEOUT")));
        assert!(policy.should_retry(None));
    }

    #[test]
    fn test_next_delay_for_classified_errors() {
        let policy = RetryPolicy::exponential().with_non_retryable_error("INVALID_INPUT");

        let transient = ActivityError::retryable("smtp unavailable");
        assert_eq!(policy.next_delay_for(1, &transient), Some(Duration::from_secs(1)));

        let terminal = ActivityError::non_retryable("mailbox does not exist");
        assert_eq!(policy.next_delay_for(1, &terminal), None);

        let listed = ActivityError::retryable("bad address").with_type("INVALID_INPUT");
        assert_eq!(policy.next_delay_for(1, &listed), None);
    }

    #[test]
    fn test_validate_rejects_bad_parameters() {
        assert_eq!(
            RetryPolicy::exponential()
                .with_backoff_coefficient(0.5)
                .validate(),
            Err(RetryPolicyError::InvalidBackoffCoefficient(0.5))
        );
        assert!(RetryPolicy::exponential()
            .with_backoff_coefficient(f64::NAN)
            .validate()
            .is_err());
        assert!(matches!(
            RetryPolicy::exponential()
                .with_initial_interval(Duration::from_secs(10))
                .with_max_interval(Duration::from_secs(1))
                .validate(),
            Err(RetryPolicyError::MaxIntervalTooShort { .. })
        ));
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(10)
            .with_non_retryable_error("TEST");

        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["initial_interval"], 1000);
        assert_eq!(json["max_interval"], 100_000);

        let parsed: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(policy, parsed);
    }
}
