//! Retry policy passed into the request dispatcher.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::MarketDataError;

/// Predicate deciding whether an error may be retried.
pub type RetryPredicate = Arc<dyn Fn(&MarketDataError) -> bool + Send + Sync>;

/// How many times, how long between, and which errors to retry.
///
/// The default retries transient errors (see
/// [`MarketDataError::is_transient`]) up to 3 attempts in total, starting at
/// 1s and doubling up to 30s.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    retryable: RetryPredicate,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            ..Self::default()
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Replace the retryable-error predicate.
    pub fn with_retryable<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&MarketDataError) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, error: &MarketDataError) -> bool {
        (self.retryable)(error)
    }

    /// Whether a request that has made `attempts` attempts and failed with
    /// `error` should go again.
    pub fn should_retry(&self, error: &MarketDataError, attempts: u32) -> bool {
        attempts < self.max_attempts && self.is_retryable(error)
    }

    /// Delay before retry number `attempt` (1-based): exponential, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let delay_nanos = self.initial_backoff.as_nanos() as f64 * factor;
        if !delay_nanos.is_finite() || delay_nanos >= self.max_backoff.as_nanos() as f64 {
            self.max_backoff
        } else {
            Duration::from_nanos(delay_nanos as u64)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            retryable: Arc::new(MarketDataError::is_transient),
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("multiplier", &self.multiplier)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(500));

        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[test]
    fn test_default_retries_only_transient() {
        let policy = RetryPolicy::default();
        let transient = MarketDataError::Timeout {
            provider: "P".to_string(),
        };
        let permanent = MarketDataError::NotFound("X".to_string());

        assert!(policy.should_retry(&transient, 1));
        assert!(policy.should_retry(&transient, 2));
        assert!(!policy.should_retry(&transient, 3));
        assert!(!policy.should_retry(&permanent, 1));
    }

    #[test]
    fn test_custom_predicate() {
        let policy = RetryPolicy::default()
            .with_retryable(|e| matches!(e, MarketDataError::NotFound(_)));
        assert!(policy.should_retry(&MarketDataError::NotFound("X".to_string()), 1));
        assert!(!policy.should_retry(
            &MarketDataError::Timeout {
                provider: "P".to_string()
            },
            1
        ));
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.should_retry(
            &MarketDataError::Timeout {
                provider: "P".to_string()
            },
            1
        ));
    }
}
