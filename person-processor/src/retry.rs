//! # Retry
//!
//! Backoff policy applied to transient pipeline step failures.
use std::time;

#[derive(Clone, Debug, PartialEq)]
/// How many times a step is attempted and how long to wait between attempts.
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval before the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<time::Duration>,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Whether another attempt is allowed after `attempt` attempts have failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Interval to wait after the given failed attempt (1-based) before the next one.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let factor = self
            .backoff_coefficient
            .saturating_pow(attempt.saturating_sub(1));
        let candidate_interval = self.initial_interval.saturating_mul(factor);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub max_attempts: u32,
    pub backoff_coefficient: u32,
    pub initial_interval: time::Duration,
    pub maximum_interval: Option<time::Duration>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(100),
            maximum_interval: Some(time::Duration::from_secs(5)),
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn max_attempts(mut self, attempts: u32) -> RetryPolicyBuilder {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_retry_interval() {
        let retry_policy = RetryPolicy::build(1, time::Duration::from_secs(2)).provide();
        let first_interval = retry_policy.retry_interval(1);
        let second_interval = retry_policy.retry_interval(2);
        let third_interval = retry_policy.retry_interval(3);

        assert_eq!(first_interval, time::Duration::from_secs(2));
        assert_eq!(second_interval, time::Duration::from_secs(2));
        assert_eq!(third_interval, time::Duration::from_secs(2));
    }

    #[test]
    fn test_retry_interval_grows_exponentially() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_millis(100)).provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_millis(100));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_millis(200));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_millis(400));
    }

    #[test]
    fn test_retry_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_secs(1))
            .maximum_interval(time::Duration::from_secs(4))
            .provide();

        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(4), time::Duration::from_secs(4));
        assert_eq!(retry_policy.retry_interval(40), time::Duration::from_secs(4));
    }

    #[test]
    fn test_should_retry_respects_attempt_budget() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_millis(1))
            .max_attempts(3)
            .provide();

        assert!(retry_policy.should_retry(1));
        assert!(retry_policy.should_retry(2));
        assert!(!retry_policy.should_retry(3));
    }

    #[test]
    fn test_zero_attempts_is_clamped_to_one() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_millis(1))
            .max_attempts(0)
            .provide();

        assert_eq!(retry_policy.max_attempts, 1);
        assert!(!retry_policy.should_retry(1));
    }
}
