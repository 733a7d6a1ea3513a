//! Retry policy for transient connection failures.
//!
//! Only failures the transport classifies as connection-level are retried.
//! HTTP status codes, including 5xx, are answers and go back to the caller
//! untouched.

use std::time::Duration;

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// How many times to retry a request and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retries: u32,
    /// Base of the exponential backoff, in seconds.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff_factor: f64) -> Self {
        Self {
            retries,
            backoff_factor,
        }
    }

    /// Same backoff, different retry count. Used for per-call overrides.
    #[must_use]
    pub fn with_retries(self, retries: u32) -> Self {
        Self { retries, ..self }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Sleep before the `retry`-th retry (1-based): `factor * 2^(retry - 1)`.
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 || self.backoff_factor.is_nan() || self.backoff_factor <= 0.0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let secs = self.backoff_factor * 2f64.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_include_the_first_try() {
        assert_eq!(RetryPolicy::new(0, 0.2).max_attempts(), 1);
        assert_eq!(RetryPolicy::new(5, 0.2).max_attempts(), 6);
        assert_eq!(RetryPolicy::new(u32::MAX, 0.2).max_attempts(), u32::MAX);
    }

    #[test]
    fn delays_grow_exponentially() {
        let policy = RetryPolicy::new(5, 0.5);
        let delays: Vec<Duration> = (1..=4).map(|n| policy.delay(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
            ]
        );
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy::new(40, 1.0);
        assert_eq!(policy.delay(30), MAX_BACKOFF);
        assert_eq!(policy.delay(u32::MAX), MAX_BACKOFF);
    }

    #[test]
    fn zero_factor_never_sleeps() {
        let policy = RetryPolicy::new(3, 0.0);
        assert_eq!(policy.delay(3), Duration::ZERO);
    }

    #[test]
    fn override_keeps_backoff() {
        let policy = RetryPolicy::new(3, 0.7).with_retries(9);
        assert_eq!(policy, RetryPolicy::new(9, 0.7));
    }
}
