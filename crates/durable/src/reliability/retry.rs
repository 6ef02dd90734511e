//! Attempt bounds and backoff schedules

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How many times something may run and how long to wait between runs
///
/// The task queue applies it to redeliver failed activities, and DSL `retry`
/// blocks use it as `backoff` between re-invocations. There is no jitter:
/// delays are a pure function of the attempt number, which keeps workflow
/// code that computes them replay safe.
///
/// Durations travel as milliseconds. Every field has a default, so
/// `{"initial_interval": 500, "backoff_coefficient": 2.0}` is a valid policy.
///
/// ```
/// use warden_durable::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::fixed(Duration::from_secs(30), 4);
/// assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
/// assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(30));
/// assert!(!policy.has_attempts_remaining(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    #[serde(default = "one")]
    pub max_attempts: u32,

    /// Wait before the second attempt
    #[serde(with = "millis", default)]
    pub initial_interval: Duration,

    /// Ceiling for a single wait; zero means no ceiling
    #[serde(with = "millis", default)]
    pub max_interval: Duration,

    #[serde(default = "flat")]
    pub backoff_coefficient: f64,
}

fn one() -> u32 {
    1
}

fn flat() -> f64 {
    1.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self::fixed(Duration::ZERO, 1)
    }

    /// Same wait before every retry
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
        }
    }

    /// Doubling waits from 1s up to 60s, five attempts
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
        }
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Wait before `attempt` (1-based); attempt 1 starts immediately
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(retries_before) = attempt.checked_sub(2) else {
            return Duration::ZERO;
        };

        let coefficient = self.backoff_coefficient.max(1.0);
        let exponent = i32::try_from(retries_before).unwrap_or(i32::MAX);
        let mut secs = self.initial_interval.as_secs_f64() * coefficient.powi(exponent);
        if self.is_capped() {
            secs = secs.min(self.max_interval.as_secs_f64());
        }

        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Whether another attempt is allowed after `attempt` finished
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    fn is_capped(&self) -> bool {
        !self.max_interval.is_zero()
    }
}

/// `Duration` as whole milliseconds
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_runs_once() {
        let policy = RetryPolicy::default();
        assert_eq!(policy, RetryPolicy::no_retry());
        assert!(!policy.has_attempts_remaining(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::ZERO);
    }

    #[test]
    fn test_exponential_schedule() {
        let policy = RetryPolicy::exponential();
        let waits: Vec<u64> = (1..=8)
            .map(|attempt| policy.delay_for_attempt(attempt).as_secs())
            .collect();
        assert_eq!(waits, vec![0, 1, 2, 4, 8, 16, 32, 60]);
    }

    #[test]
    fn test_cap_applies_to_late_attempts() {
        let policy = RetryPolicy::exponential().with_max_interval(Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_policy_fills_defaults() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"initial_interval": 1000, "backoff_coefficient": 3.0}"#)
                .unwrap();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.max_interval, Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(27));
    }

    #[test]
    fn test_coefficient_below_one_is_flat() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts": 4, "initial_interval": 2000, "backoff_coefficient": 0.5}"#,
        )
        .unwrap();
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(2));
        assert_eq!(serde_json::to_value(&policy).unwrap()["initial_interval"], 2000);
    }
}
