//! Backoff Policy
//!
//! Exponential retry schedule for transient embedding failures.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry schedule: `base_delay × 2^attempt`, capped at `max_delay`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    /// Extra random delay as a fraction of the computed delay (0 disables jitter)
    pub jitter_ratio: f64,
    /// Upper bound for a single delay
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_retries: 3,
            jitter_ratio: 0.0,
            max_delay: Duration::from_secs(120),
        }
    }
}

impl BackoffPolicy {
    /// Creates a policy without jitter
    pub fn new(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_retries,
            ..Self::default()
        }
    }

    /// Sets the jitter ratio
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Sets the delay cap
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before retry number `attempt` (0-based). Pure.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `delay_for(attempt)` plus random jitter. Jitter only ever lengthens the delay.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter_ratio <= 0.0 || !self.jitter_ratio.is_finite() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter_ratio);
        delay + delay.mul_f64(extra)
    }

    /// Total attempts the policy allows
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Serializes `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = BackoffPolicy::new(Duration::from_secs(5), 3);

        assert_eq!(policy.delay_for(0), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(2), Duration::from_secs(20));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy =
            BackoffPolicy::new(Duration::from_secs(5), 10).with_max_delay(Duration::from_secs(30));

        assert_eq!(policy.delay_for(3), Duration::from_secs(30));
        assert_eq!(policy.delay_for(40), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_never_shortens() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 3).with_jitter(0.5);

        for attempt in 0..3 {
            let delay = policy.jittered_delay_for(attempt);
            let base = policy.delay_for(attempt);
            assert!(delay >= base);
            assert!(delay <= base.mul_f64(1.5));
        }
    }

    #[test]
    fn test_policy_serializes_millis() {
        let policy = BackoffPolicy::default();
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["baseDelay"], 5000);
        assert_eq!(json["maxRetries"], 3);

        let parsed: BackoffPolicy = serde_json::from_str(r#"{"baseDelay": 250}"#).unwrap();
        assert_eq!(parsed.base_delay, Duration::from_millis(250));
        assert_eq!(parsed.max_retries, 3);
    }
}
