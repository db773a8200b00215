//! Retry policy for transient failures.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Total delivery attempts a job gets before being failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in seconds.
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    /// Ceiling on the backoff, in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Random spread applied to each delay, as a fraction. 0.2 means
    /// plus or minus twenty percent.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_secs() -> u64 {
    60
}

const fn default_max_delay_secs() -> u64 {
    86_400
}

const fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Whether a job that has already consumed `attempts` attempts
    /// gets another one.
    #[must_use]
    pub const fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Backoff before retry number `attempt` (1-based): exponential
    /// doubling from the base delay, capped, with jitter so retries
    /// from a shared incident do not land in lockstep.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let unjittered = self
            .base_delay_secs
            .saturating_mul(1_u64 << shift)
            .min(self.max_delay_secs);

        let jitter = self.jitter.clamp(0.0, 1.0);
        #[allow(clippy::cast_precision_loss, reason = "delays are far below 2^52")]
        let secs = unjittered as f64
            * rand::rng().random_range(1.0 - jitter..=1.0 + jitter);
        Duration::from_secs_f64(secs.max(0.0))
    }
}
