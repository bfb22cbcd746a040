//! Reconnect backoff for bus subscriptions.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const BASE_DELAY_MS: u64 = 100;
const MAX_DELAY_MS: u64 = 5_000;
const MAX_EXPONENT: u32 = 6;
const JITTER_RANGE: u64 = 50;

/// Exponential backoff with a cap and a small deterministic jitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Largest power of two applied to the base delay.
    #[serde(default = "default_max_exponent")]
    pub max_exponent: u32,

    /// Jitter spread in milliseconds.
    #[serde(default = "default_jitter_range")]
    pub jitter_range: u64,

    /// Give up after this many consecutive failures. `None` retries until
    /// the subscription is stopped.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_base_delay_ms() -> u64 {
    BASE_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    MAX_DELAY_MS
}

fn default_max_exponent() -> u32 {
    MAX_EXPONENT
}

fn default_jitter_range() -> u64 {
    JITTER_RANGE
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: BASE_DELAY_MS,
            max_delay_ms: MAX_DELAY_MS,
            max_exponent: MAX_EXPONENT,
            jitter_range: JITTER_RANGE,
            max_retries: None,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (zero-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(self.max_exponent);
        let base_ms = self.base_delay_ms.saturating_mul(2u64.saturating_pow(exp));
        let jitter_ms = u64::from(attempt) % self.jitter_range.max(1) + 1;
        Duration::from_millis(base_ms.saturating_add(jitter_ms).min(self.max_delay_ms))
    }

    /// Whether `failures` consecutive failures exhaust the retry budget.
    #[must_use]
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_retries.is_some_and(|max| failures >= max)
    }
}
