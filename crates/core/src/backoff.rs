//! Exponential backoff with a hard ceiling.

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Delay schedule for consecutive failures of one key: the base doubles per
/// attempt up to the cap. A successful attempt resets the counter upstream,
/// so the next failure starts over at the base delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    /// Controller retry defaults: 5 ms doubling up to 1000 s.
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            cap: Duration::from_secs(1000),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before the given attempt, 1-based. Attempt 0 means "never
    /// failed" and yields no delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(63);
        let factor = 1u128 << shift;
        let nanos = self
            .base
            .as_nanos()
            .saturating_mul(factor)
            .min(self.cap.as_nanos())
            .min(u64::MAX as u128);
        Duration::from_nanos(nanos as u64)
    }
}
