//! Exponential backoff between fetch attempts
//!
//! **Backoff Strategy:**
//! - Delay after the first failed attempt: `base`
//! - Multiplier: 2.0 (exponential)
//! - Every delay is capped at `cap`

use std::time::Duration;

/// Delay schedule for retries of one logical fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay to wait after `failed_attempt` (1-based) before the next try
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Like [`delay_for`](Self::delay_for) but never shorter than a server
    /// supplied `Retry-After`; the cap still applies
    pub fn delay_with_hint(&self, failed_attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay_for(failed_attempt);
        match retry_after {
            Some(hint) => delay.max(hint).min(self.cap),
            None => delay,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), Duration::from_millis(30_000))
    }
}
