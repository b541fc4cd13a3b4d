//! Two-tier reconnect schedule.
//!
//! The first few consecutive failures retry quickly at a fixed delay to
//! ride out brief blips. Past that the delay doubles per failure up to a
//! cap, plus up to 10% random jitter so a fleet of clients does not
//! reconnect in lockstep.

use rand::Rng;
use std::time::Duration;

const MAX_EXPONENT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTier {
    Fast,
    Backoff,
}

impl RetryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Backoff => "backoff",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub fast_retry_count: u32,
    pub fast_retry_delay: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the jitter as a fraction of the backoff delay.
    pub jitter_ratio: f64,
    /// Connection attempts allowed per `attempt_window` (0 = unlimited).
    pub attempt_limit: u32,
    pub attempt_window: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            fast_retry_count: 3,
            fast_retry_delay: Duration::from_millis(500),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_ratio: 0.1,
            attempt_limit: 150,
            attempt_window: Duration::from_secs(600),
        }
    }
}

impl ReconnectPolicy {
    /// Tier for the `failures`-th consecutive failure (1-based).
    pub fn tier(&self, failures: u32) -> RetryTier {
        if failures <= self.fast_retry_count {
            RetryTier::Fast
        } else {
            RetryTier::Backoff
        }
    }

    /// Deterministic part of the delay: `min(base * 2^n, max)` where `n`
    /// counts failures past the fast tier, starting at zero.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        match self.tier(failures) {
            RetryTier::Fast => self.fast_retry_delay,
            RetryTier::Backoff => {
                let exponent = (failures - self.fast_retry_count - 1).min(MAX_EXPONENT);
                self.base_delay
                    .saturating_mul(1u32 << exponent)
                    .min(self.max_delay)
            }
        }
    }

    /// Full delay including jitter, drawn from `rng`.
    pub fn delay_with<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let delay = self.backoff_delay(failures);
        if self.tier(failures) == RetryTier::Fast || self.jitter_ratio <= 0.0 {
            return delay;
        }
        let jitter_max_ms = (delay.as_millis() as f64 * self.jitter_ratio) as u64;
        delay + Duration::from_millis(rng.gen_range(0..=jitter_max_ms))
    }

    pub fn delay(&self, failures: u32) -> Duration {
        self.delay_with(failures, &mut rand::thread_rng())
    }
}
