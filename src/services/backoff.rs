//! Retry backoff
//!
//! Exponential backoff with full jitter:
//! `delay = random(0, min(max, base * 2^(attempt - 1)))`

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Exponent cap so `2^exp` never overflows before the `max` clamp applies
const MAX_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base) }
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// attempt번째 재시도의 지연 상한 (attempt는 1부터)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(MAX_EXPONENT);
        self.base.saturating_mul(2u32.saturating_pow(exp)).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let cap_ms = self.ceiling(attempt).as_millis() as u64;
        Duration::from_millis(rng.gen_range(0..=cap_ms))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// 지연 동안 대기. 취소되면 true
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
