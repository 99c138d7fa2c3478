//! Retry and backoff policy.
//!
//! Chunk-level attempts and job-level resubmissions are independent
//! budgets at different granularities: queue entry `attempts` bound
//! per-chunk transient retries, while a job's `retry_count` /
//! `max_retries` bound explicit whole-job resubmission. Exhausting the
//! chunk budget never triggers an automatic job retry.

use rand::Rng;
use std::time::Duration;

/// Jitter applied to every delay, as a fraction of the computed delay.
/// Spreads out re-claims so retried entries do not stampede the queue.
const JITTER_FRACTION: f64 = 0.2;

/// Exponential backoff with a ceiling and ±20% jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: i64,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: i64) -> Self {
        Self { base, cap, max_attempts }
    }

    /// Whether another attempt is within budget.
    pub fn should_retry(&self, attempts: i64) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the next attempt: `base * 2^attempts`, capped, with
    /// jitter.
    pub fn next_retry_delay(&self, attempts: i64) -> Duration {
        let exponent = attempts.clamp(0, 32) as u32;
        let uncapped = self
            .base
            .checked_mul(2u32.saturating_pow(exponent))
            .unwrap_or(self.cap);
        let capped = uncapped.min(self.cap);

        let jitter_range = capped.as_millis() as f64 * JITTER_FRACTION;
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        let millis = (capped.as_millis() as f64 + jitter).max(0.0) as u64;
        Duration::from_millis(millis)
    }
}
