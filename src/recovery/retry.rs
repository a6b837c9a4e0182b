//! Retry policy for chain calls
//!
//! Exponential backoff for failing polls, the give-up decision, and the fee
//! schedule of replacement broadcasts.

use std::time::Duration;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
    /// Fee rate bump percentage per replacement
    pub fee_bump_percent: u32,
    /// Maximum fee rate multiplier (e.g., 3 = 3x original)
    pub max_fee_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            fee_bump_percent: 20, // 20% fee increase per replacement
            max_fee_multiplier: 3.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Fee rate for the `attempt`-th broadcast of a transaction first sent at `base_fee_rate`
    pub fn fee_rate_for_attempt(&self, base_fee_rate: u64, attempt: u32) -> u64 {
        if attempt == 0 {
            return base_fee_rate;
        }

        let multiplier = 1.0 + (self.fee_bump_percent as f64 / 100.0) * (attempt as f64);
        let capped_multiplier = multiplier.min(self.max_fee_multiplier);

        (base_fee_rate as f64 * capped_multiplier) as u64
    }

    /// Fee rate for a replacement of a transaction currently paying `current`.
    ///
    /// Replacements must pay strictly more, so this returns None once the cap
    /// relative to `base_fee_rate` leaves no room above `current`.
    pub fn replacement_fee_rate(&self, base_fee_rate: u64, current: u64, attempt: u32) -> Option<u64> {
        let cap = (base_fee_rate.max(1) as f64 * self.max_fee_multiplier) as u64;
        let next = self
            .fee_rate_for_attempt(base_fee_rate, attempt)
            .max(current.saturating_add(1));
        (next <= cap).then_some(next)
    }
}
