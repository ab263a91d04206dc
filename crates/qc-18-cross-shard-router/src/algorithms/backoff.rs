//! Retry policy for transient transport failures.
//!
//! Attempt `n` (1-based) that fails waits
//! `min(base * multiplier^(n-1), max)` scaled by a uniform factor in
//! `[1 - jitter, 1 + jitter]` before attempt `n + 1`. After `max_attempts`
//! attempts the batch is dead-lettered.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total delivery attempts, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay_ms: u64,
    /// Growth per attempt.
    pub multiplier: f64,
    /// Delay cap.
    pub max_delay_ms: u64,
    /// Jitter fraction in [0, 1).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Check the policy is usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be > 0".to_string());
        }
        if self.multiplier < 1.0 {
            return Err(format!("retry.multiplier must be >= 1, got {}", self.multiplier));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(format!("retry.jitter must be in [0, 1), got {}", self.jitter));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err("retry.base_delay_ms exceeds retry.max_delay_ms".to_string());
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exp);
        Duration::from_millis(raw.min(self.max_delay_ms as f64) as u64)
    }

    /// Jittered delay after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor)
    }
}
