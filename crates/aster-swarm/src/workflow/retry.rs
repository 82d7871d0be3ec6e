//! Step Retry Policy
//!
//! Delay schedule between attempts of a failed step. The attempt count
//! itself comes from each step's `max_retries`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_ms;

/// How the pause before re-dispatching a failed step grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Every re-dispatch waits `base_delay`
    Fixed,
    /// The n-th re-dispatch waits n times `base_delay`
    Linear,
    /// Doubles per re-dispatch
    #[default]
    Exponential,
    /// Doubles per re-dispatch, then randomly spread by `jitter_factor`
    ExponentialWithJitter,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::Fixed => "fixed",
            RetryStrategy::Linear => "linear",
            RetryStrategy::Exponential => "exponential",
            RetryStrategy::ExponentialWithJitter => "exponential_with_jitter",
        }
    }

    /// Multiple of the base delay for re-dispatch `attempt` (0-based)
    fn factor(&self, attempt: u32) -> f64 {
        match self {
            RetryStrategy::Fixed => 1.0,
            RetryStrategy::Linear => f64::from(attempt) + 1.0,
            RetryStrategy::Exponential | RetryStrategy::ExponentialWithJitter => {
                2.0_f64.powi(attempt.min(30) as i32)
            }
        }
    }
}

impl std::fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff between step attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(strategy: RetryStrategy, base_delay: Duration) -> Self {
        Self {
            strategy,
            base_delay,
            ..Default::default()
        }
    }

    /// No delay at all between attempts
    pub fn immediate() -> Self {
        Self::new(RetryStrategy::Fixed, Duration::ZERO).with_max_delay(Duration::ZERO)
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Pause before re-dispatch number `attempt` (0-based), capped by `max_delay`
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let mut delay_ms = self.base_delay.as_millis() as f64 * self.strategy.factor(attempt);
        if self.strategy == RetryStrategy::ExponentialWithJitter && self.jitter_factor > 0.0 {
            let spread = delay_ms * self.jitter_factor;
            delay_ms += rand::thread_rng().gen_range(-spread..=spread);
        }
        let cap_ms = self.max_delay.as_millis() as f64;
        Duration::from_millis(delay_ms.clamp(0.0, cap_ms) as u64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_delay < self.base_delay {
            return Err("retry max_delay must be >= base_delay".to_string());
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err("retry jitter_factor must be within 0.0..=1.0".to_string());
        }
        Ok(())
    }
}
