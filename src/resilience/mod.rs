//! Resilience primitives guarding external collaborators
//!
//! This module provides:
//! - Circuit breaker with consecutive-failure and sliding-window tripping
//! - Exponential backoff with jitter for transient-error retries

mod circuit_breaker;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

use rand::Rng;
use std::time::Duration;

/// Retry configuration for transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retry attempts
    pub max_attempts: u32,

    /// Initial retry delay
    pub initial_delay: Duration,

    /// Maximum retry delay
    pub max_delay: Duration,

    /// Backoff multiplier
    pub backoff_multiplier: f64,

    /// Jitter factor (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(600),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Delay before the given retry attempt (0-based), with jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jitter_span = capped * self.jitter;
        let jitter = if jitter_span > 0.0 {
            rand::thread_rng().gen_range(-jitter_span..jitter_span)
        } else {
            0.0
        };

        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig {
            jitter: 0.0,
            ..Default::default()
        };

        let d0 = config.delay_for_attempt(0);
        let d1 = config.delay_for_attempt(1);
        let d2 = config.delay_for_attempt(2);
        assert!(d1 > d0);
        assert!(d2 > d1);

        // Far-out attempts are capped at max_delay (10 minutes).
        let d20 = config.delay_for_attempt(20);
        assert_eq!(d20, config.max_delay);
    }

    #[test]
    fn test_jitter_stays_positive() {
        let config = RetryConfig::default();
        for attempt in 0..8 {
            assert!(config.delay_for_attempt(attempt) >= Duration::ZERO);
        }
    }
}
