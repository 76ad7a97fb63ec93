//! # Exponential Backoff
//!
//! Capped exponential backoff for transient-error retries.
//!
//! The curve (base, multiplier, cap) is operational tuning, so it comes from
//! `ControllerConfig` rather than being fixed here.
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use tf_controller::controller::backoff::ExponentialBackoff;
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_secs(5), 2.0, Duration::from_secs(60));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(10));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(20));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(40));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(60));
//! ```

use std::time::Duration;

/// Exponential backoff calculator
///
/// `delay(n)` is the delay before the n-th retry: `base * multiplier^(n-1)`,
/// capped at `max`. The stateful `next_backoff` walks the same curve.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    multiplier: f64,
    max: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            base,
            // A multiplier below 1 would shrink delays
            multiplier: multiplier.max(1.0),
            max,
            attempt: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based, 0 is treated as 1)
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let factor = self.multiplier.powi(exponent);
        let millis = self.base.as_millis() as f64 * factor;
        let max_millis = self.max.as_millis() as f64;
        if !millis.is_finite() || millis >= max_millis {
            return self.max;
        }
        Duration::from_millis(millis as u64)
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.delay(self.attempt)
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
