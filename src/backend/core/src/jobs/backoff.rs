//! Exponential backoff with symmetric jitter.
//!
//! `delay(a) = min(2^a ± jitter·2^a, cap)` measured in `unit`s. With the
//! defaults (1 s unit, 10% jitter, 300 unit cap) attempt 3 waits between
//! 7.2 and 8.8 seconds and anything from attempt 9 on waits the full cap.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponent ceiling; `2^30` units is far beyond any sane cap.
const MAX_EXPONENT: u32 = 30;

/// Computes retry delays from an attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffScheduler {
    /// Length of one step of the curve
    pub unit: Duration,
    /// Upper bound, in units
    pub cap: f64,
    /// Jitter as a fraction of the un-jittered delay
    pub jitter: f64,
}

impl Default for BackoffScheduler {
    fn default() -> Self {
        Self {
            unit: Duration::from_secs(1),
            cap: 300.0,
            jitter: 0.1,
        }
    }
}

impl BackoffScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scale the whole curve, e.g. milliseconds instead of seconds.
    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    pub fn with_cap(mut self, cap: f64) -> Self {
        self.cap = cap.max(0.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay for `attempt` using the thread-local RNG.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// Delay for `attempt` with a caller-supplied RNG.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        self.unit.mul_f64(self.units_with(attempt, rng))
    }

    fn units_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> f64 {
        let exp = 2f64.powi(attempt.min(MAX_EXPONENT) as i32);

        // Every possible draw already lands on the cap.
        if exp * (1.0 - self.jitter) >= self.cap {
            return self.cap;
        }

        let spread = exp * self.jitter;
        let jitter = if spread > 0.0 {
            rng.gen_range(-spread..=spread)
        } else {
            0.0
        };

        (exp + jitter).clamp(0.0, self.cap)
    }
}

/// Delay for `attempt` with the default curve (seconds, cap 300, ±10%).
pub fn backoff(attempt: u32) -> Duration {
    BackoffScheduler::default().delay(attempt)
}
