//! Delay strategy between reconnection attempts.
//!
//! The default is a constant delay, which keeps the retry schedule
//! predictable for a client with a small attempt budget. An exponential
//! strategy is available for long-lived clients that should back off from a
//! struggling server.

use std::time::Duration;

/// How the delay grows between reconnection attempts.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Backoff {
    /// Always wait the configured base interval.
    #[default]
    Fixed,
    /// Multiply the base interval by `multiplier` after every failure,
    /// clamped to `max_delay`.
    Exponential { multiplier: f64, max_delay: Duration },
}

impl Backoff {
    /// Exponential doubling up to 30 seconds.
    pub fn exponential() -> Self {
        Backoff::Exponential {
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Delay before reconnection attempt number `attempt` (1-based).
pub fn next_delay(base: Duration, attempt: u32, backoff: &Backoff) -> Duration {
    match backoff {
        Backoff::Fixed => base,
        Backoff::Exponential {
            multiplier,
            max_delay,
        } => {
            let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
            let next_ms = base.as_millis() as f64 * multiplier.powi(exponent);
            if !next_ms.is_finite() || next_ms >= max_delay.as_millis() as f64 {
                *max_delay
            } else {
                Duration::from_millis(next_ms as u64)
            }
        }
    }
}
