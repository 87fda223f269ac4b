//! Exponential reconnect backoff.

use std::time::Duration;

/// Reconnection policy with capped exponential backoff.
///
/// The delay before attempt `n` (1-based) is
/// `min(max_delay, initial_delay * growth_factor^(n-1))`. After
/// `max_attempts` failed attempts in a row the client gives up and closes.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Multiplier applied per attempt.
    pub growth_factor: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Attempts allowed before the client closes.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            growth_factor: 1.2,
            max_delay: Duration::from_secs(10),
            max_attempts: 50,
        }
    }
}

impl BackoffPolicy {
    /// Delay before `attempt` (1-based), rounded to whole milliseconds.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.growth_factor.max(1.0).powi(exponent);
        let millis = self.initial_delay.as_secs_f64() * 1000.0 * factor;
        let max_millis = self.max_delay.as_secs_f64() * 1000.0;
        if !millis.is_finite() || millis >= max_millis {
            self.max_delay
        } else {
            Duration::from_millis(millis.round() as u64)
        }
    }
}

/// Attempt counter driven by the connection task.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
}

impl Backoff {
    pub(crate) fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Count a new attempt and return its number and delay, or `None` once
    /// `max_attempts` is exceeded.
    pub(crate) fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts > self.policy.max_attempts {
            return None;
        }
        Some((self.attempts, self.policy.delay_for_attempt(self.attempts)))
    }

    /// Called on every successful connect.
    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }
}
