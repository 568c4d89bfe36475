//! Reconnect backoff policy.
//!
//! Exponential backoff with deterministic, additive jitter and a bounded
//! retry budget. The delay is a pure function of the attempt number
//! ([`delay_for_attempt`]) so the policy is testable without timers;
//! [`ReconnectPolicy`] wraps it with the attempt counter and budget.

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ReconnectConfig;

/// Computes the backoff delay for a given 1-based attempt number.
///
/// The base delay grows by `backoff_multiplier` per attempt, capped at
/// `max_delay`. Jitter is additive and keyed off the attempt number, and its
/// range is bounded so that consecutive delays are non-decreasing up to the
/// retry budget.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap
)]
pub fn delay_for_attempt(config: &ReconnectConfig, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let max_ms = config.max_delay.as_millis() as f64;

    let base_ms = (config.initial_delay.as_millis() as f64
        * config.backoff_multiplier.powi((attempt - 1) as i32))
    .min(max_ms);

    let jitter_ms = if config.jitter {
        // Range bounded by (multiplier - 1) so delay(n) + jitter never
        // exceeds the un-jittered delay(n + 1).
        let range = base_ms * 0.25_f64.min(config.backoff_multiplier - 1.0);
        if range >= 1.0 {
            (f64::from(attempt) * 7.0) % range
        } else {
            0.0
        }
    } else {
        0.0
    };

    Duration::from_millis(((base_ms + jitter_ms).min(max_ms)).max(1.0) as u64)
}

/// Tracks reconnect attempts against the configured budget.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Reconnection configuration.
    config: ReconnectConfig,
    /// Current retry attempt number.
    attempt: u32,
}

impl ReconnectPolicy {
    /// Creates a policy from the given configuration.
    #[must_use]
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Returns the current retry attempt count.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns whether the retry budget has been consumed.
    #[must_use]
    pub fn budget_exhausted(&self) -> bool {
        self.attempt >= self.config.max_retries
    }

    /// Resets the retry state after a successful connection or a manual
    /// retry trigger.
    pub fn reset(&mut self) {
        self.attempt = 0;
        debug!("reconnect policy reset");
    }

    /// Advances the attempt counter and returns the delay to wait before
    /// the next dial.
    ///
    /// Returns `None` if reconnection is disabled or the budget is
    /// exhausted; the caller then transitions to `Failed`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.config.enabled {
            return None;
        }
        if self.budget_exhausted() {
            warn!(
                attempts = self.attempt,
                max = self.config.max_retries,
                "reconnect budget exhausted"
            );
            return None;
        }

        self.attempt += 1;
        let delay = delay_for_attempt(&self.config, self.attempt);

        debug!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect attempt"
        );
        Some(delay)
    }
}
