//! Gap recovery: where to resume after a dropped connection, and when.

use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;

use crate::config::FirehoseConfig;

/// What to do after a transport drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPlan {
    /// Wait `delay`, then connect with `cursor`.
    Retry {
        cursor: Option<i64>,
        /// 1-based attempt number within the current outage.
        attempt: u32,
        delay: Duration,
    },
    /// The retry budget is spent; the stream should end with a fatal error.
    Exhausted { attempts: u32 },
}

/// Plans reconnection attempts with a bounded, increasing backoff.
///
/// The resume cursor is always the caller's last accepted sequence, never
/// the cursor the stream was originally opened with.
#[derive(Debug)]
pub struct GapRecovery {
    max_retries: u32,
    attempts: u32,
    backoff: ExponentialBackoff,
}

impl GapRecovery {
    pub fn new(config: &FirehoseConfig) -> Self {
        let mut backoff = ExponentialBackoff {
            current_interval: config.initial_backoff,
            initial_interval: config.initial_backoff,
            max_interval: config.max_backoff,
            multiplier: config.backoff_multiplier,
            randomization_factor: config.randomization_factor,
            max_elapsed_time: None, // bounded by max_retries instead
            ..Default::default()
        };
        backoff.reset();

        Self {
            max_retries: config.max_retries,
            attempts: 0,
            backoff,
        }
    }

    /// Plan the next attempt, resuming from `last_cursor`.
    pub fn recover(&mut self, last_cursor: Option<i64>) -> RecoveryPlan {
        if self.attempts >= self.max_retries {
            return RecoveryPlan::Exhausted {
                attempts: self.attempts,
            };
        }

        self.attempts += 1;
        // Always Some since max_elapsed_time is None
        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval);

        RecoveryPlan::Retry {
            cursor: last_cursor,
            attempt: self.attempts,
            delay,
        }
    }

    /// Forget the current outage once a reconnected stream is healthy again.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.backoff.reset();
    }

    /// Attempts made in the current outage.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
