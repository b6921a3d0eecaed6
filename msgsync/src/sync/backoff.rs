//! Bounded exponential backoff for queued deliveries.

use std::time::Duration;

use msgsync_proto::message::Timestamp;
use msgsync_proto::queue::QueueEntry;

/// What the drain loop should do with a queue entry right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Attempt delivery now.
    Attempt,
    /// Still inside the backoff window; try again after `remaining`.
    Wait {
        /// Time left until the entry becomes eligible.
        remaining: Duration,
    },
    /// Retry budget exhausted; stop automatic attempts.
    Abandon,
}

/// Retry ceiling and backoff schedule for automatic delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts after which an entry is abandoned.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^retry_count, max)`.
    #[must_use]
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }

    /// Whether `retry_count` failures have used up the budget.
    #[must_use]
    pub const fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    /// Decides the fate of `entry` at time `now`.
    ///
    /// An entry that has never failed is attempted immediately.
    #[must_use]
    pub fn decide(&self, entry: &QueueEntry, now: Timestamp) -> Decision {
        if self.is_exhausted(entry.retry_count) {
            return Decision::Abandon;
        }
        let Some(last) = entry.last_retry_at else {
            return Decision::Attempt;
        };
        let backoff = self.backoff(entry.retry_count);
        let elapsed = Duration::from_millis(now.millis_since(last));
        if elapsed >= backoff {
            Decision::Attempt
        } else {
            Decision::Wait {
                remaining: backoff - elapsed,
            }
        }
    }
}
