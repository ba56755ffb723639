//! The retry policy applied when a job fails.
//!
//! A job is retried while `attempts < max_attempts`, and is permanently failed once it reaches the
//! ceiling. Each retry stamps `retry_at = now + backoff(attempts)`; backends do not hand the job
//! out again before that instant.
use std::{fmt, sync::Arc};

use chrono::{DateTime, TimeDelta, Utc};

use crate::backoff::{BackoffStrategy, Exponential, Strategy};

/// The default number of attempts before a job is permanently failed.
pub const DEFAULT_MAX_ATTEMPTS: u16 = 3;

/// `2 ^ attempts` seconds: 2s after the first failure, 4s after the second.
const DEFAULT_BACKOFF: BackoffStrategy<Exponential> =
    BackoffStrategy::exponential(TimeDelta::seconds(2));

/// What to do with a job that has just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back in the waiting partition, not to be claimed before `retry_at`.
    Retry { retry_at: DateTime<Utc> },
    /// Move the job to the failed partition.
    Discard,
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u16,
    backoff: Arc<dyn Strategy + Send + Sync>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BACKOFF)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// A `max_attempts` of zero is treated as one: every job gets at least one attempt.
    pub fn new(max_attempts: u16, backoff: impl Strategy + Send + Sync + 'static) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Arc::new(backoff),
        }
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    pub fn with_backoff(self, backoff: impl Strategy + Send + Sync + 'static) -> Self {
        Self {
            backoff: Arc::new(backoff),
            ..self
        }
    }

    pub fn max_attempts(&self) -> u16 {
        self.max_attempts
    }

    pub fn should_retry(&self, attempts: u16) -> bool {
        attempts < self.max_attempts
    }

    /// `attempts` is the count including the attempt that just failed.
    pub fn decide(&self, attempts: u16, now: DateTime<Utc>) -> RetryDecision {
        if self.should_retry(attempts) {
            let delay = self.backoff.backoff(attempts);
            let retry_at = now
                .checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            RetryDecision::Retry { retry_at }
        } else {
            RetryDecision::Discard
        }
    }
}
