//! Backoff strategies used by [`crate::retry::RetryPolicy`] to stamp `retry_at` on failed jobs.
//!
//! Three strategies are provided:
//!
//! 1. Constant
//! 2. Linear
//! 3. Exponential
//!
//! each of which can be modified by a [`Jitter`] and a minimum delay.
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use reportq::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2));
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
//! assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Maps a failed attempt count to the delay before the job may run again.
pub trait Strategy {
    /// Given the number of attempts made so far returns how long to wait before the next one.
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

/// Always the same delay.
///
/// Constructed via [`BackoffStrategy::constant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u16) -> TimeDelta {
        self.delay
    }
}

/// `base` doubled after every attempt past the first, optionally clamped.
///
/// Constructed via [`BackoffStrategy::exponential`].
///
/// ```
/// # use reportq::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy =
///     BackoffStrategy::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(30));
///
/// assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
/// assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
/// assert_eq!(strategy.backoff(5), TimeDelta::seconds(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let backoff = 2_i64
            .checked_pow(attempt.saturating_sub(1).into())
            .and_then(|factor| self.base.num_milliseconds().checked_mul(factor))
            .and_then(TimeDelta::try_milliseconds)
            .unwrap_or(TimeDelta::MAX);
        match self.max {
            Some(max) => backoff.min(max),
            None => backoff,
        }
    }
}

/// `factor * attempt`, optionally clamped.
///
/// Constructed via [`BackoffStrategy::linear`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Linear {
    factor: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Linear {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut backoff = self.factor * attempt.into();
        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }
        backoff
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Adds a random jitter in the range `-delta..=delta`.
    Absolute(TimeDelta),
    /// Adds a random jitter as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        };
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value + TimeDelta::milliseconds(jitter)
    }
}

/// A backoff [`Strategy`] together with optional jitter and a lower bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Constant> {
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the value returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl BackoffStrategy<Linear> {
    pub const fn linear(factor: TimeDelta) -> Self {
        Self::new(Linear { factor, max: None })
    }

    /// Clamps the value returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Wrap a custom [`Strategy`].
    ///
    /// The built in strategies are more commonly constructed via [`BackoffStrategy::constant`],
    /// [`BackoffStrategy::linear`], and [`BackoffStrategy::exponential`].
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Never return a delay below `min`, even after jitter.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut backoff = self.strategy.backoff(attempt);

        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }

        backoff.max(self.min)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constant_backoff() {
        let delay = TimeDelta::minutes(1);
        let strategy = BackoffStrategy::constant(delay);

        for i in 1..100 {
            assert_eq!(strategy.backoff(i), delay);
        }
    }

    #[test]
    fn constant_backoff_with_relative_jitter() {
        let delay = TimeDelta::minutes(1);
        let strategy = BackoffStrategy::constant(delay).with_jitter(Jitter::Relative(0.1));

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= TimeDelta::seconds(54));
            assert!(backoff <= TimeDelta::seconds(66));
        }
    }

    #[test]
    fn linear_backoff_with_max() {
        let strategy =
            BackoffStrategy::linear(TimeDelta::seconds(10)).with_max(TimeDelta::seconds(40));

        assert_eq!(strategy.backoff(1), TimeDelta::seconds(10));
        assert_eq!(strategy.backoff(3), TimeDelta::seconds(30));
        assert_eq!(strategy.backoff(4), TimeDelta::seconds(40));
        assert_eq!(strategy.backoff(9), TimeDelta::seconds(40));
    }

    #[test]
    fn exponential_backoff_doubles_from_two_seconds() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(2));

        assert_eq!(strategy.backoff(1), TimeDelta::seconds(2));
        assert_eq!(strategy.backoff(2), TimeDelta::seconds(4));
        assert_eq!(strategy.backoff(3), TimeDelta::seconds(8));
    }

    #[test]
    fn exponential_backoff_keeps_sub_second_base() {
        let strategy = BackoffStrategy::exponential(TimeDelta::milliseconds(500));

        assert_eq!(strategy.backoff(1), TimeDelta::milliseconds(500));
        assert_eq!(strategy.backoff(2), TimeDelta::seconds(1));
        assert_eq!(strategy.backoff(3), TimeDelta::seconds(2));
    }

    #[test]
    fn exponential_backoff_saturates() {
        let strategy = BackoffStrategy::exponential(TimeDelta::minutes(1));

        assert_eq!(strategy.backoff(u16::MAX), TimeDelta::MAX);
    }

    #[test]
    fn exponential_backoff_with_max() {
        let max = TimeDelta::minutes(10);
        let strategy = BackoffStrategy::exponential(TimeDelta::minutes(1)).with_max(max);

        for i in 1..100 {
            assert!(strategy.backoff(i) <= max);
        }
    }

    #[test]
    fn exponential_backoff_with_jitter_min() {
        let min = TimeDelta::seconds(5);
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1))
            .with_jitter(Jitter::Absolute(TimeDelta::seconds(10)))
            .with_min(min);

        for i in 1..5 {
            assert!(strategy.backoff(i) >= min);
        }
    }
}
