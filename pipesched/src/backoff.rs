//! Retry delay strategies used when a failed pipeline run is re-fired.
//!
//! The delay before attempt `n + 1` is derived from the attempt `n` that just failed. The
//! strategy used by [`crate::pipeline::RetryPolicy`] is exponential:
//! `base × multiplier^(attempt - 1)`, optionally clamped and jittered.
//!
//! All of the constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use pipesched::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(60), 2.0)
//!     .with_max(TimeDelta::minutes(10));
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::seconds(60));
//! assert_eq!(strategy.backoff(2), TimeDelta::seconds(120));
//! assert_eq!(strategy.backoff(3), TimeDelta::seconds(240));
//! assert_eq!(strategy.backoff(5), TimeDelta::minutes(10));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the number of the attempt that just failed (starting at 1) returns the
    /// [`TimeDelta`] to wait before the next attempt.
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

/// Exponential backoff strategy.
///
/// Grows by `multiplier` with each attempt, starting from `base` for the first attempt.
///
/// __Note:__ This type cannot be constructed directly, instead [`BackoffStrategy::exponential`]
/// should be used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Exponential {
    base: TimeDelta,
    multiplier: f64,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let exponent = i32::from(attempt.max(1)) - 1;
        let millis = self.base.num_milliseconds() as f64 * self.multiplier.powi(exponent);
        let mut backoff = if millis.is_finite() && millis < i64::MAX as f64 {
            TimeDelta::milliseconds(millis.round() as i64)
        } else {
            TimeDelta::MAX
        };
        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }
        backoff
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the backoff in the range `-delta =< jitter =< delta`.
    Absolute(TimeDelta),
    /// A random jitter to be added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        };
        if milliseconds <= 0 {
            return value;
        }
        let rand_jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value
            .checked_add(&TimeDelta::milliseconds(rand_jitter))
            .unwrap_or(value)
    }
}

/// A [`Strategy`] wrapped with an optional jitter and a lower bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Exponential> {
    /// Creates a [`BackoffStrategy`] that waits `base × multiplier^(attempt - 1)`.
    ///
    /// A multiplier of `1.0` gives a constant delay.
    ///
    /// ```
    /// # use pipesched::prelude::*;
    /// # use chrono::TimeDelta;
    /// let strategy = BackoffStrategy::exponential(TimeDelta::seconds(30), 1.0);
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::seconds(30));
    /// assert_eq!(strategy.backoff(4), TimeDelta::seconds(30));
    /// ```
    pub const fn exponential(base: TimeDelta, multiplier: f64) -> Self {
        Self::new(Exponential {
            base,
            multiplier,
            max: None,
        })
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Wraps a custom [`Strategy`].
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Add a jitter to the backoff strategy see [`Jitter`] for more information about how this
    /// affects the strategy.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Add a minimum value. This can be useful when you have a particularly large jitter and would
    /// like to avoid a delay of less than a given amount.
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
    fn exponential_backoff() {
        let base = TimeDelta::seconds(60);
        let strategy = BackoffStrategy::exponential(base, 2.0);

        for i in 1..10u16 {
            assert_eq!(strategy.backoff(i), base * 2i32.pow(u32::from(i) - 1));
        }
    }

    #[test]
    fn exponential_backoff_fractional_multiplier() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(10), 1.5);

        assert_eq!(strategy.backoff(1), TimeDelta::seconds(10));
        assert_eq!(strategy.backoff(2), TimeDelta::seconds(15));
        assert_eq!(strategy.backoff(3), TimeDelta::milliseconds(22_500));
    }

    #[test]
    fn attempt_zero_is_treated_as_first_attempt() {
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(5), 3.0);

        assert_eq!(strategy.backoff(0), strategy.backoff(1));
    }

    #[test]
    fn exponential_backoff_is_monotonic_for_growing_multipliers() {
        for multiplier in [1.0, 1.25, 2.0, 10.0] {
            let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1), multiplier);
            let delays = (1..40).map(|i| strategy.backoff(i)).collect::<Vec<_>>();
            assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        }
    }

    #[test]
    fn exponential_backoff_with_max() {
        let max = TimeDelta::minutes(10);
        let strategy = BackoffStrategy::exponential(TimeDelta::minutes(1), 2.0).with_max(max);

        for i in 1..100 {
            assert!(strategy.backoff(i) <= max);
        }
        assert_eq!(strategy.backoff(100), max);
    }

    #[test]
    fn exponential_backoff_saturates_instead_of_overflowing() {
        let strategy = BackoffStrategy::exponential(TimeDelta::days(1), 10.0);

        assert_eq!(strategy.backoff(u16::MAX), TimeDelta::MAX);
    }

    #[test]
    fn exponential_backoff_with_relative_jitter() {
        let base = TimeDelta::minutes(1);
        let strategy =
            BackoffStrategy::exponential(base, 2.0).with_jitter(Jitter::Relative(0.1));

        for i in 1..5u16 {
            let expected = (base * 2i32.pow(u32::from(i) - 1)).num_milliseconds() as f64;
            let backoff = strategy.backoff(i).num_milliseconds() as f64;
            assert!(backoff >= expected * 0.9);
            assert!(backoff <= expected * 1.1);
        }
    }

    #[test]
    fn exponential_backoff_with_jitter_min() {
        let jitter = TimeDelta::seconds(10);
        let min = TimeDelta::seconds(5);
        let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1), 1.0)
            .with_jitter(Jitter::Absolute(jitter))
            .with_min(min);

        for i in 1..50 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= min);
            assert!(backoff <= TimeDelta::seconds(1) + jitter);
        }
    }
}
