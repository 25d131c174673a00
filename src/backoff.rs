//! Backoff policy for scheduling redeliveries.
//!
//! `attempt` is the zero-based index of the attempt that just failed, so the router asks for
//! `delay(attempts - 1)`. The default policy is exponential with a 500 ms base and a 20 s cap:
//!
//! ```rust
//! use std::time::Duration;
//! use brokerlab::backoff::{Backoff, BackoffStrategy};
//!
//! let backoff = Backoff::default();
//! assert_eq!(backoff.delay(0), Duration::from_millis(500));
//! assert_eq!(backoff.delay(1), Duration::from_secs(1));
//! assert_eq!(backoff.delay(3), Duration::from_secs(4));
//! assert_eq!(backoff.delay(10), Duration::from_secs(20)); // capped
//! ```
//!
//! Computations saturate instead of overflowing, so arbitrarily large attempts land on the cap.
//! Policies are pure and `Sync`; the router takes any [`BackoffStrategy`], which lets tests
//! plug in constant or immediate schedules.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

/// Default base delay.
pub const DEFAULT_BASE: Duration = Duration::from_millis(500);
/// Default upper bound for any single delay.
pub const DEFAULT_CAP: Duration = Duration::from_secs(20);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffError {
    BaseMustBePositive,
    CapMustBePositive,
    CapLessThanBase { base: Duration, cap: Duration },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::BaseMustBePositive => write!(f, "base must be greater than zero"),
            BackoffError::CapMustBePositive => write!(f, "cap must be greater than zero"),
            BackoffError::CapLessThanBase { base, cap } => {
                write!(f, "cap ({:?}) must be >= base ({:?})", cap, base)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

/// Maps a zero-based attempt index to a redelivery delay.
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    fn delay(&self, attempt: u32) -> Duration;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BackoffKind {
    Constant(Duration),
    Exponential { base: Duration, cap: Duration },
}

/// Concrete backoff policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    kind: BackoffKind,
}

impl Backoff {
    /// Same delay for every attempt.
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Constant(delay) }
    }

    /// No delay at all; useful for accelerated tests.
    pub fn immediate() -> Self {
        Self::constant(Duration::ZERO)
    }

    /// `base * 2^attempt`, capped at `cap`.
    pub fn exponential(base: Duration, cap: Duration) -> Result<Self, BackoffError> {
        if base.is_zero() {
            return Err(BackoffError::BaseMustBePositive);
        }
        if cap.is_zero() {
            return Err(BackoffError::CapMustBePositive);
        }
        if cap < base {
            return Err(BackoffError::CapLessThanBase { base, cap });
        }
        Ok(Self { kind: BackoffKind::Exponential { base, cap } })
    }

    /// Delay for the given zero-based attempt index.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.kind {
            BackoffKind::Constant(d) => d,
            BackoffKind::Exponential { base, cap } => {
                let multiplier = 2u128.saturating_pow(attempt);
                let nanos = base.as_nanos().saturating_mul(multiplier).min(cap.as_nanos());
                // nanos <= cap, and cap came from a Duration, so this fits in u64 seconds.
                Duration::new(
                    (nanos / 1_000_000_000) as u64,
                    (nanos % 1_000_000_000) as u32,
                )
            }
        }
    }

    /// Distinct delays a redelivery can use when at most `max_attempts` attempts are made.
    ///
    /// Redeliveries happen after attempts `1..max_attempts`, i.e. for indexes
    /// `0..max_attempts - 1`. Ascending order.
    pub fn schedule(&self, max_attempts: u32) -> Vec<Duration> {
        let steps: BTreeSet<Duration> =
            (0..max_attempts.saturating_sub(1)).map(|attempt| self.delay(attempt)).collect();
        steps.into_iter().collect()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self { kind: BackoffKind::Exponential { base: DEFAULT_BASE, cap: DEFAULT_CAP } }
    }
}

impl BackoffStrategy for Backoff {
    fn delay(&self, attempt: u32) -> Duration {
        Backoff::delay(self, attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn default_schedule_doubles_from_half_second() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay(3), Duration::from_millis(4000));
        assert_eq!(backoff.delay(4), Duration::from_millis(8000));
        assert_eq!(backoff.delay(5), Duration::from_millis(16000));
        assert_eq!(backoff.delay(6), Duration::from_secs(20)); // 32s capped
        assert_eq!(backoff.delay(50), Duration::from_secs(20));
    }

    #[test]
    fn huge_attempt_saturates_to_cap() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(u32::MAX), DEFAULT_CAP);
    }

    #[test]
    fn constant_ignores_attempt() {
        let backoff = Backoff::constant(Duration::from_millis(7));
        assert_eq!(backoff.delay(0), Duration::from_millis(7));
        assert_eq!(backoff.delay(9), Duration::from_millis(7));
        assert_eq!(Backoff::immediate().delay(3), Duration::ZERO);
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert_eq!(
            Backoff::exponential(Duration::ZERO, Duration::from_secs(1)),
            Err(BackoffError::BaseMustBePositive)
        );
        assert_eq!(
            Backoff::exponential(Duration::from_secs(1), Duration::ZERO),
            Err(BackoffError::CapMustBePositive)
        );
        assert!(matches!(
            Backoff::exponential(Duration::from_secs(2), Duration::from_secs(1)),
            Err(BackoffError::CapLessThanBase { .. })
        ));
    }

    #[test]
    fn sub_millisecond_base_keeps_precision() {
        let backoff =
            Backoff::exponential(Duration::from_micros(250), Duration::from_secs(1)).unwrap();
        assert_eq!(backoff.delay(2), Duration::from_micros(1000));
    }

    #[test]
    fn schedule_lists_distinct_steps() {
        let backoff = Backoff::default();
        assert_eq!(
            backoff.schedule(5),
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(backoff.schedule(10).last(), Some(&Duration::from_secs(20)));
        assert_eq!(backoff.schedule(10).len(), 7);
        assert!(backoff.schedule(1).is_empty());
        assert!(backoff.schedule(0).is_empty());
        assert_eq!(Backoff::constant(Duration::from_secs(1)).schedule(5).len(), 1);
    }

    proptest! {
        #[test]
        fn matches_closed_form(attempt in 0u32..64) {
            let expected = Duration::from_millis(500)
                .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
                .unwrap_or(DEFAULT_CAP)
                .min(DEFAULT_CAP);
            prop_assert_eq!(Backoff::default().delay(attempt), expected);
        }

        #[test]
        fn never_decreases(attempt in 0u32..10_000) {
            let backoff = Backoff::default();
            prop_assert!(backoff.delay(attempt) <= backoff.delay(attempt + 1));
        }

        #[test]
        fn capped_beyond_crossover(attempt in 6u32..u32::MAX) {
            prop_assert_eq!(Backoff::default().delay(attempt), DEFAULT_CAP);
        }
    }
}
