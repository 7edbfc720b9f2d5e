// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::{fmt, num::NonZeroU64, time::Duration};

/// An instant in time, measured as a microsecond offset from the owning
/// [`Clock`](crate::time::Clock)'s epoch.
///
/// Internally the offset is stored incremented by one so the zero value stays
/// available as a niche for `Option<Timestamp>`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(NonZeroU64);

impl Timestamp {
    /// Creates a `Timestamp` from a `Duration` since the clock epoch
    #[inline]
    pub fn from_duration(duration: Duration) -> Self {
        let micros = duration.as_micros();
        debug_assert!(micros < u64::MAX as u128);
        // stored +1; a duration of zero is representable
        Self(NonZeroU64::new(micros as u64 + 1).unwrap())
    }

    /// Returns the `Duration` since the clock epoch
    #[inline]
    pub fn as_duration(self) -> Duration {
        Duration::from_micros(self.0.get() - 1)
    }

    /// Returns the amount of time elapsed from `earlier` to `self`,
    /// or zero if `earlier` is later than `self`
    #[inline]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.get().saturating_sub(earlier.0.get()))
    }

    /// Returns `Some(self + duration)` unless the result overflows
    #[inline]
    pub fn checked_add(self, duration: Duration) -> Option<Self> {
        let micros: u64 = duration.as_micros().try_into().ok()?;
        let value = self.0.get().checked_add(micros)?;
        Some(Self(NonZeroU64::new(value)?))
    }

    /// Returns `Some(self - duration)` unless the result precedes the epoch
    #[inline]
    pub fn checked_sub(self, duration: Duration) -> Option<Self> {
        let micros: u64 = duration.as_micros().try_into().ok()?;
        let value = self.0.get().checked_sub(micros)?;
        Some(Self(NonZeroU64::new(value)?))
    }

    /// Returns true if `self` is at or before `current_time`
    #[inline]
    pub fn has_elapsed(self, current_time: Self) -> bool {
        self <= current_time
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({:?})", self.as_duration())
    }
}

impl core::ops::Add<Duration> for Timestamp {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn add(self, rhs: Duration) -> Self {
        self.checked_add(rhs).expect("timestamp overflow")
    }
}

impl core::ops::AddAssign<Duration> for Timestamp {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl core::ops::Sub for Timestamp {
    type Output = Duration;

    /// Returns the time elapsed from `rhs` to `self`
    ///
    /// Panics in debug builds if `rhs` is later than `self`
    #[inline]
    #[track_caller]
    fn sub(self, rhs: Self) -> Duration {
        if cfg!(debug_assertions) {
            assert!(rhs <= self, "subtraction would precede the epoch");
        }
        self.saturating_duration_since(rhs)
    }
}

impl core::ops::Sub<Duration> for Timestamp {
    type Output = Self;

    #[inline]
    #[track_caller]
    fn sub(self, rhs: Duration) -> Self {
        self.checked_sub(rhs).expect("timestamp underflow")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_round_trip() {
        for micros in [0u64, 1, 333, u32::MAX as u64] {
            let duration = Duration::from_micros(micros);
            assert_eq!(Timestamp::from_duration(duration).as_duration(), duration);
        }
    }

    #[test]
    fn saturating_duration_since_test() {
        let a = Timestamp::from_duration(Duration::from_micros(10));
        let b = Timestamp::from_duration(Duration::from_micros(25));
        assert_eq!(b.saturating_duration_since(a), Duration::from_micros(15));
        assert_eq!(a.saturating_duration_since(b), Duration::ZERO);
    }

    #[test]
    fn option_is_free() {
        assert_eq!(
            core::mem::size_of::<Option<Timestamp>>(),
            core::mem::size_of::<Timestamp>()
        );
    }
}
