// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::time::timestamp::Timestamp;
use core::task::Poll;

/// A deadline owned by an individual component.
///
/// Timers in this crate do not self-register anywhere; the owner polls them
/// with the current time and reports the earliest armed deadline upward.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Timer {
    expiration: Option<Timestamp>,
}

impl Timer {
    /// Sets the timer to expire at the given timestamp
    #[inline]
    pub fn set(&mut self, time: Timestamp) {
        self.expiration = Some(time);
    }

    /// Cancels the timer; a cancelled timer no longer reports as expired
    #[inline]
    pub fn cancel(&mut self) {
        self.expiration = None;
    }

    /// Returns true if the timer has expired
    #[inline]
    pub fn is_expired(&self, current_time: Timestamp) -> bool {
        match self.expiration {
            Some(timeout) => timeout.has_elapsed(current_time),
            _ => false,
        }
    }

    /// Returns true if the timer is armed
    #[inline]
    pub fn is_armed(&self) -> bool {
        self.expiration.is_some()
    }

    /// Returns the armed deadline, if any
    #[inline]
    pub fn deadline(&self) -> Option<Timestamp> {
        self.expiration
    }

    /// Notifies the timer of the current time, cancelling it on expiry.
    /// Returns whether the timer had expired and was cancelled.
    #[inline]
    pub fn poll_expiration(&mut self, current_time: Timestamp) -> Poll<()> {
        if self.is_expired(current_time) {
            self.cancel();
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::clock::{Clock, NoopClock};
    use core::time::Duration;

    #[test]
    fn arm_and_cancel() {
        let now = NoopClock.get_time();
        let mut timer = Timer::default();

        assert!(!timer.is_armed());
        timer.set(now);
        assert!(timer.is_armed());
        assert_eq!(timer.deadline(), Some(now));
        timer.cancel();
        assert!(!timer.is_armed());
    }

    #[test]
    fn poll_expiration_cancels() {
        let mut now = NoopClock.get_time();
        let mut timer = Timer::default();

        timer.set(now + Duration::from_millis(10));
        assert_eq!(timer.poll_expiration(now), Poll::Pending);

        now += Duration::from_millis(10);
        assert_eq!(timer.poll_expiration(now), Poll::Ready(()));
        assert!(!timer.is_armed());
        assert_eq!(timer.poll_expiration(now), Poll::Pending);
    }
}
