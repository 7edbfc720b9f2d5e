// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The worker's timer wheel: connections indexed by next expiration

use quiver_core::time::Timestamp;
use std::collections::BTreeMap;

/// Deadline-ordered connection timers.
///
/// Each connection has at most one entry; re-arming moves it.
#[derive(Debug, Default)]
pub struct TimerWheel {
    deadlines: BTreeMap<(Timestamp, u64), ()>,
    by_connection: hashbrown::HashMap<u64, Timestamp>,
}

impl TimerWheel {
    /// Arms (or re-arms) a connection's timer
    pub fn arm(&mut self, connection_id: u64, deadline: Timestamp) {
        if let Some(previous) = self.by_connection.insert(connection_id, deadline) {
            self.deadlines.remove(&(previous, connection_id));
        }
        self.deadlines.insert((deadline, connection_id), ());
    }

    /// Cancels a connection's timer
    pub fn cancel(&mut self, connection_id: u64) {
        if let Some(deadline) = self.by_connection.remove(&connection_id) {
            self.deadlines.remove(&(deadline, connection_id));
        }
    }

    /// The earliest armed deadline
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.deadlines
            .keys()
            .next()
            .map(|(deadline, _)| *deadline)
    }

    /// Removes and returns every connection whose deadline has passed
    pub fn expire(&mut self, now: Timestamp) -> Vec<u64> {
        let mut expired = Vec::new();
        while let Some((deadline, connection_id)) = self.deadlines.keys().next().copied() {
            if !deadline.has_elapsed(now) {
                break;
            }
            self.deadlines.remove(&(deadline, connection_id));
            self.by_connection.remove(&connection_id);
            expired.push(connection_id);
        }
        expired
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use quiver_core::time::{Clock, NoopClock};

    #[test]
    fn fires_in_deadline_order() {
        let now = NoopClock.get_time();
        let mut wheel = TimerWheel::default();

        wheel.arm(1, now + Duration::from_millis(30));
        wheel.arm(2, now + Duration::from_millis(10));
        wheel.arm(3, now + Duration::from_millis(20));

        assert_eq!(wheel.next_deadline(), Some(now + Duration::from_millis(10)));
        let expired = wheel.expire(now + Duration::from_millis(20));
        assert_eq!(expired, [2, 3]);
        assert!(!wheel.is_empty());
    }

    #[test]
    fn rearm_moves_the_deadline() {
        let now = NoopClock.get_time();
        let mut wheel = TimerWheel::default();

        wheel.arm(1, now + Duration::from_millis(10));
        wheel.arm(1, now + Duration::from_millis(50));

        assert!(wheel.expire(now + Duration::from_millis(20)).is_empty());
        assert_eq!(wheel.expire(now + Duration::from_millis(50)), [1]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancel_removes_entry() {
        let now = NoopClock.get_time();
        let mut wheel = TimerWheel::default();

        wheel.arm(1, now + Duration::from_millis(10));
        wheel.cancel(1);
        assert!(wheel.expire(now + Duration::from_secs(1)).is_empty());
    }
}
