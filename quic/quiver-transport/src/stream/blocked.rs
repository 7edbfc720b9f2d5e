// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Accounting for why sending stalled and for how long.
//!
//! Each reason keeps a cumulative duration and, while active, the moment it
//! engaged. Transitions are driven by bitmask updates so one state change
//! can start and stop several reasons at once.

use quiver_core::time::Timestamp;
use core::time::Duration;

/// The reasons outbound progress can stall
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockedReason {
    Scheduling = 0,
    Pacing = 1,
    AmplificationProtection = 2,
    CongestionControl = 3,
    ConnFlowControl = 4,
    StreamIdFlowControl = 5,
    StreamFlowControl = 6,
    App = 7,
}

pub const REASON_COUNT: usize = 8;

#[derive(Clone, Copy, Debug, Default)]
struct Entry {
    cumulative: Duration,
    since: Option<Timestamp>,
}

/// Blocked-time ledger for a stream or connection
#[derive(Clone, Debug, Default)]
pub struct BlockedTimings {
    entries: [Entry; REASON_COUNT],
    active: u8,
}

impl BlockedTimings {
    /// The currently-active reasons as a bitmask
    #[inline]
    pub fn active_mask(&self) -> u8 {
        self.active
    }

    #[inline]
    pub fn is_blocked_by(&self, reason: BlockedReason) -> bool {
        self.active & (1 << reason as u8) != 0
    }

    /// Applies a new active bitmask, starting and stopping timers on the
    /// reasons whose state flipped
    pub fn update(&mut self, mask: u8, now: Timestamp) {
        let changed = self.active ^ mask;
        if changed == 0 {
            return;
        }

        for index in 0..REASON_COUNT {
            let bit = 1u8 << index;
            if changed & bit == 0 {
                continue;
            }
            let entry = &mut self.entries[index];
            if mask & bit != 0 {
                entry.since = Some(now);
            } else if let Some(since) = entry.since.take() {
                entry.cumulative += now.saturating_duration_since(since);
            }
        }

        self.active = mask;
    }

    /// Starts a single reason
    #[inline]
    pub fn set(&mut self, reason: BlockedReason, now: Timestamp) {
        self.update(self.active | (1 << reason as u8), now);
    }

    /// Stops a single reason
    #[inline]
    pub fn clear(&mut self, reason: BlockedReason, now: Timestamp) {
        self.update(self.active & !(1 << reason as u8), now);
    }

    /// The total time attributed to `reason`, including any open interval
    pub fn cumulative(&self, reason: BlockedReason, now: Timestamp) -> Duration {
        let entry = &self.entries[reason as usize];
        let open = entry
            .since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or_default();
        entry.cumulative + open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::time::{Clock, NoopClock};

    #[test]
    fn accumulates_open_and_closed_intervals() {
        let mut timings = BlockedTimings::default();
        let mut now = NoopClock.get_time();

        timings.set(BlockedReason::Pacing, now);
        now += Duration::from_millis(10);
        timings.clear(BlockedReason::Pacing, now);

        assert_eq!(
            timings.cumulative(BlockedReason::Pacing, now),
            Duration::from_millis(10)
        );

        timings.set(BlockedReason::Pacing, now);
        now += Duration::from_millis(5);
        // the open interval is included
        assert_eq!(
            timings.cumulative(BlockedReason::Pacing, now),
            Duration::from_millis(15)
        );
    }

    #[test]
    fn mask_update_flips_multiple_reasons() {
        let mut timings = BlockedTimings::default();
        let mut now = NoopClock.get_time();

        let mask = (1 << BlockedReason::CongestionControl as u8)
            | (1 << BlockedReason::StreamFlowControl as u8);
        timings.update(mask, now);
        assert!(timings.is_blocked_by(BlockedReason::CongestionControl));

        now += Duration::from_millis(3);
        timings.update(0, now);
        assert!(!timings.is_blocked_by(BlockedReason::CongestionControl));
        assert_eq!(
            timings.cumulative(BlockedReason::StreamFlowControl, now),
            Duration::from_millis(3)
        );
        // untouched reasons stay at zero
        assert_eq!(
            timings.cumulative(BlockedReason::App, now),
            Duration::ZERO
        );
    }
}
