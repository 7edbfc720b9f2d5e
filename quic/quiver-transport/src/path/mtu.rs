// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Datagram packetization-layer path MTU discovery.
//!
//! After the handshake confirms the path, the search walks upward from the
//! base MTU in fixed increments, sending one padded probe at a time. A
//! probe that is acknowledged raises the path MTU; one that fails
//! `MAX_PROBES` times ends the search. A completed search re-opens when
//! the raise timer fires, so a path whose true MTU grew is eventually
//! rediscovered.

use quiver_core::time::Timestamp;
use core::time::Duration;

/// Probe transmissions attempted per candidate size before giving up
pub const MAX_PROBES: u8 = 3;

/// How long after a completed search before probing upward again
pub const RAISE_TIMEOUT: Duration = Duration::from_secs(600);

/// Step between candidate sizes
pub const PROBE_INCREMENT: u16 = 80;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// The handshake has not confirmed the path yet
    Disabled,
    /// Probing `probe_size`; at most one probe is in flight
    Searching {
        probe_size: u16,
        probe_count: u8,
        in_flight: bool,
    },
    /// The search ended; the raise timer re-opens it
    SearchComplete { raise_at: Timestamp },
}

/// Per-path MTU search state
#[derive(Clone, Copy, Debug)]
pub struct MtuDiscovery {
    state: State,
    max_mtu: u16,
}

impl MtuDiscovery {
    pub fn new(max_mtu: u16) -> Self {
        Self {
            state: State::Disabled,
            max_mtu,
        }
    }

    /// Starts the search once the handshake confirms the path
    pub fn on_connected(&mut self, current_mtu: u16, now: Timestamp) {
        if self.state != State::Disabled {
            return;
        }
        if current_mtu >= self.max_mtu {
            self.state = State::SearchComplete {
                raise_at: now + RAISE_TIMEOUT,
            };
            return;
        }
        self.state = State::Searching {
            probe_size: (current_mtu + PROBE_INCREMENT).min(self.max_mtu),
            probe_count: 0,
            in_flight: false,
        };
    }

    /// The size to probe next, when the search wants a probe on the wire
    pub fn probe_size(&self) -> Option<u16> {
        match self.state {
            State::Searching {
                probe_size,
                in_flight: false,
                ..
            } => Some(probe_size),
            _ => None,
        }
    }

    pub fn on_probe_sent(&mut self) {
        if let State::Searching { in_flight, .. } = &mut self.state {
            *in_flight = true;
        }
    }

    /// A probe of `size` was acknowledged. Returns the new path MTU when
    /// the acknowledgment advances the search.
    pub fn on_probe_acked(&mut self, size: u16, now: Timestamp) -> Option<u16> {
        let State::Searching { probe_size, .. } = self.state else {
            return None;
        };
        if size != probe_size {
            return None;
        }

        if probe_size >= self.max_mtu {
            self.state = State::SearchComplete {
                raise_at: now + RAISE_TIMEOUT,
            };
        } else {
            self.state = State::Searching {
                probe_size: (probe_size + PROBE_INCREMENT).min(self.max_mtu),
                probe_count: 0,
                in_flight: false,
            };
        }
        Some(size)
    }

    /// A probe of `size` was declared lost
    pub fn on_probe_lost(&mut self, size: u16, now: Timestamp) {
        let State::Searching {
            probe_size,
            probe_count,
            ..
        } = self.state
        else {
            return;
        };
        if size != probe_size {
            return;
        }

        let probe_count = probe_count + 1;
        if probe_count >= MAX_PROBES {
            // the path cannot carry this size; settle where we are
            self.state = State::SearchComplete {
                raise_at: now + RAISE_TIMEOUT,
            };
        } else {
            self.state = State::Searching {
                probe_size,
                probe_count,
                in_flight: false,
            };
        }
    }

    /// The deadline at which a completed search re-opens
    pub fn raise_deadline(&self) -> Option<Timestamp> {
        match self.state {
            State::SearchComplete { raise_at } => Some(raise_at),
            _ => None,
        }
    }

    /// Re-opens the search when the raise timer fired. Returns true if
    /// probing resumed.
    pub fn on_raise_timeout(&mut self, current_mtu: u16, now: Timestamp) -> bool {
        let State::SearchComplete { raise_at } = self.state else {
            return false;
        };
        if !raise_at.has_elapsed(now) {
            return false;
        }
        if current_mtu >= self.max_mtu {
            self.state = State::SearchComplete {
                raise_at: now + RAISE_TIMEOUT,
            };
            return false;
        }
        self.state = State::Searching {
            probe_size: (current_mtu + PROBE_INCREMENT).min(self.max_mtu),
            probe_count: 0,
            in_flight: false,
        };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::time::{Clock, NoopClock};

    #[test]
    fn search_walks_to_the_maximum() {
        let now = NoopClock.get_time();
        let mut discovery = MtuDiscovery::new(1500);
        let mut mtu = 1248u16;

        discovery.on_connected(mtu, now);

        // each acknowledged probe raises the mtu by one increment
        for _ in 0..8 {
            let Some(size) = discovery.probe_size() else {
                break;
            };
            assert_eq!(size, (mtu + PROBE_INCREMENT).min(1500));
            discovery.on_probe_sent();
            assert_eq!(discovery.probe_size(), None);
            mtu = discovery.on_probe_acked(size, now).expect("probe advances");
        }

        assert_eq!(mtu, 1500);
        assert!(discovery.probe_size().is_none());
        assert!(discovery.raise_deadline().is_some());
    }

    #[test]
    fn repeated_loss_ends_the_search() {
        let now = NoopClock.get_time();
        let mut discovery = MtuDiscovery::new(1500);
        discovery.on_connected(1248, now);

        for attempt in 0..MAX_PROBES {
            let size = discovery.probe_size().expect("still searching");
            discovery.on_probe_sent();
            discovery.on_probe_lost(size, now);
            let _ = attempt;
        }

        assert!(discovery.probe_size().is_none());
        assert_eq!(discovery.raise_deadline(), Some(now + RAISE_TIMEOUT));
    }

    #[test]
    fn raise_timer_reopens_the_search() {
        let now = NoopClock.get_time();
        let mut discovery = MtuDiscovery::new(1500);
        discovery.on_connected(1248, now);

        let size = discovery.probe_size().unwrap();
        discovery.on_probe_sent();
        for _ in 0..MAX_PROBES {
            discovery.on_probe_lost(size, now);
        }
        assert!(discovery.probe_size().is_none());

        let raise_at = discovery.raise_deadline().unwrap();
        assert!(!discovery.on_raise_timeout(1248, raise_at - Duration::from_secs(1)));
        assert!(discovery.on_raise_timeout(1248, raise_at));
        assert_eq!(discovery.probe_size(), Some(1248 + PROBE_INCREMENT));
    }

    #[test]
    fn stale_acks_are_ignored() {
        let now = NoopClock.get_time();
        let mut discovery = MtuDiscovery::new(1500);
        discovery.on_connected(1248, now);

        assert_eq!(discovery.on_probe_acked(9999, now), None);
        assert!(discovery.probe_size().is_some());
    }

    #[test]
    fn already_at_maximum_skips_the_search() {
        let now = NoopClock.get_time();
        let mut discovery = MtuDiscovery::new(1500);
        discovery.on_connected(1500, now);
        assert!(discovery.probe_size().is_none());
        assert!(discovery.raise_deadline().is_some());
    }
}
