// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Network paths: address pairs with their own congestion state, RTT
//! estimate, MTU, validation challenge, and amplification budget.

pub mod cid;
pub mod mtu;

pub use cid::CidManager;
pub use mtu::MtuDiscovery;

use crate::config::{Settings, AMPLIFICATION_RATIO, CongestionControlAlgorithm, MAX_PATH_COUNT};
use quiver_core::{
    random,
    recovery::{
        bbr::BbrCongestionControl, cubic::CubicCongestionControl, CongestionController,
        RttEstimator,
    },
    time::Timestamp,
};
use smallvec::SmallVec;
use std::net::SocketAddr;

/// An in-flight path validation
#[derive(Clone, Copy, Debug)]
pub struct Challenge {
    pub data: [u8; 8],
    /// Give up when this passes
    pub deadline: Timestamp,
    /// A PATH_CHALLENGE frame still needs to go out
    pub needs_to_send: bool,
}

#[derive(Debug)]
pub struct Path {
    pub local_address: SocketAddr,
    pub remote_address: SocketAddr,
    /// Sequence of the destination CID this path addresses the peer with
    pub dest_cid_sequence: Option<u64>,

    pub rtt: RttEstimator,
    pub cc: CongestionController,
    pub mtu: u16,
    /// Upward path-MTU search state
    pub mtu_discovery: MtuDiscovery,

    /// The peer's address has answered a challenge (or completed the
    /// handshake)
    pub validated: bool,
    pub challenge: Option<Challenge>,
    /// A PATH_RESPONSE owed to the peer
    pub response_pending: Option<[u8; 8]>,

    /// Amplification accounting while unvalidated
    pub bytes_sent: u64,
    pub bytes_received: u64,

    pub is_active: bool,
    /// Time data was last sent, for pacing
    pub last_send_time: Option<Timestamp>,
}

impl Path {
    pub fn new(
        local_address: SocketAddr,
        remote_address: SocketAddr,
        settings: &Settings,
        validated: bool,
    ) -> Self {
        let mtu = settings.minimum_mtu;
        let cc = match settings.congestion_control_algorithm {
            CongestionControlAlgorithm::Bbr => CongestionController::Bbr(
                BbrCongestionControl::new(mtu, settings.initial_window_packets, settings.pacing_enabled),
            ),
            CongestionControlAlgorithm::Cubic => CongestionController::Cubic(
                CubicCongestionControl::new(
                    mtu,
                    settings.initial_window_packets,
                    settings.pacing_enabled,
                    settings.hystart_enabled,
                ),
            ),
        };

        Self {
            local_address,
            remote_address,
            dest_cid_sequence: None,
            rtt: RttEstimator::new(settings.initial_rtt),
            cc,
            mtu,
            mtu_discovery: MtuDiscovery::new(settings.maximum_mtu),
            validated,
            challenge: None,
            response_pending: None,
            bytes_sent: 0,
            bytes_received: 0,
            is_active: false,
            last_send_time: None,
        }
    }

    /// Bytes this path may still send under amplification protection;
    /// `None` once the address is validated
    ///
    //= https://www.rfc-editor.org/rfc/rfc9000#section-8.1
    //# an endpoint MUST limit the amount of data it sends to the
    //# unvalidated address to three times the amount of data received from
    //# that address.
    #[inline]
    pub fn amplification_budget(&self) -> Option<u64> {
        if self.validated {
            return None;
        }
        Some((AMPLIFICATION_RATIO * self.bytes_received).saturating_sub(self.bytes_sent))
    }

    #[inline]
    pub fn is_amplification_blocked(&self) -> bool {
        self.amplification_budget() == Some(0)
    }

    pub fn on_bytes_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }

    pub fn on_bytes_sent(&mut self, bytes: usize, now: Timestamp) {
        self.bytes_sent += bytes as u64;
        self.last_send_time = Some(now);
    }

    /// A handshake packet from the peer validates the address implicitly
    pub fn on_handshake_packet(&mut self) {
        self.validated = true;
    }

    /// Starts (or restarts) path validation
    pub fn start_challenge(
        &mut self,
        rng: &mut dyn random::Generator,
        deadline: Timestamp,
    ) -> [u8; 8] {
        let mut data = [0u8; 8];
        rng.public_random_fill(&mut data);
        self.challenge = Some(Challenge {
            data,
            deadline,
            needs_to_send: true,
        });
        data
    }

    /// Handles a PATH_RESPONSE; returns true if it validated this path
    pub fn on_path_response(&mut self, data: &[u8; 8]) -> bool {
        match self.challenge {
            Some(challenge) if challenge.data == *data => {
                self.challenge = None;
                self.validated = true;
                true
            }
            _ => false,
        }
    }

    /// Abandons validation once the deadline passes
    pub fn on_challenge_timeout(&mut self, now: Timestamp) -> bool {
        match self.challenge {
            Some(challenge) if challenge.deadline.has_elapsed(now) => {
                self.challenge = None;
                true
            }
            _ => false,
        }
    }
}

/// The connection's paths: one active, a few probationary
#[derive(Debug)]
pub struct PathSet {
    paths: SmallVec<[Path; 1]>,
}

impl PathSet {
    pub fn new(initial: Path) -> Self {
        let mut initial = initial;
        initial.is_active = true;
        let mut paths = SmallVec::new();
        paths.push(initial);
        Self { paths }
    }

    #[inline]
    pub fn active(&self) -> &Path {
        self.paths
            .iter()
            .find(|path| path.is_active)
            .expect("one path is always active")
    }

    #[inline]
    pub fn active_mut(&mut self) -> &mut Path {
        self.paths
            .iter_mut()
            .find(|path| path.is_active)
            .expect("one path is always active")
    }

    #[inline]
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Path> {
        self.paths.iter_mut()
    }

    pub fn find_mut(&mut self, remote: SocketAddr) -> Option<&mut Path> {
        self.paths
            .iter_mut()
            .find(|path| path.remote_address == remote)
    }

    /// Finds the path a datagram arrived on, creating a probationary one
    /// for an unknown source address. Returns `None` when the path table
    /// is full (the datagram is dropped).
    pub fn find_or_create(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        settings: &Settings,
    ) -> Option<usize> {
        if let Some(index) = self
            .paths
            .iter()
            .position(|path| path.remote_address == remote)
        {
            return Some(index);
        }
        if self.paths.len() >= MAX_PATH_COUNT {
            return None;
        }
        self.paths.push(Path::new(local, remote, settings, false));
        Some(self.paths.len() - 1)
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Path> {
        self.paths.get_mut(index)
    }

    /// Promotes a validated path to active (connection migration)
    pub fn promote(&mut self, index: usize) {
        if self.paths.get(index).map_or(false, |path| path.validated) {
            for path in self.paths.iter_mut() {
                path.is_active = false;
            }
            self.paths[index].is_active = true;
        }
    }

    /// Drops a non-active path (validation failure, retired CID without a
    /// replacement)
    pub fn drop_path(&mut self, index: usize) {
        if self.paths.get(index).map_or(false, |path| !path.is_active) {
            self.paths.remove(index);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::{
        random::testing,
        time::{Clock, NoopClock},
    };
    use core::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn path(validated: bool) -> Path {
        Path::new(addr(1), addr(2), &Settings::default(), validated)
    }

    #[test]
    fn amplification_budget_tracks_three_to_one() {
        let mut path = path(false);
        assert!(path.is_amplification_blocked());

        path.on_bytes_received(1200);
        assert_eq!(path.amplification_budget(), Some(3600));

        path.on_bytes_sent(3600, NoopClock.get_time());
        assert!(path.is_amplification_blocked());

        path.on_handshake_packet();
        assert_eq!(path.amplification_budget(), None);
    }

    #[test]
    fn challenge_round_trip_validates() {
        let mut rng = testing::Generator::default();
        let mut path = path(false);
        let now = NoopClock.get_time();

        let data = path.start_challenge(&mut rng, now + Duration::from_secs(1));
        assert!(!path.validated);

        // a mismatched response changes nothing
        assert!(!path.on_path_response(&[0xff; 8]));
        assert!(!path.validated);

        assert!(path.on_path_response(&data));
        assert!(path.validated);
    }

    #[test]
    fn challenge_expires() {
        let mut rng = testing::Generator::default();
        let mut path = path(false);
        let now = NoopClock.get_time();

        path.start_challenge(&mut rng, now + Duration::from_millis(100));
        assert!(!path.on_challenge_timeout(now));
        assert!(path.on_challenge_timeout(now + Duration::from_millis(100)));
        assert!(path.challenge.is_none());
    }

    #[test]
    fn path_table_caps_and_migrates() {
        let mut set = PathSet::new(path(true));
        let settings = Settings::default();

        let index = set.find_or_create(addr(1), addr(9), &settings).unwrap();
        assert_eq!(set.len(), 2);

        // an unvalidated path cannot become active
        set.promote(index);
        assert_eq!(set.active().remote_address, addr(2));

        set.get_mut(index).unwrap().validated = true;
        set.promote(index);
        assert_eq!(set.active().remote_address, addr(9));

        // the table is bounded
        for port in 10..20 {
            set.find_or_create(addr(1), addr(port), &settings);
        }
        assert!(set.len() <= MAX_PATH_COUNT);
    }
}
