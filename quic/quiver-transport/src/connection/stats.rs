// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-connection statistics surfaced to the application

use core::time::Duration;

#[derive(Clone, Debug, Default)]
pub struct SendStats {
    pub total_packets: u64,
    pub total_bytes: u64,
    /// Packets carrying at least one retransmittable frame
    pub retransmittable_packets: u64,
    pub suspected_lost_packets: u64,
    pub spurious_lost_packets: u64,
    pub congestion_events: u64,
    pub persistent_congestion_events: u64,
}

#[derive(Clone, Debug, Default)]
pub struct RecvStats {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub dropped_packets: u64,
    pub duplicate_packets: u64,
    pub decryption_failures: u64,
    pub valid_ack_frames: u64,
}

#[derive(Clone, Debug, Default)]
pub struct HandshakeTiming {
    /// When the connection attempt started, as an offset from the clock
    /// epoch
    pub start: Option<Duration>,
    /// When the first flight was confirmed received
    pub initial_flight_end: Option<Duration>,
    /// When the handshake completed
    pub handshake_flight_end: Option<Duration>,
}

#[derive(Clone, Debug, Default)]
pub struct MiscStats {
    pub key_update_count: u64,
    pub dest_cid_update_count: u64,
}

/// The statistics slice the engine maintains
#[derive(Clone, Debug, Default)]
pub struct ConnectionStats {
    pub send: SendStats,
    pub recv: RecvStats,
    pub timing: HandshakeTiming,
    pub misc: MiscStats,
    /// The connection went through version negotiation
    pub version_negotiation: u64,
    /// The connection went through a stateless retry
    pub stateless_retry: u64,
    pub smoothed_rtt: Duration,
    pub min_rtt: Duration,
}
