// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Loss recovery and congestion control primitives

pub mod bbr;
pub mod congestion_controller;
pub mod cubic;
pub mod rtt_estimator;
pub mod windowed_filter;

pub use congestion_controller::{
    AckEvent, AckedPacketInfo, CongestionControl, CongestionController, LastAckedPacketInfo,
    LossEvent,
};
pub use rtt_estimator::RttEstimator;

/// The number of packets ahead of a later acknowledged packet before a
/// packet is declared lost
pub const PACKET_REORDER_THRESHOLD: u64 = 3;

/// Packets sent this factor of an RTT before a later acknowledged packet
/// are declared lost
#[inline]
pub fn time_reorder_threshold(rtt: core::time::Duration) -> core::time::Duration {
    rtt + rtt / 8
}

/// Multiplier applied to the PTO period to detect persistent congestion
pub const PERSISTENT_CONGESTION_THRESHOLD: u32 = 2;

/// The congestion window collapses to this many packets under persistent
/// congestion
pub const PERSISTENT_CONGESTION_WINDOW_PACKETS: u32 = 2;
