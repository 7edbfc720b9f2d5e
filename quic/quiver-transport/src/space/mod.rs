// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-encryption-level packet-number spaces

pub mod ack_tracker;
pub mod key_set;
pub mod loss_detection;
pub mod sent_packets;

pub use ack_tracker::AckTracker;
pub use key_set::{KeySet, PhaseMatch};
pub use loss_detection::{AckProcessing, LossDetection};
pub use sent_packets::{SentFrame, SentPacketInfo, SentPackets};

use quiver_core::packet::number::{PacketNumber, PacketNumberSpace};

/// Everything one packet-number space owns: the next send number, the
/// receive-side ack tracker, the in-flight packet list, and its loss state
#[derive(Debug)]
pub struct PacketSpace {
    space: PacketNumberSpace,
    next_packet_number: PacketNumber,
    pub ack_tracker: AckTracker,
    pub sent_packets: SentPackets,
    pub loss: LossDetection,
    /// The space was discarded along with its keys
    discarded: bool,
}

impl PacketSpace {
    pub fn new(space: PacketNumberSpace) -> Self {
        Self {
            space,
            next_packet_number: PacketNumber::ZERO,
            ack_tracker: AckTracker::default(),
            sent_packets: SentPackets::default(),
            loss: LossDetection::default(),
            discarded: false,
        }
    }

    #[inline]
    pub fn space(&self) -> PacketNumberSpace {
        self.space
    }

    #[inline]
    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    /// Allocates the next packet number; numbers are strictly monotonic
    /// within the space
    pub fn next_packet_number(&mut self) -> PacketNumber {
        let number = self.next_packet_number;
        self.next_packet_number = number.next().expect("packet number space exhausted");
        number
    }

    #[inline]
    pub fn peek_packet_number(&self) -> PacketNumber {
        self.next_packet_number
    }

    /// Discards the space with its keys: every sent-packet record is
    /// released and timers reset. Returns the invalidated in-flight bytes.
    pub fn discard(&mut self) -> u64 {
        self.discarded = true;
        let invalidated: u64 = self
            .sent_packets
            .drain_all()
            .iter()
            .filter(|packet| packet.in_flight)
            .map(|packet| packet.sent_bytes as u64)
            .sum();
        self.loss.reset();
        invalidated
    }
}
