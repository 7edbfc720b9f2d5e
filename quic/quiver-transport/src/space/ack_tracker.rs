// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Receive-side acknowledgment state for one packet-number space

use crate::config::{ACK_DELAY_EXPONENT, MIN_ACK_SEND_NUMBER};
use quiver_core::{
    frame::ack::{Ack, AckRanges, EcnCounts},
    interval::{RangeSet, RANGE_ACK_PACKETS, RANGE_DUPLICATE_PACKETS},
    packet::number::PacketNumber,
    time::Timestamp,
    varint::VarInt,
};
use core::ops::RangeInclusive;
use s2n_codec::{Encoder, EncoderBuffer, EncoderValue};

/// Why an incoming packet was dropped by the tracker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveError {
    /// The packet number was already processed
    Duplicate,
}

/// Received packet numbers awaiting acknowledgment
#[derive(Debug)]
pub struct AckTracker {
    /// Ranges that will appear in the next ACK frame
    received: RangeSet,
    /// Wider history for duplicate detection
    duplicates: RangeSet,
    /// Ack-eliciting packets received since the last ACK went out
    ack_eliciting_count: u64,
    /// Receipt time of the largest packet, for the ack-delay field
    largest_received_time: Option<Timestamp>,
    largest_received: Option<PacketNumber>,
    /// An ACK should be sent at the next opportunity
    ack_immediately: bool,
    ecn_counts: EcnCounts,
}

impl Default for AckTracker {
    fn default() -> Self {
        Self {
            received: RangeSet::with_limit(RANGE_ACK_PACKETS),
            duplicates: RangeSet::with_limit(RANGE_DUPLICATE_PACKETS),
            ack_eliciting_count: 0,
            largest_received_time: None,
            largest_received: None,
            ack_immediately: false,
            ecn_counts: EcnCounts::default(),
        }
    }
}

impl AckTracker {
    /// True if the packet number was already processed; checked before any
    /// frame is acted on
    #[inline]
    pub fn is_duplicate(&self, packet_number: PacketNumber) -> bool {
        self.duplicates.contains(packet_number.as_u64())
    }

    /// Records a received packet; duplicate detection happens here
    pub fn on_packet_received(
        &mut self,
        packet_number: PacketNumber,
        ack_eliciting: bool,
        now: Timestamp,
    ) -> Result<(), ReceiveError> {
        let pn = packet_number.as_u64();

        if self.duplicates.contains(pn) {
            return Err(ReceiveError::Duplicate);
        }
        self.duplicates.insert_value(pn);

        let out_of_order = self
            .largest_received
            .map_or(false, |largest| packet_number < largest);

        self.received.insert_value(pn);

        if self.largest_received.map_or(true, |largest| packet_number > largest) {
            self.largest_received = Some(packet_number);
            self.largest_received_time = Some(now);
        }

        if ack_eliciting {
            self.ack_eliciting_count += 1;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-13.2.1
            //# an endpoint SHOULD send an ACK frame immediately after it receives
            //# an ack-eliciting packet that is out of order
            if out_of_order || self.ack_eliciting_count >= MIN_ACK_SEND_NUMBER {
                self.ack_immediately = true;
            }
        }

        Ok(())
    }

    /// True if an ACK frame should be sent without further delay
    #[inline]
    pub fn ack_needed(&self) -> bool {
        self.ack_immediately
    }

    /// True if an ACK should go out within the ack-delay timer
    #[inline]
    pub fn ack_pending(&self) -> bool {
        self.ack_eliciting_count > 0
    }

    #[inline]
    pub fn largest_received(&self) -> Option<PacketNumber> {
        self.largest_received
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.received.is_empty()
    }

    pub fn on_ecn_ce(&mut self) {
        self.ecn_counts.ce_count = self.ecn_counts.ce_count.saturating_add(VarInt::from_u8(1));
    }

    /// Writes an ACK frame covering everything received; on success the
    /// eliciting counter resets
    pub fn write_ack_frame(&mut self, now: Timestamp, encoder: &mut EncoderBuffer) -> bool {
        if self.received.is_empty() {
            return false;
        }

        let ack_delay = self
            .largest_received_time
            .map(|received| now.saturating_duration_since(received))
            .unwrap_or_default();
        let ack_delay = (ack_delay.as_micros() as u64) >> ACK_DELAY_EXPONENT;

        let ranges: Vec<RangeInclusive<VarInt>> = self
            .received
            .iter()
            .rev()
            .map(|interval| {
                let start = VarInt::new(interval.start).expect("packet numbers are varints");
                let end = VarInt::new(interval.last()).expect("packet numbers are varints");
                start..=end
            })
            .collect();

        let frame = Ack {
            ack_delay: VarInt::new(ack_delay).unwrap_or(VarInt::MAX),
            ack_ranges: DescendingRanges(ranges),
            ecn_counts: None,
        };

        if frame.encoding_size() > encoder.remaining_capacity() {
            return false;
        }
        encoder.encode(&frame);

        self.ack_eliciting_count = 0;
        self.ack_immediately = false;
        true
    }

    /// Drops ranges at or below `largest_acked` once the peer has
    /// confirmed seeing our ACK for them
    pub fn on_ack_frame_acked(&mut self, largest_acked: PacketNumber) {
        self.received.remove_below(largest_acked.as_u64() + 1);
    }
}

/// ACK ranges in descending order, as the wire format requires
struct DescendingRanges(Vec<RangeInclusive<VarInt>>);

impl AckRanges for DescendingRanges {
    type Iter = std::vec::IntoIter<RangeInclusive<VarInt>>;

    fn ack_ranges(&self) -> Self::Iter {
        self.0.clone().into_iter()
    }
}
