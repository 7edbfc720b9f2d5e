// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Ack processing, loss declaration, and probe timing for one
//! packet-number space.
//!
//! Loss uses both orderings: a packet is lost once a packet sent three
//! packets after it is acknowledged, or once it has been outstanding more
//! than a time threshold past the newest acknowledged packet. Neither alone
//! is declared immediately; the time case arms a timer so reordered but
//! undelivered packets are caught without a new ACK.

use crate::space::sent_packets::{SentPacketInfo, SentPackets};
use quiver_core::{
    interval::RangeSet,
    packet::number::PacketNumber,
    recovery::{RttEstimator, PACKET_REORDER_THRESHOLD},
    time::Timestamp,
};
use core::time::Duration;

/// What one incoming ACK produced
#[derive(Debug, Default)]
pub struct AckProcessing {
    /// Packets newly acknowledged, in send order
    pub newly_acked: Vec<SentPacketInfo>,
    /// Packets declared lost, in send order
    pub lost: Vec<SentPacketInfo>,
    /// RTT sample, present when the largest acknowledged packet was newly
    /// acknowledged and ack-eliciting
    pub latest_rtt: Option<Duration>,
    /// True if the loss span indicates persistent congestion
    pub persistent_congestion: bool,
}

#[derive(Debug, Default)]
pub struct LossDetection {
    largest_acked: Option<PacketNumber>,
    largest_acked_sent_time: Option<Timestamp>,
    /// Deadline at which outstanding packets cross the time threshold
    loss_time: Option<Timestamp>,
    /// Send time of the newest ack-eliciting packet, for PTO arming
    time_of_last_ack_eliciting: Option<Timestamp>,
}

impl LossDetection {
    #[inline]
    pub fn largest_acked(&self) -> Option<PacketNumber> {
        self.largest_acked
    }

    #[inline]
    pub fn loss_time(&self) -> Option<Timestamp> {
        self.loss_time
    }

    /// Records a sent packet's timing
    pub fn on_packet_sent(&mut self, ack_eliciting: bool, now: Timestamp) {
        if ack_eliciting {
            self.time_of_last_ack_eliciting = Some(now);
        }
    }

    /// Processes the ranges of an incoming ACK frame.
    ///
    /// `ranges` holds the acknowledged packet numbers; packets outside the
    /// sent list are ignored (already acknowledged or never sent).
    pub fn on_ack_received(
        &mut self,
        sent: &mut SentPackets,
        ranges: &RangeSet,
        now: Timestamp,
        rtt: &RttEstimator,
    ) -> AckProcessing {
        let mut processing = AckProcessing::default();
        let Some(largest_in_ack) = ranges.max_value() else {
            return processing;
        };

        // collect newly-acknowledged packets in send order
        let bound = PacketNumber::from_varint(
            quiver_core::varint::VarInt::new(largest_in_ack).expect("packet number in range"),
        );
        processing.newly_acked =
            sent.drain_below_if(bound, |packet| ranges.contains(packet.packet_number.as_u64()));

        if let Some(largest_newly) = processing.newly_acked.last() {
            let is_largest = largest_newly.packet_number.as_u64() == largest_in_ack;

            if self
                .largest_acked
                .map_or(true, |largest| largest_newly.packet_number > largest)
            {
                self.largest_acked = Some(largest_newly.packet_number);
                self.largest_acked_sent_time = Some(largest_newly.sent_time);
            }

            //= https://www.rfc-editor.org/rfc/rfc9002#section-5.1
            //# An endpoint generates an RTT sample on receiving an ACK frame that
            //# meets the following two conditions:
            //# *  the largest acknowledged packet number is newly acknowledged
            //# *  at least one of the newly acknowledged packets was ack-eliciting
            if is_largest && processing.newly_acked.iter().any(|packet| packet.ack_eliciting) {
                processing.latest_rtt =
                    Some(now.saturating_duration_since(largest_newly.sent_time));
            }
        }

        if processing.newly_acked.is_empty() {
            return processing;
        }

        processing.lost = self.detect_lost_packets(sent, now, rtt);
        processing.persistent_congestion =
            self.in_persistent_congestion(&processing.lost, rtt);

        processing
    }

    /// Declares lost packets and re-arms the loss timer
    pub fn detect_lost_packets(
        &mut self,
        sent: &mut SentPackets,
        now: Timestamp,
        rtt: &RttEstimator,
    ) -> Vec<SentPacketInfo> {
        self.loss_time = None;

        let Some(largest_acked) = self.largest_acked else {
            return Vec::new();
        };

        let loss_delay = rtt.loss_time_threshold();
        let lost_send_time = now.checked_sub(loss_delay);

        let mut lost = Vec::new();
        let mut earliest_pending: Option<Timestamp> = None;

        let drained = sent.drain_below_if(largest_acked, |packet| {
            // packet-reorder threshold
            if packet.packet_number.as_u64() + PACKET_REORDER_THRESHOLD <= largest_acked.as_u64() {
                return true;
            }
            // time-reorder threshold
            if let Some(lost_send_time) = lost_send_time {
                if packet.sent_time <= lost_send_time {
                    return true;
                }
            }
            let deadline = packet.sent_time + loss_delay;
            earliest_pending = Some(match earliest_pending {
                Some(current) => current.min(deadline),
                None => deadline,
            });
            false
        });

        lost.extend(drained);
        self.loss_time = earliest_pending;
        lost
    }

    //= https://www.rfc-editor.org/rfc/rfc9002#section-7.6.2
    //# A sender establishes persistent congestion after the receipt of an
    //# acknowledgment if two packets that are ack-eliciting are declared
    //# lost, and:
    //# *  ...the duration between the send times of these two packets exceeds
    //#    the persistent congestion duration
    fn in_persistent_congestion(&self, lost: &[SentPacketInfo], rtt: &RttEstimator) -> bool {
        if rtt.first_rtt_sample().is_none() {
            return false;
        }
        let mut eliciting = lost.iter().filter(|packet| packet.ack_eliciting);
        let (Some(first), Some(last)) = (eliciting.next(), eliciting.last()) else {
            return false;
        };
        last.sent_time.saturating_duration_since(first.sent_time)
            > rtt.persistent_congestion_threshold()
    }

    /// The PTO deadline given the current backoff, or `None` with nothing
    /// ack-eliciting outstanding
    pub fn pto_deadline(
        &self,
        sent: &SentPackets,
        rtt: &RttEstimator,
        pto_backoff: u32,
        space: quiver_core::packet::number::PacketNumberSpace,
    ) -> Option<Timestamp> {
        sent.earliest_ack_eliciting()?;
        let base = self.time_of_last_ack_eliciting?;
        Some(base + rtt.pto_period(pto_backoff, space))
    }

    /// Discarding a key level forgets all timing state
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::sent_packets::{pn, SentFrame, SentPacketInfo};
    use quiver_core::{
        packet::number::PacketNumberSpace,
        time::{Clock, NoopClock},
    };
    use smallvec::smallvec;

    fn packet(number: u64, sent_time: Timestamp) -> SentPacketInfo {
        SentPacketInfo {
            packet_number: pn(number),
            space: PacketNumberSpace::Handshake,
            sent_time,
            sent_bytes: 1200,
            ack_eliciting: true,
            in_flight: true,
            is_app_limited: false,
            total_bytes_sent_then: number * 1200,
            last_acked_packet_info: None,
            frames: smallvec![SentFrame::Ping],
        }
    }

    fn rtt_with_sample(now: Timestamp) -> RttEstimator {
        let mut rtt = RttEstimator::default();
        rtt.update_rtt(Duration::from_millis(40), Duration::ZERO, now, false);
        rtt
    }

    fn ranges(values: &[(u64, u64)]) -> RangeSet {
        let mut set = RangeSet::new();
        for (start, end) in values {
            set.insert(*start, *end + 1);
        }
        set
    }

    #[test]
    fn ack_produces_rtt_sample() {
        let now = NoopClock.get_time();
        let rtt = RttEstimator::default();
        let mut sent = SentPackets::default();
        let mut loss = LossDetection::default();

        sent.push(packet(0, now));
        let later = now + Duration::from_millis(30);
        let processing = loss.on_ack_received(&mut sent, &ranges(&[(0, 0)]), later, &rtt);

        assert_eq!(processing.newly_acked.len(), 1);
        assert_eq!(processing.latest_rtt, Some(Duration::from_millis(30)));
        assert_eq!(loss.largest_acked(), Some(pn(0)));
    }

    #[test]
    fn reorder_threshold_declares_loss() {
        let now = NoopClock.get_time();
        let rtt = rtt_with_sample(now);
        let mut sent = SentPackets::default();
        let mut loss = LossDetection::default();

        for n in 0..5 {
            sent.push(packet(n, now));
        }

        // packet 4 acked: packets 0 and 1 fall behind the reorder window
        let processing =
            loss.on_ack_received(&mut sent, &ranges(&[(4, 4)]), now + Duration::from_millis(1), &rtt);
        let lost: Vec<_> = processing
            .lost
            .iter()
            .map(|packet| packet.packet_number.as_u64())
            .collect();
        assert_eq!(lost, [0, 1]);
        // 2 and 3 stay pending under the loss timer
        assert!(loss.loss_time().is_some());
        assert_eq!(sent.len(), 2);
    }

    #[test]
    fn time_threshold_declares_loss() {
        let now = NoopClock.get_time();
        let rtt = rtt_with_sample(now);
        let mut sent = SentPackets::default();
        let mut loss = LossDetection::default();

        sent.push(packet(0, now));
        sent.push(packet(1, now + Duration::from_millis(100)));

        // ack packet 1 long after packet 0 went out
        let ack_time = now + Duration::from_millis(200);
        let processing = loss.on_ack_received(&mut sent, &ranges(&[(1, 1)]), ack_time, &rtt);

        let lost: Vec<_> = processing
            .lost
            .iter()
            .map(|packet| packet.packet_number.as_u64())
            .collect();
        assert_eq!(lost, [0]);
    }

    #[test]
    fn duplicate_ack_changes_nothing() {
        let now = NoopClock.get_time();
        let rtt = rtt_with_sample(now);
        let mut sent = SentPackets::default();
        let mut loss = LossDetection::default();

        sent.push(packet(0, now));
        loss.on_ack_received(&mut sent, &ranges(&[(0, 0)]), now, &rtt);
        let processing = loss.on_ack_received(&mut sent, &ranges(&[(0, 0)]), now, &rtt);

        assert!(processing.newly_acked.is_empty());
        assert!(processing.lost.is_empty());
        assert!(processing.latest_rtt.is_none());
    }

    #[test]
    fn persistent_congestion_requires_long_span() {
        let now = NoopClock.get_time();
        let rtt = rtt_with_sample(now);
        let mut sent = SentPackets::default();
        let mut loss = LossDetection::default();

        // lost packets spanning well beyond the persistent threshold
        sent.push(packet(0, now));
        sent.push(packet(1, now + Duration::from_secs(2)));
        for n in 2..6 {
            sent.push(packet(n, now + Duration::from_secs(3)));
        }

        let processing = loss.on_ack_received(
            &mut sent,
            &ranges(&[(5, 5)]),
            now + Duration::from_secs(3),
            &rtt,
        );
        assert!(processing.lost.len() >= 2);
        assert!(processing.persistent_congestion);
    }

    #[test]
    fn pto_deadline_tracks_last_eliciting_send() {
        let now = NoopClock.get_time();
        let rtt = rtt_with_sample(now);
        let mut sent = SentPackets::default();
        let mut loss = LossDetection::default();

        assert!(loss
            .pto_deadline(&sent, &rtt, 1, PacketNumberSpace::Handshake)
            .is_none());

        sent.push(packet(0, now));
        loss.on_packet_sent(true, now);

        let deadline = loss
            .pto_deadline(&sent, &rtt, 1, PacketNumberSpace::Handshake)
            .unwrap();
        assert_eq!(deadline, now + rtt.pto_period(1, PacketNumberSpace::Handshake));

        // backoff doubles the period
        let doubled = loss
            .pto_deadline(&sent, &rtt, 2, PacketNumberSpace::Handshake)
            .unwrap();
        assert!(doubled > deadline);
    }
}
