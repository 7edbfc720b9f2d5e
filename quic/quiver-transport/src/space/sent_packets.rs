// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Metadata for packets in flight, in send order

use crate::{
    crypto_stream::CryptoFrameInfo,
    stream::send::{ResetFrameInfo, StreamFrameInfo},
};
use quiver_core::{
    packet::number::{PacketNumber, PacketNumberSpace},
    recovery::congestion_controller::LastAckedPacketInfo,
    stream::{StreamId, StreamType},
    time::Timestamp,
    varint::VarInt,
};
use smallvec::SmallVec;
use std::collections::VecDeque;

/// A frame that may need action when its packet is acknowledged or lost
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SentFrame {
    Ping,
    /// The largest packet number the ACK covered
    Ack { largest_acked: PacketNumber },
    Crypto(CryptoFrameInfo),
    Stream(StreamFrameInfo),
    ResetStream(ResetFrameInfo),
    StopSending { stream_id: StreamId },
    MaxData { maximum: u64 },
    MaxStreamData { stream_id: StreamId },
    MaxStreams { stream_type: StreamType },
    DataBlocked,
    StreamDataBlocked { stream_id: StreamId },
    HandshakeDone,
    NewConnectionId { sequence_number: u64 },
    RetireConnectionId { sequence_number: u64 },
    PathChallenge { data: [u8; 8] },
    PathResponse,
    NewToken,
    Datagram { length: u16 },
    ConnectionClose,
    /// A path-MTU probe padded to `size` bytes
    MtuProbe { size: u16 },
}

/// Everything loss detection and congestion control need to know about one
/// sent packet
#[derive(Clone, Debug)]
pub struct SentPacketInfo {
    pub packet_number: PacketNumber,
    /// The packet-number space this packet was sent in
    pub space: PacketNumberSpace,
    pub sent_time: Timestamp,
    /// Wire bytes, AEAD overhead included
    pub sent_bytes: u16,
    pub ack_eliciting: bool,
    /// Counts toward bytes in flight
    pub in_flight: bool,
    pub is_app_limited: bool,
    /// Lifetime bytes sent when this packet went out
    pub total_bytes_sent_then: u64,
    /// Ack progress snapshot for rate sampling
    pub last_acked_packet_info: Option<LastAckedPacketInfo>,
    pub frames: SmallVec<[SentFrame; 4]>,
}

/// Sent packets awaiting acknowledgment, ordered by packet number
#[derive(Debug, Default)]
pub struct SentPackets {
    packets: VecDeque<SentPacketInfo>,
}

impl SentPackets {
    /// Records a packet; packet numbers are strictly increasing
    pub fn push(&mut self, info: SentPacketInfo) {
        debug_assert!(self
            .packets
            .back()
            .map_or(true, |last| last.packet_number < info.packet_number));
        self.packets.push_back(info);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &SentPacketInfo> {
        self.packets.iter()
    }

    /// The oldest ack-eliciting packet still outstanding
    pub fn earliest_ack_eliciting(&self) -> Option<&SentPacketInfo> {
        self.packets.iter().find(|packet| packet.ack_eliciting)
    }

    /// Removes and returns the packet with `packet_number`, if present
    pub fn take(&mut self, packet_number: PacketNumber) -> Option<SentPacketInfo> {
        let index = self
            .packets
            .binary_search_by_key(&packet_number, |packet| packet.packet_number)
            .ok()?;
        self.packets.remove(index)
    }

    /// Removes every packet with a number at or below `bound` that
    /// satisfies `predicate`, returning them in send order
    pub fn drain_below_if<F: FnMut(&SentPacketInfo) -> bool>(
        &mut self,
        bound: PacketNumber,
        mut predicate: F,
    ) -> Vec<SentPacketInfo> {
        let mut drained = Vec::new();
        let mut index = 0;
        while index < self.packets.len() {
            if self.packets[index].packet_number > bound {
                break;
            }
            if predicate(&self.packets[index]) {
                if let Some(packet) = self.packets.remove(index) {
                    drained.push(packet);
                }
            } else {
                index += 1;
            }
        }
        drained
    }

    /// Removes everything; used when a key level is discarded
    pub fn drain_all(&mut self) -> Vec<SentPacketInfo> {
        self.packets.drain(..).collect()
    }
}

/// Builds a `PacketNumber` from a raw value in tests and internal math
#[inline]
pub fn pn(value: u64) -> PacketNumber {
    PacketNumber::from_varint(VarInt::new(value).expect("packet number in range"))
}
