// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The serial TLS handshake byte stream.
//!
//! One contiguous outbound buffer carries the TLS messages of every
//! encryption level; `buffer_offset_handshake` and `buffer_offset_one_rtt`
//! mark where each level begins. The send side tracks acknowledgment with a
//! sparse range set above `unacked_offset` and retransmits through a
//! recovery window, so handshake data survives loss without per-level
//! buffers. The receive side reassembles into a single buffer, translating
//! each level's frame offsets by the absolute position where that level's
//! read key was installed.

use bytes::Bytes;
use quiver_core::{
    buffer::{self, RecvBuffer, RecvMode},
    frame::Crypto,
    interval::{RangeSet, RANGE_ALLOC_SIZE},
    packet,
    transport::Error,
    varint::VarInt,
};
use s2n_codec::{Encoder, EncoderBuffer, EncoderValue};
use smallvec::SmallVec;

#[cfg(test)]
mod tests;

/// Initial receive window for peer handshake data
const RECV_WINDOW_INITIAL: u64 = 0x4000;
/// Ceiling for the handshake receive window
const RECV_WINDOW_MAX: u64 = 0x10000;

/// Metadata for one CRYPTO frame written into a packet, kept with the
/// sent-packet record for ack/loss processing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CryptoFrameInfo {
    /// Absolute stream offset
    pub offset: u64,
    pub length: u16,
}

/// Outcome of acknowledging a crypto frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AckOutcome {
    /// True if no pending or recovery data remains queued
    pub send_complete: bool,
}

#[derive(Debug)]
pub struct CryptoStream {
    /// Outbound bytes `[buffer_total_length - len, buffer_total_length)`
    send_buffer: Vec<u8>,
    /// Absolute length of the outbound stream written so far
    buffer_total_length: u64,

    /// First byte not yet fully acknowledged
    unacked_offset: u64,
    /// First byte never transmitted
    next_send_offset: u64,
    /// Watermark of the largest byte transmitted
    max_sent_length: u64,
    /// Acknowledged holes above `unacked_offset`
    sparse_ack_ranges: RangeSet,

    /// Retransmission window `[recovery_next_offset, recovery_end_offset)`
    recovery_next_offset: u64,
    recovery_end_offset: u64,
    in_recovery: bool,

    /// Absolute offset where Handshake-level bytes begin; zero while unset
    buffer_offset_handshake: u64,
    /// Absolute offset where 1-RTT-level bytes begin; zero while unset
    buffer_offset_one_rtt: u64,

    /// Reassembly for peer handshake bytes; released on server complete
    recv_buffer: Option<RecvBuffer>,
    /// Absolute position where the current read key's level starts
    recv_encrypt_level_start_offset: u64,
    /// Bytes handed to TLS so far
    recv_total_consumed: u64,

    /// At most one TLS call may be outstanding
    tls_call_pending: bool,
    /// Data arrived while a TLS call was outstanding
    tls_data_pending: bool,
}

impl Default for CryptoStream {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoStream {
    pub fn new() -> Self {
        Self {
            send_buffer: Vec::new(),
            buffer_total_length: 0,
            unacked_offset: 0,
            next_send_offset: 0,
            max_sent_length: 0,
            sparse_ack_ranges: RangeSet::with_limit(RANGE_ALLOC_SIZE),
            recovery_next_offset: 0,
            recovery_end_offset: 0,
            in_recovery: false,
            buffer_offset_handshake: 0,
            buffer_offset_one_rtt: 0,
            recv_buffer: Some(RecvBuffer::new(
                RecvMode::Multiple,
                RECV_WINDOW_INITIAL,
                RECV_WINDOW_MAX,
            )),
            recv_encrypt_level_start_offset: 0,
            recv_total_consumed: 0,
            tls_call_pending: false,
            tls_data_pending: false,
        }
    }

    #[inline]
    pub fn unacked_offset(&self) -> u64 {
        self.unacked_offset
    }

    #[inline]
    pub fn next_send_offset(&self) -> u64 {
        self.next_send_offset
    }

    #[inline]
    pub fn max_sent_length(&self) -> u64 {
        self.max_sent_length
    }

    #[inline]
    pub fn buffer_total_length(&self) -> u64 {
        self.buffer_total_length
    }

    #[inline]
    pub fn sparse_ack_ranges(&self) -> &RangeSet {
        &self.sparse_ack_ranges
    }

    #[inline]
    fn recovery_window_open(&self) -> bool {
        self.recovery_next_offset < self.recovery_end_offset
    }

    /// True once every outbound byte has been acknowledged
    #[inline]
    pub fn everything_acked(&self) -> bool {
        self.unacked_offset == self.buffer_total_length
    }

    #[inline]
    pub fn one_rtt_boundary_set(&self) -> bool {
        self.buffer_offset_one_rtt != 0
    }

    /// True if any byte is queued for (re)transmission
    pub fn has_pending_data(&self) -> bool {
        self.recovery_window_open() || self.next_send_offset < self.buffer_total_length
    }

    /// The encryption level of the next byte to go out; the builder uses
    /// this to pick the packet type for pending crypto data
    pub fn next_send_level(&self) -> quiver_core::crypto::EncryptionLevel {
        use quiver_core::crypto::EncryptionLevel;

        let offset = if self.recovery_window_open() {
            self.recovery_next_offset
        } else {
            self.next_send_offset
        };

        if self.buffer_offset_one_rtt != 0 && offset >= self.buffer_offset_one_rtt {
            EncryptionLevel::OneRtt
        } else if self.buffer_offset_handshake != 0 && offset >= self.buffer_offset_handshake {
            EncryptionLevel::Handshake
        } else {
            EncryptionLevel::Initial
        }
    }

    // === send side ===

    /// Appends TLS output at the Initial level
    pub fn write_initial_data(&mut self, data: &[u8]) {
        debug_assert_eq!(
            self.buffer_offset_handshake, 0,
            "initial data after handshake level started"
        );
        self.append(data);
    }

    /// Appends TLS output at the Handshake level, starting the level if
    /// this is its first byte
    pub fn write_handshake_data(&mut self, data: &[u8]) {
        if self.buffer_offset_handshake == 0 {
            self.buffer_offset_handshake = self.buffer_total_length;
        }
        debug_assert_eq!(self.buffer_offset_one_rtt, 0);
        self.append(data);
    }

    /// Appends TLS output at the 1-RTT level
    pub fn write_one_rtt_data(&mut self, data: &[u8]) {
        if self.buffer_offset_one_rtt == 0 {
            self.buffer_offset_one_rtt = self.buffer_total_length;
        }
        self.append(data);
    }

    fn append(&mut self, data: &[u8]) {
        self.send_buffer.extend_from_slice(data);
        self.buffer_total_length += data.len() as u64;
        self.check_send_integrity();
    }

    /// The absolute window `[level_start, level_right)` a packet of
    /// `packet_type` may carry
    fn level_bounds(&self, packet_type: packet::Type) -> (u64, u64) {
        match packet_type {
            packet::Type::Initial => {
                let right = if self.buffer_offset_handshake != 0 {
                    self.buffer_offset_handshake
                } else {
                    self.buffer_total_length
                };
                (0, right)
            }
            packet::Type::Handshake => {
                debug_assert_ne!(self.buffer_offset_handshake, 0);
                let right = if self.buffer_offset_one_rtt != 0 {
                    self.buffer_offset_one_rtt
                } else {
                    self.buffer_total_length
                };
                (self.buffer_offset_handshake, right)
            }
            _ => {
                debug_assert_ne!(self.buffer_offset_one_rtt, 0);
                (self.buffer_offset_one_rtt, self.buffer_total_length)
            }
        }
    }

    /// Writes as many CRYPTO frames as fit, returning their metadata.
    ///
    /// Frame bounds walk the recovery window first, then untransmitted
    /// bytes, skipping acknowledged holes and clamping to the packet
    /// type's encryption-level span.
    pub fn write_frames(
        &mut self,
        packet_type: packet::Type,
        max_frames: usize,
        encoder: &mut EncoderBuffer,
    ) -> SmallVec<[CryptoFrameInfo; 4]> {
        let mut frames = SmallVec::new();

        while frames.len() < max_frames {
            let (left, recovery) = if self.recovery_window_open() {
                (self.recovery_next_offset, true)
            } else {
                (self.next_send_offset, false)
            };

            if left == self.buffer_total_length {
                break;
            }

            let mut right = left + encoder.remaining_capacity() as u64;

            if recovery
                && right > self.recovery_end_offset
                && self.recovery_end_offset != self.next_send_offset
            {
                right = self.recovery_end_offset;
            }

            // clamp to the first acknowledged hole above `left`
            let sack = if left == self.max_sent_length {
                // transmitting new bytes; no such hole can exist
                None
            } else {
                let sack = self.sparse_ack_ranges.first_above(left).map(|(_, s)| s);
                debug_assert!(
                    sack.map_or(true, |sack| sack.start >= left),
                    "send cursor {left} rests inside a SACK"
                );
                sack
            };

            match sack {
                Some(sack) => right = right.min(sack.start),
                None => right = right.min(self.buffer_total_length),
            }

            let (level_start, level_right) = self.level_bounds(packet_type);
            right = right.min(level_right);

            if left < level_start || left >= right {
                break;
            }

            let base = self.buffer_total_length - self.send_buffer.len() as u64;
            debug_assert!(left >= base);
            let data = &self.send_buffer[(left - base) as usize..(right - base) as usize];

            let frame = Crypto {
                offset: VarInt::new(left - level_start).expect("offset in varint range"),
                data,
            };

            let Ok(payload_len) = frame.try_fit(encoder.remaining_capacity()) else {
                break;
            };
            if payload_len == 0 {
                break;
            }

            let frame = Crypto {
                offset: frame.offset,
                data: &data[..payload_len],
            };
            encoder.encode(&frame);

            let right = left + payload_len as u64;

            // advance the send cursors, hopping over a hole whose low edge
            // they just reached
            if recovery {
                debug_assert!(self.recovery_next_offset <= right);
                self.recovery_next_offset = right;
                if let Some(sack) = sack {
                    if self.recovery_next_offset == sack.start {
                        self.recovery_next_offset += sack.len();
                    }
                }
            }

            if self.next_send_offset < right {
                self.next_send_offset = right;
                if let Some(sack) = sack {
                    if self.next_send_offset == sack.start {
                        self.next_send_offset += sack.len();
                    }
                }
            }

            if self.max_sent_length < right {
                self.max_sent_length = right;
            }

            frames.push(CryptoFrameInfo {
                offset: left,
                length: payload_len as u16,
            });
        }

        self.check_send_integrity();
        frames
    }

    /// Processes acknowledgment of one previously-sent frame
    pub fn on_ack(&mut self, frame: CryptoFrameInfo) -> AckOutcome {
        let offset = frame.offset;
        let following = offset + frame.length as u64;
        debug_assert!(following <= self.buffer_total_length);

        if offset <= self.unacked_offset {
            if self.unacked_offset < following {
                // drain the front of the send buffer
                let drain_length = (following - self.unacked_offset) as usize;
                if self.send_buffer.len() > drain_length {
                    self.send_buffer.drain(..drain_length);
                } else {
                    self.send_buffer.clear();
                }

                self.unacked_offset = following;

                // absorb any hole the new offset caught up to
                self.sparse_ack_ranges.remove_below(self.unacked_offset);
                if let Some(sack) = self.sparse_ack_ranges.min() {
                    if sack.start == self.unacked_offset {
                        self.unacked_offset = sack.end;
                        self.sparse_ack_ranges.remove_at(0, 1);
                    }
                }

                if self.next_send_offset < self.unacked_offset {
                    self.next_send_offset = self.unacked_offset;
                }
                if self.recovery_next_offset < self.unacked_offset {
                    self.recovery_next_offset = self.unacked_offset;
                }
                if self.recovery_end_offset < self.unacked_offset {
                    self.in_recovery = false;
                }
            }
        } else {
            let insertion = self.sparse_ack_ranges.insert(offset, following);
            if insertion.updated {
                let sack = self
                    .sparse_ack_ranges
                    .get(insertion.index)
                    .expect("inserted range exists");

                // frame writing assumes the send cursors are unacknowledged
                if (sack.start..sack.end).contains(&self.next_send_offset) {
                    self.next_send_offset = sack.end;
                }
                if (sack.start..sack.end).contains(&self.recovery_next_offset) {
                    self.recovery_next_offset = sack.end;
                }
            }
        }

        self.check_send_integrity();

        AckOutcome {
            send_complete: !self.has_pending_data(),
        }
    }

    /// Processes loss of one previously-sent frame, expanding the recovery
    /// window over any bytes still outstanding.
    ///
    /// Returns true if retransmission is now required.
    pub fn on_loss(&mut self, frame: CryptoFrameInfo) -> bool {
        let mut start = frame.offset;
        let mut end = start + frame.length as u64;

        if end <= self.unacked_offset {
            // already completely acknowledged
            return false;
        }
        if start < self.unacked_offset {
            start = self.unacked_offset;
        }

        // trim the lost range against acknowledged holes
        for sack in self.sparse_ack_ranges.iter() {
            if sack.start >= end {
                break;
            }
            if start < sack.end {
                if start >= sack.start {
                    if end <= sack.end {
                        // fully covered by the hole
                        return false;
                    }
                    start = sack.end;
                } else if end <= sack.end {
                    end = sack.start;
                }
                // a hole strictly inside the range still leaves both edges
                // needing retransmission
            }
        }

        let mut updated = false;
        if start < self.recovery_next_offset {
            self.recovery_next_offset = start;
            updated = true;
        }
        if self.recovery_end_offset < end {
            self.recovery_end_offset = end;
            updated = true;
        }

        if updated {
            self.in_recovery = true;
        }

        self.check_send_integrity();
        updated
    }

    /// Releases the send and receive buffers once the handshake no longer
    /// needs them (server completion)
    pub fn release_buffers(&mut self) {
        self.send_buffer = Vec::new();
        self.recv_buffer = None;
    }

    // === receive side ===

    /// Accepts an incoming CRYPTO frame at the current read level.
    ///
    /// Returns true if new contiguous data became available for TLS.
    pub fn on_crypto_frame(&mut self, frame_offset: u64, data: &[u8]) -> Result<bool, Error> {
        let Some(recv_buffer) = self.recv_buffer.as_mut() else {
            // the handshake is finished; late frames carry nothing we need
            return Ok(false);
        };

        let absolute = self
            .recv_encrypt_level_start_offset
            .checked_add(frame_offset)
            .ok_or(Error::CRYPTO_BUFFER_EXCEEDED)?;

        match recv_buffer.write(absolute, data) {
            Ok(outcome) => Ok(outcome.data_ready),
            Err(buffer::Error::FlowControlExceeded) => Err(Error::CRYPTO_BUFFER_EXCEEDED
                .with_reason("peer exceeded the crypto buffer limit")),
        }
    }

    /// Pulls up to `max_len` contiguous received bytes for TLS
    pub fn read_pending(&mut self, max_len: Option<usize>) -> Option<Bytes> {
        use quiver_core::time::{Clock, NoopClock};

        let recv_buffer = self.recv_buffer.as_mut()?;
        let available = recv_buffer.readable_len();
        if available == 0 {
            return None;
        }

        let len = max_len.map_or(available, |max| max.min(available));
        let mut data = vec![0u8; len];
        // the handshake window policy keys off its own drain rate; the
        // engine's RTT estimate is irrelevant at this layer
        let read = recv_buffer.read(
            &mut data,
            NoopClock.get_time(),
            core::time::Duration::from_millis(1),
        );
        debug_assert_eq!(read, len);
        self.recv_total_consumed += read as u64;

        Some(Bytes::from(data))
    }

    /// A new read key was installed: subsequent frame offsets restart at
    /// zero for the new level
    pub fn on_read_key_updated(&mut self) {
        debug_assert_eq!(
            self.recv_buffer
                .as_ref()
                .map_or(self.recv_total_consumed, |buffer| buffer.base_offset()),
            self.recv_total_consumed,
            "level transition with undelivered crypto data"
        );
        self.recv_encrypt_level_start_offset = self.recv_total_consumed;
    }

    // === TLS reentrancy latch ===

    /// Claims the single outstanding TLS call; false if one is in flight
    pub fn begin_tls_call(&mut self) -> bool {
        if self.tls_call_pending {
            self.tls_data_pending = true;
            return false;
        }
        self.tls_call_pending = true;
        true
    }

    /// Completes the outstanding TLS call, reporting whether data queued
    /// while it ran (requiring one re-entry)
    pub fn end_tls_call(&mut self) -> bool {
        debug_assert!(self.tls_call_pending);
        self.tls_call_pending = false;
        core::mem::take(&mut self.tls_data_pending)
    }

    #[inline]
    pub fn tls_call_pending(&self) -> bool {
        self.tls_call_pending
    }

    fn check_send_integrity(&self) {
        if cfg!(debug_assertions) {
            assert!(self.unacked_offset <= self.next_send_offset);
            assert!(self.next_send_offset <= self.max_sent_length || self.max_sent_length == 0);
            assert!(self.next_send_offset <= self.buffer_total_length);
            assert!(self.max_sent_length <= self.buffer_total_length);
            if let Some(first) = self.sparse_ack_ranges.min() {
                assert!(first.start > self.unacked_offset);
            }
            // the send cursors never rest inside an acknowledged hole
            for sack in self.sparse_ack_ranges.iter() {
                assert!(
                    !(sack.start..sack.end).contains(&self.next_send_offset),
                    "next_send_offset inside a SACK"
                );
                if self.recovery_window_open() {
                    assert!(
                        !(sack.start..sack.end).contains(&self.recovery_next_offset),
                        "recovery_next_offset inside a SACK"
                    );
                }
            }
        }
    }
}
