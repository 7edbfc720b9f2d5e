// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The send half of an application stream.
//!
//! Acknowledgment tracking mirrors the crypto stream: a contiguous buffer
//! above `unacked_offset`, sparse acknowledged holes, and a recovery window
//! for retransmission. On top of that sit the peer's flow-control grant,
//! FIN accounting, and reset semantics (including reliable reset, which
//! keeps delivering bytes below the reliable offset after the reset goes
//! out).

use quiver_core::{
    frame::{self, Stream as StreamFrame},
    interval::{RangeSet, RANGE_ALLOC_SIZE},
    stream::StreamId,
    transport::error::ApplicationError,
    varint::VarInt,
};
use s2n_codec::{Encoder, EncoderBuffer, EncoderValue};
use smallvec::SmallVec;

/// Send-half states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendState {
    /// Open, no data queued yet
    Open,
    /// Data queued or in flight
    Send,
    /// FIN has been sent; waiting for everything to be acknowledged
    DataSent,
    /// All data and the FIN are acknowledged (terminal)
    DataRecvd,
    /// RESET_STREAM (or its reliable variant) has been sent
    ResetSent,
    /// The reset is acknowledged (terminal)
    ResetRecvd,
}

impl SendState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::DataRecvd | Self::ResetRecvd)
    }
}

/// Metadata for one STREAM frame in a sent packet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFrameInfo {
    pub stream_id: StreamId,
    pub offset: u64,
    pub length: u16,
    pub fin: bool,
}

/// Metadata for a RESET_STREAM frame in a sent packet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResetFrameInfo {
    pub stream_id: StreamId,
    pub reliable_size: Option<u64>,
}

#[derive(Debug)]
pub struct SendStream {
    id: StreamId,
    state: SendState,

    /// Bytes `[total_enqueued - len, total_enqueued)`
    buffer: Vec<u8>,
    /// Absolute length of the stream enqueued so far
    total_enqueued: u64,

    unacked_offset: u64,
    next_send_offset: u64,
    max_sent_length: u64,
    sparse_ack_ranges: RangeSet,

    recovery_next_offset: u64,
    recovery_end_offset: u64,

    /// The peer's flow-control grant for this stream
    max_allowed_send_offset: u64,

    /// Set once the application finishes the stream
    fin_queued: bool,
    fin_sent: bool,
    fin_acked: bool,

    /// Pending or sent reset
    reset_error: Option<ApplicationError>,
    reset_sent: bool,
    reset_acked: bool,
    /// Bytes below this offset are still delivered after a reset
    reliable_offset_send: Option<u64>,

    /// 16-bit send priority; higher sends first
    priority: u16,
}

impl SendStream {
    pub fn new(id: StreamId, initial_max_stream_data: u64) -> Self {
        Self {
            id,
            state: SendState::Open,
            buffer: Vec::new(),
            total_enqueued: 0,
            unacked_offset: 0,
            next_send_offset: 0,
            max_sent_length: 0,
            sparse_ack_ranges: RangeSet::with_limit(RANGE_ALLOC_SIZE),
            recovery_next_offset: 0,
            recovery_end_offset: 0,
            max_allowed_send_offset: initial_max_stream_data,
            fin_queued: false,
            fin_sent: false,
            fin_acked: false,
            reset_error: None,
            reset_sent: false,
            reset_acked: false,
            reliable_offset_send: None,
            priority: 0x7fff,
        }
    }

    #[inline]
    pub fn state(&self) -> SendState {
        self.state
    }

    #[inline]
    pub fn priority(&self) -> u16 {
        self.priority
    }

    #[inline]
    pub fn set_priority(&mut self, priority: u16) {
        self.priority = priority;
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
    pub fn total_enqueued(&self) -> u64 {
        self.total_enqueued
    }

    #[inline]
    pub fn max_allowed_send_offset(&self) -> u64 {
        self.max_allowed_send_offset
    }

    #[inline]
    fn recovery_window_open(&self) -> bool {
        self.recovery_next_offset < self.recovery_end_offset
    }

    /// The stream's effective send limit, honoring a reliable reset
    #[inline]
    fn send_limit(&self) -> u64 {
        match (self.reset_error.is_some(), self.reliable_offset_send) {
            // an abortive reset stops everything
            (true, None) => self.unacked_offset,
            // a reliable reset still delivers the head of the stream
            (true, Some(reliable)) => reliable.min(self.total_enqueued),
            (false, _) => self.total_enqueued,
        }
    }

    /// Appends application data; returns the number of bytes accepted
    pub fn write(&mut self, data: &[u8]) -> Result<usize, SendError> {
        if self.fin_queued || self.reset_error.is_some() {
            return Err(SendError::Finished);
        }
        self.buffer.extend_from_slice(data);
        self.total_enqueued += data.len() as u64;
        if self.state == SendState::Open {
            self.state = SendState::Send;
        }
        Ok(data.len())
    }

    /// Queues the FIN; no further writes are accepted
    pub fn finish(&mut self) -> Result<(), SendError> {
        if self.reset_error.is_some() {
            return Err(SendError::Finished);
        }
        if !self.fin_queued {
            self.fin_queued = true;
            if self.state == SendState::Open {
                self.state = SendState::Send;
            }
        }
        Ok(())
    }

    /// Abandons the send direction. With `reliable_size`, bytes below it
    /// are still delivered before the stream completes.
    pub fn reset(&mut self, error: ApplicationError, reliable_size: Option<u64>) {
        if self.state.is_terminal() || self.reset_error.is_some() {
            return;
        }
        self.reset_error = Some(error);
        // the reliable offset may only shrink the outstanding data
        self.reliable_offset_send = reliable_size.map(|size| size.min(self.total_enqueued));
        self.state = SendState::ResetSent;
    }

    /// Lowers a previously-chosen reliable offset; only allowed before the
    /// reset frame is transmitted
    pub fn lower_reliable_offset(&mut self, offset: u64) {
        if self.reset_sent {
            return;
        }
        if let Some(reliable) = self.reliable_offset_send.as_mut() {
            *reliable = (*reliable).min(offset);
        }
    }

    /// The peer raised this stream's flow-control limit. Returns true if
    /// sending was unblocked.
    pub fn on_max_stream_data(&mut self, maximum: u64) -> bool {
        if maximum <= self.max_allowed_send_offset {
            return false;
        }
        let was_blocked = self.next_send_offset >= self.max_allowed_send_offset
            && self.next_send_offset < self.send_limit();
        self.max_allowed_send_offset = maximum;
        was_blocked
    }

    /// True if the stream could use a STREAM_DATA_BLOCKED frame
    pub fn is_flow_control_blocked(&self) -> bool {
        self.reset_error.is_none()
            && self.next_send_offset >= self.max_allowed_send_offset
            && self.next_send_offset < self.total_enqueued
    }

    /// True if a RESET_STREAM (or reliable variant) still needs to go out
    pub fn reset_pending(&self) -> bool {
        self.reset_error.is_some() && !self.reset_sent
    }

    /// True if any byte or the FIN is queued for (re)transmission
    pub fn has_pending_data(&self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if self.reset_pending() {
            return true;
        }
        if self.recovery_window_open() {
            return true;
        }
        let limit = self.send_limit().min(self.max_allowed_send_offset);
        if self.next_send_offset < limit {
            return true;
        }
        // a bare FIN still needs a frame
        self.fin_queued && !self.fin_sent && self.reset_error.is_none()
    }

    /// Writes the pending reset frame
    pub fn write_reset_frame(&mut self, encoder: &mut EncoderBuffer) -> Option<ResetFrameInfo> {
        let error = self.reset_error?;
        if self.reset_sent {
            return None;
        }

        let final_size = VarInt::new(self.total_enqueued).expect("stream offsets are varints");
        let stream_id = self.id.as_varint();
        let code = error.0;

        if let Some(reliable) = self.reliable_offset_send {
            let frame = frame::ReliableResetStream {
                stream_id,
                application_error_code: code,
                final_size,
                reliable_size: VarInt::new(reliable).expect("stream offsets are varints"),
            };
            if frame.encoding_size() > encoder.remaining_capacity() {
                return None;
            }
            encoder.encode(&frame);
        } else {
            let frame = frame::ResetStream {
                stream_id,
                application_error_code: code,
                final_size,
            };
            if frame.encoding_size() > encoder.remaining_capacity() {
                return None;
            }
            encoder.encode(&frame);
        }

        self.reset_sent = true;
        Some(ResetFrameInfo {
            stream_id: self.id,
            reliable_size: self.reliable_offset_send,
        })
    }

    /// Writes as many STREAM frames as fit under `connection_budget` bytes
    /// of connection-level flow control, returning metadata and the
    /// connection-level bytes consumed (new data beyond `max_sent`).
    pub fn write_frames(
        &mut self,
        connection_budget: u64,
        max_frames: usize,
        encoder: &mut EncoderBuffer,
    ) -> (SmallVec<[StreamFrameInfo; 2]>, u64) {
        let mut frames = SmallVec::new();
        let mut new_bytes = 0u64;

        while frames.len() < max_frames {
            let (left, recovery) = if self.recovery_window_open() {
                (self.recovery_next_offset, true)
            } else {
                (self.next_send_offset, false)
            };

            let limit = self.send_limit();
            let fin_needed = self.fin_queued
                && !self.fin_sent
                && self.reset_error.is_none()
                && left == limit;

            if left == limit && !fin_needed {
                break;
            }

            let mut right = left + encoder.remaining_capacity() as u64;

            if recovery
                && right > self.recovery_end_offset
                && self.recovery_end_offset != self.next_send_offset
            {
                right = self.recovery_end_offset;
            }

            let sack = if left == self.max_sent_length {
                None
            } else {
                self.sparse_ack_ranges.first_above(left).map(|(_, s)| s)
            };
            match sack {
                Some(sack) => right = right.min(sack.start),
                None => right = right.min(limit),
            }

            // new bytes respect both flow-control ceilings
            if right > self.max_sent_length {
                let flow_limit = self
                    .max_allowed_send_offset
                    .min(self.max_sent_length + connection_budget.saturating_sub(new_bytes));
                right = right.max(self.max_sent_length).min(flow_limit.max(left));
            }

            if left > right || (left == right && !fin_needed) {
                break;
            }

            let base = self.total_enqueued - self.buffer.len() as u64;
            debug_assert!(left >= base);
            let data = &self.buffer[(left - base) as usize..(right - base) as usize];

            let is_fin_frame = self.fin_queued
                && self.reset_error.is_none()
                && right == self.total_enqueued;

            let offset = VarInt::new(left).expect("stream offsets are varints");

            // frames always carry their explicit length so more frames can
            // follow in the packet; fit the payload accordingly
            let Some(payload_len) = explicit_length_fit(
                self.id.as_varint(),
                offset,
                data.len(),
                encoder.remaining_capacity(),
            ) else {
                break;
            };
            if payload_len == 0 && !(fin_needed || (is_fin_frame && data.is_empty())) {
                break;
            }

            let is_fin_frame = is_fin_frame && payload_len == data.len();
            let frame = StreamFrame {
                stream_id: self.id.as_varint(),
                offset,
                is_last_frame: false,
                is_fin: is_fin_frame,
                data: &data[..payload_len],
            };
            encoder.encode(&frame);

            let right = left + payload_len as u64;

            if recovery {
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
                new_bytes += right - self.max_sent_length;
                self.max_sent_length = right;
            }

            if is_fin_frame {
                self.fin_sent = true;
                if self.state == SendState::Send {
                    self.state = SendState::DataSent;
                }
            }

            frames.push(StreamFrameInfo {
                stream_id: self.id,
                offset: left,
                length: payload_len as u16,
                fin: is_fin_frame,
            });

            if is_fin_frame {
                break;
            }
        }

        self.check_integrity();
        (frames, new_bytes)
    }

    /// Processes acknowledgment of one stream frame. Returns true when the
    /// send half just reached `DataRecvd`.
    pub fn on_ack(&mut self, info: StreamFrameInfo) -> bool {
        let offset = info.offset;
        let following = offset + info.length as u64;

        if info.fin {
            self.fin_acked = true;
        }

        if offset <= self.unacked_offset {
            if self.unacked_offset < following {
                let drain_length = (following - self.unacked_offset) as usize;
                if self.buffer.len() > drain_length {
                    self.buffer.drain(..drain_length);
                } else {
                    self.buffer.clear();
                }

                self.unacked_offset = following;

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
            }
        } else if info.length > 0 {
            let insertion = self.sparse_ack_ranges.insert(offset, following);
            if insertion.updated {
                let sack = self
                    .sparse_ack_ranges
                    .get(insertion.index)
                    .expect("inserted range exists");
                if (sack.start..sack.end).contains(&self.next_send_offset) {
                    self.next_send_offset = sack.end;
                }
                if (sack.start..sack.end).contains(&self.recovery_next_offset) {
                    self.recovery_next_offset = sack.end;
                }
            }
        }

        self.check_integrity();

        // the half completes when every byte and the FIN are acknowledged
        if self.state == SendState::DataSent
            && self.fin_acked
            && self.unacked_offset == self.total_enqueued
        {
            self.state = SendState::DataRecvd;
            return true;
        }
        // under a reliable reset, delivery completes at the reliable offset
        if self.state == SendState::ResetSent
            && self.reset_acked
            && self
                .reliable_offset_send
                .map_or(true, |reliable| self.unacked_offset >= reliable)
        {
            self.state = SendState::ResetRecvd;
            return true;
        }
        false
    }

    /// Processes loss of one stream frame; returns true if retransmission
    /// is required
    pub fn on_loss(&mut self, info: StreamFrameInfo) -> bool {
        if info.fin && !self.fin_acked {
            // the FIN itself needs retransmission
            self.fin_sent = false;
        }

        let mut start = info.offset;
        let mut end = start + info.length as u64;

        if end <= self.unacked_offset {
            return info.fin && !self.fin_acked;
        }
        if start < self.unacked_offset {
            start = self.unacked_offset;
        }

        for sack in self.sparse_ack_ranges.iter() {
            if sack.start >= end {
                break;
            }
            if start < sack.end {
                if start >= sack.start {
                    if end <= sack.end {
                        return info.fin && !self.fin_acked;
                    }
                    start = sack.end;
                } else if end <= sack.end {
                    end = sack.start;
                }
            }
        }

        // under a reliable reset only the reliable prefix matters
        end = end.min(self.send_limit());
        if start >= end {
            return info.fin && !self.fin_acked;
        }

        let mut updated = false;
        if start < self.recovery_next_offset || !self.recovery_window_open() {
            self.recovery_next_offset = start;
            updated = true;
        }
        if self.recovery_end_offset < end {
            self.recovery_end_offset = end;
            updated = true;
        }

        self.check_integrity();
        updated || (info.fin && !self.fin_acked)
    }

    /// The peer acknowledged the reset frame. Returns true when the send
    /// half just reached `ResetRecvd`.
    pub fn on_reset_ack(&mut self) -> bool {
        self.reset_acked = true;
        if self.state == SendState::ResetSent
            && self
                .reliable_offset_send
                .map_or(true, |reliable| self.unacked_offset >= reliable)
        {
            self.state = SendState::ResetRecvd;
            return true;
        }
        false
    }

    /// The reset frame was lost and must go out again
    pub fn on_reset_loss(&mut self) {
        if !self.reset_acked {
            self.reset_sent = false;
        }
    }

    fn check_integrity(&self) {
        if cfg!(debug_assertions) {
            assert!(self.unacked_offset <= self.next_send_offset);
            assert!(self.next_send_offset <= self.max_sent_length || self.max_sent_length == 0);
            assert!(self.max_sent_length <= self.total_enqueued);
            if let Some(first) = self.sparse_ack_ranges.min() {
                assert!(first.start > self.unacked_offset);
            }
        }
    }
}

/// Errors surfaced to the application on the send path
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendError {
    /// The stream was finished or reset
    Finished,
}

/// The payload that fits a STREAM frame with an explicit length field, or
/// `None` when not even the header fits
fn explicit_length_fit(
    stream_id: VarInt,
    offset: VarInt,
    data_len: usize,
    capacity: usize,
) -> Option<usize> {
    let mut fixed = 1 + stream_id.encoding_size();
    if offset != 0u64 {
        fixed += offset.encoding_size();
    }

    let remaining = capacity.checked_sub(fixed)?;
    let max_data = remaining.min(data_len);
    let prefix = VarInt::try_from(max_data).ok()?.encoding_size();
    let prefixed = remaining.checked_sub(prefix)?;
    Some(prefixed.min(data_len))
}
