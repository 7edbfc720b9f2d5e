// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The receive half of an application stream

use quiver_core::{
    buffer::{self, RecvBuffer, RecvMode},
    stream::StreamId,
    time::Timestamp,
    transport::{error::ApplicationError, Error},
};
use core::time::Duration;

/// Receive-half states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecvState {
    /// Receiving data; the final size is unknown
    Recv,
    /// A FIN established the final size; data may still be missing
    SizeKnown,
    /// Every byte up to the final size has arrived (terminal once drained)
    DataRecvd,
    /// The peer reset the stream (terminal)
    ResetRecvd,
}

impl RecvState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::DataRecvd | Self::ResetRecvd)
    }
}

/// What an incoming frame produced
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecvOutcome {
    /// New contiguous data is ready for the application
    pub data_ready: bool,
    /// The receive half transitioned to a terminal state
    pub completed: bool,
    /// Newly-received bytes counted against connection flow control
    pub flow_control_credit: u64,
}

#[derive(Debug)]
pub struct RecvStream {
    id: StreamId,
    state: RecvState,
    buffer: RecvBuffer,

    /// Established by FIN or reset
    final_size: Option<u64>,
    /// The highest offset observed, for flow-control accounting
    max_received: u64,
    /// Set when the peer reset the stream
    reset_error: Option<ApplicationError>,
    /// Under a reliable reset, data below this still gets delivered
    recv_max_length: Option<u64>,

    /// A STOP_SENDING frame is queued
    stop_sending: Option<ApplicationError>,
    stop_sending_sent: bool,
}

impl RecvStream {
    pub fn new(id: StreamId, mode: RecvMode, window: u64, max_window: u64) -> Self {
        Self {
            id,
            state: RecvState::Recv,
            buffer: RecvBuffer::new(mode, window, max_window),
            final_size: None,
            max_received: 0,
            reset_error: None,
            recv_max_length: None,
            stop_sending: None,
            stop_sending_sent: false,
        }
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> RecvState {
        self.state
    }

    #[inline]
    pub fn reset_error(&self) -> Option<ApplicationError> {
        self.reset_error
    }

    /// The limit to advertise in MAX_STREAM_DATA
    #[inline]
    pub fn flow_control_limit(&self) -> u64 {
        self.buffer.flow_control_limit()
    }

    #[inline]
    pub fn readable_len(&self) -> usize {
        self.buffer.readable_len()
    }

    /// Accepts an incoming STREAM frame
    pub fn on_stream_frame(
        &mut self,
        offset: u64,
        data: &[u8],
        fin: bool,
        _now: Timestamp,
    ) -> Result<RecvOutcome, Error> {
        if self.state == RecvState::ResetRecvd {
            // late data after a reset carries nothing for the application
            return Ok(RecvOutcome::default());
        }

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(Error::FLOW_CONTROL_ERROR)?;

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.5
        //# Once a final size for a stream is known, it cannot change.  If a
        //# RESET_STREAM or STREAM frame is received indicating a change in the
        //# final size for the stream, an endpoint SHOULD respond with an error
        //# of type FINAL_SIZE_ERROR
        if let Some(final_size) = self.final_size {
            if end > final_size || (fin && end != final_size) {
                return Err(Error::FINAL_SIZE_ERROR);
            }
        }
        if fin {
            if self.max_received > end {
                return Err(Error::FINAL_SIZE_ERROR);
            }
            self.final_size = Some(end);
            if self.state == RecvState::Recv {
                self.state = RecvState::SizeKnown;
            }
        }

        let write_end = match self.recv_max_length {
            Some(cap) => end.min(cap),
            None => end,
        };
        let data = &data[..(write_end.saturating_sub(offset) as usize).min(data.len())];

        let outcome = match self.buffer.write(offset, data) {
            Ok(outcome) => outcome,
            Err(buffer::Error::FlowControlExceeded) => {
                return Err(Error::FLOW_CONTROL_ERROR
                    .with_reason("peer exceeded the stream receive window"))
            }
        };

        let credit = end.saturating_sub(self.max_received);
        self.max_received = self.max_received.max(end);

        let mut completed = false;
        if let Some(final_size) = self.final_size {
            if self.buffer.max_received() == final_size && self.buffer.readable_len() as u64
                == final_size - self.buffer.base_offset()
            {
                self.state = RecvState::DataRecvd;
                completed = true;
            }
        }

        Ok(RecvOutcome {
            data_ready: outcome.data_ready,
            completed,
            flow_control_credit: credit,
        })
    }

    /// The peer reset the stream. Returns the flow-control credit implied
    /// by the final size.
    pub fn on_reset(
        &mut self,
        error: ApplicationError,
        final_size: u64,
        reliable_size: Option<u64>,
    ) -> Result<RecvOutcome, Error> {
        if let Some(known) = self.final_size {
            if known != final_size {
                return Err(Error::FINAL_SIZE_ERROR);
            }
        }
        if self.max_received > final_size {
            return Err(Error::FINAL_SIZE_ERROR);
        }
        if self.state.is_terminal() {
            return Ok(RecvOutcome::default());
        }

        let credit = final_size.saturating_sub(self.max_received);
        self.max_received = final_size;
        self.final_size = Some(final_size);
        self.reset_error = Some(error);

        match reliable_size {
            Some(reliable) if self.buffer.base_offset() < reliable => {
                // keep delivering the reliable prefix; the reset completes
                // once the application drains it
                self.recv_max_length = Some(reliable);
            }
            _ => {
                self.buffer.reset();
                self.state = RecvState::ResetRecvd;
            }
        }

        Ok(RecvOutcome {
            data_ready: false,
            completed: self.state.is_terminal(),
            flow_control_credit: credit,
        })
    }

    /// Reads contiguous data for the application
    pub fn read(
        &mut self,
        dest: &mut [u8],
        now: Timestamp,
        smoothed_rtt: Duration,
    ) -> (usize, bool) {
        // under a reliable reset, nothing beyond the reliable prefix is
        // delivered
        let cap = self
            .recv_max_length
            .map(|reliable| reliable.saturating_sub(self.buffer.base_offset()) as usize)
            .unwrap_or(usize::MAX)
            .min(dest.len());
        let len = self.buffer.read(&mut dest[..cap], now, smoothed_rtt);

        // a deferred reliable reset completes once the prefix is drained
        if let Some(reliable) = self.recv_max_length {
            if self.buffer.base_offset() >= reliable && self.reset_error.is_some() {
                self.buffer.reset();
                self.state = RecvState::ResetRecvd;
            }
        }

        let is_fin = self
            .final_size
            .map_or(false, |final_size| self.buffer.base_offset() >= final_size);
        (len, is_fin)
    }

    /// Adds application-provided receive capacity, returning the new limit
    /// to advertise
    pub fn provide_chunks(&mut self, additional: u64) -> u64 {
        self.buffer.provide_chunks(additional)
    }

    /// Requests that the peer stop sending
    pub fn stop_sending(&mut self, error: ApplicationError) {
        if self.state.is_terminal() || self.stop_sending.is_some() {
            return;
        }
        self.stop_sending = Some(error);
    }

    /// The queued STOP_SENDING error, if it still needs a frame
    pub fn stop_sending_pending(&self) -> Option<ApplicationError> {
        if self.stop_sending_sent {
            None
        } else {
            self.stop_sending
        }
    }

    pub fn on_stop_sending_sent(&mut self) {
        self.stop_sending_sent = true;
    }

    pub fn on_stop_sending_loss(&mut self) {
        self.stop_sending_sent = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::{
        endpoint,
        stream::{StreamId, StreamType},
        time::{Clock, NoopClock},
        varint::VarInt,
    };

    const RTT: Duration = Duration::from_millis(50);

    fn stream() -> RecvStream {
        let id = StreamId::initial(endpoint::Type::Client, StreamType::Bidirectional);
        RecvStream::new(id, RecvMode::Multiple, 1024, 4096)
    }

    #[test]
    fn fin_establishes_final_size() {
        let now = NoopClock.get_time();
        let mut stream = stream();

        let outcome = stream.on_stream_frame(0, b"hello", true, now).unwrap();
        assert!(outcome.data_ready);
        assert!(outcome.completed);
        assert_eq!(outcome.flow_control_credit, 5);
        assert_eq!(stream.state(), RecvState::DataRecvd);

        let mut dest = [0u8; 8];
        let (len, is_fin) = stream.read(&mut dest, now, RTT);
        assert_eq!(&dest[..len], b"hello");
        assert!(is_fin);
    }

    #[test]
    fn final_size_cannot_change() {
        let now = NoopClock.get_time();
        let mut stream = stream();

        stream.on_stream_frame(0, b"hello", true, now).unwrap();
        assert_eq!(
            stream.on_stream_frame(0, b"hello!", false, now).unwrap_err().code,
            Error::FINAL_SIZE_ERROR.code
        );
        assert_eq!(
            stream.on_stream_frame(0, b"hell", true, now).unwrap_err().code,
            Error::FINAL_SIZE_ERROR.code
        );
    }

    #[test]
    fn size_known_waits_for_gaps() {
        let now = NoopClock.get_time();
        let mut stream = stream();

        let outcome = stream.on_stream_frame(5, b"world", true, now).unwrap();
        assert!(!outcome.completed);
        assert_eq!(stream.state(), RecvState::SizeKnown);

        let outcome = stream.on_stream_frame(0, b"hello", false, now).unwrap();
        assert!(outcome.completed);
        assert_eq!(stream.state(), RecvState::DataRecvd);
    }

    #[test]
    fn reset_discards_pending_data() {
        let now = NoopClock.get_time();
        let mut stream = stream();

        stream.on_stream_frame(0, b"partial", false, now).unwrap();
        let outcome = stream
            .on_reset(ApplicationError(VarInt::from_u8(7)), 20, None)
            .unwrap();
        assert!(outcome.completed);
        // the unreceived remainder still counts against flow control
        assert_eq!(outcome.flow_control_credit, 13);
        assert_eq!(stream.state(), RecvState::ResetRecvd);
        assert_eq!(stream.reset_error(), Some(ApplicationError(VarInt::from_u8(7))));
    }

    #[test]
    fn reliable_reset_delivers_prefix_first() {
        let now = NoopClock.get_time();
        let mut stream = stream();

        stream.on_stream_frame(0, b"keep+drop", false, now).unwrap();
        let outcome = stream
            .on_reset(ApplicationError(VarInt::from_u8(1)), 9, Some(4))
            .unwrap();
        assert!(!outcome.completed);
        assert_eq!(stream.state(), RecvState::Recv);

        let mut dest = [0u8; 16];
        let (len, _) = stream.read(&mut dest, now, RTT);
        assert_eq!(&dest[..len], b"keep");
        assert_eq!(stream.state(), RecvState::ResetRecvd);
    }

    #[test]
    fn flow_control_overflow_is_fatal() {
        let now = NoopClock.get_time();
        let mut stream = stream();
        let error = stream
            .on_stream_frame(1024, b"x", false, now)
            .unwrap_err();
        assert_eq!(error.code, Error::FLOW_CONTROL_ERROR.code);
    }
}
