// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The connection's stream table: id allocation, implicit opening of
//! peer streams, connection-level flow control, and event fan-out.

use crate::{
    config::Settings,
    stream::{
        recv::RecvStream,
        scheduler::SendScheduler,
        send::SendStream,
        Stream,
    },
};
use hashbrown::HashMap;
use quiver_core::{
    buffer::RecvMode,
    endpoint,
    event::{ConnectionEvent, StreamEvent},
    stream::{StreamId, StreamType},
    time::Timestamp,
    transport::{error::ApplicationError, parameters::TransportParameters, Error},
    varint::VarInt,
};
use std::collections::VecDeque;

/// Index helper: 0 = bidirectional, 1 = unidirectional
#[inline]
fn type_index(stream_type: StreamType) -> usize {
    match stream_type {
        StreamType::Bidirectional => 0,
        StreamType::Unidirectional => 1,
    }
}

/// Stream-open failures surfaced to the application
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenError {
    /// The peer's stream-count limit is exhausted
    StreamIdFlowControl,
}

#[derive(Debug)]
pub struct StreamManager {
    local: endpoint::Type,
    settings: Settings,

    streams: HashMap<u64, Stream>,
    pub scheduler: SendScheduler,

    /// Next ordinal for locally-opened streams, per type
    next_local_ordinal: [u64; 2],
    /// The peer's grant of how many streams we may open, per type
    peer_max_streams: [u64; 2],
    /// How many streams we allow the peer, per type (advertised)
    local_max_streams: [u64; 2],
    /// The highest peer-opened ordinal + 1, per type
    peer_opened: [u64; 2],
    /// Completed peer streams whose count slot has been released, per type
    peer_released: [u64; 2],

    /// Peer's initial per-stream flow limits, from transport parameters
    peer_initial_max_stream_data: [u64; 3],

    /// Connection-level flow control, send direction
    peer_max_data: u64,
    data_sent: u64,
    /// Connection-level flow control, receive direction
    local_max_data: u64,
    data_received: u64,
    data_consumed: u64,

    /// Pending MAX_STREAMS bumps to transmit, per type
    max_streams_to_send: [bool; 2],
    max_data_to_send: bool,

    events: VecDeque<(Option<StreamId>, StreamEventOrConn)>,
}

/// Internal event staging; connection-level events ride the same queue to
/// preserve ordering
#[derive(Debug)]
pub enum StreamEventOrConn {
    Stream(StreamEvent),
    Connection(ConnectionEvent),
}

impl StreamManager {
    pub fn new(local: endpoint::Type, settings: Settings) -> Self {
        let local_max_streams = [
            settings.peer_bidi_stream_count as u64,
            settings.peer_unidi_stream_count as u64,
        ];
        let local_max_data = settings.conn_flow_control_window as u64;
        Self {
            local,
            settings,
            streams: HashMap::new(),
            scheduler: SendScheduler::default(),
            next_local_ordinal: [0; 2],
            peer_max_streams: [0; 2],
            local_max_streams,
            peer_opened: [0; 2],
            peer_released: [0; 2],
            peer_initial_max_stream_data: [0; 3],
            peer_max_data: 0,
            data_sent: 0,
            local_max_data,
            data_received: 0,
            data_consumed: 0,
            max_streams_to_send: [false; 2],
            max_data_to_send: false,
            events: VecDeque::new(),
        }
    }

    /// Applies the peer's transport parameters once the handshake delivers
    /// them
    pub fn on_peer_parameters(&mut self, parameters: &TransportParameters) {
        self.peer_max_streams = [
            parameters.initial_max_streams_bidi.as_u64(),
            parameters.initial_max_streams_uni.as_u64(),
        ];
        self.peer_max_data = parameters.initial_max_data.as_u64();
        // index 0: their limit for streams we open bidirectionally
        // (bidi_remote from their perspective); 1: our unidirectional
        // streams; 2: peer-opened bidirectional streams
        self.peer_initial_max_stream_data = [
            parameters.initial_max_stream_data_bidi_remote.as_u64(),
            parameters.initial_max_stream_data_uni.as_u64(),
            parameters.initial_max_stream_data_bidi_local.as_u64(),
        ];

        // unblock anything the grants now allow
        for (id, stream) in self.streams.iter_mut() {
            if let Some(send) = stream.send.as_mut() {
                let id = StreamId::from_varint(VarInt::new(*id).expect("valid id"));
                let index = if id.initiator() == self.local {
                    type_index(id.stream_type())
                } else {
                    2
                };
                send.on_max_stream_data(self.peer_initial_max_stream_data[index]);
            }
        }
    }

    /// The limits we advertise in our transport parameters
    pub fn local_parameters(&self, parameters: &mut TransportParameters) {
        parameters.initial_max_data = VarInt::new(self.local_max_data).expect("window fits");
        parameters.initial_max_streams_bidi =
            VarInt::new(self.local_max_streams[0]).expect("count fits");
        parameters.initial_max_streams_uni =
            VarInt::new(self.local_max_streams[1]).expect("count fits");
        let window = self.settings.stream_recv_window_default as u64;
        parameters.initial_max_stream_data_bidi_local = VarInt::new(window).expect("fits");
        parameters.initial_max_stream_data_bidi_remote = VarInt::new(window).expect("fits");
        parameters.initial_max_stream_data_uni = VarInt::new(window).expect("fits");
    }

    // === opening ===

    /// Opens a locally-initiated stream
    pub fn open_local(&mut self, stream_type: StreamType) -> Result<StreamId, OpenError> {
        let index = type_index(stream_type);
        let ordinal = self.next_local_ordinal[index];

        if ordinal >= self.peer_max_streams[index] {
            return Err(OpenError::StreamIdFlowControl);
        }

        let id = StreamId::nth(self.local, stream_type, ordinal)
            .ok_or(OpenError::StreamIdFlowControl)?;
        self.next_local_ordinal[index] = ordinal + 1;

        let send_limit_index = type_index(stream_type);
        let send = SendStream::new(id, self.peer_initial_max_stream_data[send_limit_index]);
        let recv = (stream_type == StreamType::Bidirectional).then(|| {
            RecvStream::new(
                id,
                self.recv_mode(),
                self.settings.stream_recv_window_default as u64,
                self.settings.stream_recv_window_default as u64 * 4,
            )
        });

        self.streams
            .insert(id.into(), Stream::new(Some(send), recv));
        self.push_stream_event(id, StreamEvent::StartComplete { id });
        Ok(id)
    }

    fn recv_mode(&self) -> RecvMode {
        if self.settings.stream_multi_receive_enabled {
            RecvMode::Multiple
        } else {
            RecvMode::Circular
        }
    }

    /// Ensures a peer-initiated stream (and all lower ordinals of its type)
    /// exists, enforcing the advertised stream-count limit
    fn ensure_peer_stream(&mut self, id: StreamId) -> Result<(), Error> {
        debug_assert_eq!(id.initiator(), self.local.peer_type());
        let stream_type = id.stream_type();
        let index = type_index(stream_type);

        //= https://www.rfc-editor.org/rfc/rfc9000#section-4.6
        //# An endpoint that receives a frame with a stream ID exceeding the
        //# limit it has sent MUST treat this as a connection error of type
        //# STREAM_LIMIT_ERROR
        if id.ordinal() >= self.local_max_streams[index] {
            return Err(Error::STREAM_LIMIT_ERROR);
        }

        while self.peer_opened[index] <= id.ordinal() {
            let ordinal = self.peer_opened[index];
            let new_id = StreamId::nth(self.local.peer_type(), stream_type, ordinal)
                .expect("ordinal below advertised limit");
            self.peer_opened[index] = ordinal + 1;

            let recv = RecvStream::new(
                new_id,
                self.recv_mode(),
                self.settings.stream_recv_window_default as u64,
                self.settings.stream_recv_window_default as u64 * 4,
            );
            // our send half of a peer-opened bidi stream uses the peer's
            // "bidi local" limit
            let send = (stream_type == StreamType::Bidirectional).then(|| {
                SendStream::new(new_id, self.peer_initial_max_stream_data[2])
            });

            self.streams
                .insert(new_id.into(), Stream::new(send, Some(recv)));
            self.push_conn_event(ConnectionEvent::PeerStreamStarted { id: new_id });
        }
        Ok(())
    }

    // === frame intake ===

    pub fn on_stream_frame(
        &mut self,
        frame: &quiver_core::frame::Stream<&[u8]>,
        now: Timestamp,
    ) -> Result<(), Error> {
        let id = StreamId::from_varint(frame.stream_id);

        if id.initiator() != self.local {
            self.ensure_peer_stream(id)?;
        } else if id.stream_type() == StreamType::Unidirectional {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
            //# An endpoint MUST terminate the connection with error
            //# STREAM_STATE_ERROR if it receives a STREAM frame for a locally
            //# initiated stream that has not yet been created, or for a send-
            //# only stream.
            return Err(Error::STREAM_STATE_ERROR);
        }

        let Some(stream) = self.streams.get_mut(&u64::from(id)) else {
            // a completed, released stream; late data is discarded
            return Ok(());
        };
        let Some(recv) = stream.recv.as_mut() else {
            return Err(Error::STREAM_STATE_ERROR);
        };

        let outcome = recv.on_stream_frame(
            frame.offset.as_u64(),
            frame.data,
            frame.is_fin,
            now,
        )?;

        // connection-level flow control
        if outcome.flow_control_credit > 0 {
            self.data_received += outcome.flow_control_credit;
            if self.data_received > self.local_max_data {
                return Err(Error::FLOW_CONTROL_ERROR
                    .with_reason("peer exceeded the connection data limit"));
            }
        }

        if outcome.data_ready {
            let available = stream
                .recv
                .as_ref()
                .map(|recv| recv.readable_len())
                .unwrap_or(0);
            self.push_stream_event(
                id,
                StreamEvent::Receive {
                    available,
                    is_fin: false,
                },
            );
        }
        if outcome.completed {
            self.push_stream_event(id, StreamEvent::PeerSendShutdown);
            self.finish_if_complete(id);
        }
        Ok(())
    }

    pub fn on_reset_frame(
        &mut self,
        id: StreamId,
        error_code: VarInt,
        final_size: u64,
        reliable_size: Option<u64>,
    ) -> Result<(), Error> {
        if id.initiator() != self.local {
            self.ensure_peer_stream(id)?;
        } else if id.stream_type() == StreamType::Unidirectional {
            return Err(Error::STREAM_STATE_ERROR);
        }

        let Some(stream) = self.streams.get_mut(&u64::from(id)) else {
            return Ok(());
        };
        let Some(recv) = stream.recv.as_mut() else {
            return Err(Error::STREAM_STATE_ERROR);
        };

        let outcome = recv.on_reset(ApplicationError(error_code), final_size, reliable_size)?;

        if outcome.flow_control_credit > 0 {
            self.data_received += outcome.flow_control_credit;
            if self.data_received > self.local_max_data {
                return Err(Error::FLOW_CONTROL_ERROR);
            }
        }

        if outcome.completed {
            self.push_stream_event(
                id,
                StreamEvent::PeerSendAborted {
                    error_code: ApplicationError(error_code),
                },
            );
            self.finish_if_complete(id);
        }
        Ok(())
    }

    pub fn on_stop_sending_frame(&mut self, id: StreamId, error_code: VarInt) -> Result<(), Error> {
        if id.initiator() != self.local {
            self.ensure_peer_stream(id)?;
        }

        let Some(stream) = self.streams.get_mut(&u64::from(id)) else {
            return Ok(());
        };
        let Some(send) = stream.send.as_mut() else {
            return Err(Error::STREAM_STATE_ERROR);
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-3.5
        //# An endpoint that receives a STOP_SENDING frame MUST send a
        //# RESET_STREAM frame if the stream is in the "Ready" or "Send" state.
        send.reset(ApplicationError(error_code), None);
        self.push_stream_event(
            id,
            StreamEvent::PeerReceiveAborted {
                error_code: ApplicationError(error_code),
            },
        );
        self.queue_send(id);
        Ok(())
    }

    pub fn on_max_stream_data_frame(&mut self, id: StreamId, maximum: u64) -> Result<(), Error> {
        if id.initiator() != self.local {
            self.ensure_peer_stream(id)?;
        }
        if let Some(stream) = self.streams.get_mut(&u64::from(id)) {
            if let Some(send) = stream.send.as_mut() {
                if send.on_max_stream_data(maximum) {
                    self.queue_send(id);
                }
            }
        }
        Ok(())
    }

    pub fn on_max_data_frame(&mut self, maximum: u64) -> bool {
        let was_blocked = self.connection_send_budget() == 0;
        self.peer_max_data = self.peer_max_data.max(maximum);
        was_blocked && self.connection_send_budget() > 0
    }

    pub fn on_max_streams_frame(&mut self, stream_type: StreamType, maximum: u64) {
        let index = type_index(stream_type);
        if maximum > self.peer_max_streams[index] {
            self.peer_max_streams[index] = maximum;
            self.push_conn_event(ConnectionEvent::StreamsAvailable {
                bidirectional: self.available_local_streams(StreamType::Bidirectional),
                unidirectional: self.available_local_streams(StreamType::Unidirectional),
            });
        }
    }

    // === application surface ===

    pub fn write(&mut self, id: StreamId, data: &[u8]) -> Result<usize, Error> {
        let stream = self
            .streams
            .get_mut(&u64::from(id))
            .ok_or(Error::STREAM_STATE_ERROR)?;
        let send = stream
            .send
            .as_mut()
            .ok_or(Error::STREAM_STATE_ERROR)?;
        let written = send
            .write(data)
            .map_err(|_| Error::STREAM_STATE_ERROR.with_reason("stream finished"))?;
        self.queue_send(id);
        Ok(written)
    }

    pub fn finish(&mut self, id: StreamId) -> Result<(), Error> {
        let stream = self
            .streams
            .get_mut(&u64::from(id))
            .ok_or(Error::STREAM_STATE_ERROR)?;
        let send = stream
            .send
            .as_mut()
            .ok_or(Error::STREAM_STATE_ERROR)?;
        send.finish()
            .map_err(|_| Error::STREAM_STATE_ERROR.with_reason("stream reset"))?;
        self.queue_send(id);
        Ok(())
    }

    pub fn reset(
        &mut self,
        id: StreamId,
        error: ApplicationError,
        reliable_size: Option<u64>,
    ) -> Result<(), Error> {
        let stream = self
            .streams
            .get_mut(&u64::from(id))
            .ok_or(Error::STREAM_STATE_ERROR)?;
        let send = stream
            .send
            .as_mut()
            .ok_or(Error::STREAM_STATE_ERROR)?;
        send.reset(error, reliable_size);
        self.queue_send(id);
        Ok(())
    }

    pub fn read(
        &mut self,
        id: StreamId,
        dest: &mut [u8],
        now: Timestamp,
        smoothed_rtt: core::time::Duration,
    ) -> Result<(usize, bool), Error> {
        let stream = self
            .streams
            .get_mut(&u64::from(id))
            .ok_or(Error::STREAM_STATE_ERROR)?;
        let recv = stream
            .recv
            .as_mut()
            .ok_or(Error::STREAM_STATE_ERROR)?;

        let (len, is_fin) = recv.read(dest, now, smoothed_rtt);

        // reading consumes connection-level window; reopen it lazily
        self.data_consumed += len as u64;
        let target = self.data_consumed + self.settings.conn_flow_control_window as u64;
        if target > self.local_max_data
            && target - self.local_max_data >= self.settings.conn_flow_control_window as u64 / 4
        {
            self.local_max_data = target;
            self.max_data_to_send = true;
        }

        if is_fin || len > 0 {
            self.finish_if_complete(id);
        }
        Ok((len, is_fin))
    }

    pub fn set_priority(&mut self, id: StreamId, priority: u16) -> Result<(), Error> {
        let stream = self
            .streams
            .get_mut(&u64::from(id))
            .ok_or(Error::STREAM_STATE_ERROR)?;
        if let Some(send) = stream.send.as_mut() {
            send.set_priority(priority);
            self.scheduler.update_priority(id, priority);
        }
        Ok(())
    }

    // === send plumbing ===

    /// Queues the stream with the scheduler if it has anything to send
    pub fn queue_send(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get(&u64::from(id)) {
            if let Some(send) = stream.send.as_ref() {
                if send.has_pending_data() || send.reset_pending() {
                    self.scheduler.insert(id, send.priority());
                }
            }
        }
    }

    /// Bytes the connection-level window still allows us to send
    #[inline]
    pub fn connection_send_budget(&self) -> u64 {
        self.peer_max_data.saturating_sub(self.data_sent)
    }

    pub fn on_stream_bytes_sent(&mut self, new_bytes: u64) {
        self.data_sent += new_bytes;
    }

    /// Lifetime stream bytes sent; the limit reported by DATA_BLOCKED
    #[inline]
    pub fn data_sent_total(&self) -> u64 {
        self.data_sent
    }

    /// Fans a new ideal send-buffer size out to every open send half
    pub fn on_ideal_send_buffer_changed(&mut self, byte_count: u64) {
        let ids: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, stream)| stream.send.is_some())
            .map(|(id, _)| StreamId::from_varint(VarInt::new(*id).expect("valid id")))
            .collect();
        for id in ids {
            self.push_stream_event(id, StreamEvent::IdealSendBufferSize { byte_count });
        }
    }

    /// The new MAX_DATA limit to transmit, if one is pending
    pub fn max_data_frame_needed(&mut self) -> Option<u64> {
        self.max_data_to_send.then_some(self.local_max_data)
    }

    pub fn on_max_data_frame_sent(&mut self) {
        self.max_data_to_send = false;
    }

    pub fn stream_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&u64::from(id))
    }

    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&u64::from(id))
    }

    pub fn available_local_streams(&self, stream_type: StreamType) -> u64 {
        let index = type_index(stream_type);
        self.peer_max_streams[index].saturating_sub(self.next_local_ordinal[index])
    }

    // === completion ===

    /// Delivers the terminal event and releases the id slot once both
    /// halves are done
    pub fn finish_if_complete(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(&u64::from(id)) else {
            return;
        };
        if !stream.is_shutdown_complete() || !stream.mark_shutdown_delivered() {
            return;
        }

        let delayed = stream.delayed_id_release;
        self.push_stream_event(
            id,
            StreamEvent::ShutdownComplete {
                connection_shutdown: false,
                app_close_in_progress: false,
            },
        );
        self.scheduler.remove(id);

        if !delayed {
            self.release_stream(id);
        }
    }

    /// Returns the stream-count slot of a completed peer stream, bumping
    /// the advertised limit
    pub fn release_stream(&mut self, id: StreamId) {
        if self.streams.remove(&u64::from(id)).is_none() {
            return;
        }
        if id.initiator() != self.local {
            let index = type_index(id.stream_type());
            self.peer_released[index] += 1;
            self.local_max_streams[index] += 1;
            self.max_streams_to_send[index] = true;
        }
    }

    /// The new MAX_STREAMS limit to transmit for `stream_type`, if pending
    pub fn max_streams_frame_needed(&mut self, stream_type: StreamType) -> Option<u64> {
        let index = type_index(stream_type);
        self.max_streams_to_send[index].then_some(self.local_max_streams[index])
    }

    pub fn on_max_streams_frame_sent(&mut self, stream_type: StreamType) {
        self.max_streams_to_send[type_index(stream_type)] = false;
    }

    /// Drains staged events in production order
    pub fn drain_events(
        &mut self,
    ) -> impl Iterator<Item = (Option<StreamId>, StreamEventOrConn)> + '_ {
        self.events.drain(..)
    }

    fn push_stream_event(&mut self, id: StreamId, event: StreamEvent) {
        self.events.push_back((Some(id), StreamEventOrConn::Stream(event)));
    }

    fn push_conn_event(&mut self, event: ConnectionEvent) {
        self.events.push_back((None, StreamEventOrConn::Connection(event)));
    }
}

#[cfg(test)]
mod tests;
