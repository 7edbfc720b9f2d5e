// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The packet builder: assembles frames into encryption-level-appropriate
//! packets under the MTU, congestion, amplification, and flow-control
//! budgets, then seals and header-protects them in place.
//!
//! Frames are tried in a fixed priority order per packet; a frame that no
//! longer fits yields the packet for sealing, and the builder moves to the
//! next level (coalescing long-header packets into one datagram).

use crate::{
    config::{Settings, MIN_INITIAL_PACKET_LENGTH},
    crypto_stream::CryptoStream,
    path::{CidManager, Path},
    space::{KeySet, PacketSpace, SentFrame, SentPacketInfo},
    stream::StreamManager,
};
use quiver_core::{
    crypto::{apply_header_protection, EncryptionLevel},
    endpoint,
    frame::{self, MAX_FRAMES_PER_PACKET},
    packet::{long_first_byte, short_first_byte, truncate_packet_number, Type as PacketType},
    stream::StreamType,
    time::Timestamp,
    transport::Error,
    varint::VarInt,
};
use s2n_codec::{Encoder, EncoderBuffer, EncoderValue};
use smallvec::SmallVec;

/// One-shot send triggers owned by the connection
#[derive(Clone, Copy, Debug, Default)]
pub struct SendFlags {
    /// A PTO fired: send a probe even without data
    pub ping: bool,
    /// The server confirmed the handshake and owes HANDSHAKE_DONE
    pub handshake_done: bool,
    /// A CONNECTION_CLOSE is pending (closing state)
    pub connection_close: Option<frame::ConnectionClose<'static>>,
}

/// Everything the builder borrows from the connection for one flush
pub struct Context<'a> {
    pub settings: &'a Settings,
    pub local: endpoint::Type,
    pub now: Timestamp,
    pub version: u32,
    /// Destination CID bytes for headers
    pub dest_cid: &'a [u8],
    /// Source CID bytes for long headers
    pub source_cid: &'a [u8],
    /// Token for Initial packets (client, after Retry)
    pub token: &'a [u8],
    pub keys: &'a mut KeySet,
    pub spaces: &'a mut [PacketSpace; 3],
    pub crypto: &'a mut CryptoStream,
    pub streams: Option<&'a mut StreamManager>,
    pub cids: &'a mut CidManager,
    pub path: &'a mut Path,
    pub flags: &'a mut SendFlags,
    /// Unreliable datagrams awaiting transmission
    pub datagrams: &'a mut std::collections::VecDeque<bytes::Bytes>,
    /// Total bytes the congestion controller allows this flush
    pub send_allowance: u32,
    /// True once the handshake completed (1-RTT frames beyond crypto/ack
    /// are permitted)
    pub handshake_complete: bool,
    /// Lifetime bytes sent, for rate-sample bookkeeping
    pub total_bytes_sent: u64,
}

/// A fully-built datagram plus the per-packet metadata to record
pub struct Transmission {
    pub len: usize,
    pub packets: SmallVec<[SentPacketInfo; 2]>,
}

/// Builds one datagram. Returns `None` when nothing needs to be sent.
pub fn build_datagram(
    context: &mut Context<'_>,
    datagram: &mut [u8],
) -> Result<Option<Transmission>, Error> {
    let mtu = context.path.mtu as usize;
    let mut budget = (context.send_allowance as usize).min(mtu).min(datagram.len());

    // amplification protection caps everything while unvalidated
    if let Some(amplification) = context.path.amplification_budget() {
        budget = budget.min(amplification as usize);
    }
    if budget == 0 {
        return Ok(None);
    }

    let mut offset = 0;
    let mut packets: SmallVec<[SentPacketInfo; 2]> = SmallVec::new();
    let mut contains_initial = false;

    for level in [
        EncryptionLevel::Initial,
        EncryptionLevel::Handshake,
        EncryptionLevel::OneRtt,
    ] {
        if !context.keys.has_keys(level) {
            continue;
        }
        if context.spaces[level.space().as_index()].is_discarded() {
            continue;
        }
        if offset >= budget {
            break;
        }

        let remaining = &mut datagram[offset..budget];
        if let Some(packet) = build_packet(context, level, remaining, None)? {
            offset += packet.sent_bytes as usize;
            if level == EncryptionLevel::Initial {
                contains_initial = true;
            }
            packets.push(packet);
        }
    }

    if packets.is_empty() {
        return Ok(None);
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
    //# a client MUST expand the payload of all UDP datagrams carrying
    //# Initial packets to at least the smallest allowed maximum datagram
    //# size of 1200 bytes
    if contains_initial && offset < MIN_INITIAL_PACKET_LENGTH {
        // pad the datagram tail; unprotected padding between packets is
        // legal and ignored by the receiver
        let target = MIN_INITIAL_PACKET_LENGTH.min(datagram.len());
        for byte in datagram[offset..target].iter_mut() {
            *byte = 0;
        }
        offset = target;
    }

    Ok(Some(Transmission {
        len: offset,
        packets,
    }))
}

/// The packet type carrying `level`
fn packet_type_for(level: EncryptionLevel) -> PacketType {
    match level {
        EncryptionLevel::Initial => PacketType::Initial,
        EncryptionLevel::ZeroRtt => PacketType::ZeroRtt,
        EncryptionLevel::Handshake => PacketType::Handshake,
        EncryptionLevel::OneRtt => PacketType::OneRtt,
    }
}

/// Builds a standalone path-MTU probe: one 1-RTT packet whose datagram is
/// exactly `probe_size` bytes of PING and PADDING.
///
/// Probes do not count toward bytes in flight, so a lost probe never reads
/// as congestion.
pub fn build_mtu_probe(
    context: &mut Context<'_>,
    probe_size: u16,
    datagram: &mut [u8],
) -> Result<Option<SentPacketInfo>, Error> {
    if !context.keys.has_keys(EncryptionLevel::OneRtt) {
        return Ok(None);
    }
    if datagram.len() < probe_size as usize {
        return Ok(None);
    }
    build_packet(
        context,
        EncryptionLevel::OneRtt,
        &mut datagram[..probe_size as usize],
        Some(probe_size),
    )
}

/// Builds and seals a single packet at `level` into `buffer`; with
/// `probe_size` the payload is a padded MTU probe instead of the frame
/// ladder
fn build_packet(
    context: &mut Context<'_>,
    level: EncryptionLevel,
    buffer: &mut [u8],
    probe_size: Option<u16>,
) -> Result<Option<SentPacketInfo>, Error> {
    let packet_type = packet_type_for(level);
    let space_index = level.space().as_index();

    let tag_len = {
        let keys = context.keys.keys(level).expect("caller checked keys");
        keys.sealer.tag_len()
    };

    // reserve room for the smallest useful packet before bothering
    if buffer.len() < 64 {
        return Ok(None);
    }

    let packet_number = context.spaces[space_index].peek_packet_number();
    let largest_acked = context.spaces[space_index].loss.largest_acked();
    let truncated = truncate_packet_number(packet_number, largest_acked);

    // === header ===
    let mut header_len = 0usize;
    let mut length_offset = None;

    {
        let mut encoder = EncoderBuffer::new(buffer);
        match packet_type {
            PacketType::OneRtt => {
                let first =
                    short_first_byte(key_phase_bit(context.keys.key_phase()), false, truncated);
                encoder.encode(&first);
                encoder.write_slice(context.dest_cid);
            }
            _ => {
                let first = long_first_byte(packet_type, truncated);
                encoder.encode(&first);
                encoder.encode(&context.version);
                encoder.encode(&(context.dest_cid.len() as u8));
                encoder.write_slice(context.dest_cid);
                encoder.encode(&(context.source_cid.len() as u8));
                encoder.write_slice(context.source_cid);

                if packet_type == PacketType::Initial {
                    let token_len =
                        VarInt::try_from(context.token.len()).map_err(|_| Error::INTERNAL_ERROR)?;
                    encoder.encode(&token_len);
                    encoder.write_slice(context.token);
                }

                // two-byte length placeholder, patched once the payload
                // size is known (and before sealing, since the length is
                // part of the authenticated header)
                length_offset = Some(encoder.len());
                encoder.encode(&0x4000u16);
            }
        }

        let pn_offset = encoder.len();
        encoder.write_repeated(truncated.len(), 0);
        truncated.write(&mut encoder.as_mut_slice()[pn_offset..pn_offset + truncated.len()]);
        header_len = encoder.len();
    }
    let pn_offset = header_len - truncated.len();

    // === frames ===
    // the payload must leave room for the AEAD tag, and samples require at
    // least four bytes of packet number plus sample data
    let payload_capacity = buffer.len().checked_sub(header_len + tag_len);
    let Some(payload_capacity) = payload_capacity else {
        return Ok(None);
    };

    let mut frames: SmallVec<[SentFrame; 4]> = SmallVec::new();
    let mut ack_eliciting = false;
    let mut in_flight = false;

    let payload_len = {
        let mut encoder = EncoderBuffer::new(&mut buffer[header_len..header_len + payload_capacity]);

        if let Some(size) = probe_size {
            // the probe fills its datagram exactly: one PING, the rest
            // PADDING
            let ping = frame::Ping;
            if payload_capacity < ping.encoding_size() {
                return Ok(None);
            }
            encoder.encode(&ping);
            encoder.encode(&frame::Padding {
                length: payload_capacity - ping.encoding_size(),
            });
            frames.push(SentFrame::MtuProbe { size });
            ack_eliciting = true;
            in_flight = false;
        } else {
            write_frames(
                context,
                level,
                &mut frames,
                &mut ack_eliciting,
                &mut in_flight,
                &mut encoder,
            )?;
        }

        if frames.is_empty() {
            return Ok(None);
        }

        // the sample for header protection needs (4 - pn_len) + sample_len
        // bytes of ciphertext; tiny payloads get padding
        let min_payload = 4 - truncated.len() + 16;
        if encoder.len() < min_payload {
            let padding = frame::Padding {
                length: min_payload - encoder.len(),
            };
            encoder.encode(&padding);
            in_flight = true;
        }

        encoder.len()
    };

    // patch the long-header length field (pn + ciphertext) before
    // sealing: the length is part of the authenticated header
    if let Some(length_offset) = length_offset {
        let length = (truncated.len() + payload_len + tag_len) as u16;
        debug_assert!(length < 0x4000);
        buffer[length_offset..length_offset + 2]
            .copy_from_slice(&(length | 0x4000).to_be_bytes());
    }

    // === seal ===
    {
        let keys = context.keys.keys(level).expect("caller checked keys");
        let (header, payload) = buffer.split_at_mut(header_len);
        let payload = &mut payload[..payload_len + tag_len];
        keys.sealer
            .encrypt(packet_number.as_u64(), header, payload)
            .map_err(|_| Error::INTERNAL_ERROR.with_reason("packet sealing failed"))?;
    }

    let packet_len = header_len + payload_len + tag_len;

    // === header protection ===
    {
        let keys = context.keys.keys(level).expect("caller checked keys");
        let sample_start = pn_offset + 4;
        let sample_len = keys.sealer_header.sample_len();
        debug_assert!(sample_start + sample_len <= packet_len);
        let sample: SmallVec<[u8; 16]> =
            SmallVec::from_slice(&buffer[sample_start..sample_start + sample_len]);
        let mask = keys
            .sealer_header
            .protection_mask(&sample)
            .map_err(|_| Error::INTERNAL_ERROR.with_reason("header protection failed"))?;

        let (head, rest) = buffer.split_at_mut(pn_offset);
        apply_header_protection(
            mask,
            &mut head[0],
            &mut rest[..truncated.len()],
            packet_type != PacketType::OneRtt,
        );
    }

    // === record ===
    let packet_number = context.spaces[space_index].next_packet_number();
    context.spaces[space_index]
        .loss
        .on_packet_sent(ack_eliciting, context.now);

    let info = SentPacketInfo {
        packet_number,
        space: level.space(),
        sent_time: context.now,
        sent_bytes: packet_len as u16,
        ack_eliciting,
        in_flight,
        is_app_limited: false,
        total_bytes_sent_then: context.total_bytes_sent + packet_len as u64,
        last_acked_packet_info: None,
        frames,
    };

    Ok(Some(info))
}

/// Writes frames for `level` in priority order
fn write_frames(
    context: &mut Context<'_>,
    level: EncryptionLevel,
    frames: &mut SmallVec<[SentFrame; 4]>,
    ack_eliciting: &mut bool,
    in_flight: &mut bool,
    encoder: &mut EncoderBuffer,
) -> Result<(), Error> {
    let space_index = level.space().as_index();

    // CONNECTION_CLOSE preempts everything and travels alone; it is
    // never retransmitted by loss detection, only by the closing-state
    // rate limiter
    if let Some(close) = context.flags.connection_close.take() {
        if close.encoding_size() <= encoder.remaining_capacity() {
            encoder.encode(&close);
            frames.push(SentFrame::ConnectionClose);
            *in_flight = false;
            return Ok(());
        }
        context.flags.connection_close = Some(close);
    }

    // PING: a PTO probe when nothing else elicits an acknowledgment
    if context.flags.ping {
        let ping = frame::Ping;
        if ping.encoding_size() <= encoder.remaining_capacity() {
            encoder.encode(&ping);
            frames.push(SentFrame::Ping);
            *ack_eliciting = true;
            *in_flight = true;
            context.flags.ping = false;
        }
    }

    // ACK
    if context.spaces[space_index].ack_tracker.ack_pending()
        || context.spaces[space_index].ack_tracker.ack_needed()
    {
        let largest = context.spaces[space_index].ack_tracker.largest_received();
        if context.spaces[space_index]
            .ack_tracker
            .write_ack_frame(context.now, encoder)
        {
            frames.push(SentFrame::Ack {
                largest_acked: largest.expect("tracker had ranges"),
            });
        }
    }

    // CRYPTO
    if context.crypto.has_pending_data() && context.crypto.next_send_level() == level {
        let remaining = MAX_FRAMES_PER_PACKET.saturating_sub(frames.len());
        let written = context
            .crypto
            .write_frames(packet_type_for(level), remaining, encoder);
        for info in written {
            frames.push(SentFrame::Crypto(info));
            *ack_eliciting = true;
            *in_flight = true;
        }
    }

    // everything below is 1-RTT only
    if level != EncryptionLevel::OneRtt || !context.handshake_complete {
        return Ok(());
    }

    // HANDSHAKE_DONE
    if context.flags.handshake_done && context.local.is_server() {
        let done = frame::HandshakeDone;
        if done.encoding_size() <= encoder.remaining_capacity() {
            encoder.encode(&done);
            frames.push(SentFrame::HandshakeDone);
            *ack_eliciting = true;
            *in_flight = true;
            context.flags.handshake_done = false;
        }
    }

    // NEW_CONNECTION_ID / RETIRE_CONNECTION_ID
    for cid in context.cids.source_cids_to_send() {
        if frames.len() >= MAX_FRAMES_PER_PACKET {
            break;
        }
        let frame = frame::NewConnectionId {
            sequence_number: VarInt::new(cid.sequence).expect("sequence fits"),
            retire_prior_to: VarInt::ZERO,
            connection_id: cid.id.as_bytes(),
            stateless_reset_token: &cid.reset_token,
        };
        if frame.encoding_size() > encoder.remaining_capacity() {
            break;
        }
        encoder.encode(&frame);
        cid.needs_to_send = false;
        frames.push(SentFrame::NewConnectionId {
            sequence_number: cid.sequence,
        });
        *ack_eliciting = true;
        *in_flight = true;
    }
    for dest in context.cids.dest_cids_to_retire() {
        if frames.len() >= MAX_FRAMES_PER_PACKET {
            break;
        }
        let frame = frame::RetireConnectionId {
            sequence_number: VarInt::new(dest.sequence).expect("sequence fits"),
        };
        if frame.encoding_size() > encoder.remaining_capacity() {
            break;
        }
        encoder.encode(&frame);
        dest.retire_needs_send = false;
        frames.push(SentFrame::RetireConnectionId {
            sequence_number: dest.sequence,
        });
        *ack_eliciting = true;
        *in_flight = true;
    }

    // PATH_CHALLENGE / PATH_RESPONSE
    if let Some(challenge) = context.path.challenge.as_mut() {
        if challenge.needs_to_send {
            let frame = frame::PathChallenge {
                data: &challenge.data,
            };
            if frame.encoding_size() <= encoder.remaining_capacity() {
                let data = challenge.data;
                encoder.encode(&frame);
                challenge.needs_to_send = false;
                frames.push(SentFrame::PathChallenge { data });
                *ack_eliciting = true;
                *in_flight = true;
            }
        }
    }
    if let Some(data) = context.path.response_pending.take() {
        let frame = frame::PathResponse { data: &data };
        if frame.encoding_size() <= encoder.remaining_capacity() {
            encoder.encode(&frame);
            frames.push(SentFrame::PathResponse);
            *ack_eliciting = true;
            *in_flight = true;
        } else {
            context.path.response_pending = Some(data);
        }
    }

    let Some(streams) = context.streams.as_deref_mut() else {
        return Ok(());
    };

    // MAX_DATA / MAX_STREAM_DATA / MAX_STREAMS
    if let Some(maximum) = streams.max_data_frame_needed() {
        let frame = frame::MaxData {
            maximum_data: VarInt::new(maximum).expect("limit fits"),
        };
        if frame.encoding_size() <= encoder.remaining_capacity() {
            encoder.encode(&frame);
            streams.on_max_data_frame_sent();
            frames.push(SentFrame::MaxData { maximum });
            *ack_eliciting = true;
            *in_flight = true;
        }
    }
    for stream_type in [StreamType::Bidirectional, StreamType::Unidirectional] {
        if let Some(maximum) = streams.max_streams_frame_needed(stream_type) {
            let maximum = VarInt::new(maximum).expect("count fits");
            let fits = if stream_type == StreamType::Bidirectional {
                let frame = frame::MaxStreamsBidirectional {
                    maximum_streams: maximum,
                };
                (frame.encoding_size() <= encoder.remaining_capacity()).then(|| encoder.encode(&frame)).is_some()
            } else {
                let frame = frame::MaxStreamsUnidirectional {
                    maximum_streams: maximum,
                };
                (frame.encoding_size() <= encoder.remaining_capacity()).then(|| encoder.encode(&frame)).is_some()
            };
            if fits {
                streams.on_max_streams_frame_sent(stream_type);
                frames.push(SentFrame::MaxStreams { stream_type });
                *ack_eliciting = true;
                *in_flight = true;
            }
        }
    }

    // DATA_BLOCKED / STREAM_DATA_BLOCKED report stalls to the peer
    if streams.connection_send_budget() == 0 && !streams.scheduler.is_empty() {
        let frame = frame::DataBlocked {
            data_limit: VarInt::new(streams.data_sent_total()).unwrap_or(VarInt::MAX),
        };
        if frame.encoding_size() <= encoder.remaining_capacity() {
            encoder.encode(&frame);
            frames.push(SentFrame::DataBlocked);
            *ack_eliciting = true;
            *in_flight = true;
        }
    }
    for id in streams.scheduler.iter().collect::<SmallVec<[_; 8]>>() {
        if frames.len() >= MAX_FRAMES_PER_PACKET {
            break;
        }
        let Some(stream) = streams.stream(id) else {
            continue;
        };
        let Some(send) = stream.send.as_ref() else {
            continue;
        };
        if !send.is_flow_control_blocked() {
            continue;
        }
        let frame = frame::StreamDataBlocked {
            stream_id: id.as_varint(),
            stream_data_limit: VarInt::new(send.max_allowed_send_offset())
                .unwrap_or(VarInt::MAX),
        };
        if frame.encoding_size() > encoder.remaining_capacity() {
            break;
        }
        encoder.encode(&frame);
        frames.push(SentFrame::StreamDataBlocked { stream_id: id });
        *ack_eliciting = true;
        *in_flight = true;
    }

    // STREAM frames by priority, round-robin within a class
    let mut batch_used: SmallVec<[quiver_core::stream::StreamId; 4]> = SmallVec::new();
    while frames.len() < MAX_FRAMES_PER_PACKET {
        let Some(id) = streams.scheduler.peek() else {
            break;
        };
        let budget = streams.connection_send_budget();
        let Some(stream) = streams.stream_mut(id) else {
            streams.scheduler.remove(id);
            continue;
        };
        let Some(send) = stream.send.as_mut() else {
            streams.scheduler.remove(id);
            continue;
        };

        // pending reset preempts data
        if send.reset_pending() {
            if let Some(info) = send.write_reset_frame(encoder) {
                frames.push(SentFrame::ResetStream(info));
                *ack_eliciting = true;
                *in_flight = true;
            }
        }

        let remaining = MAX_FRAMES_PER_PACKET.saturating_sub(frames.len());
        let (written, new_bytes) = send.write_frames(budget, remaining, encoder);
        let wrote_any = !written.is_empty();
        let still_pending = send.has_pending_data();

        for info in written {
            frames.push(SentFrame::Stream(info));
            *ack_eliciting = true;
            *in_flight = true;
        }
        streams.on_stream_bytes_sent(new_bytes);

        if !still_pending {
            streams.scheduler.remove(id);
        } else if wrote_any {
            if !batch_used.contains(&id) {
                batch_used.push(id);
            }
        }
        if !wrote_any {
            break;
        }
    }
    for id in batch_used {
        streams.scheduler.on_packet_written(id);
    }

    // unreliable datagrams ride behind stream data; they are never
    // fragmented, so one that does not fit waits for a fresh packet
    while frames.len() < MAX_FRAMES_PER_PACKET {
        let Some(data) = context.datagrams.front() else {
            break;
        };
        let prefix = VarInt::try_from(data.len())
            .map_err(|_| Error::INTERNAL_ERROR)?
            .encoding_size();
        if 1 + prefix + data.len() > encoder.remaining_capacity() {
            break;
        }

        let frame = frame::Datagram {
            is_last_frame: false,
            data: &data[..],
        };
        let length = data.len() as u16;
        encoder.encode(&frame);
        context.datagrams.pop_front();
        frames.push(SentFrame::Datagram { length });
        *ack_eliciting = true;
        *in_flight = true;
    }

    Ok(())
}

#[inline]
fn key_phase_bit(phase: quiver_core::crypto::KeyPhase) -> bool {
    matches!(phase, quiver_core::crypto::KeyPhase::One)
}
