// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The per-connection state machine.
//!
//! A connection multiplexes the TLS handshake over the crypto stream,
//! owns the three packet-number spaces with their keys and loss state, the
//! stream table, the path set with its connection IDs, and the two-phase
//! close machinery. All of it is driven from exactly one worker at a time;
//! nothing here locks.

pub mod stats;

pub use stats::ConnectionStats;

use crate::{
    config::{
        Settings, CLOSE_PTO_COUNT, CLOSING_RESPONSE_MIN_INTERVAL, LOCAL_CID_LEN,
    },
    crypto_stream::CryptoStream,
    path::{CidManager, Path, PathSet},
    space::{KeySet, PacketSpace, PhaseMatch, SentFrame},
    stream::StreamManager,
    transmission::{self, SendFlags},
};
use quiver_core::{
    connection::{self as core_connection, id::PeerId},
    crypto::{
        apply_header_protection, tls, EncryptionLevel, KeyPhase,
    },
    endpoint,
    event::{ConnectionEvent, ShutdownSummary},
    frame::Frame,
    interval::RangeSet,
    packet::{
        self, expand_packet_number, number::PacketNumberSpace, TruncatedPacketNumber,
    },
    random,
    recovery::congestion_controller::{AckEvent, CongestionControl, LossEvent},
    time::{Timer, Timestamp},
    transport::{error::ApplicationError, parameters::TransportParameters, Error},
    varint::VarInt,
};
use s2n_codec::{DecoderBuffer, EncoderValue};
use smallvec::SmallVec;
use std::{collections::VecDeque, net::SocketAddr};
use tracing::{debug, trace, warn};

/// Connection lifecycle flags, set monotonically
#[derive(Clone, Copy, Debug, Default)]
pub struct State {
    pub started: bool,
    pub handshake_confirmed: bool,
    pub connected: bool,
    pub closed_locally: bool,
    pub closed_remotely: bool,
    pub handle_closed: bool,
    pub freed: bool,
}

/// The two-phase close progression
#[derive(Debug)]
enum CloseStage {
    Open,
    /// We sent CONNECTION_CLOSE; incoming packets re-elicit it,
    /// rate-limited, until the drain deadline
    Closing {
        error_code: VarInt,
        is_application: bool,
        last_response: Option<Timestamp>,
        drain_deadline: Timestamp,
    },
    /// The peer closed; nothing more is sent
    Draining { drain_deadline: Timestamp },
    Closed,
}

pub struct Connection<S: tls::Session> {
    local: endpoint::Type,
    settings: Settings,
    version: u32,
    /// Correlation id for logs and events
    correlation_id: u64,

    pub state: State,
    close: CloseStage,
    close_cause: Option<core_connection::Error>,

    tls: Option<S>,
    /// The level whose read key currently decodes incoming crypto frames
    read_level: EncryptionLevel,
    crypto: CryptoStream,
    keys: KeySet,
    spaces: [PacketSpace; 3],
    pub streams: StreamManager,
    cids: CidManager,
    paths: PathSet,

    pub stats: ConnectionStats,
    flags: SendFlags,
    events: VecDeque<ConnectionEvent>,

    pto_backoff: u32,
    total_bytes_sent: u64,
    total_bytes_acked: u64,

    peer_params: Option<TransportParameters>,
    local_params: Vec<u8>,
    /// Retry or NEW_TOKEN token to put in Initial packets
    token: Vec<u8>,
    /// The client's first destination id, for Retry validation
    original_dest_cid: PeerId,
    retry_received: bool,

    idle_timer: Timer,
    keep_alive_timer: Timer,

    epoch: Timestamp,
    /// The send-buffer target last advertised to the streams
    ideal_send_buffer: u64,
    /// Unreliable datagrams queued for transmission
    pub pending_datagrams: VecDeque<bytes::Bytes>,
    /// Work is queued for the send path
    pub send_pending: bool,
}

impl<S: tls::Session> Connection<S> {
    /// Creates a client connection and queues the first handshake flight
    #[allow(clippy::too_many_arguments)]
    pub fn new_client(
        correlation_id: u64,
        settings: Settings,
        local_address: SocketAddr,
        remote_address: SocketAddr,
        server_name: &str,
        tls_endpoint: &mut impl tls::Endpoint<Session = S>,
        rng: &mut dyn random::Generator,
        now: Timestamp,
        cid_inserter: &mut dyn FnMut(&quiver_core::connection::id::LocalId) -> bool,
    ) -> Result<Self, Error> {
        let mut cids = CidManager::default();
        cids.set_routing_prefix(&settings.cid_routing_prefix);
        cids.generate_source_cid(rng, true, cid_inserter)?;

        // the client invents the server's first id
        let mut initial_dcid = [0u8; LOCAL_CID_LEN];
        rng.public_random_fill(&mut initial_dcid);
        let original_dest_cid =
            PeerId::try_from_bytes(&initial_dcid).expect("generated length is valid");
        cids.set_initial_dest_cid(original_dest_cid);

        let path = Path::new(local_address, remote_address, &settings, true);

        let mut connection = Self::new_common(
            endpoint::Type::Client,
            correlation_id,
            settings,
            cids,
            path,
            original_dest_cid,
            now,
        );

        let mut params = TransportParameters {
            idle_timeout_ms: VarInt::new(connection.settings.idle_timeout.as_millis() as u64)
                .unwrap_or(VarInt::ZERO),
            max_ack_delay_ms: VarInt::from_u8(crate::config::MAX_ACK_DELAY_MS as u8),
            active_connection_id_limit: VarInt::new(crate::config::ACTIVE_CONNECTION_ID_LIMIT)
                .expect("limit fits"),
            ..Default::default()
        };
        connection.streams.local_parameters(&mut params);
        connection.local_params = params.encode_to_vec();

        connection.install_initial_keys()?;
        connection.tls = Some(tls_endpoint.new_client_session(&connection.local_params, server_name));
        connection.state.started = true;
        connection.drive_tls(now)?;
        connection.send_pending = true;

        Ok(connection)
    }

    /// Creates a server connection from a validated first Initial packet
    #[allow(clippy::too_many_arguments)]
    pub fn new_server(
        correlation_id: u64,
        settings: Settings,
        local_address: SocketAddr,
        remote_address: SocketAddr,
        client_dest_cid: PeerId,
        client_source_cid: PeerId,
        tls_endpoint: &mut impl tls::Endpoint<Session = S>,
        rng: &mut dyn random::Generator,
        now: Timestamp,
        cid_inserter: &mut dyn FnMut(&quiver_core::connection::id::LocalId) -> bool,
    ) -> Result<Self, Error> {
        let mut cids = CidManager::default();
        cids.set_routing_prefix(&settings.cid_routing_prefix);
        cids.generate_source_cid(rng, true, cid_inserter)?;
        cids.set_initial_dest_cid(client_source_cid);

        // the server's address is validated by definition; the client's is
        // not until it proves handshake progress
        let path = Path::new(local_address, remote_address, &settings, false);

        let mut connection = Self::new_common(
            endpoint::Type::Server,
            correlation_id,
            settings,
            cids,
            path,
            client_dest_cid,
            now,
        );

        let mut params = TransportParameters {
            original_destination_connection_id: Some(client_dest_cid),
            idle_timeout_ms: VarInt::new(connection.settings.idle_timeout.as_millis() as u64)
                .unwrap_or(VarInt::ZERO),
            max_ack_delay_ms: VarInt::from_u8(crate::config::MAX_ACK_DELAY_MS as u8),
            active_connection_id_limit: VarInt::new(crate::config::ACTIVE_CONNECTION_ID_LIMIT)
                .expect("limit fits"),
            ..Default::default()
        };
        connection.streams.local_parameters(&mut params);
        connection.local_params = params.encode_to_vec();

        // initial keys derive from the client's chosen destination id
        connection.install_initial_keys_for(client_dest_cid.as_bytes())?;
        connection.tls = Some(tls_endpoint.new_server_session(&connection.local_params));
        connection.state.started = true;

        Ok(connection)
    }

    fn new_common(
        local: endpoint::Type,
        correlation_id: u64,
        settings: Settings,
        cids: CidManager,
        path: Path,
        original_dest_cid: PeerId,
        now: Timestamp,
    ) -> Self {
        let streams = StreamManager::new(local, settings.clone());
        let ideal_send_buffer = settings.ideal_send_buffer_size;
        let mut idle_timer = Timer::default();
        idle_timer.set(now + settings.handshake_idle_timeout);

        let mut stats = ConnectionStats::default();
        stats.timing.start = Some(now.as_duration());

        Self {
            local,
            settings,
            version: packet::QUIC_VERSION_1,
            correlation_id,
            state: State::default(),
            close: CloseStage::Open,
            close_cause: None,
            tls: None,
            read_level: EncryptionLevel::Initial,
            crypto: CryptoStream::new(),
            keys: KeySet::default(),
            spaces: [
                PacketSpace::new(PacketNumberSpace::Initial),
                PacketSpace::new(PacketNumberSpace::Handshake),
                PacketSpace::new(PacketNumberSpace::Application),
            ],
            streams,
            cids,
            paths: PathSet::new(path),
            stats,
            flags: SendFlags::default(),
            events: VecDeque::new(),
            pto_backoff: 1,
            total_bytes_sent: 0,
            total_bytes_acked: 0,
            peer_params: None,
            local_params: Vec::new(),
            token: Vec::new(),
            original_dest_cid,
            retry_received: false,
            idle_timer,
            keep_alive_timer: Timer::default(),
            epoch: now,
            ideal_send_buffer,
            pending_datagrams: VecDeque::new(),
            send_pending: false,
        }
    }

    #[inline]
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    #[inline]
    pub fn local_type(&self) -> endpoint::Type {
        self.local
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        matches!(self.close, CloseStage::Closed)
    }

    /// Drains application-visible events in production order
    pub fn drain_events(&mut self) -> impl Iterator<Item = ConnectionEvent> + '_ {
        self.events.drain(..)
    }

    /// Queues an unreliable datagram
    pub fn send_datagram(&mut self, data: bytes::Bytes) {
        self.pending_datagrams.push_back(data);
        self.send_pending = true;
    }

    /// The worker moved this connection; the application learns its new
    /// home so it can follow with affinity-sensitive work
    pub fn on_worker_update(&mut self, ideal_processor: u16) {
        self.events
            .push_back(ConnectionEvent::IdealProcessorChanged { ideal_processor });
    }

    fn install_initial_keys(&mut self) -> Result<(), Error> {
        let dcid: SmallVec<[u8; 20]> = SmallVec::from_slice(
            self.cids
                .active_dest_cid()
                .expect("initial dest cid present")
                .id
                .as_bytes(),
        );
        self.install_initial_keys_for(&dcid)
    }

    fn install_initial_keys_for(&mut self, client_dcid: &[u8]) -> Result<(), Error> {
        let pair = quiver_crypto::initial::initial_key_pair(client_dcid, self.local)
            .map_err(Error::from)?;
        self.keys.install(EncryptionLevel::Initial, pair);
        Ok(())
    }

    // === TLS plumbing ===

    /// Runs the TLS state machine to quiescence, honoring the
    /// one-outstanding-call latch
    fn drive_tls(&mut self, now: Timestamp) -> Result<(), Error> {
        if !self.crypto.begin_tls_call() {
            return Ok(());
        }

        loop {
            let Some(mut tls) = self.tls.take() else {
                self.crypto.end_tls_call();
                return Ok(());
            };

            let result = {
                let mut context = TlsContext {
                    connection: self,
                    now,
                };
                tls.process(&mut context)
            };
            self.tls = Some(tls);

            match result {
                Ok(tls::Progress::Complete) => {
                    self.on_handshake_complete(now)?;
                }
                Ok(tls::Progress::Pending) => {}
                Err(error) => {
                    self.crypto.end_tls_call();
                    return Err(error);
                }
            }

            if self.crypto.has_pending_data() {
                self.send_pending = true;
            }

            if !self.crypto.end_tls_call() {
                return Ok(());
            }
            // data arrived during the call: re-enter once
            if !self.crypto.begin_tls_call() {
                return Ok(());
            }
        }
    }

    fn on_handshake_complete(&mut self, now: Timestamp) -> Result<(), Error> {
        if self.state.connected {
            return Ok(());
        }
        self.state.connected = true;
        self.stats.timing.handshake_flight_end = Some(now.saturating_duration_since(self.epoch));

        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9.2
        //# An endpoint MUST discard its Handshake keys when the TLS handshake is
        //# confirmed
        if self.local.is_server() {
            self.state.handshake_confirmed = true;
            self.flags.handshake_done = true;
            self.discard_keys(EncryptionLevel::Handshake);
            // the client's address produced a completed handshake
            self.paths.active_mut().on_handshake_packet();
        }

        // a confirmed path starts searching for a larger MTU
        {
            let path = self.paths.active_mut();
            let mtu = path.mtu;
            path.mtu_discovery.on_connected(mtu, now);
        }

        self.idle_timer.set(now + self.settings.idle_timeout);
        if !self.settings.keep_alive_interval.is_zero() {
            self.keep_alive_timer.set(now + self.settings.keep_alive_interval);
        }

        debug!(id = self.correlation_id, "handshake complete");
        self.events.push_back(ConnectionEvent::Connected);
        self.send_pending = true;
        Ok(())
    }

    fn discard_keys(&mut self, level: EncryptionLevel) {
        if !self.keys.discard(level) {
            return;
        }
        let invalidated = self.spaces[level.space().as_index()].discard();
        if invalidated > 0 {
            let path = self.paths.active_mut();
            path.cc.on_data_invalidated(invalidated as u32);
        }
    }

    /// The server finished delivering its handshake data: release the TLS
    /// object and the crypto buffers
    fn try_server_complete(&mut self) {
        if self.local.is_server()
            && self.state.connected
            && self.crypto.one_rtt_boundary_set()
            && self.crypto.everything_acked()
        {
            self.tls = None;
            self.crypto.release_buffers();
        }
    }

    // === receive path ===

    /// Processes one UDP datagram addressed to this connection
    pub fn on_datagram_received(
        &mut self,
        remote_address: SocketAddr,
        datagram: &mut [u8],
        now: Timestamp,
        rng: &mut dyn random::Generator,
    ) -> Result<(), core_connection::Error> {
        if matches!(self.close, CloseStage::Closed) {
            return Ok(());
        }

        // path bookkeeping (and implicit creation for new source addresses)
        let local_address = self.paths.active().local_address;
        if let Some(index) =
            self.paths
                .find_or_create(local_address, remote_address, &self.settings.clone())
        {
            if let Some(path) = self.paths.get_mut(index) {
                path.on_bytes_received(datagram.len());
            }
        } else {
            self.stats.recv.dropped_packets += 1;
            return Ok(());
        }

        self.stats.recv.total_bytes += datagram.len() as u64;

        let mut cursor = 0usize;
        while cursor < datagram.len() {
            let remaining_len = datagram.len() - cursor;
            let meta = {
                let buffer = DecoderBuffer::new(&datagram[cursor..]);
                match packet::decode_packet(buffer, LOCAL_CID_LEN) {
                    Ok((packet, rest)) => {
                        let consumed = remaining_len - rest.len();
                        Some((PacketMeta::from_packet(&packet), consumed))
                    }
                    Err(_) => None,
                }
            };
            let Some((meta, consumed)) = meta else {
                self.stats.recv.dropped_packets += 1;
                break;
            };

            let packet_bytes = &mut datagram[cursor..cursor + meta.packet_len.max(consumed)];
            let result = self.on_packet(meta, packet_bytes, now, rng);
            match result {
                Ok(()) => {}
                Err(PacketDrop::Ignored) => {
                    trace!(id = self.correlation_id, "dropped undecryptable packet");
                    self.stats.recv.dropped_packets += 1;
                }
                Err(PacketDrop::Fatal(error)) => {
                    warn!(id = self.correlation_id, %error, "fatal packet error");
                    self.initiate_close_on_error(error, now);
                    return Ok(());
                }
            }
            cursor += consumed;

            // later coalesced packets may need keys this packet's crypto
            // data installs, so TLS runs between packets
            if let Err(error) = self.drive_tls(now) {
                let cause = self.transport_close_cause(error, now);
                return Err(cause);
            }
        }

        // any packet from the peer restarts the idle clock
        let idle = if self.state.connected {
            self.settings.idle_timeout
        } else {
            self.settings.handshake_idle_timeout
        };
        self.idle_timer.set(now + idle);

        self.drive_tls(now)
            .map_err(|error| self.transport_close_cause(error, now))?;

        Ok(())
    }

    fn transport_close_cause(
        &mut self,
        error: Error,
        now: Timestamp,
    ) -> core_connection::Error {
        self.initiate_close_on_error(error, now);
        core_connection::Error::Transport {
            error,
            initiator: self.local,
        }
    }

    fn on_packet(
        &mut self,
        meta: PacketMeta,
        packet_bytes: &mut [u8],
        now: Timestamp,
        rng: &mut dyn random::Generator,
    ) -> Result<(), PacketDrop> {
        match meta.packet_type {
            packet::Type::VersionNegotiation => {
                self.on_version_negotiation(&meta, now);
                Ok(())
            }
            packet::Type::Retry => self.on_retry(&meta, packet_bytes, now),
            packet::Type::Initial | packet::Type::Handshake | packet::Type::OneRtt => {
                self.on_protected_packet(meta, packet_bytes, now, rng)
            }
            packet::Type::ZeroRtt => Err(PacketDrop::Ignored),
        }
    }

    fn on_version_negotiation(&mut self, meta: &PacketMeta, _now: Timestamp) {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-6.2
        //# An endpoint MUST NOT act on a Version Negotiation packet if it has
        //# already negotiated a version
        if self.local.is_server() || self.state.connected || self.stats.version_negotiation > 0 {
            return;
        }
        if !meta
            .supported_versions
            .iter()
            .any(|version| *version == packet::QUIC_VERSION_1)
        {
            return;
        }

        debug!(id = self.correlation_id, "restarting after version negotiation");
        self.stats.version_negotiation = 1;
        self.version = packet::QUIC_VERSION_1;

        // restart the first flight under the (re)chosen version
        let unsent = self.crypto.max_sent_length();
        if unsent > 0 {
            self.crypto.on_loss(crate::crypto_stream::CryptoFrameInfo {
                offset: 0,
                length: unsent as u16,
            });
        }
        self.send_pending = true;
    }

    fn on_retry(
        &mut self,
        meta: &PacketMeta,
        packet_bytes: &[u8],
        _now: Timestamp,
    ) -> Result<(), PacketDrop> {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.5.2
        //# A client MUST accept and process at most one Retry packet for each
        //# connection attempt.
        if self.local.is_server() || self.retry_received || !self.token.is_empty() {
            return Err(PacketDrop::Ignored);
        }
        if meta.retry_token.is_empty() {
            return Err(PacketDrop::Ignored);
        }

        // the integrity tag covers the original destination id
        let without_tag = &packet_bytes[..packet_bytes.len() - 16];
        let pseudo =
            quiver_crypto::retry::pseudo_packet(self.original_dest_cid.as_bytes(), without_tag);
        let tag: [u8; 16] = packet_bytes[packet_bytes.len() - 16..]
            .try_into()
            .expect("length checked by parser");
        if quiver_crypto::retry::validate(&pseudo, &tag).is_err() {
            return Err(PacketDrop::Ignored);
        }

        debug!(id = self.correlation_id, "restarting handshake after retry");
        self.retry_received = true;
        self.stats.stateless_retry = 1;
        self.token = meta.retry_token.to_vec();

        // future Initial packets target the server's new id and re-derive
        // their keys from it
        let new_dcid = PeerId::try_from_bytes(&meta.source_cid).ok_or(PacketDrop::Ignored)?;
        self.cids.update_initial_dest_cid(new_dcid);
        self.install_initial_keys_for(new_dcid.as_bytes())
            .map_err(|_| PacketDrop::Ignored)?;

        // the first flight goes again with the token
        let unsent = self.crypto.max_sent_length();
        if unsent > 0 {
            self.crypto.on_loss(crate::crypto_stream::CryptoFrameInfo {
                offset: 0,
                length: unsent as u16,
            });
        }
        self.send_pending = true;
        Ok(())
    }

    /// Removes header protection, decrypts, and dispatches one packet
    fn on_protected_packet(
        &mut self,
        meta: PacketMeta,
        packet_bytes: &mut [u8],
        now: Timestamp,
        rng: &mut dyn random::Generator,
    ) -> Result<(), PacketDrop> {
        let level = match meta.packet_type {
            packet::Type::Initial => EncryptionLevel::Initial,
            packet::Type::Handshake => EncryptionLevel::Handshake,
            _ => EncryptionLevel::OneRtt,
        };
        let space_index = level.space().as_index();

        if self.spaces[space_index].is_discarded() || !self.keys.has_keys(level) {
            return Err(PacketDrop::Ignored);
        }

        // === header protection removal ===
        let header_len = meta.header_len;
        let sample_len = {
            let keys = self.keys.keys(level).expect("checked above");
            keys.opener_header.sample_len()
        };
        if packet_bytes.len() < header_len + 4 + sample_len {
            return Err(PacketDrop::Ignored);
        }

        let mask = {
            let keys = self.keys.keys(level).expect("checked above");
            let sample = &packet_bytes[header_len + 4..header_len + 4 + sample_len];
            keys.opener_header
                .protection_mask(sample)
                .map_err(|_| PacketDrop::Ignored)?
        };

        {
            let (head, rest) = packet_bytes.split_at_mut(header_len);
            // the pn length is unknown until the first byte is unmasked;
            // unmask up to four bytes and ignore the excess
            let long_header = meta.packet_type != packet::Type::OneRtt;
            apply_header_protection(mask, &mut head[0], &mut rest[..4], long_header);
        }

        let first_byte = packet_bytes[0];
        let pn_len = (first_byte & 0b11) as usize + 1;
        // re-protect the bytes past the actual packet number
        for i in pn_len..4 {
            packet_bytes[header_len + i] ^= mask[1 + i];
        }

        let truncated = TruncatedPacketNumber::read(&packet_bytes[header_len..], pn_len)
            .ok_or(PacketDrop::Ignored)?;
        let largest = self.spaces[space_index].ack_tracker.largest_received();
        let packet_number =
            expand_packet_number(truncated, largest).ok_or(PacketDrop::Ignored)?;

        if self.spaces[space_index]
            .ack_tracker
            .is_duplicate(packet_number)
        {
            self.stats.recv.duplicate_packets += 1;
            return Err(PacketDrop::Ignored);
        }

        // === decrypt ===
        let key_phase = if first_byte & packet::KEY_PHASE_BIT != 0 {
            KeyPhase::One
        } else {
            KeyPhase::Zero
        };

        let aad_len = header_len + pn_len;
        let payload_len = meta.packet_len - aad_len;
        let plaintext_len = {
            let (aad, payload) = packet_bytes.split_at_mut(aad_len);
            let payload = &mut payload[..payload_len];

            let open_result = if level == EncryptionLevel::OneRtt {
                match self.keys.select_one_rtt_opener(key_phase) {
                    Some((keys, phase_match)) => {
                        let result = keys.opener.decrypt(packet_number.as_u64(), aad, payload);
                        result.map(|len| (len, Some(phase_match)))
                    }
                    None => Err(quiver_core::crypto::CryptoError::DECRYPT_ERROR),
                }
            } else {
                let keys = self.keys.keys(level).expect("checked above");
                keys.opener
                    .decrypt(packet_number.as_u64(), aad, payload)
                    .map(|len| (len, None))
            };

            match open_result {
                Ok((len, phase_match)) => {
                    if phase_match == Some(PhaseMatch::Next) {
                        // the peer initiated a key update
                        debug!(id = self.correlation_id, "peer key update");
                        self.keys
                            .commit_key_update()
                            .map_err(PacketDrop::Fatal)?;
                        self.stats.misc.key_update_count = self.keys.key_update_count();
                    }
                    len
                }
                Err(_) => {
                    self.stats.recv.decryption_failures += 1;
                    self.keys
                        .on_decryption_failure()
                        .map_err(PacketDrop::Fatal)?;
                    return Err(PacketDrop::Ignored);
                }
            }
        };

        // === duplicate detection and dispatch ===
        let plaintext_start = aad_len;
        let plaintext_range = plaintext_start..plaintext_start + plaintext_len;

        // a server receiving a handshake packet has validated the client
        if level == EncryptionLevel::Handshake && self.local.is_server() {
            self.paths.active_mut().on_handshake_packet();
            // the client address is validated; initial keys are done
            self.discard_keys(EncryptionLevel::Initial);
        }
        if level == EncryptionLevel::Handshake && self.local.is_client() {
            // receipt of any handshake packet means the server progressed
            self.stats.timing.initial_flight_end
                .get_or_insert(now.saturating_duration_since(self.epoch));
        }

        let mut ack_eliciting = false;
        let dispatch_result = self.dispatch_frames(
            level,
            &packet_bytes[plaintext_range],
            now,
            rng,
            &mut ack_eliciting,
        );

        match dispatch_result {
            Ok(()) => {}
            Err(error) => return Err(PacketDrop::Fatal(error)),
        }

        self.spaces[space_index]
            .ack_tracker
            .on_packet_received(packet_number, ack_eliciting, now)
            .expect("duplicate was checked before dispatch");

        self.stats.recv.total_packets += 1;
        if self.spaces[space_index].ack_tracker.ack_needed() {
            self.send_pending = true;
        }

        Ok(())
    }

    /// Dispatches the frames of a decrypted packet
    fn dispatch_frames(
        &mut self,
        level: EncryptionLevel,
        plaintext: &[u8],
        now: Timestamp,
        rng: &mut dyn random::Generator,
        ack_eliciting: &mut bool,
    ) -> Result<(), Error> {
        // a closing connection only re-elicits its close frame
        if let CloseStage::Closing {
            error_code,
            is_application,
            last_response,
            ..
        } = &mut self.close
        {
            let can_respond = last_response
                .map_or(true, |last| now.saturating_duration_since(last) >= CLOSING_RESPONSE_MIN_INTERVAL);
            if can_respond {
                *last_response = Some(now);
                self.flags.connection_close = Some(quiver_core::frame::ConnectionClose {
                    error_code: *error_code,
                    frame_type: (!*is_application).then_some(VarInt::ZERO),
                    reason: None,
                });
                self.send_pending = true;
            }
            return Ok(());
        }
        if matches!(self.close, CloseStage::Draining { .. }) {
            return Ok(());
        }

        let mut buffer = DecoderBuffer::new(plaintext);
        while !buffer.is_empty() {
            let (frame, rest) = Frame::decode(buffer).map_err(Error::from)?;
            buffer = rest;
            *ack_eliciting |= frame.ack_elicitation().is_ack_eliciting();
            self.on_frame(level, frame, now, rng)?;
        }
        Ok(())
    }

    fn on_frame(
        &mut self,
        level: EncryptionLevel,
        frame: Frame<'_>,
        now: Timestamp,
        rng: &mut dyn random::Generator,
    ) -> Result<(), Error> {
        let space_index = level.space().as_index();
        let is_one_rtt = level == EncryptionLevel::OneRtt;

        match frame {
            Frame::Padding(_) | Frame::Ping(_) => {}

            Frame::Ack(ack) => {
                self.on_ack_frame(space_index, &ack, now, rng)?;
            }

            Frame::Crypto(crypto) => {
                // the first crypto bytes at a higher level mark the read-key
                // transition: subsequent frame offsets restart at zero there
                if level > self.read_level {
                    self.read_level = level;
                    self.crypto.on_read_key_updated();
                }
                let data_ready = self
                    .crypto
                    .on_crypto_frame(crypto.offset.as_u64(), crypto.data)?;
                if data_ready {
                    // drained between packets and after the datagram
                    self.send_pending = true;
                }
            }

            Frame::ConnectionClose(close) => {
                self.on_peer_close(close.error_code, close.is_application_close(), now);
            }

            Frame::HandshakeDone(_) => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-19.20
                //# A server MUST treat receipt of a HANDSHAKE_DONE frame as a
                //# connection error of type PROTOCOL_VIOLATION.
                if self.local.is_server() {
                    return Err(Error::PROTOCOL_VIOLATION.with_reason("client sent HANDSHAKE_DONE"));
                }
                if !self.state.handshake_confirmed {
                    self.state.handshake_confirmed = true;
                    self.discard_keys(EncryptionLevel::Handshake);
                }
            }

            Frame::Stream(stream) if is_one_rtt => {
                self.streams.on_stream_frame(&stream, now)?;
            }
            Frame::ResetStream(reset) if is_one_rtt => {
                self.streams.on_reset_frame(
                    quiver_core::stream::StreamId::from_varint(reset.stream_id),
                    reset.application_error_code,
                    reset.final_size.as_u64(),
                    None,
                )?;
            }
            Frame::ReliableResetStream(reset) if is_one_rtt => {
                self.streams.on_reset_frame(
                    quiver_core::stream::StreamId::from_varint(reset.stream_id),
                    reset.application_error_code,
                    reset.final_size.as_u64(),
                    Some(reset.reliable_size.as_u64()),
                )?;
            }
            Frame::StopSending(stop) if is_one_rtt => {
                self.streams.on_stop_sending_frame(
                    quiver_core::stream::StreamId::from_varint(stop.stream_id),
                    stop.application_error_code,
                )?;
                self.send_pending = true;
            }
            Frame::MaxData(frame) if is_one_rtt => {
                if self.streams.on_max_data_frame(frame.maximum_data.as_u64()) {
                    self.send_pending = true;
                }
            }
            Frame::MaxStreamData(frame) if is_one_rtt => {
                self.streams.on_max_stream_data_frame(
                    quiver_core::stream::StreamId::from_varint(frame.stream_id),
                    frame.maximum_stream_data.as_u64(),
                )?;
                self.send_pending = true;
            }
            Frame::MaxStreamsBidirectional(frame) if is_one_rtt => {
                self.streams.on_max_streams_frame(
                    quiver_core::stream::StreamType::Bidirectional,
                    frame.maximum_streams.as_u64(),
                );
            }
            Frame::MaxStreamsUnidirectional(frame) if is_one_rtt => {
                self.streams.on_max_streams_frame(
                    quiver_core::stream::StreamType::Unidirectional,
                    frame.maximum_streams.as_u64(),
                );
            }
            Frame::DataBlocked(_) | Frame::StreamDataBlocked(_) if is_one_rtt => {
                // informational; the window reopen path already runs
            }
            Frame::StreamsBlockedBidirectional(_) | Frame::StreamsBlockedUnidirectional(_)
                if is_one_rtt => {}

            Frame::NewConnectionId(frame) if is_one_rtt => {
                let id = PeerId::try_from_bytes(frame.connection_id)
                    .ok_or(Error::FRAME_ENCODING_ERROR)?;
                let outcome = self.cids.on_new_connection_id(
                    id,
                    frame.sequence_number.as_u64(),
                    frame.retire_prior_to.as_u64(),
                    *frame.stateless_reset_token,
                )?;
                if outcome.active_cid_replaced {
                    self.stats.misc.dest_cid_update_count += 1;
                    self.send_pending = true;
                }
                if outcome.active_path_broken {
                    // silent abort: no usable path identity remains
                    self.close_silently(core_connection::Error::NoValidPath, now);
                }
            }
            Frame::RetireConnectionId(frame) if is_one_rtt => {
                // the engine's own cid appears in the short header; the
                // binding removed it from its table on our behalf
                self.cids
                    .on_retire_connection_id(frame.sequence_number.as_u64(), &[])?;
            }

            Frame::PathChallenge(challenge) if is_one_rtt => {
                let path = self.paths.active_mut();
                path.response_pending = Some(*challenge.data);
                self.send_pending = true;
            }
            Frame::PathResponse(response) if is_one_rtt => {
                for path in self.paths.iter_mut() {
                    if path.on_path_response(response.data) {
                        break;
                    }
                }
            }

            Frame::NewToken(token) if is_one_rtt => {
                if self.local.is_client() {
                    self.token = token.token.to_vec();
                }
            }

            Frame::Datagram(datagram) if is_one_rtt => {
                self.events.push_back(ConnectionEvent::DatagramReceived {
                    length: datagram.data.len(),
                });
            }

            _ => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-12.4
                //# The payload of a packet that contains frames MUST contain only
                //# frames permitted for that packet type.
                return Err(Error::PROTOCOL_VIOLATION.with_reason("frame in wrong packet type"));
            }
        }
        Ok(())
    }

    /// Applies an ACK frame to one space: loss detection, congestion
    /// control, and per-frame acknowledgment fan-out
    fn on_ack_frame(
        &mut self,
        space_index: usize,
        ack: &quiver_core::frame::Ack<quiver_core::frame::ack::AckRangesDecoder<'_>>,
        now: Timestamp,
        rng: &mut dyn random::Generator,
    ) -> Result<(), Error> {
        let mut ranges = RangeSet::new();
        for range in ack.ack_ranges() {
            ranges.insert(range.start().as_u64(), range.end().as_u64() + 1);
        }

        let ack_delay_exponent = self
            .peer_params
            .as_ref()
            .map(|params| params.ack_delay_exponent)
            .unwrap_or(3);
        let ack_delay = core::time::Duration::from_micros(
            ack.ack_delay.as_u64() << ack_delay_exponent,
        );

        let space = &mut self.spaces[space_index];
        let path = self.paths.active_mut();

        let processing =
            space
                .loss
                .on_ack_received(&mut space.sent_packets, &ranges, now, &path.rtt);

        if processing.newly_acked.is_empty() && processing.lost.is_empty() {
            return Ok(());
        }
        self.stats.recv.valid_ack_frames += 1;

        // RTT sample
        if let Some(latest_rtt) = processing.latest_rtt {
            path.rtt
                .update_rtt(latest_rtt, ack_delay, now, self.state.handshake_confirmed);
            self.stats.smoothed_rtt = path.rtt.smoothed_rtt();
            self.stats.min_rtt = path.rtt.min_rtt();
        }

        // congestion control
        let acked_in_flight: u64 = processing
            .newly_acked
            .iter()
            .filter(|packet| packet.in_flight)
            .map(|packet| packet.sent_bytes as u64)
            .sum();
        self.total_bytes_acked += acked_in_flight;

        if acked_in_flight > 0 {
            let largest = processing.newly_acked.last().expect("non-empty");
            let acked_infos: Vec<_> = processing
                .newly_acked
                .iter()
                .filter(|packet| packet.in_flight)
                .map(|packet| quiver_core::recovery::congestion_controller::AckedPacketInfo {
                    sent_time: packet.sent_time,
                    packet_length: packet.sent_bytes as u32,
                    is_app_limited: packet.is_app_limited,
                    total_bytes_sent_then: packet.total_bytes_sent_then,
                    last_acked: packet.last_acked_packet_info,
                })
                .collect();

            let event = AckEvent {
                now,
                largest_acked_sent_time: largest.sent_time,
                adjusted_ack_time: now.checked_sub(ack_delay).unwrap_or(now),
                num_retransmittable_bytes: acked_in_flight as u32,
                total_bytes_acked: self.total_bytes_acked,
                min_rtt_sample: processing.latest_rtt,
                is_implicit: false,
                has_loss: !processing.lost.is_empty(),
                is_largest_acked_packet_app_limited: largest.is_app_limited,
                acked_packets: &acked_infos,
            };
            if path.cc.on_data_acknowledged(&event, rng) {
                self.send_pending = true;
            }
        }

        // PTO recovery
        self.pto_backoff = 1;

        // fan acknowledgment out to the owning components
        for packet in &processing.newly_acked {
            for frame in &packet.frames {
                self.on_frame_acked(frame, packet.space, now);
            }
        }

        // losses
        if !processing.lost.is_empty() {
            let lost_in_flight: u64 = processing
                .lost
                .iter()
                .filter(|packet| packet.in_flight)
                .map(|packet| packet.sent_bytes as u64)
                .sum();
            self.stats.send.suspected_lost_packets += processing.lost.len() as u64;
            self.stats.send.congestion_events += 1;

            let path = self.paths.active_mut();
            if processing.persistent_congestion {
                self.stats.send.persistent_congestion_events += 1;
                path.rtt.on_persistent_congestion();
            }
            if lost_in_flight > 0 {
                let event = LossEvent {
                    now,
                    num_retransmittable_bytes: lost_in_flight as u32,
                    persistent_congestion: processing.persistent_congestion,
                };
                if path.cc.on_data_lost(&event) {
                    self.send_pending = true;
                }
            }

            for packet in &processing.lost {
                for frame in packet.frames.clone() {
                    self.on_frame_lost(frame, now);
                }
            }
        }

        self.try_server_complete();
        Ok(())
    }

    fn on_frame_acked(&mut self, frame: &SentFrame, space: PacketNumberSpace, now: Timestamp) {
        match frame {
            SentFrame::Crypto(info) => {
                let outcome = self.crypto.on_ack(*info);
                if outcome.send_complete {
                    self.try_server_complete();
                }
            }
            SentFrame::Stream(info) => {
                if let Some(stream) = self.streams.stream_mut(info.stream_id) {
                    if let Some(send) = stream.send.as_mut() {
                        if send.on_ack(*info) {
                            self.streams.finish_if_complete(info.stream_id);
                        }
                    }
                }
            }
            SentFrame::ResetStream(info) => {
                if let Some(stream) = self.streams.stream_mut(info.stream_id) {
                    if let Some(send) = stream.send.as_mut() {
                        if send.on_reset_ack() {
                            self.streams.finish_if_complete(info.stream_id);
                        }
                    }
                }
            }
            SentFrame::Ack { largest_acked } => {
                self.spaces[space.as_index()]
                    .ack_tracker
                    .on_ack_frame_acked(*largest_acked);
            }
            SentFrame::RetireConnectionId { sequence_number } => {
                self.cids.on_retire_frame_acked(*sequence_number);
            }
            SentFrame::MtuProbe { size } => {
                let path = self.paths.active_mut();
                if let Some(new_mtu) = path.mtu_discovery.on_probe_acked(*size, now) {
                    debug!(id = self.correlation_id, mtu = new_mtu, "path mtu raised");
                    path.mtu = new_mtu;
                    path.cc.update_mtu(new_mtu);
                    // keep walking toward the configured maximum
                    self.send_pending = true;
                }
            }
            _ => {}
        }
    }

    fn on_frame_lost(&mut self, frame: SentFrame, now: Timestamp) {
        match frame {
            SentFrame::Crypto(info) => {
                if self.crypto.on_loss(info) {
                    self.send_pending = true;
                }
            }
            SentFrame::Stream(info) => {
                if let Some(stream) = self.streams.stream_mut(info.stream_id) {
                    if let Some(send) = stream.send.as_mut() {
                        if send.on_loss(info) {
                            self.streams.queue_send(info.stream_id);
                            self.send_pending = true;
                        }
                    }
                }
            }
            SentFrame::ResetStream(info) => {
                if let Some(stream) = self.streams.stream_mut(info.stream_id) {
                    if let Some(send) = stream.send.as_mut() {
                        send.on_reset_loss();
                        self.streams.queue_send(info.stream_id);
                        self.send_pending = true;
                    }
                }
            }
            SentFrame::Ping => {
                self.flags.ping = true;
                self.send_pending = true;
            }
            SentFrame::HandshakeDone => {
                self.flags.handshake_done = true;
                self.send_pending = true;
            }
            SentFrame::NewConnectionId { sequence_number } => {
                self.cids.requeue_new_cid(sequence_number);
                self.send_pending = true;
            }
            SentFrame::RetireConnectionId { sequence_number } => {
                self.cids.requeue_retire_cid(sequence_number);
                self.send_pending = true;
            }
            SentFrame::PathChallenge { data } => {
                if let Some(challenge) = self.paths.active_mut().challenge.as_mut() {
                    if challenge.data == data {
                        challenge.needs_to_send = true;
                        self.send_pending = true;
                    }
                }
            }
            SentFrame::MtuProbe { size } => {
                self.paths
                    .active_mut()
                    .mtu_discovery
                    .on_probe_lost(size, now);
                // either the next attempt or the settled search
                self.send_pending = true;
            }
            _ => {}
        }
    }

    // === close ===

    /// Application-initiated shutdown
    pub fn shutdown(&mut self, error_code: ApplicationError, now: Timestamp) {
        if !matches!(self.close, CloseStage::Open) {
            return;
        }
        self.state.closed_locally = true;
        self.close_cause = Some(core_connection::Error::Application {
            error: error_code,
            initiator: self.local,
        });
        self.enter_closing(error_code.0, true, now);
        self.events
            .push_back(ConnectionEvent::ShutdownInitiatedByTransport {
                error: self.close_cause.expect("just set"),
            });
    }

    /// Transport-error shutdown (sends CONNECTION_CLOSE with the code)
    pub fn initiate_close_on_error(&mut self, error: Error, now: Timestamp) {
        if !matches!(self.close, CloseStage::Open) {
            return;
        }
        self.state.closed_locally = true;
        let cause = core_connection::Error::Transport {
            error,
            initiator: self.local,
        };
        self.close_cause = Some(cause);
        self.enter_closing(error.code, false, now);
        self.events
            .push_back(ConnectionEvent::ShutdownInitiatedByTransport { error: cause });
    }

    /// Local fatal error: drop without a closing period
    pub fn close_silently(&mut self, cause: core_connection::Error, now: Timestamp) {
        if matches!(self.close, CloseStage::Closed) {
            return;
        }
        debug!(id = self.correlation_id, %cause, "silent close");
        self.state.closed_locally = true;
        self.close_cause = Some(cause);
        self.close = CloseStage::Closed;
        self.state.freed = true;
        self.emit_shutdown_complete(now);
    }

    fn enter_closing(&mut self, error_code: VarInt, is_application: bool, now: Timestamp) {
        let pto = self
            .paths
            .active()
            .rtt
            .pto_period(self.pto_backoff, PacketNumberSpace::Application);
        let drain_deadline = now + pto * CLOSE_PTO_COUNT;

        self.flags.connection_close = Some(quiver_core::frame::ConnectionClose {
            error_code,
            frame_type: (!is_application).then_some(VarInt::ZERO),
            reason: None,
        });
        self.close = CloseStage::Closing {
            error_code,
            is_application,
            last_response: Some(now),
            drain_deadline,
        };
        self.send_pending = true;
    }

    fn on_peer_close(&mut self, error_code: VarInt, is_application: bool, now: Timestamp) {
        if matches!(self.close, CloseStage::Draining { .. } | CloseStage::Closed) {
            return;
        }
        self.state.closed_remotely = true;

        let cause = if is_application {
            core_connection::Error::Application {
                error: ApplicationError(error_code),
                initiator: self.local.peer_type(),
            }
        } else if error_code == VarInt::ZERO {
            core_connection::Error::Closed {
                initiator: self.local.peer_type(),
            }
        } else {
            core_connection::Error::Transport {
                error: Error::new(error_code),
                initiator: self.local.peer_type(),
            }
        };
        if self.close_cause.is_none() {
            self.close_cause = Some(cause);
        }

        self.events
            .push_back(ConnectionEvent::ShutdownInitiatedByPeer {
                error_code: ApplicationError(error_code),
            });

        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.2.2
        //# An endpoint that receives a CONNECTION_CLOSE frame MAY send a single
        //# packet containing a CONNECTION_CLOSE frame before entering the
        //# draining state
        let pto = self
            .paths
            .active()
            .rtt
            .pto_period(self.pto_backoff, PacketNumberSpace::Application);
        self.close = CloseStage::Draining {
            drain_deadline: now + pto * CLOSE_PTO_COUNT,
        };
    }

    fn emit_shutdown_complete(&mut self, _now: Timestamp) {
        let status = self
            .close_cause
            .unwrap_or(core_connection::Error::Closed {
                initiator: self.local,
            });
        let summary = ShutdownSummary {
            by_app: matches!(status, core_connection::Error::Application { initiator, .. } if initiator == self.local),
            closed_remotely: self.state.closed_remotely,
            error_code: status.close_code(),
            status,
        };
        self.events
            .push_back(ConnectionEvent::ShutdownComplete(summary));
    }

    // === timers ===

    /// The earliest pending deadline
    pub fn next_timeout(&self) -> Option<Timestamp> {
        let mut deadline: Option<Timestamp> = None;
        let mut fold = |candidate: Option<Timestamp>| {
            if let Some(candidate) = candidate {
                deadline = Some(deadline.map_or(candidate, |current| current.min(candidate)));
            }
        };

        match &self.close {
            CloseStage::Closing { drain_deadline, .. }
            | CloseStage::Draining { drain_deadline } => {
                fold(Some(*drain_deadline));
                return deadline;
            }
            CloseStage::Closed => return None,
            CloseStage::Open => {}
        }

        fold(self.idle_timer.deadline());
        fold(self.keep_alive_timer.deadline());

        let path = self.paths.active();
        fold(path.mtu_discovery.raise_deadline());
        for space in self.spaces.iter() {
            if space.is_discarded() {
                continue;
            }
            fold(space.loss.loss_time());
            fold(space.loss.pto_deadline(
                &space.sent_packets,
                &path.rtt,
                self.pto_backoff,
                space.space(),
            ));
        }
        deadline
    }

    /// Fires whichever timers expired at `now`
    pub fn on_timeout(&mut self, now: Timestamp, rng: &mut dyn random::Generator) {
        let _ = rng;

        match &self.close {
            CloseStage::Closing { drain_deadline, .. }
            | CloseStage::Draining { drain_deadline } => {
                if drain_deadline.has_elapsed(now) {
                    self.close = CloseStage::Closed;
                    self.state.freed = true;
                    self.emit_shutdown_complete(now);
                }
                return;
            }
            CloseStage::Closed => return,
            CloseStage::Open => {}
        }

        // idle timeout closes silently (no peer to inform reliably)
        if self.idle_timer.poll_expiration(now).is_ready() {
            let cause = if self.state.connected {
                core_connection::Error::IdleTimeout
            } else {
                core_connection::Error::HandshakeTimeout
            };
            self.close_silently(cause, now);
            return;
        }

        if self.keep_alive_timer.poll_expiration(now).is_ready() {
            self.flags.ping = true;
            self.send_pending = true;
            self.keep_alive_timer
                .set(now + self.settings.keep_alive_interval);
        }

        // a completed MTU search re-opens when its raise timer fires
        {
            let path = self.paths.active_mut();
            let mtu = path.mtu;
            if path.mtu_discovery.on_raise_timeout(mtu, now) {
                self.send_pending = true;
            }
        }

        // loss timers and PTO
        let path_rtt = self.paths.active().rtt;
        let mut lost_frames: Vec<SentFrame> = Vec::new();
        let mut lost_bytes = 0u64;
        let mut pto_fired = false;

        for space in self.spaces.iter_mut() {
            if space.is_discarded() {
                continue;
            }
            if let Some(loss_time) = space.loss.loss_time() {
                if loss_time.has_elapsed(now) {
                    let lost = space
                        .loss
                        .detect_lost_packets(&mut space.sent_packets, now, &path_rtt);
                    for packet in lost {
                        if packet.in_flight {
                            lost_bytes += packet.sent_bytes as u64;
                        }
                        lost_frames.extend(packet.frames.into_iter());
                    }
                }
            }
            if let Some(pto) = space.loss.pto_deadline(
                &space.sent_packets,
                &path_rtt,
                self.pto_backoff,
                space.space(),
            ) {
                if pto.has_elapsed(now) {
                    pto_fired = true;
                }
            }
        }

        if lost_bytes > 0 {
            self.stats.send.congestion_events += 1;
            let event = LossEvent {
                now,
                num_retransmittable_bytes: lost_bytes as u32,
                persistent_congestion: false,
            };
            self.paths.active_mut().cc.on_data_lost(&event);
        }
        for frame in lost_frames {
            self.on_frame_lost(frame, now);
        }

        if pto_fired {
            //= https://www.rfc-editor.org/rfc/rfc9002#section-6.2.1
            //# When a PTO timer expires, the PTO backoff MUST be doubled
            self.pto_backoff = self.pto_backoff.saturating_mul(2);
            self.flags.ping = true;
            // probes may exceed the congestion window
            self.paths.active_mut().cc.set_exemption(2);
            self.send_pending = true;

            let disconnect_deadline = self.settings.disconnect_timeout;
            let exhausted = self
                .paths
                .active()
                .rtt
                .pto_period(self.pto_backoff, PacketNumberSpace::Application)
                >= disconnect_deadline;
            if exhausted {
                self.close_silently(core_connection::Error::DisconnectTimeout, now);
            }
        }
    }

    // === send path ===

    /// Builds and emits datagrams until budgets run dry
    pub fn flush(
        &mut self,
        now: Timestamp,
        rng: &mut dyn random::Generator,
        emit: &mut dyn FnMut(&[u8], SocketAddr),
    ) -> Result<(), Error> {
        let _ = rng;
        if matches!(self.close, CloseStage::Draining { .. } | CloseStage::Closed) {
            self.send_pending = false;
            return Ok(());
        }

        let remote = self.paths.active().remote_address;
        let mut datagram = vec![0u8; self.settings.maximum_mtu as usize];

        loop {
            let path = self.paths.active_mut();
            let time_since_last_send = path
                .last_send_time
                .map(|last| now.saturating_duration_since(last));
            let allowance = path.cc.get_send_allowance(time_since_last_send);
            if allowance == 0 && path.cc.get_exemptions() == 0 && self.flags.connection_close.is_none() {
                break;
            }
            let allowance = allowance.max(path.mtu as u32);

            let dest_cid: SmallVec<[u8; 20]> = match self.cids.active_dest_cid() {
                Some(dest) => SmallVec::from_slice(dest.id.as_bytes()),
                None => break,
            };
            let source_cid: SmallVec<[u8; 20]> = self
                .cids
                .source_cids()
                .iter()
                .find(|cid| !cid.retired)
                .map(|cid| SmallVec::from_slice(cid.id.as_bytes()))
                .unwrap_or_default();

            let handshake_complete = self.state.connected;
            let token: SmallVec<[u8; 64]> = SmallVec::from_slice(&self.token);

            let transmission = {
                let mut context = transmission::Context {
                    settings: &self.settings,
                    local: self.local,
                    now,
                    version: self.version,
                    dest_cid: &dest_cid,
                    source_cid: &source_cid,
                    token: &token,
                    keys: &mut self.keys,
                    spaces: &mut self.spaces,
                    crypto: &mut self.crypto,
                    streams: Some(&mut self.streams),
                    cids: &mut self.cids,
                    path: self.paths.active_mut(),
                    flags: &mut self.flags,
                    datagrams: &mut self.pending_datagrams,
                    send_allowance: allowance,
                    handshake_complete,
                    total_bytes_sent: self.total_bytes_sent,
                };
                transmission::build_datagram(&mut context, &mut datagram)?
            };

            let Some(transmission) = transmission else {
                break;
            };

            let len = transmission.len;
            self.total_bytes_sent += len as u64;
            self.stats.send.total_bytes += len as u64;

            self.paths.active_mut().on_bytes_sent(len, now);

            for packet in transmission.packets {
                self.stats.send.total_packets += 1;
                if packet.ack_eliciting {
                    self.stats.send.retransmittable_packets += 1;
                }
                if packet.in_flight {
                    self.paths
                        .active_mut()
                        .cc
                        .on_data_sent(packet.sent_bytes as u32, now);
                }
                self.spaces[packet.space.as_index()].sent_packets.push(packet);
            }

            // 1-RTT bytes count against the key's sealing budget
            if self.keys.has_keys(EncryptionLevel::OneRtt)
                && self
                    .keys
                    .on_bytes_sealed(len as u64, self.settings.max_bytes_per_key)
                && self.keys.key_update_staged()
            {
                self.keys.commit_key_update().ok();
                self.stats.misc.key_update_count = self.keys.key_update_count();
            }

            emit(&datagram[..len], remote);
        }

        // a confirmed path sends its upward MTU probe as its own datagram
        if self.state.connected && matches!(self.close, CloseStage::Open) {
            if let Some(size) = self.paths.active().mtu_discovery.probe_size() {
                if (size as usize) <= datagram.len() {
                    let dest_cid: SmallVec<[u8; 20]> = match self.cids.active_dest_cid() {
                        Some(dest) => SmallVec::from_slice(dest.id.as_bytes()),
                        None => SmallVec::new(),
                    };
                    let source_cid: SmallVec<[u8; 20]> = self
                        .cids
                        .source_cids()
                        .iter()
                        .find(|cid| !cid.retired)
                        .map(|cid| SmallVec::from_slice(cid.id.as_bytes()))
                        .unwrap_or_default();
                    let token: SmallVec<[u8; 64]> = SmallVec::from_slice(&self.token);

                    if !dest_cid.is_empty() {
                        let probe = {
                            let mut context = transmission::Context {
                                settings: &self.settings,
                                local: self.local,
                                now,
                                version: self.version,
                                dest_cid: &dest_cid,
                                source_cid: &source_cid,
                                token: &token,
                                keys: &mut self.keys,
                                spaces: &mut self.spaces,
                                crypto: &mut self.crypto,
                                streams: None,
                                cids: &mut self.cids,
                                path: self.paths.active_mut(),
                                flags: &mut self.flags,
                                datagrams: &mut self.pending_datagrams,
                                send_allowance: 0,
                                handshake_complete: true,
                                total_bytes_sent: self.total_bytes_sent,
                            };
                            transmission::build_mtu_probe(&mut context, size, &mut datagram)?
                        };

                        if let Some(packet) = probe {
                            let sent_bytes = packet.sent_bytes as usize;
                            self.total_bytes_sent += sent_bytes as u64;
                            self.stats.send.total_bytes += sent_bytes as u64;
                            self.stats.send.total_packets += 1;
                            if packet.ack_eliciting {
                                self.stats.send.retransmittable_packets += 1;
                            }
                            let path = self.paths.active_mut();
                            path.on_bytes_sent(sent_bytes, now);
                            path.mtu_discovery.on_probe_sent();
                            self.spaces[packet.space.as_index()].sent_packets.push(packet);
                            emit(&datagram[..sent_bytes], remote);
                        }
                    }
                }
            }
        }

        // the ideal send buffer tracks twice the deepest in-flight point
        if self.settings.send_buffering_enabled {
            let target = (2 * self.paths.active().cc.get_bytes_in_flight_max() as u64)
                .max(self.settings.ideal_send_buffer_size)
                .min(crate::config::MAX_IDEAL_SEND_BUFFER_SIZE);
            if target != self.ideal_send_buffer {
                self.ideal_send_buffer = target;
                self.streams.on_ideal_send_buffer_changed(target);
            }
        }

        self.send_pending = false;
        Ok(())
    }
}

/// Distinguishes recoverable per-packet drops from connection-fatal errors
enum PacketDrop {
    Ignored,
    Fatal(Error),
}

/// Owned header facts extracted before mutation begins
struct PacketMeta {
    packet_type: packet::Type,
    header_len: usize,
    packet_len: usize,
    source_cid: SmallVec<[u8; 20]>,
    retry_token: SmallVec<[u8; 64]>,
    supported_versions: SmallVec<[u32; 4]>,
}

impl PacketMeta {
    fn from_packet(packet: &packet::Packet<'_>) -> Self {
        use packet::Packet::*;
        match packet {
            VersionNegotiation(vn) => Self {
                packet_type: quiver_core::packet::Type::VersionNegotiation,
                header_len: 0,
                packet_len: 0,
                source_cid: SmallVec::from_slice(vn.source_cid),
                retry_token: SmallVec::new(),
                supported_versions: vn.supported_versions().collect(),
            },
            Initial(initial) => Self {
                packet_type: quiver_core::packet::Type::Initial,
                header_len: initial.header_len,
                packet_len: initial.packet_len(),
                source_cid: SmallVec::from_slice(initial.source_cid),
                retry_token: SmallVec::from_slice(initial.token),
                supported_versions: SmallVec::new(),
            },
            ZeroRtt(zero_rtt) => Self {
                packet_type: quiver_core::packet::Type::ZeroRtt,
                header_len: zero_rtt.header_len,
                packet_len: zero_rtt.packet_len(),
                source_cid: SmallVec::from_slice(zero_rtt.source_cid),
                retry_token: SmallVec::new(),
                supported_versions: SmallVec::new(),
            },
            Handshake(handshake) => Self {
                packet_type: quiver_core::packet::Type::Handshake,
                header_len: handshake.header_len,
                packet_len: handshake.packet_len(),
                source_cid: SmallVec::from_slice(handshake.source_cid),
                retry_token: SmallVec::new(),
                supported_versions: SmallVec::new(),
            },
            Retry(retry) => Self {
                packet_type: quiver_core::packet::Type::Retry,
                header_len: 0,
                packet_len: 0,
                source_cid: SmallVec::from_slice(retry.source_cid),
                retry_token: SmallVec::from_slice(retry.retry_token),
                supported_versions: SmallVec::new(),
            },
            Short(short) => Self {
                packet_type: quiver_core::packet::Type::OneRtt,
                header_len: short.header_len,
                packet_len: short.header_len + short.payload.len(),
                source_cid: SmallVec::new(),
                retry_token: SmallVec::new(),
                supported_versions: SmallVec::new(),
            },
        }
    }
}

/// The engine-side TLS context: installs keys, stores peer parameters,
/// and moves crypto-stream bytes in both directions
struct TlsContext<'a, S: tls::Session> {
    connection: &'a mut Connection<S>,
    now: Timestamp,
}

impl<'a, S: tls::Session> tls::Context for TlsContext<'a, S> {
    fn on_handshake_keys(&mut self, keys: quiver_core::crypto::KeyPair) -> Result<(), Error> {
        let connection = &mut *self.connection;
        connection.keys.install(EncryptionLevel::Handshake, keys);

        //= https://www.rfc-editor.org/rfc/rfc9001#section-4.9.1
        //# a client MUST discard Initial keys when it first sends a
        //# Handshake packet
        if connection.local.is_client() {
            connection.discard_keys(EncryptionLevel::Initial);
            connection.stats.timing.initial_flight_end =
                Some(self.now.saturating_duration_since(connection.epoch));
        }
        Ok(())
    }

    fn on_zero_rtt_keys(&mut self, keys: quiver_core::crypto::KeyPair) -> Result<(), Error> {
        self.connection.keys.install(EncryptionLevel::ZeroRtt, keys);
        Ok(())
    }

    fn on_one_rtt_keys(&mut self, keys: quiver_core::crypto::KeyPair) -> Result<(), Error> {
        let connection = &mut *self.connection;
        connection.keys.install(EncryptionLevel::OneRtt, keys);
        if connection.local.is_client() {
            // queued application data may flush now
            connection.discard_keys(EncryptionLevel::ZeroRtt);
        }
        connection.send_pending = true;
        Ok(())
    }

    fn on_transport_parameters(&mut self, encoded: &[u8]) -> Result<(), Error> {
        let params = TransportParameters::decode(encoded)?;
        let connection = &mut *self.connection;

        connection.streams.on_peer_parameters(&params);
        connection
            .paths
            .active_mut()
            .rtt
            .on_max_ack_delay(core::time::Duration::from_millis(
                params.max_ack_delay_ms.as_u64(),
            ));
        connection.peer_params = Some(params);
        Ok(())
    }

    fn on_server_name(&mut self, _name: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    fn on_application_protocol(&mut self, _protocol: bytes::Bytes) -> Result<(), Error> {
        Ok(())
    }

    fn on_handshake_complete(&mut self) -> Result<(), Error> {
        // the session's process() result also reports completion; state
        // moves there so both paths converge
        Ok(())
    }

    fn on_session_ticket(&mut self, _ticket: &[u8]) -> Result<(), Error> {
        self.connection
            .events
            .push_back(ConnectionEvent::ResumptionTicketReceived);
        Ok(())
    }

    fn receive_initial(&mut self, max_len: Option<usize>) -> Option<bytes::Bytes> {
        if self.connection.read_level != EncryptionLevel::Initial {
            return None;
        }
        self.connection.crypto.read_pending(max_len)
    }

    fn receive_handshake(&mut self, max_len: Option<usize>) -> Option<bytes::Bytes> {
        if self.connection.read_level != EncryptionLevel::Handshake {
            return None;
        }
        self.connection.crypto.read_pending(max_len)
    }

    fn receive_application(&mut self, max_len: Option<usize>) -> Option<bytes::Bytes> {
        if self.connection.read_level != EncryptionLevel::OneRtt {
            return None;
        }
        self.connection.crypto.read_pending(max_len)
    }

    fn can_send_initial(&self) -> bool {
        true
    }

    fn send_initial(&mut self, transmission: bytes::Bytes) {
        self.connection.crypto.write_initial_data(&transmission);
        self.connection.send_pending = true;
    }

    fn can_send_handshake(&self) -> bool {
        self.connection.keys.has_keys(EncryptionLevel::Handshake)
    }

    fn send_handshake(&mut self, transmission: bytes::Bytes) {
        self.connection.crypto.write_handshake_data(&transmission);
        self.connection.send_pending = true;
    }

    fn can_send_application(&self) -> bool {
        self.connection.keys.has_keys(EncryptionLevel::OneRtt)
    }

    fn send_application(&mut self, transmission: bytes::Bytes) {
        self.connection.crypto.write_one_rtt_data(&transmission);
        self.connection.send_pending = true;
    }
}
