// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The binding: one UDP endpoint shared by listeners and connections.
//!
//! Incoming datagrams demultiplex by destination connection ID (long
//! headers always, short headers via the fixed local id length), falling
//! back to the 4-tuple for address-stable flows. Unroutable packets
//! produce stateless work: version negotiation for unknown versions, Retry
//! when a listener demands address validation, and stateless resets for
//! short headers aimed at forgotten ids.

use crate::config::LOCAL_CID_LEN;
use hashbrown::HashMap;
use quiver_core::{
    connection::id::{LocalId, RESET_TOKEN_LEN},
    crypto::client_hello,
    packet::{self, Packet},
    random,
};
use siphasher::sip::SipHasher13;
use smallvec::SmallVec;
use std::hash::Hasher;
use std::net::SocketAddr;

/// Where a datagram should go
#[derive(Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Hand the datagram to this connection
    Connection(u64),
    /// A new inbound connection attempt: the listener accepted it
    Accept(AcceptInfo),
    /// Reply with this stateless datagram
    Stateless(Vec<u8>),
    /// Nothing to do with it
    Drop,
}

/// What a listener needs to create the server connection
#[derive(Debug, PartialEq, Eq)]
pub struct AcceptInfo {
    pub remote_address: SocketAddr,
    pub destination_cid: SmallVec<[u8; 20]>,
    pub source_cid: SmallVec<[u8; 20]>,
    pub token: SmallVec<[u8; 64]>,
}

/// An ALPN-matched acceptor
#[derive(Debug)]
pub struct Listener {
    /// Accepted application protocols, preference-ordered
    pub alpn: Vec<Vec<u8>>,
    /// Require a Retry round trip before accepting
    pub require_retry: bool,
}

/// A keyed hash over connection id bytes, for the demux table and the
/// reset-token derivation
#[derive(Clone, Copy, Debug)]
struct CidKey([u8; 16]);

impl CidKey {
    fn hash(&self, bytes: &[u8]) -> u64 {
        let mut hasher = SipHasher13::new_with_key(&self.0);
        hasher.write(bytes);
        hasher.finish()
    }
}

pub struct Binding {
    pub local_address: SocketAddr,
    /// Demux: hashed source cid -> connection
    cid_table: HashMap<u64, u64>,
    /// Fallback demux for short headers before migration support kicks in
    four_tuple: HashMap<SocketAddr, u64>,
    demux_key: CidKey,
    /// Keys the stateless reset token derivation
    reset_key: CidKey,
    /// Keys retry-token validation
    retry_key: CidKey,
    pub listener: Option<Listener>,
    /// Versions this endpoint accepts
    supported_versions: Vec<u32>,
}

impl Binding {
    pub fn new(local_address: SocketAddr, rng: &mut dyn random::Generator) -> Self {
        let mut demux = [0u8; 16];
        let mut reset = [0u8; 16];
        let mut retry = [0u8; 16];
        rng.public_random_fill(&mut demux);
        rng.public_random_fill(&mut reset);
        rng.public_random_fill(&mut retry);
        Self {
            local_address,
            cid_table: HashMap::new(),
            four_tuple: HashMap::new(),
            demux_key: CidKey(demux),
            reset_key: CidKey(reset),
            retry_key: CidKey(retry),
            listener: None,
            supported_versions: vec![packet::QUIC_VERSION_1],
        }
    }

    /// Registers a source id for a connection; false on collision
    pub fn insert_cid(&mut self, id: &LocalId, connection: u64) -> bool {
        let key = self.demux_key.hash(id.as_bytes());
        if self.cid_table.contains_key(&key) {
            return false;
        }
        self.cid_table.insert(key, connection);
        true
    }

    pub fn remove_cid(&mut self, id: &LocalId) {
        let key = self.demux_key.hash(id.as_bytes());
        self.cid_table.remove(&key);
    }

    pub fn insert_four_tuple(&mut self, remote: SocketAddr, connection: u64) {
        self.four_tuple.insert(remote, connection);
    }

    pub fn remove_four_tuple(&mut self, remote: SocketAddr) {
        self.four_tuple.remove(&remote);
    }

    /// The stateless reset token for one of our ids
    pub fn reset_token(&self, id: &[u8]) -> [u8; RESET_TOKEN_LEN] {
        let mut token = [0u8; RESET_TOKEN_LEN];
        let low = self.reset_key.hash(id);
        let mut salted = [0u8; 21];
        salted[..id.len().min(20)].copy_from_slice(&id[..id.len().min(20)]);
        salted[20] = 0x5a;
        let high = self.reset_key.hash(&salted);
        token[..8].copy_from_slice(&low.to_be_bytes());
        token[8..].copy_from_slice(&high.to_be_bytes());
        token
    }

    /// Routes one incoming datagram
    pub fn dispatch(
        &mut self,
        remote_address: SocketAddr,
        datagram: &[u8],
        rng: &mut dyn random::Generator,
    ) -> Dispatch {
        let buffer = s2n_codec::DecoderBuffer::new(datagram);
        let Ok((packet, _)) = packet::decode_packet(buffer, LOCAL_CID_LEN) else {
            return Dispatch::Drop;
        };

        // known destination id wins outright
        let dcid = packet.destination_cid();
        if let Some(connection) = self.cid_table.get(&self.demux_key.hash(dcid)) {
            return Dispatch::Connection(*connection);
        }
        // 4-tuple fallback covers short headers after an id rotation
        if let Some(connection) = self.four_tuple.get(&remote_address) {
            return Dispatch::Connection(*connection);
        }

        match packet {
            Packet::Initial(initial) => {
                self.dispatch_initial(remote_address, datagram, initial, rng)
            }
            Packet::ZeroRtt(_) | Packet::Handshake(_) => Dispatch::Drop,
            Packet::Retry(_) | Packet::VersionNegotiation(_) => Dispatch::Drop,
            Packet::Short(short) => {
                //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
                //# An endpoint that receives a short header packet that it cannot
                //# route sends a stateless reset
                self.build_stateless_reset(short.destination_cid, rng)
                    .map(Dispatch::Stateless)
                    .unwrap_or(Dispatch::Drop)
            }
        }
    }

    fn dispatch_initial(
        &mut self,
        remote_address: SocketAddr,
        datagram: &[u8],
        initial: packet::Initial<'_>,
        rng: &mut dyn random::Generator,
    ) -> Dispatch {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-14.1
        //# A server MUST discard an Initial packet that is carried in a UDP
        //# datagram with a payload that is smaller than the smallest allowed
        //# maximum datagram size of 1200 bytes.
        if datagram.len() < crate::config::MIN_INITIAL_PACKET_LENGTH {
            return Dispatch::Drop;
        }

        let Some(listener) = self.listener.as_ref() else {
            return Dispatch::Drop;
        };

        if !self.supported_versions.contains(&initial.version) {
            return self
                .build_version_negotiation(initial.destination_cid, initial.source_cid, rng)
                .map(Dispatch::Stateless)
                .unwrap_or(Dispatch::Drop);
        }

        if listener.require_retry && initial.token.is_empty() {
            return self
                .build_retry(remote_address, initial.destination_cid, initial.source_cid, rng)
                .map(Dispatch::Stateless)
                .unwrap_or(Dispatch::Drop);
        }
        if !initial.token.is_empty()
            && !self.validate_retry_token(remote_address, initial.token)
        {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-8.1.3
            //# If a server receives a client Initial that contains an invalid
            //# Retry token...the server SHOULD immediately close the connection
            //# with an INVALID_TOKEN error
            tracing::debug!(%remote_address, "invalid retry token");
            return Dispatch::Drop;
        }

        Dispatch::Accept(AcceptInfo {
            remote_address,
            destination_cid: SmallVec::from_slice(initial.destination_cid),
            source_cid: SmallVec::from_slice(initial.source_cid),
            token: SmallVec::from_slice(initial.token),
        })
    }

    /// Checks a ClientHello's ALPN against the listener before accepting
    pub fn alpn_matches(&self, client_hello_bytes: &[u8]) -> bool {
        let Some(listener) = self.listener.as_ref() else {
            return false;
        };
        match client_hello::parse_client_hello(client_hello_bytes) {
            Ok(Some(hello)) => listener
                .alpn
                .iter()
                .any(|protocol| hello.offers_protocol(protocol)),
            // incomplete or unparseable hellos are the TLS layer's problem
            _ => true,
        }
    }

    // === stateless datagram builders ===

    fn build_version_negotiation(
        &self,
        their_dcid: &[u8],
        their_scid: &[u8],
        rng: &mut dyn random::Generator,
    ) -> Option<Vec<u8>> {
        let mut first = [0u8; 1];
        rng.private_random_fill(&mut first);

        let mut out = Vec::with_capacity(64);
        //= https://www.rfc-editor.org/rfc/rfc9000#section-17.2.1
        //# The value in the Unused field is set to an arbitrary value by the
        //# server.
        out.push(packet::LONG_HEADER_BIT | (first[0] & 0x7f));
        out.extend_from_slice(&0u32.to_be_bytes());
        // the roles swap: their source id becomes the destination
        out.push(their_scid.len() as u8);
        out.extend_from_slice(their_scid);
        out.push(their_dcid.len() as u8);
        out.extend_from_slice(their_dcid);
        for version in &self.supported_versions {
            out.extend_from_slice(&version.to_be_bytes());
        }
        Some(out)
    }

    fn retry_token(&self, remote_address: SocketAddr, odcid: &[u8]) -> SmallVec<[u8; 64]> {
        let mut token = SmallVec::new();
        let mut addr_bytes: SmallVec<[u8; 18]> = SmallVec::new();
        match remote_address.ip() {
            std::net::IpAddr::V4(ip) => addr_bytes.extend_from_slice(&ip.octets()),
            std::net::IpAddr::V6(ip) => addr_bytes.extend_from_slice(&ip.octets()),
        }
        addr_bytes.extend_from_slice(&remote_address.port().to_be_bytes());

        let tag = self.retry_key.hash(&addr_bytes);
        token.extend_from_slice(&tag.to_be_bytes());
        token.push(odcid.len() as u8);
        token.extend_from_slice(odcid);
        token
    }

    fn validate_retry_token(&self, remote_address: SocketAddr, token: &[u8]) -> bool {
        if token.len() < 9 {
            return false;
        }
        let expected = self.retry_token(remote_address, &token[9..]);
        expected.len() == token.len() && expected[..8] == token[..8]
    }

    fn build_retry(
        &self,
        remote_address: SocketAddr,
        their_dcid: &[u8],
        their_scid: &[u8],
        rng: &mut dyn random::Generator,
    ) -> Option<Vec<u8>> {
        // the retry advertises a fresh server-chosen id
        let mut new_scid = [0u8; LOCAL_CID_LEN];
        rng.public_random_fill(&mut new_scid);

        let token = self.retry_token(remote_address, their_dcid);

        let mut out = Vec::with_capacity(128);
        out.push(0xf0); // long header, type retry
        out.extend_from_slice(&packet::QUIC_VERSION_1.to_be_bytes());
        out.push(their_scid.len() as u8);
        out.extend_from_slice(their_scid);
        out.push(new_scid.len() as u8);
        out.extend_from_slice(&new_scid);
        out.extend_from_slice(&token);

        let pseudo = quiver_crypto::retry::pseudo_packet(their_dcid, &out);
        let tag = quiver_crypto::retry::generate_tag(&pseudo);
        out.extend_from_slice(&tag);
        Some(out)
    }

    fn build_stateless_reset(
        &self,
        dcid: &[u8],
        rng: &mut dyn random::Generator,
    ) -> Option<Vec<u8>> {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-10.3
        //# Stateless Reset {
        //#   Fixed Bits (2) = 01,
        //#   Unpredictable Bits (38..),
        //#   Stateless Reset Token (128),
        //# }
        let token = self.reset_token(dcid);

        let mut out = vec![0u8; 25 + RESET_TOKEN_LEN];
        let len = out.len();
        rng.private_random_fill(&mut out[..len - RESET_TOKEN_LEN]);
        out[0] = (out[0] & 0x3f) | packet::FIXED_BIT;
        out[len - RESET_TOKEN_LEN..].copy_from_slice(&token);
        Some(out)
    }
}

#[cfg(test)]
mod tests;
