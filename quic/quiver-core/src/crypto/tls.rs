// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The seam between the transport engine and a TLS 1.3 implementation.
//!
//! The engine owns the crypto-stream bytes; a [`Session`] consumes and
//! produces handshake messages through a [`Context`] and installs packet
//! protection keys as the handshake advances. A `process` call is strictly
//! non-reentrant: the engine guarantees at most one outstanding call per
//! connection, queueing incoming data until the call returns.

use crate::{crypto::KeyPair, transport};
use bytes::Bytes;

/// Transport-relevant products of the TLS handshake
#[derive(Debug)]
pub struct ApplicationParameters<'a> {
    /// The peer's encoded transport parameters extension
    pub transport_parameters: &'a [u8],
}

/// What a [`Session::process`] call achieved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// The handshake needs more peer data (or an async provider callback)
    /// before it can continue
    Pending,
    /// The handshake has completed; no further processing is required
    Complete,
}

/// The engine-side surface a TLS session drives
pub trait Context {
    fn on_handshake_keys(&mut self, keys: KeyPair) -> Result<(), transport::Error>;

    fn on_zero_rtt_keys(&mut self, keys: KeyPair) -> Result<(), transport::Error>;

    fn on_one_rtt_keys(&mut self, keys: KeyPair) -> Result<(), transport::Error>;

    /// The peer's transport parameters extension arrived
    fn on_transport_parameters(&mut self, encoded: &[u8]) -> Result<(), transport::Error>;

    /// The client's SNI arrived (server only)
    fn on_server_name(&mut self, name: &[u8]) -> Result<(), transport::Error>;

    /// ALPN negotiation concluded
    fn on_application_protocol(&mut self, protocol: Bytes) -> Result<(), transport::Error>;

    /// TLS reported handshake completion
    fn on_handshake_complete(&mut self) -> Result<(), transport::Error>;

    /// A session ticket arrived (client only); opaque to the engine
    fn on_session_ticket(&mut self, ticket: &[u8]) -> Result<(), transport::Error>;

    /// Pulls up to `max_len` received crypto-stream bytes at the given level
    fn receive_initial(&mut self, max_len: Option<usize>) -> Option<Bytes>;
    fn receive_handshake(&mut self, max_len: Option<usize>) -> Option<Bytes>;
    fn receive_application(&mut self, max_len: Option<usize>) -> Option<Bytes>;

    fn can_send_initial(&self) -> bool;
    fn send_initial(&mut self, transmission: Bytes);

    fn can_send_handshake(&self) -> bool;
    fn send_handshake(&mut self, transmission: Bytes);

    fn can_send_application(&self) -> bool;
    fn send_application(&mut self, transmission: Bytes);
}

/// An in-progress TLS 1.3 handshake
pub trait Session: Send {
    /// Advances the handshake as far as the available data allows.
    ///
    /// The engine calls this once per quiescent point; incoming crypto data
    /// that arrives while a call is outstanding is delivered on the next
    /// call.
    fn process<C: Context>(&mut self, context: &mut C) -> Result<Progress, transport::Error>;

    /// Processes post-handshake messages (session tickets, key updates)
    fn process_post_handshake<C: Context>(
        &mut self,
        context: &mut C,
    ) -> Result<(), transport::Error>;
}

/// Builds TLS sessions for an endpoint
pub trait Endpoint: 'static + Send {
    type Session: Session;

    fn new_server_session(&mut self, transport_parameters: &[u8]) -> Self::Session;

    fn new_client_session(
        &mut self,
        transport_parameters: &[u8],
        server_name: &str,
    ) -> Self::Session;

    /// The largest AEAD tag any negotiable cipher produces; reserved by the
    /// packet builder
    fn max_tag_length(&self) -> usize;
}
