// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! A deterministic handshake session for tests.
//!
//! The session performs a two-flight exchange shaped like TLS 1.3 --
//! client hello, server hello + finished, client finished -- carrying the
//! transport-parameter extensions verbatim. Packet protection uses real
//! AES-128-GCM keys expanded from fixed secrets, so both endpoints of a
//! test interoperate on the wire without a TLS library.

use bytes::Bytes;
use quiver_core::{crypto::tls, endpoint, transport::Error};
use quiver_crypto::{suite, CipherSuite, SecretPair};
use zeroize::Zeroizing;

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const FINISHED: u8 = 20;

fn fixed_secrets(label: u8) -> SecretPair {
    SecretPair {
        client: Zeroizing::new(vec![0x11 ^ label; 32]),
        server: Zeroizing::new(vec![0x22 ^ label; 32]),
    }
}

fn key_pair(label: u8, local: endpoint::Type) -> quiver_core::crypto::KeyPair {
    suite::key_pair(CipherSuite::Aes128GcmSha256, &fixed_secrets(label), local)
        .expect("fixed secrets expand")
}

fn message(tag: u8, body: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(3 + body.len());
    out.push(tag);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body);
    Bytes::from(out)
}

fn parse_message(data: &[u8]) -> Option<(u8, &[u8])> {
    if data.len() < 3 {
        return None;
    }
    let tag = data[0];
    let len = u16::from_be_bytes([data[1], data[2]]) as usize;
    if data.len() < 3 + len {
        return None;
    }
    Some((tag, &data[3..3 + len]))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Start,
    WaitingForHello,
    WaitingForFinished,
    Complete,
}

/// The deterministic session
#[derive(Debug)]
pub struct Session {
    local: endpoint::Type,
    phase: Phase,
    transport_parameters: Vec<u8>,
    buffered: Vec<u8>,
}

impl Session {
    fn advance_client<C: tls::Context>(&mut self, context: &mut C) -> Result<tls::Progress, Error> {
        loop {
            match self.phase {
                Phase::Start => {
                    context.send_initial(message(CLIENT_HELLO, &self.transport_parameters));
                    self.phase = Phase::WaitingForHello;
                }
                Phase::WaitingForHello => {
                    if let Some(data) = context.receive_initial(None) {
                        self.buffered.extend_from_slice(&data);
                    }
                    let Some((tag, body)) = parse_message(&self.buffered) else {
                        return Ok(tls::Progress::Pending);
                    };
                    if tag != SERVER_HELLO {
                        return Err(Error::crypto_error(10).with_reason("expected server hello"));
                    }
                    context.on_transport_parameters(body)?;
                    let consumed = 3 + body.len();
                    self.buffered.drain(..consumed);

                    context.on_handshake_keys(key_pair(1, self.local))?;
                    self.phase = Phase::WaitingForFinished;
                }
                Phase::WaitingForFinished => {
                    if let Some(data) = context.receive_handshake(None) {
                        self.buffered.extend_from_slice(&data);
                    }
                    let Some((tag, body)) = parse_message(&self.buffered) else {
                        return Ok(tls::Progress::Pending);
                    };
                    if tag != FINISHED {
                        return Err(Error::crypto_error(10).with_reason("expected finished"));
                    }
                    let consumed = 3 + body.len();
                    self.buffered.drain(..consumed);

                    context.send_handshake(message(FINISHED, b""));
                    context.on_one_rtt_keys(key_pair(2, self.local))?;
                    context.on_handshake_complete()?;
                    self.phase = Phase::Complete;
                    return Ok(tls::Progress::Complete);
                }
                Phase::Complete => return Ok(tls::Progress::Complete),
            }
        }
    }

    fn advance_server<C: tls::Context>(&mut self, context: &mut C) -> Result<tls::Progress, Error> {
        loop {
            match self.phase {
                Phase::Start | Phase::WaitingForHello => {
                    self.phase = Phase::WaitingForHello;
                    if let Some(data) = context.receive_initial(None) {
                        self.buffered.extend_from_slice(&data);
                    }
                    let Some((tag, body)) = parse_message(&self.buffered) else {
                        return Ok(tls::Progress::Pending);
                    };
                    if tag != CLIENT_HELLO {
                        return Err(Error::crypto_error(10).with_reason("expected client hello"));
                    }
                    context.on_server_name(b"")?;
                    context.on_transport_parameters(body)?;
                    let consumed = 3 + body.len();
                    self.buffered.drain(..consumed);

                    context.send_initial(message(SERVER_HELLO, &self.transport_parameters));
                    context.on_handshake_keys(key_pair(1, self.local))?;
                    context.send_handshake(message(FINISHED, b""));
                    context.on_one_rtt_keys(key_pair(2, self.local))?;
                    self.phase = Phase::WaitingForFinished;
                }
                Phase::WaitingForFinished => {
                    if let Some(data) = context.receive_handshake(None) {
                        self.buffered.extend_from_slice(&data);
                    }
                    let Some((tag, body)) = parse_message(&self.buffered) else {
                        return Ok(tls::Progress::Pending);
                    };
                    if tag != FINISHED {
                        return Err(Error::crypto_error(10).with_reason("expected finished"));
                    }
                    let consumed = 3 + body.len();
                    self.buffered.drain(..consumed);

                    context.on_handshake_complete()?;
                    self.phase = Phase::Complete;
                    return Ok(tls::Progress::Complete);
                }
                Phase::Complete => return Ok(tls::Progress::Complete),
            }
        }
    }
}

impl tls::Session for Session {
    fn process<C: tls::Context>(&mut self, context: &mut C) -> Result<tls::Progress, Error> {
        match self.local {
            endpoint::Type::Client => self.advance_client(context),
            endpoint::Type::Server => self.advance_server(context),
        }
    }

    fn process_post_handshake<C: tls::Context>(&mut self, _context: &mut C) -> Result<(), Error> {
        Ok(())
    }
}

/// Builds deterministic sessions
#[derive(Debug, Default)]
pub struct Endpoint;

impl tls::Endpoint for Endpoint {
    type Session = Session;

    fn new_server_session(&mut self, transport_parameters: &[u8]) -> Session {
        Session {
            local: endpoint::Type::Server,
            phase: Phase::Start,
            transport_parameters: transport_parameters.to_vec(),
            buffered: Vec::new(),
        }
    }

    fn new_client_session(&mut self, transport_parameters: &[u8], _server_name: &str) -> Session {
        Session {
            local: endpoint::Type::Client,
            phase: Phase::Start,
            transport_parameters: transport_parameters.to_vec(),
            buffered: Vec::new(),
        }
    }

    fn max_tag_length(&self) -> usize {
        16
    }
}
