// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Pre-TLS ClientHello inspection.
//!
//! The listener routes an incoming connection by SNI and ALPN before the
//! message is handed to the TLS library proper, so the engine carries a
//! minimal structural parser for exactly those two extensions.

use s2n_codec::{decoder_invariant, DecoderBuffer, DecoderError};

/// TLS handshake message type for ClientHello
const CLIENT_HELLO: u8 = 1;

/// server_name extension id
const SNI_EXTENSION: u16 = 0;
/// application_layer_protocol_negotiation extension id
const ALPN_EXTENSION: u16 = 16;

/// host_name entry type within the server_name extension
const SNI_HOST_NAME: u8 = 0;

/// The routing-relevant contents of a ClientHello
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientHello<'a> {
    /// The host name from the server_name extension, if present
    pub server_name: Option<&'a [u8]>,
    /// The raw ALPN protocol list (length-prefixed entries), if present
    alpn_list: Option<&'a [u8]>,
}

impl<'a> ClientHello<'a> {
    /// Iterates over the offered ALPN protocols
    pub fn alpn_protocols(&self) -> AlpnIter<'a> {
        AlpnIter {
            buffer: self.alpn_list.unwrap_or(&[]),
        }
    }

    /// True if any offered protocol matches `protocol`
    pub fn offers_protocol(&self, protocol: &[u8]) -> bool {
        self.alpn_protocols().any(|offered| offered == protocol)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AlpnIter<'a> {
    buffer: &'a [u8],
}

impl<'a> Iterator for AlpnIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let (len, rest) = self.buffer.split_first()?;
        let len = *len as usize;
        if rest.len() < len {
            self.buffer = &[];
            return None;
        }
        let (protocol, rest) = rest.split_at(len);
        self.buffer = rest;
        Some(protocol)
    }
}

/// Parses the SNI and ALPN extensions out of a ClientHello handshake
/// message.
///
/// `payload` starts at the handshake header (the first decrypted byte of the
/// Initial crypto stream). Returns `Ok(None)` if the message is not yet
/// complete.
pub fn parse_client_hello(payload: &[u8]) -> Result<Option<ClientHello>, DecoderError> {
    let buffer = DecoderBuffer::new(payload);

    // HandshakeHeader: msg_type(1) + length(24)
    if buffer.len() < 4 {
        return Ok(None);
    }
    let (msg_type, buffer) = buffer.decode::<u8>()?;
    decoder_invariant!(msg_type == CLIENT_HELLO, "not a ClientHello");

    let mut length = 0usize;
    let (len_bytes, buffer) = buffer.decode_slice(3)?;
    for byte in len_bytes.into_less_safe_slice() {
        length = (length << 8) | *byte as usize;
    }
    if buffer.len() < length {
        // the message spans multiple CRYPTO frames; wait for the rest
        return Ok(None);
    }
    let (buffer, _) = buffer.decode_slice(length)?;

    // legacy_version(2) + random(32)
    let buffer = buffer.skip(2 + 32)?;
    // legacy_session_id
    let buffer = buffer.skip_with_len_prefix::<u8>()?;
    // cipher_suites
    let buffer = buffer.skip_with_len_prefix::<u16>()?;
    // legacy_compression_methods
    let buffer = buffer.skip_with_len_prefix::<u8>()?;

    let mut hello = ClientHello::default();

    if buffer.is_empty() {
        // extensions are technically optional
        return Ok(Some(hello));
    }

    let (mut extensions, _) = buffer.decode_slice_with_len_prefix::<u16>()?;

    while !extensions.is_empty() {
        let (extension_type, rest) = extensions.decode::<u16>()?;
        let (extension, rest) = rest.decode_slice_with_len_prefix::<u16>()?;
        extensions = rest;

        match extension_type {
            SNI_EXTENSION => {
                //= https://www.rfc-editor.org/rfc/rfc6066#section-3
                //# struct {
                //#     ServerName server_name_list<1..2^16-1>
                //# } ServerNameList;
                let (mut list, _) = extension.decode_slice_with_len_prefix::<u16>()?;
                while !list.is_empty() {
                    let (name_type, rest) = list.decode::<u8>()?;
                    let (name, rest) = rest.decode_slice_with_len_prefix::<u16>()?;
                    list = rest;
                    if name_type == SNI_HOST_NAME {
                        hello.server_name = Some(name.into_less_safe_slice());
                        break;
                    }
                }
            }
            ALPN_EXTENSION => {
                //= https://www.rfc-editor.org/rfc/rfc7301#section-3.1
                //# ProtocolNameList protocol_name_list<2..2^16-1>
                let (list, _) = extension.decode_slice_with_len_prefix::<u16>()?;
                hello.alpn_list = Some(list.into_less_safe_slice());
            }
            _ => {}
        }
    }

    Ok(Some(hello))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn build_hello(sni: Option<&[u8]>, alpn: &[&[u8]]) -> Vec<u8> {
        let mut extensions = Vec::new();

        if let Some(name) = sni {
            let mut body = Vec::new();
            let list_len = 1 + 2 + name.len();
            body.extend_from_slice(&(list_len as u16).to_be_bytes());
            body.push(SNI_HOST_NAME);
            body.extend_from_slice(&(name.len() as u16).to_be_bytes());
            body.extend_from_slice(name);

            extensions.extend_from_slice(&SNI_EXTENSION.to_be_bytes());
            extensions.extend_from_slice(&(body.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&body);
        }

        if !alpn.is_empty() {
            let mut list = Vec::new();
            for protocol in alpn {
                list.push(protocol.len() as u8);
                list.extend_from_slice(protocol);
            }
            let mut body = Vec::new();
            body.extend_from_slice(&(list.len() as u16).to_be_bytes());
            body.extend_from_slice(&list);

            extensions.extend_from_slice(&ALPN_EXTENSION.to_be_bytes());
            extensions.extend_from_slice(&(body.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&body);
        }

        let mut hello_body = Vec::new();
        hello_body.extend_from_slice(&[0x03, 0x03]); // legacy_version
        hello_body.extend_from_slice(&[0u8; 32]); // random
        hello_body.push(0); // legacy_session_id
        hello_body.extend_from_slice(&2u16.to_be_bytes()); // cipher_suites
        hello_body.extend_from_slice(&[0x13, 0x01]);
        hello_body.push(1); // legacy_compression_methods
        hello_body.push(0);
        hello_body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        hello_body.extend_from_slice(&extensions);

        let mut message = Vec::new();
        message.push(CLIENT_HELLO);
        message.extend_from_slice(&(hello_body.len() as u32).to_be_bytes()[1..]);
        message.extend_from_slice(&hello_body);
        message
    }

    #[test]
    fn extracts_sni_and_alpn() {
        let message = build_hello(Some(b"example.com"), &[b"h3", b"hq-interop"]);
        let hello = parse_client_hello(&message).unwrap().unwrap();

        assert_eq!(hello.server_name, Some(&b"example.com"[..]));
        let protocols: Vec<_> = hello.alpn_protocols().collect();
        assert_eq!(protocols, [&b"h3"[..], &b"hq-interop"[..]]);
        assert!(hello.offers_protocol(b"h3"));
        assert!(!hello.offers_protocol(b"h2"));
    }

    #[test]
    fn partial_message_waits() {
        let message = build_hello(Some(b"example.com"), &[b"h3"]);
        assert_eq!(parse_client_hello(&message[..3]).unwrap(), None);
        assert_eq!(parse_client_hello(&message[..20]).unwrap(), None);
    }

    #[test]
    fn non_client_hello_rejected() {
        let mut message = build_hello(None, &[]);
        message[0] = 2; // ServerHello
        assert!(parse_client_hello(&message).is_err());
    }
}
