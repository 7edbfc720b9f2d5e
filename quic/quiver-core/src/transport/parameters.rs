// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport parameter codec.
//!
//! The extension body is a `u16` length-prefixed list of
//! `(id: u16, length: u16, value)` entries; integer-valued parameters carry
//! a varint, connection IDs and tokens raw bytes. Values are range-checked
//! on receive, duplicate known ids abort the connection, and reserved ids of
//! the form `31·N + 27` are ignored.

use crate::{connection::id, transport::Error, varint::VarInt};
use s2n_codec::{DecoderBuffer, Encoder, EncoderValue};

pub const ORIGINAL_DESTINATION_CONNECTION_ID: u16 = 0;
pub const IDLE_TIMEOUT: u16 = 1;
pub const STATELESS_RESET_TOKEN: u16 = 2;
pub const MAX_UDP_PAYLOAD_SIZE: u16 = 3;
pub const INITIAL_MAX_DATA: u16 = 4;
pub const INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u16 = 5;
pub const INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u16 = 6;
pub const INITIAL_MAX_STREAM_DATA_UNI: u16 = 7;
pub const INITIAL_MAX_STREAMS_BIDI: u16 = 8;
pub const INITIAL_MAX_STREAMS_UNI: u16 = 9;
pub const ACK_DELAY_EXPONENT: u16 = 10;
pub const MAX_ACK_DELAY: u16 = 11;
pub const DISABLE_ACTIVE_MIGRATION: u16 = 12;
pub const PREFERRED_ADDRESS: u16 = 13;
pub const ACTIVE_CONNECTION_ID_LIMIT: u16 = 14;

/// A private parameter id used to exercise oversized parameter lists in
/// tests; the value is opaque and ignored on receive
pub const TEST_PARAMETER: u16 = 77;

/// Smallest permitted max_udp_payload_size
pub const MIN_MAX_UDP_PAYLOAD_SIZE: u64 = 1200;
/// Largest permitted max_udp_payload_size
pub const MAX_MAX_UDP_PAYLOAD_SIZE: u64 = 65527;
/// Largest permitted ack_delay_exponent
pub const MAX_ACK_DELAY_EXPONENT: u64 = 20;
/// max_ack_delay must fit 14 bits of milliseconds
pub const MAX_MAX_ACK_DELAY: u64 = (1 << 14) - 1;
/// Stream data and stream count limits top out at 2^60-1
pub const MAX_LIMIT_VALUE: u64 = (1 << 60) - 1;

/// True for ids of the form 31·N + 27, which are reserved to exercise
/// ignore-unknown behavior
#[inline]
pub fn is_reserved(id: u16) -> bool {
    id % 31 == 27
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportParameters {
    /// Server only; echoes the client's first destination connection id
    pub original_destination_connection_id: Option<id::PeerId>,
    /// Milliseconds; zero disables the peer-advertised idle timeout
    pub idle_timeout_ms: VarInt,
    pub stateless_reset_token: Option<[u8; id::RESET_TOKEN_LEN]>,
    pub max_udp_payload_size: VarInt,
    pub initial_max_data: VarInt,
    pub initial_max_stream_data_bidi_local: VarInt,
    pub initial_max_stream_data_bidi_remote: VarInt,
    pub initial_max_stream_data_uni: VarInt,
    pub initial_max_streams_bidi: VarInt,
    pub initial_max_streams_uni: VarInt,
    pub ack_delay_exponent: u8,
    /// Milliseconds
    pub max_ack_delay_ms: VarInt,
    pub disable_active_migration: bool,
    pub active_connection_id_limit: VarInt,
    /// When set, a TEST_PARAMETER entry of this many opaque bytes is encoded
    pub test_parameter_len: Option<u16>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            original_destination_connection_id: None,
            idle_timeout_ms: VarInt::ZERO,
            max_udp_payload_size: VarInt::from_u32(MAX_MAX_UDP_PAYLOAD_SIZE as u32),
            stateless_reset_token: None,
            initial_max_data: VarInt::ZERO,
            initial_max_stream_data_bidi_local: VarInt::ZERO,
            initial_max_stream_data_bidi_remote: VarInt::ZERO,
            initial_max_stream_data_uni: VarInt::ZERO,
            initial_max_streams_bidi: VarInt::ZERO,
            initial_max_streams_uni: VarInt::ZERO,
            ack_delay_exponent: 3,
            max_ack_delay_ms: VarInt::from_u8(25),
            disable_active_migration: false,
            active_connection_id_limit: VarInt::from_u8(2),
            test_parameter_len: None,
        }
    }
}

const PARAMETER_ERROR: Error = Error::TRANSPORT_PARAMETER_ERROR;

#[inline]
fn write_header<E: Encoder>(encoder: &mut E, id: u16, len: usize) {
    encoder.encode(&id);
    encoder.encode(&(len as u16));
}

#[inline]
fn write_varint<E: Encoder>(encoder: &mut E, id: u16, value: VarInt) {
    write_header(encoder, id, value.encoding_size());
    encoder.encode(&value);
}

struct Body<'a>(&'a TransportParameters);

impl<'a> EncoderValue for Body<'a> {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        let params = self.0;

        if let Some(cid) = &params.original_destination_connection_id {
            write_header(encoder, ORIGINAL_DESTINATION_CONNECTION_ID, cid.len());
            encoder.write_slice(cid.as_bytes());
        }
        if params.idle_timeout_ms != VarInt::ZERO {
            write_varint(encoder, IDLE_TIMEOUT, params.idle_timeout_ms);
        }
        if let Some(token) = &params.stateless_reset_token {
            write_header(encoder, STATELESS_RESET_TOKEN, token.len());
            encoder.write_slice(token);
        }
        if params.max_udp_payload_size != MAX_MAX_UDP_PAYLOAD_SIZE {
            write_varint(encoder, MAX_UDP_PAYLOAD_SIZE, params.max_udp_payload_size);
        }
        if params.initial_max_data != VarInt::ZERO {
            write_varint(encoder, INITIAL_MAX_DATA, params.initial_max_data);
        }
        if params.initial_max_stream_data_bidi_local != VarInt::ZERO {
            write_varint(
                encoder,
                INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
                params.initial_max_stream_data_bidi_local,
            );
        }
        if params.initial_max_stream_data_bidi_remote != VarInt::ZERO {
            write_varint(
                encoder,
                INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
                params.initial_max_stream_data_bidi_remote,
            );
        }
        if params.initial_max_stream_data_uni != VarInt::ZERO {
            write_varint(
                encoder,
                INITIAL_MAX_STREAM_DATA_UNI,
                params.initial_max_stream_data_uni,
            );
        }
        if params.initial_max_streams_bidi != VarInt::ZERO {
            write_varint(
                encoder,
                INITIAL_MAX_STREAMS_BIDI,
                params.initial_max_streams_bidi,
            );
        }
        if params.initial_max_streams_uni != VarInt::ZERO {
            write_varint(
                encoder,
                INITIAL_MAX_STREAMS_UNI,
                params.initial_max_streams_uni,
            );
        }
        if params.ack_delay_exponent != 3 {
            write_varint(
                encoder,
                ACK_DELAY_EXPONENT,
                VarInt::from_u8(params.ack_delay_exponent),
            );
        }
        if params.max_ack_delay_ms != 25u64 {
            write_varint(encoder, MAX_ACK_DELAY, params.max_ack_delay_ms);
        }
        if params.disable_active_migration {
            write_header(encoder, DISABLE_ACTIVE_MIGRATION, 0);
        }
        if params.active_connection_id_limit != 2u64 {
            write_varint(
                encoder,
                ACTIVE_CONNECTION_ID_LIMIT,
                params.active_connection_id_limit,
            );
        }
        if let Some(len) = params.test_parameter_len {
            write_header(encoder, TEST_PARAMETER, len as usize);
            encoder.write_repeated(len as usize, 0);
        }
    }
}

impl EncoderValue for TransportParameters {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        // the preferred_address parameter is never advertised
        encoder.encode_with_len_prefix::<u16, _>(&Body(self));
    }
}

#[inline]
fn decode_varint_value(value: &[u8]) -> Result<VarInt, Error> {
    let buffer = DecoderBuffer::new(value);
    let (value, remaining) = buffer
        .decode::<VarInt>()
        .map_err(|_| PARAMETER_ERROR.with_reason("malformed varint value"))?;
    remaining
        .ensure_empty()
        .map_err(|_| PARAMETER_ERROR.with_reason("trailing bytes in value"))?;
    Ok(value)
}

#[inline]
fn check_range(value: VarInt, low: u64, high: u64, reason: &'static str) -> Result<VarInt, Error> {
    if (low..=high).contains(&value.as_u64()) {
        Ok(value)
    } else {
        Err(PARAMETER_ERROR.with_reason(reason))
    }
}

impl TransportParameters {
    /// Decodes and validates a transport parameter extension body
    pub fn decode(encoded: &[u8]) -> Result<Self, Error> {
        let buffer = DecoderBuffer::new(encoded);
        let (mut body, remaining) = buffer
            .decode_slice_with_len_prefix::<u16>()
            .map_err(|_| PARAMETER_ERROR.with_reason("malformed parameter list"))?;
        remaining
            .ensure_empty()
            .map_err(|_| PARAMETER_ERROR.with_reason("trailing bytes after parameter list"))?;

        let mut params = Self::default();
        let mut seen = 0u128;

        while !body.is_empty() {
            let (entry_id, rest) = body
                .decode::<u16>()
                .map_err(|_| PARAMETER_ERROR.with_reason("truncated parameter id"))?;
            let (value, rest) = rest
                .decode_slice_with_len_prefix::<u16>()
                .map_err(|_| PARAMETER_ERROR.with_reason("truncated parameter value"))?;
            body = rest;
            let value = value.into_less_safe_slice();

            if is_reserved(entry_id) {
                continue;
            }

            //= https://www.rfc-editor.org/rfc/rfc9000#section-7.4
            //# An endpoint MUST NOT send a parameter more than once in a given
            //# transport parameters extension.  An endpoint SHOULD treat receipt
            //# of duplicate transport parameters as a connection error of type
            //# TRANSPORT_PARAMETER_ERROR.
            if entry_id < 128 {
                let bit = 1u128 << entry_id;
                if seen & bit != 0 {
                    return Err(PARAMETER_ERROR.with_reason("duplicate transport parameter"));
                }
                seen |= bit;
            }

            match entry_id {
                ORIGINAL_DESTINATION_CONNECTION_ID => {
                    let cid = id::PeerId::try_from_bytes(value)
                        .ok_or(PARAMETER_ERROR.with_reason("invalid original dcid"))?;
                    params.original_destination_connection_id = Some(cid);
                }
                IDLE_TIMEOUT => {
                    params.idle_timeout_ms = decode_varint_value(value)?;
                }
                STATELESS_RESET_TOKEN => {
                    let token = value
                        .try_into()
                        .map_err(|_| PARAMETER_ERROR.with_reason("invalid reset token length"))?;
                    params.stateless_reset_token = Some(token);
                }
                MAX_UDP_PAYLOAD_SIZE => {
                    params.max_udp_payload_size = check_range(
                        decode_varint_value(value)?,
                        MIN_MAX_UDP_PAYLOAD_SIZE,
                        MAX_MAX_UDP_PAYLOAD_SIZE,
                        "max_udp_payload_size out of range",
                    )?;
                }
                INITIAL_MAX_DATA => {
                    params.initial_max_data = check_range(
                        decode_varint_value(value)?,
                        0,
                        MAX_LIMIT_VALUE,
                        "initial_max_data out of range",
                    )?;
                }
                INITIAL_MAX_STREAM_DATA_BIDI_LOCAL => {
                    params.initial_max_stream_data_bidi_local = check_range(
                        decode_varint_value(value)?,
                        0,
                        MAX_LIMIT_VALUE,
                        "stream data limit out of range",
                    )?;
                }
                INITIAL_MAX_STREAM_DATA_BIDI_REMOTE => {
                    params.initial_max_stream_data_bidi_remote = check_range(
                        decode_varint_value(value)?,
                        0,
                        MAX_LIMIT_VALUE,
                        "stream data limit out of range",
                    )?;
                }
                INITIAL_MAX_STREAM_DATA_UNI => {
                    params.initial_max_stream_data_uni = check_range(
                        decode_varint_value(value)?,
                        0,
                        MAX_LIMIT_VALUE,
                        "stream data limit out of range",
                    )?;
                }
                INITIAL_MAX_STREAMS_BIDI => {
                    params.initial_max_streams_bidi = check_range(
                        decode_varint_value(value)?,
                        0,
                        MAX_LIMIT_VALUE,
                        "stream limit out of range",
                    )?;
                }
                INITIAL_MAX_STREAMS_UNI => {
                    params.initial_max_streams_uni = check_range(
                        decode_varint_value(value)?,
                        0,
                        MAX_LIMIT_VALUE,
                        "stream limit out of range",
                    )?;
                }
                ACK_DELAY_EXPONENT => {
                    let value = check_range(
                        decode_varint_value(value)?,
                        0,
                        MAX_ACK_DELAY_EXPONENT,
                        "ack_delay_exponent out of range",
                    )?;
                    params.ack_delay_exponent = value.as_u64() as u8;
                }
                MAX_ACK_DELAY => {
                    params.max_ack_delay_ms = check_range(
                        decode_varint_value(value)?,
                        0,
                        MAX_MAX_ACK_DELAY,
                        "max_ack_delay out of range",
                    )?;
                }
                DISABLE_ACTIVE_MIGRATION => {
                    if !value.is_empty() {
                        return Err(
                            PARAMETER_ERROR.with_reason("disable_active_migration carries a value")
                        );
                    }
                    params.disable_active_migration = true;
                }
                PREFERRED_ADDRESS => {
                    // structurally tolerated, never acted upon
                    if value.len() < 41 {
                        return Err(PARAMETER_ERROR.with_reason("malformed preferred_address"));
                    }
                }
                ACTIVE_CONNECTION_ID_LIMIT => {
                    params.active_connection_id_limit = check_range(
                        decode_varint_value(value)?,
                        2,
                        MAX_LIMIT_VALUE,
                        "active_connection_id_limit out of range",
                    )?;
                }
                TEST_PARAMETER => {
                    // opaque; exercised by large-extension tests
                }
                _ => {
                    //= https://www.rfc-editor.org/rfc/rfc9000#section-7.4.2
                    //# An endpoint MUST ignore transport parameters that it does
                    //# not support.
                }
            }
        }

        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s2n_codec::EncoderBuffer;

    fn round_trip(params: &TransportParameters) -> TransportParameters {
        let mut bytes = [0u8; 1024];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut bytes);
            encoder.encode(params);
            encoder.len()
        };
        TransportParameters::decode(&bytes[..len]).unwrap()
    }

    #[test]
    fn defaults_round_trip() {
        let params = TransportParameters::default();
        assert_eq!(round_trip(&params), params);
    }

    #[test]
    fn populated_round_trip() {
        let params = TransportParameters {
            original_destination_connection_id: id::PeerId::try_from_bytes(&[7u8; 8]),
            idle_timeout_ms: VarInt::from_u16(30_000),
            stateless_reset_token: Some([0x5au8; 16]),
            max_udp_payload_size: VarInt::from_u16(1472),
            initial_max_data: VarInt::from_u32(1 << 24),
            initial_max_stream_data_bidi_local: VarInt::from_u16(65535),
            initial_max_stream_data_bidi_remote: VarInt::from_u16(65535),
            initial_max_stream_data_uni: VarInt::from_u16(4096),
            initial_max_streams_bidi: VarInt::from_u8(100),
            initial_max_streams_uni: VarInt::from_u8(3),
            ack_delay_exponent: 8,
            max_ack_delay_ms: VarInt::from_u8(40),
            disable_active_migration: true,
            active_connection_id_limit: VarInt::from_u8(4),
            test_parameter_len: None,
        };
        assert_eq!(round_trip(&params), params);
    }

    #[test]
    fn test_parameter_is_opaque() {
        let params = TransportParameters {
            test_parameter_len: Some(600),
            ..Default::default()
        };
        let decoded = round_trip(&params);
        assert_eq!(decoded.test_parameter_len, None);
    }

    #[test]
    fn duplicates_abort() {
        let mut bytes = [0u8; 64];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut bytes);
            let mut body_bytes = [0u8; 32];
            let body_len = {
                let mut body = EncoderBuffer::new(&mut body_bytes);
                write_varint(&mut body, IDLE_TIMEOUT, VarInt::from_u8(1));
                write_varint(&mut body, IDLE_TIMEOUT, VarInt::from_u8(2));
                body.len()
            };
            encoder.encode(&(body_len as u16));
            encoder.write_slice(&body_bytes[..body_len]);
            encoder.len()
        };

        let error = TransportParameters::decode(&bytes[..len]).unwrap_err();
        assert_eq!(error.code, Error::TRANSPORT_PARAMETER_ERROR.code);
    }

    #[test]
    fn reserved_ids_are_ignored() {
        let mut bytes = [0u8; 64];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut bytes);
            let mut body_bytes = [0u8; 32];
            let body_len = {
                let mut body = EncoderBuffer::new(&mut body_bytes);
                // 58 = 31*1 + 27: reserved, even duplicated
                write_varint(&mut body, 58, VarInt::from_u8(1));
                write_varint(&mut body, 58, VarInt::from_u8(2));
                body.len()
            };
            encoder.encode(&(body_len as u16));
            encoder.write_slice(&body_bytes[..body_len]);
            encoder.len()
        };

        assert!(TransportParameters::decode(&bytes[..len]).is_ok());
    }

    #[test]
    fn out_of_range_values_abort() {
        for (id, value) in [
            (MAX_UDP_PAYLOAD_SIZE, 1199u64),
            (MAX_UDP_PAYLOAD_SIZE, 65528),
            (ACK_DELAY_EXPONENT, 21),
            (MAX_ACK_DELAY, 1 << 14),
            (ACTIVE_CONNECTION_ID_LIMIT, 1),
        ] {
            let mut bytes = [0u8; 64];
            let len = {
                let mut encoder = EncoderBuffer::new(&mut bytes);
                let mut body_bytes = [0u8; 32];
                let body_len = {
                    let mut body = EncoderBuffer::new(&mut body_bytes);
                    write_varint(&mut body, id, VarInt::new(value).unwrap());
                    body.len()
                };
                encoder.encode(&(body_len as u16));
                encoder.write_slice(&body_bytes[..body_len]);
                encoder.len()
            };

            assert!(
                TransportParameters::decode(&bytes[..len]).is_err(),
                "id {id} value {value} should be rejected"
            );
        }
    }
}
