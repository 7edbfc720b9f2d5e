// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use alloc::vec::Vec;

fn build_initial(token: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.push(0xc0); // long, fixed, type=initial, pn_len=1
    bytes.extend_from_slice(&QUIC_VERSION_1.to_be_bytes());
    bytes.push(8);
    bytes.extend_from_slice(&[1u8; 8]); // dcid
    bytes.push(4);
    bytes.extend_from_slice(&[2u8; 4]); // scid
    bytes.push(token.len() as u8); // token length (1-byte varint)
    bytes.extend_from_slice(token);
    assert!(payload.len() < 64);
    bytes.push(payload.len() as u8); // length (1-byte varint)
    bytes.extend_from_slice(payload);
    bytes
}

#[test]
fn initial_decodes_with_offsets() {
    let payload = [0u8; 24];
    let bytes = build_initial(b"tok", &payload);
    let (packet, remaining) = decode_packet(DecoderBuffer::new(&bytes), 8).unwrap();
    assert!(remaining.is_empty());

    match packet {
        Packet::Initial(initial) => {
            assert_eq!(initial.version, QUIC_VERSION_1);
            assert_eq!(initial.destination_cid, &[1u8; 8][..]);
            assert_eq!(initial.source_cid, &[2u8; 4][..]);
            assert_eq!(initial.token, b"tok");
            assert_eq!(initial.payload.len(), 24);
            // 1 + 4 + (1+8) + (1+4) + (1+3) + 1 bytes precede the payload
            assert_eq!(initial.header_len, 24);
            assert_eq!(initial.packet_len(), bytes.len());
        }
        other => panic!("unexpected packet {other:?}"),
    }
}

#[test]
fn coalesced_packets_split() {
    let payload = [0u8; 16];
    let mut bytes = build_initial(&[], &payload);
    let first_len = bytes.len();
    bytes.extend_from_slice(&build_initial(&[], &payload));

    let (packet, remaining) = decode_packet(DecoderBuffer::new(&bytes), 8).unwrap();
    match packet {
        Packet::Initial(initial) => assert_eq!(initial.packet_len(), first_len),
        other => panic!("unexpected packet {other:?}"),
    }
    assert_eq!(remaining.len(), first_len);

    let (packet, remaining) = decode_packet(remaining, 8).unwrap();
    assert!(matches!(packet, Packet::Initial(_)));
    assert!(remaining.is_empty());
}

#[test]
fn short_header_consumes_datagram() {
    let mut bytes = alloc::vec![0x41u8];
    bytes.extend_from_slice(&[9u8; 8]); // dcid
    bytes.extend_from_slice(&[0xddu8; 20]); // pn + ciphertext

    let (packet, remaining) = decode_packet(DecoderBuffer::new(&bytes), 8).unwrap();
    assert!(remaining.is_empty());
    match packet {
        Packet::Short(short) => {
            assert_eq!(short.destination_cid, &[9u8; 8][..]);
            assert_eq!(short.header_len, 9);
            assert_eq!(short.payload.len(), 20);
        }
        other => panic!("unexpected packet {other:?}"),
    }
}

#[test]
fn version_negotiation_versions() {
    let mut bytes = alloc::vec![0x80u8];
    bytes.extend_from_slice(&0u32.to_be_bytes());
    bytes.push(0); // dcid
    bytes.push(0); // scid
    bytes.extend_from_slice(&QUIC_VERSION_1.to_be_bytes());
    bytes.extend_from_slice(&0x0a0a_0a0au32.to_be_bytes());

    let (packet, _) = decode_packet(DecoderBuffer::new(&bytes), 8).unwrap();
    match packet {
        Packet::VersionNegotiation(vn) => {
            let versions: Vec<_> = vn.supported_versions().collect();
            assert_eq!(versions, [QUIC_VERSION_1, 0x0a0a_0a0a]);
        }
        other => panic!("unexpected packet {other:?}"),
    }
}

#[test]
fn retry_splits_tag() {
    let mut bytes = alloc::vec![0xf0u8];
    bytes.extend_from_slice(&QUIC_VERSION_1.to_be_bytes());
    bytes.push(0); // dcid
    bytes.push(8);
    bytes.extend_from_slice(&[3u8; 8]); // scid
    bytes.extend_from_slice(b"retry-token");
    bytes.extend_from_slice(&[0xaau8; 16]);

    let (packet, _) = decode_packet(DecoderBuffer::new(&bytes), 8).unwrap();
    match packet {
        Packet::Retry(retry) => {
            assert_eq!(retry.retry_token, b"retry-token");
            assert_eq!(retry.integrity_tag, &[0xaau8; 16]);
        }
        other => panic!("unexpected packet {other:?}"),
    }
}

#[test]
fn first_byte_bits() {
    let pn = TruncatedPacketNumber::new(0, 2);
    assert_eq!(long_first_byte(Type::Initial, pn), 0xc1);
    assert_eq!(long_first_byte(Type::Handshake, pn), 0xe1);
    assert_eq!(short_first_byte(true, false, pn), 0x45);
}
