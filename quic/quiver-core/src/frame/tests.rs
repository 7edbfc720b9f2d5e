// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use crate::varint::VarInt;
use s2n_codec::{Encoder, EncoderBuffer, EncoderValue};

fn encode<F: EncoderValue>(frame: &F, bytes: &mut [u8]) -> usize {
    let mut encoder = EncoderBuffer::new(bytes);
    encoder.encode(frame);
    encoder.len()
}

#[test]
fn simple_frames_round_trip() {
    let mut bytes = [0u8; 64];

    macro_rules! check {
        ($frame:expr, $variant:ident) => {{
            let frame = $frame;
            let len = encode(&frame, &mut bytes);
            let (decoded, remaining) = Frame::decode(DecoderBuffer::new(&bytes[..len])).unwrap();
            assert!(remaining.is_empty());
            assert_eq!(decoded, Frame::$variant(frame));
        }};
    }

    check!(Ping, Ping);
    check!(HandshakeDone, HandshakeDone);
    check!(
        ResetStream {
            stream_id: VarInt::from_u8(4),
            application_error_code: VarInt::from_u16(1000),
            final_size: VarInt::from_u32(1 << 20),
        },
        ResetStream
    );
    check!(
        ReliableResetStream {
            stream_id: VarInt::from_u8(4),
            application_error_code: VarInt::from_u8(1),
            final_size: VarInt::from_u16(4096),
            reliable_size: VarInt::from_u16(1024),
        },
        ReliableResetStream
    );
    check!(
        StopSending {
            stream_id: VarInt::from_u8(8),
            application_error_code: VarInt::from_u8(3),
        },
        StopSending
    );
    check!(
        MaxData {
            maximum_data: VarInt::from_u32(1 << 24),
        },
        MaxData
    );
    check!(
        MaxStreamData {
            stream_id: VarInt::from_u8(0),
            maximum_stream_data: VarInt::from_u32(1 << 16),
        },
        MaxStreamData
    );
    check!(
        MaxStreamsBidirectional {
            maximum_streams: VarInt::from_u8(100),
        },
        MaxStreamsBidirectional
    );
    check!(
        MaxStreamsUnidirectional {
            maximum_streams: VarInt::from_u8(3),
        },
        MaxStreamsUnidirectional
    );
    check!(
        DataBlocked {
            data_limit: VarInt::from_u16(512),
        },
        DataBlocked
    );
    check!(
        StreamDataBlocked {
            stream_id: VarInt::from_u8(4),
            stream_data_limit: VarInt::from_u16(2048),
        },
        StreamDataBlocked
    );
    check!(
        StreamsBlockedBidirectional {
            stream_limit: VarInt::from_u8(16),
        },
        StreamsBlockedBidirectional
    );
    check!(
        StreamsBlockedUnidirectional {
            stream_limit: VarInt::from_u8(16),
        },
        StreamsBlockedUnidirectional
    );
    check!(
        RetireConnectionId {
            sequence_number: VarInt::from_u8(2),
        },
        RetireConnectionId
    );
    check!(PathChallenge { data: &[7u8; 8] }, PathChallenge);
    check!(PathResponse { data: &[7u8; 8] }, PathResponse);
    check!(NewToken { token: &[1, 2, 3] }, NewToken);
    check!(
        Datagram {
            is_last_frame: false,
            data: &b"dgram"[..],
        },
        Datagram
    );
}

#[test]
fn unknown_frame_type_rejected() {
    // 0x21 is unassigned
    let bytes = [0x21u8, 0x00];
    assert!(Frame::decode(DecoderBuffer::new(&bytes)).is_err());

    // the two-byte encoding of a known type is still unknown: frame types
    // use the shortest varint form
    let bytes = [0x40u8, 0x01];
    assert!(Frame::decode(DecoderBuffer::new(&bytes)).is_err());
}

#[test]
fn ack_elicitation() {
    let mut bytes = [0u8; 16];

    let len = encode(&Ping, &mut bytes);
    let (frame, _) = Frame::decode(DecoderBuffer::new(&bytes[..len])).unwrap();
    assert!(frame.ack_elicitation().is_ack_eliciting());
    assert!(frame.is_congestion_controlled());

    let len = encode(&Padding { length: 3 }, &mut bytes);
    let (frame, _) = Frame::decode(DecoderBuffer::new(&bytes[..len])).unwrap();
    assert!(!frame.ack_elicitation().is_ack_eliciting());
    assert!(frame.is_congestion_controlled());

    let close = ConnectionClose {
        error_code: VarInt::ZERO,
        frame_type: Some(VarInt::ZERO),
        reason: None,
    };
    let len = encode(&close, &mut bytes);
    let (frame, _) = Frame::decode(DecoderBuffer::new(&bytes[..len])).unwrap();
    assert!(!frame.ack_elicitation().is_ack_eliciting());
    assert!(!frame.is_congestion_controlled());
}
