// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use quiver_core::frame::Frame;
use s2n_codec::DecoderBuffer;

fn stream_with(initial: &[u8]) -> CryptoStream {
    let mut stream = CryptoStream::new();
    stream.write_initial_data(initial);
    stream
}

/// Drives `write_frames` into a scratch packet and returns the decoded
/// frames along with their metadata
fn write_packet(
    stream: &mut CryptoStream,
    packet_type: quiver_core::packet::Type,
    capacity: usize,
) -> (Vec<(u64, Vec<u8>)>, SmallVec<[CryptoFrameInfo; 4]>) {
    let mut bytes = vec![0u8; capacity];
    let (infos, len) = {
        let mut encoder = EncoderBuffer::new(&mut bytes);
        let infos = stream.write_frames(packet_type, 8, &mut encoder);
        let len = encoder.len();
        (infos, len)
    };

    let mut decoded = Vec::new();
    let mut buffer = DecoderBuffer::new(&bytes[..len]);
    while !buffer.is_empty() {
        let (frame, remaining) = Frame::decode(buffer).unwrap();
        match frame {
            Frame::Crypto(crypto) => {
                decoded.push((crypto.offset.as_u64(), crypto.data.to_vec()));
            }
            other => panic!("unexpected frame {other:?}"),
        }
        buffer = remaining;
    }
    (decoded, infos)
}

#[test]
fn writes_and_tracks_new_data() {
    let mut stream = stream_with(b"client hello bytes");

    assert!(stream.has_pending_data());
    let (frames, infos) = write_packet(&mut stream, quiver_core::packet::Type::Initial, 128);

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].0, 0);
    assert_eq!(frames[0].1, b"client hello bytes");
    assert_eq!(infos[0].offset, 0);
    assert_eq!(infos[0].length, 18);

    assert_eq!(stream.next_send_offset(), 18);
    assert_eq!(stream.max_sent_length(), 18);
    assert!(!stream.has_pending_data());
}

#[test]
fn splits_across_small_packets() {
    let data = [7u8; 100];
    let mut stream = stream_with(&data);

    let (first, _) = write_packet(&mut stream, quiver_core::packet::Type::Initial, 40);
    assert_eq!(first.len(), 1);
    let first_len = first[0].1.len();
    assert!(first_len < 100);

    let (second, _) = write_packet(&mut stream, quiver_core::packet::Type::Initial, 200);
    assert_eq!(second[0].0, first_len as u64);
    assert_eq!(first_len + second[0].1.len(), 100);
}

#[test]
fn level_boundary_clamps_initial_packets() {
    let mut stream = stream_with(b"initial");
    stream.write_handshake_data(b"handshake");

    // an Initial packet may only carry the first seven bytes
    let (frames, _) = write_packet(&mut stream, quiver_core::packet::Type::Initial, 256);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].1, b"initial");
    assert!(stream.has_pending_data());

    // the Handshake packet's frame offsets restart at the level boundary
    let (frames, infos) = write_packet(&mut stream, quiver_core::packet::Type::Handshake, 256);
    assert_eq!(frames[0].0, 0);
    assert_eq!(frames[0].1, b"handshake");
    assert_eq!(infos[0].offset, 7);
}

#[test]
fn ack_advances_and_absorbs_sacks() {
    let mut stream = stream_with(&[1u8; 30]);
    let (_, infos) = write_packet(&mut stream, quiver_core::packet::Type::Initial, 64);
    assert_eq!(infos.len(), 1);

    // ack the middle chunk first: a sparse range forms
    stream.on_ack(CryptoFrameInfo {
        offset: 10,
        length: 10,
    });
    assert_eq!(stream.unacked_offset(), 0);
    assert_eq!(stream.sparse_ack_ranges().interval_len(), 1);

    // acking the head catches up to and absorbs the range
    stream.on_ack(CryptoFrameInfo {
        offset: 0,
        length: 10,
    });
    assert_eq!(stream.unacked_offset(), 20);
    assert!(stream.sparse_ack_ranges().is_empty());

    let outcome = stream.on_ack(CryptoFrameInfo {
        offset: 20,
        length: 10,
    });
    assert_eq!(stream.unacked_offset(), 30);
    assert!(outcome.send_complete);
    assert!(stream.everything_acked());
}

/// Acking the same range twice leaves the send state untouched
#[test]
fn ack_is_idempotent() {
    let mut stream = stream_with(&[2u8; 40]);
    write_packet(&mut stream, quiver_core::packet::Type::Initial, 64);

    stream.on_ack(CryptoFrameInfo {
        offset: 12,
        length: 8,
    });
    let unacked = stream.unacked_offset();
    let next_send = stream.next_send_offset();
    let ranges: Vec<_> = stream.sparse_ack_ranges().iter().collect();

    stream.on_ack(CryptoFrameInfo {
        offset: 12,
        length: 8,
    });
    assert_eq!(stream.unacked_offset(), unacked);
    assert_eq!(stream.next_send_offset(), next_send);
    assert_eq!(stream.sparse_ack_ranges().iter().collect::<Vec<_>>(), ranges);
}

#[test]
fn loss_opens_recovery_window_and_retransmits() {
    let mut stream = stream_with(&[3u8; 50]);
    write_packet(&mut stream, quiver_core::packet::Type::Initial, 128);
    assert!(!stream.has_pending_data());

    assert!(stream.on_loss(CryptoFrameInfo {
        offset: 0,
        length: 50,
    }));
    assert!(stream.has_pending_data());

    // the retransmission covers the lost bytes from the start
    let (frames, _) = write_packet(&mut stream, quiver_core::packet::Type::Initial, 128);
    assert_eq!(frames[0].0, 0);
    assert_eq!(frames[0].1.len(), 50);
    assert!(!stream.has_pending_data());
}

#[test]
fn loss_is_trimmed_by_acks_and_sacks() {
    let mut stream = stream_with(&[4u8; 60]);
    write_packet(&mut stream, quiver_core::packet::Type::Initial, 128);

    // head acked, a sack in the middle
    stream.on_ack(CryptoFrameInfo {
        offset: 0,
        length: 10,
    });
    stream.on_ack(CryptoFrameInfo {
        offset: 30,
        length: 10,
    });

    // fully-acknowledged spans report no retransmission
    assert!(!stream.on_loss(CryptoFrameInfo {
        offset: 0,
        length: 10,
    }));
    assert!(!stream.on_loss(CryptoFrameInfo {
        offset: 32,
        length: 6,
    }));

    // a span overlapping the sack shrinks to the unacked part; the
    // recovery window starts no earlier than the acknowledged frontier
    assert!(stream.on_loss(CryptoFrameInfo {
        offset: 25,
        length: 10,
    }));
    let (frames, _) = write_packet(&mut stream, quiver_core::packet::Type::Initial, 128);
    assert_eq!(frames[0].0, 10);
    assert_eq!(frames[0].1.len(), 20);
}

#[test]
fn retransmission_skips_sack_at_cursor() {
    let mut stream = stream_with(&[5u8; 60]);
    write_packet(&mut stream, quiver_core::packet::Type::Initial, 128);

    stream.on_ack(CryptoFrameInfo {
        offset: 20,
        length: 10,
    });

    // everything else is lost
    stream.on_loss(CryptoFrameInfo {
        offset: 0,
        length: 20,
    });
    stream.on_loss(CryptoFrameInfo {
        offset: 30,
        length: 30,
    });

    // the first frame stops at the hole; the cursor hops over it
    let (frames, _) = write_packet(&mut stream, quiver_core::packet::Type::Initial, 25);
    assert_eq!(frames[0].0, 0);
    assert!(frames[0].1.len() <= 20);

    let (frames, _) = write_packet(&mut stream, quiver_core::packet::Type::Initial, 128);
    let offsets: Vec<u64> = frames.iter().map(|(offset, _)| *offset).collect();
    assert!(!offsets.contains(&20), "retransmitted an acknowledged byte");
}

#[test]
fn recv_reassembles_across_levels() {
    let mut stream = CryptoStream::new();

    // initial level: 10 bytes
    assert!(stream.on_crypto_frame(0, &[1u8; 10]).unwrap());
    let data = stream.read_pending(None).unwrap();
    assert_eq!(data.len(), 10);

    // level transition translates the new level's offsets
    stream.on_read_key_updated();
    assert!(stream.on_crypto_frame(0, &[2u8; 5]).unwrap());
    let data = stream.read_pending(Some(3)).unwrap();
    assert_eq!(&data[..], &[2u8; 3]);
    let data = stream.read_pending(None).unwrap();
    assert_eq!(&data[..], &[2u8; 2]);
}

#[test]
fn recv_overflow_is_fatal() {
    let mut stream = CryptoStream::new();
    let error = stream
        .on_crypto_frame(RECV_WINDOW_INITIAL, &[0u8; 1])
        .unwrap_err();
    assert_eq!(error.code, Error::CRYPTO_BUFFER_EXCEEDED.code);
}

#[test]
fn tls_latch_serializes_calls() {
    let mut stream = CryptoStream::new();

    assert!(stream.begin_tls_call());
    // reentrant attempts queue instead
    assert!(!stream.begin_tls_call());
    assert!(stream.tls_call_pending());

    // the queued data forces one re-entry
    assert!(stream.end_tls_call());
    assert!(stream.begin_tls_call());
    assert!(!stream.end_tls_call());
}
