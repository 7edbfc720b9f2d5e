// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use quiver_core::{
    frame::Stream as StreamFrame,
    time::{Clock, NoopClock},
};

fn peer_params() -> TransportParameters {
    TransportParameters {
        initial_max_data: VarInt::from_u32(1 << 20),
        initial_max_streams_bidi: VarInt::from_u8(8),
        initial_max_streams_uni: VarInt::from_u8(2),
        initial_max_stream_data_bidi_local: VarInt::from_u16(4096),
        initial_max_stream_data_bidi_remote: VarInt::from_u16(8192),
        initial_max_stream_data_uni: VarInt::from_u16(1024),
        ..Default::default()
    }
}

fn manager(local: endpoint::Type) -> StreamManager {
    let settings = Settings {
        peer_bidi_stream_count: 4,
        peer_unidi_stream_count: 1,
        ..Default::default()
    };
    let mut manager = StreamManager::new(local, settings);
    manager.on_peer_parameters(&peer_params());
    manager
}

fn stream_frame(id: u64, offset: u64, data: &[u8], fin: bool) -> StreamFrame<&[u8]> {
    StreamFrame {
        stream_id: VarInt::new(id).unwrap(),
        offset: VarInt::new(offset).unwrap(),
        is_last_frame: false,
        is_fin: fin,
        data,
    }
}

#[test]
fn local_open_respects_peer_grant() {
    let mut manager = manager(endpoint::Type::Client);

    // the peer granted 2 unidirectional streams
    let first = manager.open_local(StreamType::Unidirectional).unwrap();
    assert_eq!(u64::from(first), 2);
    manager.open_local(StreamType::Unidirectional).unwrap();
    assert_eq!(
        manager.open_local(StreamType::Unidirectional),
        Err(OpenError::StreamIdFlowControl)
    );

    // a MAX_STREAMS bump unblocks the next open
    manager.on_max_streams_frame(StreamType::Unidirectional, 3);
    assert!(manager.open_local(StreamType::Unidirectional).is_ok());
}

#[test]
fn peer_streams_open_implicitly_in_order() {
    let now = NoopClock.get_time();
    let mut manager = manager(endpoint::Type::Server);

    // client bidi stream ordinal 2 (id 8) implies ordinals 0 and 1
    manager
        .on_stream_frame(&stream_frame(8, 0, b"hi", false), now)
        .unwrap();

    let opened: Vec<_> = manager
        .drain_events()
        .filter_map(|(_, event)| match event {
            StreamEventOrConn::Connection(ConnectionEvent::PeerStreamStarted { id }) => {
                Some(u64::from(id))
            }
            _ => None,
        })
        .collect();
    assert_eq!(opened, [0, 4, 8]);
}

#[test]
fn peer_stream_limit_is_enforced() {
    let now = NoopClock.get_time();
    let mut manager = manager(endpoint::Type::Server);

    // only 4 client bidi streams are allowed: ordinal 4 (id 16) is out
    let error = manager
        .on_stream_frame(&stream_frame(16, 0, b"x", false), now)
        .unwrap_err();
    assert_eq!(error.code, Error::STREAM_LIMIT_ERROR.code);
}

#[test]
fn send_only_stream_rejects_peer_data() {
    let now = NoopClock.get_time();
    let mut manager = manager(endpoint::Type::Client);

    let id = manager.open_local(StreamType::Unidirectional).unwrap();
    let error = manager
        .on_stream_frame(&stream_frame(id.into(), 0, b"x", false), now)
        .unwrap_err();
    assert_eq!(error.code, Error::STREAM_STATE_ERROR.code);
}

#[test]
fn connection_flow_control_enforced_on_receive() {
    let now = NoopClock.get_time();
    let settings = Settings {
        peer_bidi_stream_count: 4,
        conn_flow_control_window: 10,
        // keep the stream window above the connection window
        stream_recv_window_default: 64,
        ..Default::default()
    };
    let mut manager = StreamManager::new(endpoint::Type::Server, settings);
    manager.on_peer_parameters(&peer_params());

    let error = manager
        .on_stream_frame(&stream_frame(0, 0, &[0u8; 11], false), now)
        .unwrap_err();
    assert_eq!(error.code, Error::FLOW_CONTROL_ERROR.code);
}

#[test]
fn completed_peer_stream_releases_count_slot() {
    let now = NoopClock.get_time();
    let mut manager = manager(endpoint::Type::Server);

    manager
        .on_stream_frame(&stream_frame(2, 0, b"done", true), now)
        .unwrap();

    // the slot is held until the application drains the data
    let id = StreamId::from_varint(VarInt::from_u8(2));
    assert!(manager.stream(id).is_some());

    let mut dest = [0u8; 8];
    let (len, is_fin) = manager
        .read(id, &mut dest, now, core::time::Duration::from_millis(50))
        .unwrap();
    assert_eq!(&dest[..len], b"done");
    assert!(is_fin);

    // client uni stream 2 has no send half on our side; draining completes
    // it and returns the count slot
    assert!(manager.stream(id).is_none());
    assert_eq!(
        manager.max_streams_frame_needed(StreamType::Unidirectional),
        Some(2)
    );
    manager.on_max_streams_frame_sent(StreamType::Unidirectional);
    assert_eq!(
        manager.max_streams_frame_needed(StreamType::Unidirectional),
        None
    );
}

#[test]
fn writes_queue_the_scheduler() {
    let mut manager = manager(endpoint::Type::Client);
    let id = manager.open_local(StreamType::Bidirectional).unwrap();

    assert!(manager.scheduler.is_empty());
    manager.write(id, b"payload").unwrap();
    assert_eq!(manager.scheduler.peek(), Some(id));
}

#[test]
fn reading_reopens_connection_window() {
    let now = NoopClock.get_time();
    let settings = Settings {
        peer_bidi_stream_count: 4,
        conn_flow_control_window: 16,
        stream_recv_window_default: 64,
        ..Default::default()
    };
    let mut manager = StreamManager::new(endpoint::Type::Server, settings);
    manager.on_peer_parameters(&peer_params());

    manager
        .on_stream_frame(&stream_frame(0, 0, &[7u8; 8], false), now)
        .unwrap();

    let id = StreamId::from_varint(VarInt::from_u8(0));
    let mut dest = [0u8; 8];
    manager
        .read(id, &mut dest, now, core::time::Duration::from_millis(50))
        .unwrap();

    // consuming half the window queues a MAX_DATA bump
    assert_eq!(manager.max_data_frame_needed(), Some(8 + 16));
}
