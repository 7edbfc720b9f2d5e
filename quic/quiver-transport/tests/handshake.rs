// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end exercises over an in-memory datagram pipe: handshake
//! completion, application data exchange, loss recovery, and graceful
//! close.

use quiver_core::{
    connection::id::PeerId,
    event::ConnectionEvent,
    stream::StreamType,
    time::{Clock, Timestamp},
    transport::error::ApplicationError,
    varint::VarInt,
};
use quiver_transport::{
    config::Settings,
    connection::Connection,
    random,
    testing,
};
use std::net::SocketAddr;
use std::time::Duration;

struct TestClock {
    now: Timestamp,
}

impl TestClock {
    fn new() -> Self {
        Self {
            now: quiver_core::time::NoopClock.get_time() + Duration::from_secs(1),
        }
    }

    fn advance(&mut self, duration: Duration) {
        self.now = self.now + duration;
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

struct Pair {
    client: Connection<testing::Session>,
    server: Option<Connection<testing::Session>>,
    tls: testing::Endpoint,
    rng: random::Generator,
    clock: TestClock,
    /// Datagrams in flight toward (server, client)
    to_server: Vec<Vec<u8>>,
    to_client: Vec<Vec<u8>>,
}

impl Pair {
    fn new(settings: Settings) -> Self {
        let mut tls = testing::Endpoint;
        let mut rng = random::Generator::default();
        let clock = TestClock::new();

        let client = Connection::new_client(
            1,
            settings,
            addr(1111),
            addr(443),
            "test.example",
            &mut tls,
            &mut rng,
            clock.now,
            &mut |_| true,
        )
        .expect("client construction");

        Self {
            client,
            server: None,
            tls,
            rng,
            clock,
            to_server: Vec::new(),
            to_client: Vec::new(),
        }
    }

    fn flush_client(&mut self) {
        let out = &mut self.to_server;
        self.client
            .flush(self.clock.now, &mut self.rng, &mut |datagram, _| {
                out.push(datagram.to_vec());
            })
            .expect("client flush");
    }

    fn flush_server(&mut self) {
        if let Some(server) = self.server.as_mut() {
            let out = &mut self.to_client;
            server
                .flush(self.clock.now, &mut self.rng, &mut |datagram, _| {
                    out.push(datagram.to_vec());
                })
                .expect("server flush");
        }
    }

    /// Delivers pending datagrams in both directions, creating the server
    /// on the first client flight
    fn deliver(&mut self, drop_first_to_server: bool) {
        let mut to_server = std::mem::take(&mut self.to_server);
        if drop_first_to_server && !to_server.is_empty() {
            to_server.remove(0);
        }

        for mut datagram in to_server {
            if self.server.is_none() {
                // crack the first packet open far enough to seed the server
                let buffer = s2n_codec::DecoderBuffer::new(&datagram);
                let (packet, _) =
                    quiver_core::packet::decode_packet(buffer, 8).expect("parseable initial");
                let (dcid, scid) = match &packet {
                    quiver_core::packet::Packet::Initial(initial) => (
                        PeerId::try_from_bytes(initial.destination_cid).unwrap(),
                        PeerId::try_from_bytes(initial.source_cid).unwrap(),
                    ),
                    other => panic!("first packet was not initial: {other:?}"),
                };

                let server = Connection::new_server(
                    2,
                    Settings {
                        peer_bidi_stream_count: 8,
                        peer_unidi_stream_count: 2,
                        ..Settings::default()
                    },
                    addr(443),
                    addr(1111),
                    dcid,
                    scid,
                    &mut self.tls,
                    &mut self.rng,
                    self.clock.now,
                    &mut |_| true,
                )
                .expect("server construction");
                self.server = Some(server);
            }

            if let Some(server) = self.server.as_mut() {
                server
                    .on_datagram_received(addr(1111), &mut datagram, self.clock.now, &mut self.rng)
                    .expect("server receive");
            }
        }

        for mut datagram in std::mem::take(&mut self.to_client) {
            self.client
                .on_datagram_received(addr(443), &mut datagram, self.clock.now, &mut self.rng)
                .expect("client receive");
        }
    }

    /// Runs flush/deliver rounds until traffic quiesces
    fn settle(&mut self) {
        for _ in 0..12 {
            self.flush_client();
            self.flush_server();
            if self.to_server.is_empty() && self.to_client.is_empty() {
                break;
            }
            self.deliver(false);
            self.clock.advance(Duration::from_millis(10));
        }
    }
}

#[test]
fn handshake_completes_and_connected_events_fire() {
    let mut pair = Pair::new(Settings {
        peer_bidi_stream_count: 8,
        ..Settings::default()
    });

    pair.settle();

    assert!(pair.client.state.connected, "client never connected");
    let server = pair.server.as_ref().expect("server was created");
    assert!(server.state.connected, "server never connected");

    let client_events: Vec<_> = pair.client.drain_events().collect();
    assert!(
        client_events.contains(&ConnectionEvent::Connected),
        "missing client CONNECTED event: {client_events:?}"
    );
}

#[test]
fn first_flight_loss_recovers_via_pto() {
    let mut pair = Pair::new(Settings {
        peer_bidi_stream_count: 8,
        ..Settings::default()
    });

    // drop the client's first Initial datagram on the floor
    pair.flush_client();
    pair.deliver(true);
    assert!(pair.server.is_none());

    // fire the client's probe timer until it retransmits
    for _ in 0..8 {
        pair.clock.advance(Duration::from_millis(500));
        pair.client.on_timeout(pair.clock.now, &mut pair.rng);
        pair.flush_client();
        if !pair.to_server.is_empty() {
            break;
        }
    }
    assert!(!pair.to_server.is_empty(), "no retransmission after PTO");

    pair.deliver(false);
    pair.settle();

    assert!(pair.client.state.connected);
    assert!(
        pair.client.stats.send.retransmittable_packets >= 2,
        "expected at least two retransmittable packets, saw {}",
        pair.client.stats.send.retransmittable_packets
    );
}

#[test]
fn stream_data_round_trips_after_handshake() {
    let mut pair = Pair::new(Settings {
        peer_bidi_stream_count: 8,
        ..Settings::default()
    });
    pair.settle();
    assert!(pair.client.state.connected);

    // client opens a stream and sends a request
    let id = pair
        .client
        .streams
        .open_local(StreamType::Bidirectional)
        .expect("stream grant available");
    pair.client.streams.write(id, b"ping").expect("write accepted");
    pair.client.send_pending = true;
    pair.settle();

    // the server sees the data
    let server = pair.server.as_mut().expect("server exists");
    let mut buffer = [0u8; 16];
    let (len, _) = server
        .streams
        .read(id, &mut buffer, pair.clock.now, Duration::from_millis(50))
        .expect("server read");
    assert_eq!(&buffer[..len], b"ping");

    // and echoes a response
    server.streams.write(id, b"pong").expect("server write");
    server.send_pending = true;
    pair.settle();

    let (len, _) = pair
        .client
        .streams
        .read(id, &mut buffer, pair.clock.now, Duration::from_millis(50))
        .expect("client read");
    assert_eq!(&buffer[..len], b"pong");
}

#[test]
fn graceful_close_drains_both_sides() {
    let mut pair = Pair::new(Settings {
        peer_bidi_stream_count: 8,
        ..Settings::default()
    });
    pair.settle();

    pair.client
        .shutdown(ApplicationError(VarInt::ZERO), pair.clock.now);
    pair.settle();

    // the server heard about it
    let server = pair.server.as_mut().expect("server exists");
    let server_events: Vec<_> = server.drain_events().collect();
    assert!(
        server_events
            .iter()
            .any(|event| matches!(event, ConnectionEvent::ShutdownInitiatedByPeer { .. })),
        "server missed the close: {server_events:?}"
    );

    // both sides reach their terminal state within the drain window
    pair.clock.advance(Duration::from_secs(10));
    pair.client.on_timeout(pair.clock.now, &mut pair.rng);
    server.on_timeout(pair.clock.now, &mut pair.rng);

    assert!(pair.client.is_closed());
    assert!(server.is_closed());
}
