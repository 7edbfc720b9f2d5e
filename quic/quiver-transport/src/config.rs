// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Connection-level configuration knobs and engine constants

use core::time::Duration;

/// The congestion control algorithms a configuration can select
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CongestionControlAlgorithm {
    #[default]
    Cubic,
    Bbr,
}

/// Tunables the engine reads; defaults follow long-standing practice for
/// production QUIC deployments
#[derive(Clone, Debug)]
pub struct Settings {
    pub initial_rtt: Duration,
    pub initial_window_packets: u32,
    pub idle_timeout: Duration,
    pub handshake_idle_timeout: Duration,
    pub disconnect_timeout: Duration,
    /// Zero disables keep-alive
    pub keep_alive_interval: Duration,
    /// A key update is initiated after this many bytes under one key
    pub max_bytes_per_key: u64,
    pub minimum_mtu: u16,
    pub maximum_mtu: u16,
    pub stream_recv_window_default: u32,
    pub stream_recv_buffer_default: u32,
    pub conn_flow_control_window: u32,
    pub congestion_control_algorithm: CongestionControlAlgorithm,
    pub pacing_enabled: bool,
    pub ecn_enabled: bool,
    pub hystart_enabled: bool,
    pub grease_quic_bit: bool,
    pub reliable_reset_enabled: bool,
    pub one_way_delay_enabled: bool,
    pub stream_multi_receive_enabled: bool,
    pub migration_enabled: bool,
    pub send_buffering_enabled: bool,
    pub ideal_send_buffer_size: u64,
    /// Prefix embedded at the front of generated connection IDs for
    /// deployment-level routing; empty disables it
    pub cid_routing_prefix: Vec<u8>,
    pub peer_bidi_stream_count: u16,
    pub peer_unidi_stream_count: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            initial_rtt: Duration::from_millis(333),
            initial_window_packets: 10,
            idle_timeout: Duration::from_millis(30_000),
            handshake_idle_timeout: Duration::from_millis(10_000),
            disconnect_timeout: Duration::from_millis(16_000),
            keep_alive_interval: Duration::ZERO,
            max_bytes_per_key: 0x40_0000_0000,
            minimum_mtu: 1248,
            maximum_mtu: 1500,
            stream_recv_window_default: 0x10000,
            stream_recv_buffer_default: 0x1000,
            conn_flow_control_window: 0x100_0000,
            congestion_control_algorithm: CongestionControlAlgorithm::default(),
            pacing_enabled: true,
            ecn_enabled: false,
            hystart_enabled: true,
            grease_quic_bit: false,
            reliable_reset_enabled: false,
            one_way_delay_enabled: false,
            stream_multi_receive_enabled: false,
            migration_enabled: true,
            send_buffering_enabled: true,
            ideal_send_buffer_size: 0x20000,
            cid_routing_prefix: Vec::new(),
            peer_bidi_stream_count: 0,
            peer_unidi_stream_count: 0,
        }
    }
}

/// Largest allowed disconnect timeout
pub const MAX_DISCONNECT_TIMEOUT: Duration = Duration::from_millis(600_000);

/// The amplification budget for an unvalidated peer address
pub const AMPLIFICATION_RATIO: u64 = 3;

/// Minimum UDP payload for an Initial packet
pub const MIN_INITIAL_PACKET_LENGTH: usize = 1200;

/// PTO multiplier governing the closing/draining period
pub const CLOSE_PTO_COUNT: u32 = 3;

/// The minimum interval between CONNECTION_CLOSE retransmissions while
/// closing
pub const CLOSING_RESPONSE_MIN_INTERVAL: Duration = Duration::from_millis(5);

/// Packets a stream may fill before yielding to its priority peers
pub const STREAM_SEND_BATCH_COUNT: u32 = 8;

/// Operations drained per connection per scheduling quantum
pub const MAX_OPERATIONS_PER_DRAIN: usize = 16;

/// Stateless operations processed per worker loop iteration
pub const MAX_STATELESS_OPERATIONS: usize = 16;

/// How long a queued stateless operation stays actionable
pub const STATELESS_OPERATION_EXPIRATION: Duration = Duration::from_millis(100);

/// Locally-tracked paths per connection
pub const MAX_PATH_COUNT: usize = 4;

/// The number of connection IDs we issue to (and accept from) the peer
pub const ACTIVE_CONNECTION_ID_LIMIT: u64 = 4;

/// Retired destination CIDs beyond `8 ×` this limit indicate a misbehaving
/// peer
pub const RETIRED_CID_LIMIT_MULTIPLIER: u64 = 8;

/// Source CID generation retries before giving up on collisions
pub const MAX_CID_COLLISION_RETRY: usize = 8;

/// The fixed length of locally-generated connection IDs
pub const LOCAL_CID_LEN: usize = 8;

/// Ceiling for the adaptive ideal send-buffer size
pub const MAX_IDEAL_SEND_BUFFER_SIZE: u64 = 0x800_0000;

/// Exponent advertised for ack-delay encoding
pub const ACK_DELAY_EXPONENT: u8 = 8;

/// Our advertised max_ack_delay, in milliseconds
pub const MAX_ACK_DELAY_MS: u64 = 25;

/// Ack-eliciting packets received before an immediate ACK is queued
pub const MIN_ACK_SEND_NUMBER: u64 = 2;

/// The worker's exponential queue-delay smoothing keeps 7/8 of history
pub const WORKER_QUEUE_DELAY_SMOOTHING_SHIFT: u32 = 3;
