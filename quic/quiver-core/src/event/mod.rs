// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Application-visible events.
//!
//! Events are produced on the worker thread in the order the underlying
//! state transitions happened and drained by the application through its
//! connection handle.

use crate::{
    connection,
    stream::StreamId,
    transport::error::ApplicationError,
    varint::VarInt,
};

/// Why and how a connection finished; carried by
/// [`ConnectionEvent::ShutdownComplete`].
///
/// Together the fields disambiguate every close category: a graceful or
/// abortive app close, a transport error from either side, a timeout, or a
/// silent local failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShutdownSummary {
    /// True if the shutdown was initiated by the application rather than
    /// the transport
    pub by_app: bool,
    /// True if the peer initiated the close
    pub closed_remotely: bool,
    /// The wire error code, when one was sent or received
    pub error_code: Option<VarInt>,
    /// The local cause, precise across all categories
    pub status: connection::Error,
}

/// Events delivered for a connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The handshake completed and 1-RTT keys are installed
    Connected,
    /// The transport began closing the connection (local error or timeout)
    ShutdownInitiatedByTransport { error: connection::Error },
    /// The peer began closing the connection
    ShutdownInitiatedByPeer {
        error_code: ApplicationError,
    },
    /// The connection reached its terminal state; always the last event
    ShutdownComplete(ShutdownSummary),
    /// The peer opened a stream
    PeerStreamStarted { id: StreamId },
    /// The peer raised our stream-count limit
    StreamsAvailable {
        bidirectional: u64,
        unidirectional: u64,
    },
    /// The connection migrated to a different worker
    IdealProcessorChanged { ideal_processor: u16 },
    /// A session resumption ticket arrived (client)
    ResumptionTicketReceived,
    /// An unreliable datagram arrived
    DatagramReceived { length: usize },
}

/// Events delivered for a stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream id was assigned and flow control initialized
    StartComplete { id: StreamId },
    /// New contiguous data is ready to read
    Receive { available: usize, is_fin: bool },
    /// A send request finished (acknowledged or canceled)
    SendComplete { canceled: bool },
    /// The peer finished sending gracefully
    PeerSendShutdown,
    /// The peer abandoned its send direction
    PeerSendAborted { error_code: ApplicationError },
    /// The peer no longer wants our data
    PeerReceiveAborted { error_code: ApplicationError },
    /// Our send direction is fully acknowledged or abandoned
    SendShutdownComplete { graceful: bool },
    /// Both directions are terminal; always the last event
    ShutdownComplete {
        connection_shutdown: bool,
        app_close_in_progress: bool,
    },
    /// The ideal amount of send buffering changed
    IdealSendBufferSize { byte_count: u64 },
}
