// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{endpoint, transport};
use core::fmt;

/// The reason a connection reached (or is reaching) its end of life.
///
/// The four spec error categories map onto this enum: transport errors and
/// application errors carry the wire-visible code and which side initiated
/// the close; local fatal errors close silently via `Fatal`; timeouts and
/// stateless resets get their own variants so the application can
/// disambiguate every cause.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The connection was closed without an error (code 0)
    Closed { initiator: endpoint::Type },
    /// The connection was closed on the transport level
    Transport {
        error: transport::Error,
        initiator: endpoint::Type,
    },
    /// The connection was closed by the application or application protocol
    Application {
        error: transport::error::ApplicationError,
        initiator: endpoint::Type,
    },
    /// No packets were received within the negotiated idle window
    IdleTimeout,
    /// The handshake did not complete within the handshake idle window
    HandshakeTimeout,
    /// The peer stopped acknowledging within the disconnect window
    DisconnectTimeout,
    /// A stateless reset was received from the peer
    StatelessReset,
    /// The active path lost its last usable destination connection ID
    NoValidPath,
    /// A local fatal error; the connection is dropped without a
    /// CONNECTION_CLOSE and without a closing period
    Fatal { reason: &'static str },
}

impl Error {
    /// True if the cause was local rather than peer-initiated
    #[inline]
    pub fn is_local(&self, local: endpoint::Type) -> bool {
        match self {
            Self::Closed { initiator }
            | Self::Transport { initiator, .. }
            | Self::Application { initiator, .. } => *initiator == local,
            Self::StatelessReset => false,
            _ => true,
        }
    }

    /// The wire error code, if this cause produces a CONNECTION_CLOSE
    #[inline]
    pub fn close_code(&self) -> Option<crate::varint::VarInt> {
        match self {
            Self::Closed { .. } => Some(crate::varint::VarInt::ZERO),
            Self::Transport { error, .. } => Some(error.code),
            Self::Application { error, .. } => Some(error.0),
            Self::IdleTimeout
            | Self::HandshakeTimeout
            | Self::DisconnectTimeout
            | Self::StatelessReset
            | Self::NoValidPath
            | Self::Fatal { .. } => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Closed { .. } => write!(f, "connection closed without error"),
            Self::Transport { error, .. } => write!(f, "transport error: {error}"),
            Self::Application { error, .. } => write!(f, "application error: {error}"),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::HandshakeTimeout => write!(f, "handshake timeout"),
            Self::DisconnectTimeout => write!(f, "disconnect timeout"),
            Self::StatelessReset => write!(f, "stateless reset received"),
            Self::NoValidPath => write!(f, "no valid path remains"),
            Self::Fatal { reason } => write!(f, "fatal: {reason}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
