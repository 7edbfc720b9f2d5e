// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Endpoint role types

/// The role of an endpoint in a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Client,
    Server,
}

impl Type {
    /// Returns the peer's role
    #[inline]
    #[must_use]
    pub fn peer_type(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }

    #[inline]
    pub fn is_client(self) -> bool {
        matches!(self, Self::Client)
    }

    #[inline]
    pub fn is_server(self) -> bool {
        matches!(self, Self::Server)
    }
}
