// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

/// The data-flow shape of a stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamType {
    /// Both peers may send data
    Bidirectional,
    /// Only the initiator may send data
    Unidirectional,
}

impl StreamType {
    #[inline]
    pub fn is_bidirectional(self) -> bool {
        matches!(self, Self::Bidirectional)
    }

    #[inline]
    pub fn is_unidirectional(self) -> bool {
        matches!(self, Self::Unidirectional)
    }
}
