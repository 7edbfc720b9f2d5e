// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{endpoint, stream::StreamType, varint::VarInt};

/// The ID of a stream.
///
/// A 62-bit integer whose two least significant bits encode the initiator
/// and the direction.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash)]
pub struct StreamId(VarInt);

impl From<StreamId> for VarInt {
    #[inline]
    fn from(id: StreamId) -> Self {
        id.0
    }
}

impl From<StreamId> for u64 {
    #[inline]
    fn from(id: StreamId) -> Self {
        id.0.as_u64()
    }
}

impl StreamId {
    /// Creates a Stream ID from a [`VarInt`]; always valid since the ranges
    /// coincide
    #[inline]
    pub const fn from_varint(id: VarInt) -> StreamId {
        StreamId(id)
    }

    #[inline]
    pub const fn as_varint(self) -> VarInt {
        self.0
    }

    //= https://www.rfc-editor.org/rfc/rfc9000#section-2.1
    //# The two least significant bits from a stream ID therefore identify a
    //# stream as one of four types, as summarized in Table 1.

    /// Returns the first Stream ID of the given type, e.g. `3` for a
    /// server-initiated unidirectional stream
    #[inline]
    pub fn initial(initiator: endpoint::Type, stream_type: StreamType) -> StreamId {
        let low_bits = match (stream_type, initiator) {
            (StreamType::Bidirectional, endpoint::Type::Client) => 0,
            (StreamType::Bidirectional, endpoint::Type::Server) => 1,
            (StreamType::Unidirectional, endpoint::Type::Client) => 2,
            (StreamType::Unidirectional, endpoint::Type::Server) => 3,
        };
        StreamId(VarInt::from_u8(low_bits))
    }

    /// Returns the n-th Stream ID of the given type; `None` once the 62-bit
    /// space is exhausted
    #[inline]
    pub fn nth(initiator: endpoint::Type, stream_type: StreamType, n: u64) -> Option<StreamId> {
        let initial = Self::initial(initiator, stream_type);
        let id = VarInt::new(n.checked_mul(4)?.checked_add(initial.into())?).ok()?;
        Some(StreamId(id))
    }

    /// Returns the next Stream ID of the same type, or `None` on overflow
    #[inline]
    pub fn next_of_type(self) -> Option<StreamId> {
        // ids of one type are spaced apart by 4
        self.0.checked_add(VarInt::from_u8(4)).map(StreamId)
    }

    /// The endpoint which opened this stream
    #[inline]
    pub fn initiator(self) -> endpoint::Type {
        if self.0.as_u64() & 0b01 == 0 {
            endpoint::Type::Client
        } else {
            endpoint::Type::Server
        }
    }

    #[inline]
    pub fn stream_type(self) -> StreamType {
        if self.0.as_u64() & 0b10 == 0 {
            StreamType::Bidirectional
        } else {
            StreamType::Unidirectional
        }
    }

    /// The zero-based index of this stream within its type
    #[inline]
    pub fn ordinal(self) -> u64 {
        self.0.as_u64() >> 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_ids() {
        for (id, initiator, stream_type) in [
            (0, endpoint::Type::Client, StreamType::Bidirectional),
            (1, endpoint::Type::Server, StreamType::Bidirectional),
            (2, endpoint::Type::Client, StreamType::Unidirectional),
            (3, endpoint::Type::Server, StreamType::Unidirectional),
        ] {
            let stream_id = StreamId::initial(initiator, stream_type);
            assert_eq!(u64::from(stream_id), id);
            assert_eq!(stream_id.initiator(), initiator);
            assert_eq!(stream_id.stream_type(), stream_type);
            assert_eq!(stream_id.ordinal(), 0);
        }
    }

    #[test]
    fn nth_spacing() {
        let id = StreamId::nth(endpoint::Type::Client, StreamType::Unidirectional, 3).unwrap();
        assert_eq!(u64::from(id), 14);
        assert_eq!(id.ordinal(), 3);
        assert_eq!(u64::from(id.next_of_type().unwrap()), 18);

        assert!(StreamId::nth(endpoint::Type::Client, StreamType::Bidirectional, 1 << 62).is_none());
    }
}
