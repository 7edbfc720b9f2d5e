// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! QUIC frame codecs.
//!
//! Each frame type lives in its own module with a `decoder_parameterized_value!`
//! impl (parameterized by the frame tag) and an `EncoderValue` impl. Frames
//! with a variable payload additionally provide `try_fit`, which the packet
//! builder uses to clamp the payload to the remaining packet capacity.

use core::fmt;
use s2n_codec::{DecoderBuffer, DecoderBufferResult, DecoderError};

pub mod ack;
pub mod ack_elicitation;
pub mod connection_close;
pub mod crypto;
pub mod datagram;
pub mod new_connection_id;
pub mod new_token;
pub mod padding;
pub mod path_challenge;
pub mod stream;

pub use ack::Ack;
pub use ack_elicitation::AckElicitation;
pub use connection_close::ConnectionClose;
pub use crypto::Crypto;
pub use datagram::Datagram;
pub use new_connection_id::NewConnectionId;
pub use new_token::NewToken;
pub use padding::Padding;
pub use path_challenge::{PathChallenge, PathResponse};
pub use stream::Stream;

pub(crate) type Tag = u8;

/// The maximum number of frames the builder will pack into one packet
pub const MAX_FRAMES_PER_PACKET: usize = 12;

/// Returned by `try_fit` when a frame cannot fit the remaining capacity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FitError;

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "frame cannot fit in the remaining capacity")
    }
}

/// Defines a frame struct consisting only of VarInt fields, along with its
/// codec impls
macro_rules! simple_frame {
    (
        $(#[doc = $doc:expr])*
        $name:ident:$tag:expr => { $($field:ident),* $(,)? }
    ) => {
        $(#[doc = $doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub struct $name {
            $(pub $field: $crate::varint::VarInt,)*
        }

        impl $name {
            pub const TAG: $crate::frame::Tag = $tag;

            #[inline]
            pub const fn tag(&self) -> $crate::frame::Tag {
                Self::TAG
            }
        }

        s2n_codec::decoder_parameterized_value!(
            impl<'a> $name {
                fn decode(_tag: $crate::frame::Tag, buffer: Buffer) -> Result<Self> {
                    $(
                        let ($field, buffer) = buffer.decode()?;
                    )*
                    Ok(($name { $($field),* }, buffer))
                }
            }
        );

        impl s2n_codec::EncoderValue for $name {
            #[inline]
            fn encode<E: s2n_codec::Encoder>(&self, buffer: &mut E) {
                buffer.encode(&self.tag());
                $(
                    buffer.encode(&self.$field);
                )*
            }
        }
    };
}

simple_frame!(
    /// Informs the peer of a stream's abrupt termination
    ResetStream:0x04 => { stream_id, application_error_code, final_size }
);

simple_frame!(
    /// Requests that the peer stop sending on a stream
    StopSending:0x05 => { stream_id, application_error_code }
);

simple_frame!(
    /// Raises the connection-wide flow control limit
    MaxData:0x10 => { maximum_data }
);

simple_frame!(
    /// Raises a stream's flow control limit
    MaxStreamData:0x11 => { stream_id, maximum_stream_data }
);

simple_frame!(
    /// Reports that the connection-wide flow control limit blocks sending
    DataBlocked:0x14 => { data_limit }
);

simple_frame!(
    /// Reports that a stream's flow control limit blocks sending
    StreamDataBlocked:0x15 => { stream_id, stream_data_limit }
);

simple_frame!(
    /// Requests the peer stop using a connection ID
    RetireConnectionId:0x19 => { sequence_number }
);

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.11
//# A MAX_STREAMS frame (type=0x12 or 0x13) informs the peer of the
//# cumulative number of streams of a given type it is permitted to open.

simple_frame!(
    /// Raises the cumulative bidirectional stream count limit
    MaxStreamsBidirectional:0x12 => { maximum_streams }
);

simple_frame!(
    /// Raises the cumulative unidirectional stream count limit
    MaxStreamsUnidirectional:0x13 => { maximum_streams }
);

simple_frame!(
    /// Reports that the bidirectional stream count limit blocks opening
    StreamsBlockedBidirectional:0x16 => { stream_limit }
);

simple_frame!(
    /// Reports that the unidirectional stream count limit blocks opening
    StreamsBlockedUnidirectional:0x17 => { stream_limit }
);

//= https://datatracker.ietf.org/doc/html/draft-ietf-quic-reliable-stream-reset-03
//# A RELIABLE_RESET_STREAM frame carries a Reliable Size in addition to the
//# RESET_STREAM fields; data below the Reliable Size is still delivered.

simple_frame!(
    /// Resets a stream while still guaranteeing delivery below `reliable_size`
    ReliableResetStream:0x24 => {
        stream_id,
        application_error_code,
        final_size,
        reliable_size,
    }
);

/// A PING frame (type 0x01); elicits an acknowledgment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ping;

impl Ping {
    pub const TAG: Tag = 0x01;

    #[inline]
    pub const fn tag(&self) -> Tag {
        Self::TAG
    }
}

impl s2n_codec::EncoderValue for Ping {
    #[inline]
    fn encode<E: s2n_codec::Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
    }
}

s2n_codec::decoder_parameterized_value!(
    impl<'a> Ping {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            Ok((Ping, buffer))
        }
    }
);

/// A HANDSHAKE_DONE frame (type 0x1e); sent by the server to confirm the
/// handshake
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandshakeDone;

impl HandshakeDone {
    pub const TAG: Tag = 0x1e;

    #[inline]
    pub const fn tag(&self) -> Tag {
        Self::TAG
    }
}

impl s2n_codec::EncoderValue for HandshakeDone {
    #[inline]
    fn encode<E: s2n_codec::Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
    }
}

s2n_codec::decoder_parameterized_value!(
    impl<'a> HandshakeDone {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            Ok((HandshakeDone, buffer))
        }
    }
);

/// A decoded frame borrowing the packet payload
#[derive(Debug, PartialEq)]
pub enum Frame<'a> {
    Padding(Padding),
    Ping(Ping),
    Ack(Ack<ack::AckRangesDecoder<'a>>),
    ResetStream(ResetStream),
    ReliableResetStream(ReliableResetStream),
    StopSending(StopSending),
    Crypto(Crypto<&'a [u8]>),
    NewToken(NewToken<'a>),
    Stream(Stream<&'a [u8]>),
    MaxData(MaxData),
    MaxStreamData(MaxStreamData),
    MaxStreamsBidirectional(MaxStreamsBidirectional),
    MaxStreamsUnidirectional(MaxStreamsUnidirectional),
    DataBlocked(DataBlocked),
    StreamDataBlocked(StreamDataBlocked),
    StreamsBlockedBidirectional(StreamsBlockedBidirectional),
    StreamsBlockedUnidirectional(StreamsBlockedUnidirectional),
    NewConnectionId(NewConnectionId<'a>),
    RetireConnectionId(RetireConnectionId),
    PathChallenge(PathChallenge<'a>),
    PathResponse(PathResponse<'a>),
    ConnectionClose(ConnectionClose<'a>),
    HandshakeDone(HandshakeDone),
    Datagram(Datagram<&'a [u8]>),
}

macro_rules! decode_frame {
    ($variant:ident, $tag:expr, $buffer:expr) => {{
        let buffer = $buffer.skip(core::mem::size_of::<Tag>())?;
        let (frame, buffer) = buffer.decode_parameterized($tag)?;
        Ok((Frame::$variant(frame), buffer))
    }};
}

impl<'a> Frame<'a> {
    /// Decodes a single frame from the front of `buffer`
    pub fn decode(buffer: DecoderBuffer<'a>) -> DecoderBufferResult<'a, Frame<'a>> {
        let tag = buffer.peek_byte(0)?;

        match tag {
            0x00 => decode_frame!(Padding, tag, buffer),
            0x01 => decode_frame!(Ping, tag, buffer),
            0x02..=0x03 => decode_frame!(Ack, tag, buffer),
            0x04 => decode_frame!(ResetStream, tag, buffer),
            0x05 => decode_frame!(StopSending, tag, buffer),
            0x06 => {
                let buffer = buffer.skip(core::mem::size_of::<Tag>())?;
                let (frame, buffer) =
                    buffer.decode_parameterized::<Crypto<DecoderBuffer<'a>>>(tag)?;
                Ok((
                    Frame::Crypto(frame.map_data(|data| data.into_less_safe_slice())),
                    buffer,
                ))
            }
            0x07 => decode_frame!(NewToken, tag, buffer),
            0x08..=0x0f => {
                let buffer = buffer.skip(core::mem::size_of::<Tag>())?;
                let (frame, buffer) =
                    buffer.decode_parameterized::<Stream<DecoderBuffer<'a>>>(tag)?;
                Ok((
                    Frame::Stream(frame.map_data(|data| data.into_less_safe_slice())),
                    buffer,
                ))
            }
            0x10 => decode_frame!(MaxData, tag, buffer),
            0x11 => decode_frame!(MaxStreamData, tag, buffer),
            0x12 => decode_frame!(MaxStreamsBidirectional, tag, buffer),
            0x13 => decode_frame!(MaxStreamsUnidirectional, tag, buffer),
            0x14 => decode_frame!(DataBlocked, tag, buffer),
            0x15 => decode_frame!(StreamDataBlocked, tag, buffer),
            0x16 => decode_frame!(StreamsBlockedBidirectional, tag, buffer),
            0x17 => decode_frame!(StreamsBlockedUnidirectional, tag, buffer),
            0x18 => decode_frame!(NewConnectionId, tag, buffer),
            0x19 => decode_frame!(RetireConnectionId, tag, buffer),
            0x1a => decode_frame!(PathChallenge, tag, buffer),
            0x1b => decode_frame!(PathResponse, tag, buffer),
            0x1c..=0x1d => decode_frame!(ConnectionClose, tag, buffer),
            0x1e => decode_frame!(HandshakeDone, tag, buffer),
            0x24 => decode_frame!(ReliableResetStream, tag, buffer),
            0x30..=0x31 => {
                let buffer = buffer.skip(core::mem::size_of::<Tag>())?;
                let (frame, buffer) =
                    buffer.decode_parameterized::<Datagram<DecoderBuffer<'a>>>(tag)?;
                Ok((
                    Frame::Datagram(frame.map_data(|data| data.into_less_safe_slice())),
                    buffer,
                ))
            }
            _ => Err(DecoderError::InvariantViolation("unknown frame type")),
        }
    }

    /// The frame's wire tag
    pub fn tag(&self) -> Tag {
        match self {
            Frame::Padding(frame) => frame.tag(),
            Frame::Ping(frame) => frame.tag(),
            Frame::Ack(frame) => frame.tag(),
            Frame::ResetStream(frame) => frame.tag(),
            Frame::ReliableResetStream(frame) => frame.tag(),
            Frame::StopSending(frame) => frame.tag(),
            Frame::Crypto(frame) => frame.tag(),
            Frame::NewToken(frame) => frame.tag(),
            Frame::Stream(frame) => frame.tag(),
            Frame::MaxData(frame) => frame.tag(),
            Frame::MaxStreamData(frame) => frame.tag(),
            Frame::MaxStreamsBidirectional(frame) => frame.tag(),
            Frame::MaxStreamsUnidirectional(frame) => frame.tag(),
            Frame::DataBlocked(frame) => frame.tag(),
            Frame::StreamDataBlocked(frame) => frame.tag(),
            Frame::StreamsBlockedBidirectional(frame) => frame.tag(),
            Frame::StreamsBlockedUnidirectional(frame) => frame.tag(),
            Frame::NewConnectionId(frame) => frame.tag(),
            Frame::RetireConnectionId(frame) => frame.tag(),
            Frame::PathChallenge(frame) => frame.tag(),
            Frame::PathResponse(frame) => frame.tag(),
            Frame::ConnectionClose(frame) => frame.tag(),
            Frame::HandshakeDone(frame) => frame.tag(),
            Frame::Datagram(frame) => frame.tag(),
        }
    }

    /// Whether the frame requires acknowledgment from the receiver
    #[inline]
    pub fn ack_elicitation(&self) -> AckElicitation {
        match self {
            Frame::Padding(_) | Frame::Ack(_) | Frame::ConnectionClose(_) => {
                AckElicitation::NonEliciting
            }
            _ => AckElicitation::Eliciting,
        }
    }

    /// Whether the frame counts toward bytes in flight
    ///
    //= https://www.rfc-editor.org/rfc/rfc9002#section-2
    //# Packets that contain ack-eliciting frames elicit an ACK from the
    //# receiver within the maximum acknowledgment delay and are called ack-
    //# eliciting packets.
    #[inline]
    pub fn is_congestion_controlled(&self) -> bool {
        // PADDING is congestion controlled but not ack-eliciting
        !matches!(self, Frame::Ack(_) | Frame::ConnectionClose(_))
    }
}

#[cfg(test)]
mod tests;
