// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{frame::Tag, transport, varint::VarInt};
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.19
//# An endpoint sends a CONNECTION_CLOSE frame (type=0x1c or 0x1d) to
//# notify its peer that the connection is being closed.  The
//# CONNECTION_CLOSE frame with a type of 0x1c is used to signal errors
//# at only the QUIC layer, or the absence of errors (with the NO_ERROR
//# code).  The CONNECTION_CLOSE frame with a type of 0x1d is used to
//# signal an error with the application that uses QUIC.

const TRANSPORT_TAG: Tag = 0x1c;
const APPLICATION_TAG: Tag = 0x1d;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.19
//# CONNECTION_CLOSE Frame {
//#   Type (i) = 0x1c..0x1d,
//#   Error Code (i),
//#   [Frame Type (i)],
//#   Reason Phrase Length (i),
//#   Reason Phrase (..),
//# }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionClose<'a> {
    pub error_code: VarInt,

    /// The type of the frame that triggered the error; `None` for
    /// application-level closes (type 0x1d) and unknown frames
    pub frame_type: Option<VarInt>,

    /// Human-readable close reason; not authenticated content
    pub reason: Option<&'a [u8]>,
}

impl<'a> ConnectionClose<'a> {
    #[inline]
    pub fn tag(&self) -> Tag {
        if self.frame_type.is_some() {
            TRANSPORT_TAG
        } else {
            APPLICATION_TAG
        }
    }

    /// True if this close was produced by the application rather than the
    /// transport
    #[inline]
    pub fn is_application_close(&self) -> bool {
        self.frame_type.is_none()
    }
}

decoder_parameterized_value!(
    impl<'a> ConnectionClose<'a> {
        fn decode(tag: Tag, buffer: Buffer) -> Result<Self> {
            let (error_code, buffer) = buffer.decode()?;

            let (frame_type, buffer) = if tag == TRANSPORT_TAG {
                let (frame_type, buffer) = buffer.decode::<VarInt>()?;
                (Some(frame_type), buffer)
            } else {
                (None, buffer)
            };

            let (reason, buffer) = buffer.decode_slice_with_len_prefix::<VarInt>()?;
            let reason = reason.into_less_safe_slice();
            let reason = if reason.is_empty() {
                None
            } else {
                Some(&*reason)
            };

            let frame = ConnectionClose {
                error_code,
                frame_type,
                reason,
            };

            Ok((frame, buffer))
        }
    }
);

impl<'a> EncoderValue for ConnectionClose<'a> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.error_code);

        if let Some(frame_type) = self.frame_type {
            buffer.encode(&frame_type);
        }

        if let Some(reason) = self.reason {
            buffer.encode_with_len_prefix::<VarInt, _>(&reason);
        } else {
            buffer.encode(&VarInt::ZERO);
        }
    }
}

impl<'a> From<transport::Error> for ConnectionClose<'a> {
    fn from(error: transport::Error) -> Self {
        ConnectionClose {
            error_code: error.code,
            frame_type: Some(error.frame_type.unwrap_or(VarInt::ZERO)),
            reason: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use s2n_codec::{DecoderBuffer, EncoderBuffer};

    fn round_trip(frame: &ConnectionClose) {
        let mut bytes = [0u8; 128];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut bytes);
            encoder.encode(frame);
            encoder.len()
        };

        let (decoded, _) = Frame::decode(DecoderBuffer::new(&bytes[..len])).unwrap();
        match decoded {
            Frame::ConnectionClose(decoded) => assert_eq!(&decoded, frame),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn transport_close() {
        round_trip(&ConnectionClose {
            error_code: transport::Error::PROTOCOL_VIOLATION.code,
            frame_type: Some(VarInt::from_u8(0x06)),
            reason: Some(b"bad crypto frame"),
        });
    }

    #[test]
    fn application_close() {
        let frame = ConnectionClose {
            error_code: VarInt::from_u8(7),
            frame_type: None,
            reason: None,
        };
        assert_eq!(frame.tag(), 0x1d);
        assert!(frame.is_application_close());
        round_trip(&frame);
    }
}
