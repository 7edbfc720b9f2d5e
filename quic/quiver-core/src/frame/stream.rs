// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{FitError, Tag},
    varint::VarInt,
};
use core::mem::size_of;
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
//# STREAM frames implicitly create a stream and carry stream data.  The
//# Type field in the STREAM frame takes the form 0b00001XXX (or the set
//# of values from 0x08 to 0x0f).

const STREAM_TAG: Tag = 0x08;

/// Set when an Offset field is present
const OFF_BIT: Tag = 0x04;
/// Set when a Length field is present; clear means the data extends to the
/// end of the packet
const LEN_BIT: Tag = 0x02;
/// Set when the frame marks the end of the stream
const FIN_BIT: Tag = 0x01;

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.8
//# STREAM Frame {
//#   Type (i) = 0x08..0x0f,
//#   Stream ID (i),
//#   [Offset (i)],
//#   [Length (i)],
//#   Stream Data (..),
//# }

#[derive(Debug, PartialEq, Eq)]
pub struct Stream<Data> {
    pub stream_id: VarInt,

    /// Byte offset of `data` within the stream
    pub offset: VarInt,

    /// If true, the frame is the last frame in the payload and omits its
    /// length field
    pub is_last_frame: bool,

    /// If true, the frame marks the end of the stream
    pub is_fin: bool,

    pub data: Data,
}

pub type StreamRef<'a> = Stream<&'a [u8]>;

impl<Data> Stream<Data> {
    #[inline]
    pub fn tag(&self) -> Tag {
        let mut tag = STREAM_TAG;

        if *self.offset != 0 {
            tag |= OFF_BIT;
        }
        if !self.is_last_frame {
            tag |= LEN_BIT;
        }
        if self.is_fin {
            tag |= FIN_BIT;
        }

        tag
    }

    /// Converts the stream data from one type to another
    #[inline]
    pub fn map_data<F: FnOnce(Data) -> Out, Out>(self, map: F) -> Stream<Out> {
        Stream {
            stream_id: self.stream_id,
            offset: self.offset,
            is_last_frame: self.is_last_frame,
            is_fin: self.is_fin,
            data: map(self.data),
        }
    }
}

impl<Data: EncoderValue> Stream<Data> {
    /// Tries to fit the frame into the provided capacity, updating
    /// `is_last_frame` in the process.
    ///
    /// If ok, the payload length that fits is returned.
    #[inline]
    pub fn try_fit(&mut self, capacity: usize) -> Result<usize, FitError> {
        let mut fixed_len = 0;
        fixed_len += size_of::<Tag>();
        fixed_len += self.stream_id.encoding_size();

        if self.offset != 0u64 {
            fixed_len += self.offset.encoding_size();
        }

        let remaining_capacity = capacity.checked_sub(fixed_len).ok_or(FitError)?;

        let data_len = self.data.encoding_size();
        let max_data_len = remaining_capacity.min(data_len);

        // data that fills the capacity exactly can omit its length field
        if max_data_len == remaining_capacity {
            self.is_last_frame = true;
            return Ok(max_data_len);
        }

        self.is_last_frame = false;

        let len_prefix_size = VarInt::try_from(max_data_len)
            .map_err(|_| FitError)?
            .encoding_size();

        let prefixed_data_len = remaining_capacity
            .checked_sub(len_prefix_size)
            .ok_or(FitError)?;

        Ok(prefixed_data_len.min(data_len))
    }
}

decoder_parameterized_value!(
    impl<'a, Data> Stream<Data> {
        fn decode(tag: Tag, buffer: Buffer) -> Result<Self> {
            let has_offset = tag & OFF_BIT == OFF_BIT;
            let is_last_frame = tag & LEN_BIT != LEN_BIT;
            let is_fin = tag & FIN_BIT == FIN_BIT;

            let (stream_id, buffer) = buffer.decode()?;

            let (offset, buffer) = if has_offset {
                buffer.decode()?
            } else {
                (Default::default(), buffer)
            };

            let (data, buffer) = if !is_last_frame {
                buffer.decode_with_len_prefix::<VarInt, Data>()?
            } else {
                let len = buffer.len();
                let (data, buffer) = buffer.decode_slice(len)?;
                let (data, remaining) = data.decode()?;
                remaining.ensure_empty()?;
                (data, buffer)
            };

            let frame = Stream {
                stream_id,
                offset,
                is_last_frame,
                is_fin,
                data,
            };

            Ok((frame, buffer))
        }
    }
);

impl<Data: EncoderValue> EncoderValue for Stream<Data> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.stream_id);

        if *self.offset != 0 {
            buffer.encode(&self.offset);
        }

        if self.is_last_frame {
            buffer.encode(&self.data);
        } else {
            buffer.encode_with_len_prefix::<VarInt, _>(&self.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use s2n_codec::{DecoderBuffer, EncoderBuffer};

    fn round_trip(frame: &Stream<&[u8]>) -> usize {
        let mut bytes = [0u8; 1500];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut bytes);
            encoder.encode(frame);
            encoder.len()
        };

        let (decoded, _) = Frame::decode(DecoderBuffer::new(&bytes[..len])).unwrap();
        match decoded {
            Frame::Stream(decoded) => assert_eq!(&decoded, frame),
            other => panic!("unexpected frame {other:?}"),
        }
        len
    }

    #[test]
    fn tag_bits() {
        let mut frame = Stream {
            stream_id: VarInt::from_u8(4),
            offset: VarInt::ZERO,
            is_last_frame: false,
            is_fin: false,
            data: &b"hello"[..],
        };
        assert_eq!(frame.tag(), 0x0a);
        round_trip(&frame);

        frame.offset = VarInt::from_u16(300);
        frame.is_fin = true;
        assert_eq!(frame.tag(), 0x0f);
        round_trip(&frame);

        frame.is_last_frame = true;
        assert_eq!(frame.tag(), 0x0d);
        round_trip(&frame);
    }

    #[test]
    fn try_fit_clamps_payload() {
        let data = [0u8; 1000];
        let mut frame = Stream {
            stream_id: VarInt::from_u8(0),
            offset: VarInt::ZERO,
            is_last_frame: false,
            is_fin: false,
            data: &data[..],
        };

        // plenty of room: everything fits and the length field is omitted
        // only when the data exactly fills the capacity
        let fitted = frame.try_fit(2000).unwrap();
        assert_eq!(fitted, 1000);

        // constrained: payload is clamped below the capacity
        let fitted = frame.try_fit(100).unwrap();
        frame.data = &data[..fitted];
        let len = round_trip(&frame);
        assert!(len <= 100, "encoded {len} bytes into capacity 100");

        // no room for the header at all
        assert!(frame.try_fit(1).is_err());
    }
}
