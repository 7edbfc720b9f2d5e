// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{FitError, Tag},
    varint::VarInt,
};
use core::mem::size_of;
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9221#section-4
//# DATAGRAM frames are used to transmit application data in an
//# unreliable manner.

const DATAGRAM_TAG: Tag = 0x30;

/// Set when a Length field is present
const LEN_BIT: Tag = 0x01;

//= https://www.rfc-editor.org/rfc/rfc9221#section-4
//# DATAGRAM Frame {
//#   Type (i) = 0x30..0x31,
//#   [Length (i)],
//#   Datagram Data (..),
//# }

#[derive(Debug, PartialEq, Eq)]
pub struct Datagram<Data> {
    /// If true, the frame is the last frame in the payload and omits its
    /// length field
    pub is_last_frame: bool,

    pub data: Data,
}

impl<Data> Datagram<Data> {
    #[inline]
    pub fn tag(&self) -> Tag {
        if self.is_last_frame {
            DATAGRAM_TAG
        } else {
            DATAGRAM_TAG | LEN_BIT
        }
    }

    /// Converts the datagram data from one type to another
    #[inline]
    pub fn map_data<F: FnOnce(Data) -> Out, Out>(self, map: F) -> Datagram<Out> {
        Datagram {
            is_last_frame: self.is_last_frame,
            data: map(self.data),
        }
    }
}

impl<Data: EncoderValue> Datagram<Data> {
    /// Tries to fit the frame into the provided capacity; datagrams are
    /// never truncated, so this either fits the whole payload or fails
    #[inline]
    pub fn try_fit(&mut self, capacity: usize) -> Result<usize, FitError> {
        let data_len = self.data.encoding_size();

        let mut fixed_len = size_of::<Tag>();
        fixed_len += data_len;

        let remaining = capacity.checked_sub(fixed_len).ok_or(FitError)?;

        if remaining == 0 {
            self.is_last_frame = true;
            return Ok(data_len);
        }

        self.is_last_frame = false;
        let len_prefix_size = VarInt::try_from(data_len)
            .map_err(|_| FitError)?
            .encoding_size();
        if len_prefix_size > remaining {
            return Err(FitError);
        }

        Ok(data_len)
    }
}

decoder_parameterized_value!(
    impl<'a, Data> Datagram<Data> {
        fn decode(tag: Tag, buffer: Buffer) -> Result<Self> {
            let is_last_frame = tag & LEN_BIT != LEN_BIT;

            let (data, buffer) = if !is_last_frame {
                buffer.decode_with_len_prefix::<VarInt, Data>()?
            } else {
                let len = buffer.len();
                let (data, buffer) = buffer.decode_slice(len)?;
                let (data, remaining) = data.decode()?;
                remaining.ensure_empty()?;
                (data, buffer)
            };

            let frame = Datagram {
                is_last_frame,
                data,
            };

            Ok((frame, buffer))
        }
    }
);

impl<Data: EncoderValue> EncoderValue for Datagram<Data> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());

        if self.is_last_frame {
            buffer.encode(&self.data);
        } else {
            buffer.encode_with_len_prefix::<VarInt, _>(&self.data);
        }
    }
}
