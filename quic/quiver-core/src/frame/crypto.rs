// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{FitError, Tag},
    varint::VarInt,
};
use core::mem::size_of;
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.6
//# A CRYPTO frame (type=0x06) is used to transmit cryptographic
//# handshake messages.

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.6
//# CRYPTO Frame {
//#   Type (i) = 0x06,
//#   Offset (i),
//#   Length (i),
//#   Crypto Data (..),
//# }

#[derive(Debug, PartialEq, Eq)]
pub struct Crypto<Data> {
    /// Byte offset of `data` within the crypto stream of the packet's
    /// encryption level
    pub offset: VarInt,

    /// The cryptographic message data
    pub data: Data,
}

pub type CryptoRef<'a> = Crypto<&'a [u8]>;

impl<Data> Crypto<Data> {
    pub const TAG: Tag = 0x06;

    #[inline]
    pub const fn tag(&self) -> Tag {
        Self::TAG
    }

    /// Converts the crypto data from one type to another
    #[inline]
    pub fn map_data<F: FnOnce(Data) -> Out, Out>(self, map: F) -> Crypto<Out> {
        Crypto {
            offset: self.offset,
            data: map(self.data),
        }
    }
}

impl<Data: EncoderValue> Crypto<Data> {
    /// Tries to fit the frame into the provided capacity
    ///
    /// If ok, the payload length that fits is returned.
    #[inline]
    pub fn try_fit(&self, capacity: usize) -> Result<usize, FitError> {
        let mut fixed_len = 0;
        fixed_len += size_of::<Tag>();
        fixed_len += self.offset.encoding_size();

        let remaining_capacity = capacity.checked_sub(fixed_len).ok_or(FitError)?;

        let data_len = self.data.encoding_size();
        let max_data_len = remaining_capacity.min(data_len);

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
    impl<'a, Data> Crypto<Data> {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            let (offset, buffer) = buffer.decode()?;
            let (data, buffer) = buffer.decode_with_len_prefix::<VarInt, Data>()?;

            let frame = Crypto { offset, data };

            Ok((frame, buffer))
        }
    }
);

impl<Data: EncoderValue> EncoderValue for Crypto<Data> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.offset);
        buffer.encode_with_len_prefix::<VarInt, _>(&self.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use s2n_codec::{DecoderBuffer, EncoderBuffer};

    #[test]
    fn round_trip() {
        let frame = Crypto {
            offset: VarInt::from_u16(1200),
            data: &b"client hello"[..],
        };

        let mut bytes = [0u8; 64];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut bytes);
            encoder.encode(&frame);
            encoder.len()
        };

        let (decoded, remaining) = Frame::decode(DecoderBuffer::new(&bytes[..len])).unwrap();
        assert!(remaining.is_empty());
        assert_eq!(decoded, Frame::Crypto(frame));
    }

    #[test]
    fn try_fit_accounts_for_header() {
        let data = [0u8; 200];
        let frame = Crypto {
            offset: VarInt::from_u8(0),
            data: &data[..],
        };

        // tag(1) + offset(1) + len(1) leaves 61 bytes of payload
        assert_eq!(frame.try_fit(64).unwrap(), 61);
        assert_eq!(frame.try_fit(203).unwrap(), 199);
        assert_eq!(frame.try_fit(204).unwrap(), 200);
        assert!(frame.try_fit(2).is_err());
    }
}
