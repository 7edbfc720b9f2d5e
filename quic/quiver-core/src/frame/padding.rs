// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::Tag;
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.1
//# A PADDING frame (type=0x00) has no semantic value.  PADDING frames
//# can be used to increase the size of a packet.

/// A run of PADDING bytes. Consecutive padding bytes decode into a single
/// frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Padding {
    pub length: usize,
}

impl Padding {
    pub const TAG: Tag = 0x00;

    #[inline]
    pub const fn tag(&self) -> Tag {
        Self::TAG
    }
}

decoder_parameterized_value!(
    impl<'a> Padding {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            let mut length = 1;
            // absorb the rest of the padding run
            while buffer.peek_byte(length - 1).ok() == Some(0) {
                length += 1;
            }
            let buffer = buffer.skip(length - 1)?;

            Ok((Padding { length }, buffer))
        }
    }
);

impl EncoderValue for Padding {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.write_repeated(self.length, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s2n_codec::DecoderBuffer;

    #[test]
    fn padding_run_decodes_as_one_frame() {
        let bytes = [0u8, 0, 0, 0, 1];
        let (frame, buffer) = crate::frame::Frame::decode(DecoderBuffer::new(&bytes)).unwrap();
        assert_eq!(frame, crate::frame::Frame::Padding(Padding { length: 4 }));
        assert_eq!(buffer.len(), 1);
    }
}
