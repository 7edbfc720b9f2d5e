// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{connection::id, frame::Tag, varint::VarInt};
use s2n_codec::{decoder_invariant, decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
//# An endpoint sends a NEW_CONNECTION_ID frame (type=0x18) to provide
//# its peer with alternative connection IDs that can be used to break
//# linkability when migrating connections.

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
//# NEW_CONNECTION_ID Frame {
//#   Type (i) = 0x18,
//#   Sequence Number (i),
//#   Retire Prior To (i),
//#   Length (8),
//#   Connection ID (8..160),
//#   Stateless Reset Token (128),
//# }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewConnectionId<'a> {
    /// The sequence number assigned to the connection ID by the sender
    pub sequence_number: VarInt,

    /// The sequence number below which all connection IDs are retired
    pub retire_prior_to: VarInt,

    /// The new connection ID (1..=20 bytes)
    pub connection_id: &'a [u8],

    /// A token usable for a stateless reset targeting this connection ID
    pub stateless_reset_token: &'a [u8; id::RESET_TOKEN_LEN],
}

impl<'a> NewConnectionId<'a> {
    pub const TAG: Tag = 0x18;

    #[inline]
    pub const fn tag(&self) -> Tag {
        Self::TAG
    }
}

decoder_parameterized_value!(
    impl<'a> NewConnectionId<'a> {
        fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
            let (sequence_number, buffer) = buffer.decode::<VarInt>()?;
            let (retire_prior_to, buffer) = buffer.decode::<VarInt>()?;

            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.15
            //# The value in the Retire Prior To field MUST be less than or equal
            //# to the value in the Sequence Number field.
            decoder_invariant!(
                retire_prior_to <= sequence_number,
                "retire_prior_to exceeds sequence_number"
            );

            let (connection_id, buffer) = buffer.decode_slice_with_len_prefix::<u8>()?;
            let connection_id = connection_id.into_less_safe_slice();
            decoder_invariant!(
                (1..=id::MAX_LEN).contains(&connection_id.len()),
                "invalid connection id length"
            );

            let (stateless_reset_token, buffer) = buffer.decode_slice(id::RESET_TOKEN_LEN)?;
            let stateless_reset_token: &[u8] = stateless_reset_token.into_less_safe_slice();
            let stateless_reset_token = stateless_reset_token
                .try_into()
                .expect("slice len already checked");

            let frame = NewConnectionId {
                sequence_number,
                retire_prior_to,
                connection_id: &*connection_id,
                stateless_reset_token,
            };

            Ok((frame, buffer))
        }
    }
);

impl<'a> EncoderValue for NewConnectionId<'a> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.tag());
        buffer.encode(&self.sequence_number);
        buffer.encode(&self.retire_prior_to);
        buffer.encode(&(self.connection_id.len() as u8));
        buffer.write_slice(self.connection_id);
        buffer.write_slice(self.stateless_reset_token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use s2n_codec::{DecoderBuffer, EncoderBuffer};

    #[test]
    fn round_trip() {
        let token = [0xabu8; id::RESET_TOKEN_LEN];
        let frame = NewConnectionId {
            sequence_number: VarInt::from_u8(3),
            retire_prior_to: VarInt::from_u8(1),
            connection_id: &[1, 2, 3, 4, 5, 6, 7, 8],
            stateless_reset_token: &token,
        };

        let mut bytes = [0u8; 64];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut bytes);
            encoder.encode(&frame);
            encoder.len()
        };

        let (decoded, _) = Frame::decode(DecoderBuffer::new(&bytes[..len])).unwrap();
        assert_eq!(decoded, Frame::NewConnectionId(frame));
    }

    #[test]
    fn rejects_retire_above_sequence() {
        // sequence=1, retire_prior_to=2
        let bytes = [0x18u8, 0x01, 0x02, 0x01, 0xaa];
        assert!(Frame::decode(DecoderBuffer::new(&bytes)).is_err());
    }
}
