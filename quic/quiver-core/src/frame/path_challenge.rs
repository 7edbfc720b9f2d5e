// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::frame::Tag;
use s2n_codec::{Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.17
//# Endpoints can use PATH_CHALLENGE frames (type=0x1a) to check
//# reachability to the peer and for path validation during connection
//# migration.

/// The length of the unpredictable challenge payload
pub const DATA_LEN: usize = 8;

macro_rules! path_frame {
    ($name:ident, $tag:expr) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub struct $name<'a> {
            pub data: &'a [u8; DATA_LEN],
        }

        impl<'a> $name<'a> {
            pub const TAG: Tag = $tag;

            #[inline]
            pub const fn tag(&self) -> Tag {
                Self::TAG
            }
        }

        s2n_codec::decoder_parameterized_value!(
            impl<'a> $name<'a> {
                fn decode(_tag: Tag, buffer: Buffer) -> Result<Self> {
                    let (data, buffer) = buffer.decode_slice(DATA_LEN)?;
                    let data: &[u8] = data.into_less_safe_slice();
                    let data = data.try_into().expect("slice len already checked");

                    Ok(($name { data }, buffer))
                }
            }
        );

        impl<'a> EncoderValue for $name<'a> {
            #[inline]
            fn encode<E: Encoder>(&self, buffer: &mut E) {
                buffer.encode(&self.tag());
                buffer.write_slice(self.data);
            }
        }
    };
}

path_frame!(PathChallenge, 0x1a);

//= https://www.rfc-editor.org/rfc/rfc9000#section-19.18
//# A PATH_RESPONSE frame (type=0x1b) is sent in response to a
//# PATH_CHALLENGE frame.  Its format...is identical to the PATH_CHALLENGE frame.

path_frame!(PathResponse, 0x1b);

impl<'a> PathChallenge<'a> {
    /// Builds the matching response
    #[inline]
    pub fn response(&self) -> PathResponse<'a> {
        PathResponse { data: self.data }
    }
}
