// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! QUIC connection IDs

use s2n_codec::{decoder_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc9000#section-17.2
//# In QUIC version 1, this value MUST NOT exceed 20 bytes.

/// The maximum size of a connection ID
pub const MAX_LEN: usize = 20;

/// The minimum length of a locally-issued connection ID that still allows
/// the binding to demultiplex reliably
pub const MIN_LOCAL_ID_LEN: usize = 8;

/// The length of a stateless reset token
pub const RESET_TOKEN_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Error(&'static str);

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.write_str(self.0)
    }
}

macro_rules! id {
    ($type:ident, $min_len:expr) => {
        /// A connection ID: an opaque byte string of at most 20 bytes
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $type {
            bytes: [u8; MAX_LEN],
            len: u8,
        }

        impl core::fmt::Debug for $type {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}({:?})", stringify!($type), self.as_bytes())
            }
        }

        impl $type {
            /// The minimum length for this connection ID type
            pub const MIN_LEN: usize = $min_len;

            #[inline]
            pub fn try_from_bytes(bytes: &[u8]) -> Option<$type> {
                Self::try_from(bytes).ok()
            }

            #[inline]
            pub fn as_bytes(&self) -> &[u8] {
                &self.bytes[..self.len as usize]
            }

            #[inline]
            pub const fn len(&self) -> usize {
                self.len as usize
            }

            #[inline]
            pub const fn is_empty(&self) -> bool {
                self.len == 0
            }
        }

        impl AsRef<[u8]> for $type {
            #[inline]
            fn as_ref(&self) -> &[u8] {
                self.as_bytes()
            }
        }

        impl TryFrom<&[u8]> for $type {
            type Error = Error;

            #[inline]
            fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
                if slice.len() > MAX_LEN {
                    return Err(Error("connection id exceeds 20 bytes"));
                }
                if slice.len() < Self::MIN_LEN {
                    return Err(Error("connection id too short"));
                }
                let mut bytes = [0u8; MAX_LEN];
                bytes[..slice.len()].copy_from_slice(slice);
                Ok(Self {
                    bytes,
                    len: slice.len() as u8,
                })
            }
        }

        decoder_value!(
            impl<'a> $type {
                fn decode(buffer: Buffer) -> Result<Self> {
                    let (data, buffer) = buffer.decode_slice_with_len_prefix::<u8>()?;
                    let data = data.into_less_safe_slice();
                    let id = $type::try_from(&*data).map_err(|err| {
                        s2n_codec::DecoderError::InvariantViolation(err.0)
                    })?;
                    Ok((id, buffer))
                }
            }
        );

        impl EncoderValue for $type {
            /// Encodes the id with its one-byte length prefix
            #[inline]
            fn encode<E: Encoder>(&self, encoder: &mut E) {
                encoder.encode(&self.len);
                encoder.write_slice(self.as_bytes());
            }
        }
    };
}

// An id issued by this endpoint. Zero-length local ids are not issued: the
// binding demultiplexes by them.
id!(LocalId, MIN_LOCAL_ID_LEN);
// An id issued by the peer; may be empty
id!(PeerId, 0);

impl PeerId {
    /// The sentinel used before the peer has supplied any id
    pub const EMPTY: Self = Self {
        bytes: [0; MAX_LEN],
        len: 0,
    };
}

impl From<LocalId> for PeerId {
    #[inline]
    fn from(id: LocalId) -> Self {
        Self {
            bytes: id.bytes,
            len: id.len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_bounds() {
        assert!(LocalId::try_from_bytes(&[0u8; 21]).is_none());
        assert!(LocalId::try_from_bytes(&[0u8; 7]).is_none());
        assert!(LocalId::try_from_bytes(&[0u8; 8]).is_some());
        assert!(LocalId::try_from_bytes(&[0u8; 20]).is_some());

        assert!(PeerId::try_from_bytes(&[]).is_some());
        assert_eq!(PeerId::EMPTY.len(), 0);
    }

    #[test]
    fn codec_round_trip() {
        use s2n_codec::{DecoderBuffer, EncoderBuffer};

        let id = LocalId::try_from_bytes(&[7u8; 11]).unwrap();
        let mut buffer = [0u8; MAX_LEN + 1];
        let len = {
            let mut encoder = EncoderBuffer::new(&mut buffer);
            encoder.encode(&id);
            encoder.len()
        };
        assert_eq!(len, 12);

        let (decoded, remaining) = DecoderBuffer::new(&buffer[..len])
            .decode::<LocalId>()
            .unwrap();
        assert!(remaining.is_empty());
        assert_eq!(decoded, id);
    }
}
