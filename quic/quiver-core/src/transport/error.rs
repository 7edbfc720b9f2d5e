// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::varint::{VarInt, VarIntError};
use core::fmt;
use s2n_codec::DecoderError;

//= https://www.rfc-editor.org/rfc/rfc9000#section-20.1
//# QUIC transport error codes and application error codes are 62-bit
//# unsigned integers.

/// A QUIC transport-level error: a code, the frame type that provoked it
/// (when known), and a static reason for logs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Error {
    pub code: VarInt,
    pub frame_type: Option<VarInt>,
    pub reason: &'static str,
}

impl Error {
    pub const fn new(code: VarInt) -> Self {
        Self {
            code,
            frame_type: None,
            reason: "",
        }
    }

    #[must_use]
    pub const fn with_frame_type(mut self, frame_type: VarInt) -> Self {
        self.frame_type = Some(frame_type);
        self
    }

    #[must_use]
    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }

    /// A TLS alert carried as a transport error
    ///
    //= https://www.rfc-editor.org/rfc/rfc9001#section-4.8
    //# A TLS alert is converted into a QUIC connection error.  The
    //# AlertDescription value is added to 0x0100 to produce a QUIC error
    //# code from the range reserved for CRYPTO_ERROR.
    #[inline]
    pub const fn crypto_error(alert: u8) -> Self {
        Self::new(VarInt::from_u16(0x100 + alert as u16))
    }

    /// True if the code is within the CRYPTO_ERROR range
    #[inline]
    pub fn is_crypto_error(&self) -> bool {
        (0x100..=0x1ff).contains(&self.code.as_u64())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "TransportError({})", self.code)
        } else {
            f.write_str(self.reason)
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

macro_rules! def_error {
    ($(#[doc = $doc:expr])* $name:ident, $code:expr) => {
        impl Error {
            $(#[doc = $doc])*
            pub const $name: Self = Self::new(VarInt::from_u8($code));
        }
    };
}

def_error!(
    /// The connection is being closed abruptly in the absence of any error
    NO_ERROR,
    0x0
);
def_error!(
    /// The endpoint encountered an internal error and cannot continue
    INTERNAL_ERROR,
    0x1
);
def_error!(
    /// The server is currently busy and does not accept any new connections
    SERVER_BUSY,
    0x2
);
def_error!(
    /// More data was received than the advertised data limits allow
    FLOW_CONTROL_ERROR,
    0x3
);
def_error!(
    /// A frame arrived for a stream identifier above the advertised stream limit
    STREAM_LIMIT_ERROR,
    0x4
);
def_error!(
    /// A frame arrived for a stream in a state that does not permit it
    STREAM_STATE_ERROR,
    0x5
);
def_error!(
    /// Stream data contradicted an established final size
    FINAL_SIZE_ERROR,
    0x6
);
def_error!(
    /// A malformed frame was received
    FRAME_ENCODING_ERROR,
    0x7
);
def_error!(
    /// Transport parameters were malformed, duplicated, or out of range
    TRANSPORT_PARAMETER_ERROR,
    0x8
);
def_error!(
    /// More connection IDs were retired than the limit permits
    CONNECTION_ID_LIMIT_ERROR,
    0x9
);
def_error!(
    /// The peer violated a protocol requirement without a more specific code
    PROTOCOL_VIOLATION,
    0xa
);
def_error!(
    /// An invalid Retry token was received
    INVALID_TOKEN,
    0xb
);
def_error!(
    /// The application or application protocol caused the connection to close
    APPLICATION_ERROR,
    0xc
);
def_error!(
    /// More CRYPTO stream data was received than can be buffered
    CRYPTO_BUFFER_EXCEEDED,
    0xd
);
def_error!(
    /// A key update could not be performed
    KEY_UPDATE_ERROR,
    0xe
);
def_error!(
    /// The AEAD confidentiality or integrity limit was reached
    AEAD_LIMIT_REACHED,
    0xf
);
def_error!(
    /// No viable network path exists
    NO_VIABLE_PATH,
    0x10
);

impl From<DecoderError> for Error {
    fn from(error: DecoderError) -> Self {
        match error {
            DecoderError::InvariantViolation(reason) => {
                Self::PROTOCOL_VIOLATION.with_reason(reason)
            }
            _ => Self::FRAME_ENCODING_ERROR.with_reason("malformed encoding"),
        }
    }
}

impl From<VarIntError> for Error {
    fn from(_: VarIntError) -> Self {
        Self::INTERNAL_ERROR.with_reason("varint range exceeded")
    }
}

/// An opaque 62-bit application error code, surfaced to the peer in
/// CONNECTION_CLOSE (type 0x1d) or RESET_STREAM frames
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApplicationError(pub VarInt);

impl From<VarInt> for ApplicationError {
    #[inline]
    fn from(code: VarInt) -> Self {
        Self(code)
    }
}

impl From<ApplicationError> for VarInt {
    #[inline]
    fn from(error: ApplicationError) -> Self {
        error.0
    }
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ApplicationError({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_error_range() {
        let error = Error::crypto_error(47);
        assert_eq!(error.code.as_u64(), 0x12f);
        assert!(error.is_crypto_error());
        assert!(!Error::PROTOCOL_VIOLATION.is_crypto_error());
    }

    #[test]
    fn builders() {
        let error = Error::FLOW_CONTROL_ERROR
            .with_frame_type(VarInt::from_u8(0x08))
            .with_reason("stream data beyond limit");
        assert_eq!(error.code, Error::FLOW_CONTROL_ERROR.code);
        assert_eq!(error.frame_type, Some(VarInt::from_u8(0x08)));
    }
}
