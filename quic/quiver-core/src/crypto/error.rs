// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;

//= https://www.rfc-editor.org/rfc/rfc9001#section-4.8
//# A TLS alert is converted into a QUIC connection error.

/// A TLS-level failure: an alert code plus a static reason
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CryptoError {
    pub code: u8,
    pub reason: &'static str,
}

impl CryptoError {
    pub const fn new(code: u8) -> Self {
        Self { code, reason: "" }
    }

    #[must_use]
    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }

    /// AEAD open failure; not a peer-visible alert
    pub const DECRYPT_ERROR: Self = Self::new(51).with_reason("decrypt error");
    /// Generic internal failure within the crypto provider
    pub const INTERNAL_ERROR: Self = Self::new(80).with_reason("internal error");
    /// The handshake message could not be parsed
    pub const DECODE_ERROR: Self = Self::new(50).with_reason("decode error");
    /// A required extension is missing
    pub const MISSING_EXTENSION: Self = Self::new(109).with_reason("missing extension");
    /// The handshake failed for lack of an acceptable offer
    pub const HANDSHAKE_FAILURE: Self = Self::new(40).with_reason("handshake failure");
    /// No application protocol overlapped with the peer
    pub const NO_APPLICATION_PROTOCOL: Self = Self::new(120).with_reason("no application protocol");
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "CryptoError({})", self.code)
        } else {
            f.write_str(self.reason)
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CryptoError {}

impl From<CryptoError> for crate::transport::Error {
    fn from(error: CryptoError) -> Self {
        Self::crypto_error(error.code).with_reason(error.reason)
    }
}
