// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use quiver_core::crypto::{CryptoError, HeaderKey};
use ring::aead::quic;

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.4.2
//# in sampling packet ciphertext for header protection, the Packet Number field is
//# assumed to be 4 bytes long

/// The number of ciphertext bytes sampled for the protection mask
pub const SAMPLE_LEN: usize = 16;

/// A header-protection key for one direction
pub struct HeaderProtectionKey {
    key: quic::HeaderProtectionKey,
}

impl HeaderProtectionKey {
    pub(crate) fn new(
        algorithm: &'static quic::Algorithm,
        key_bytes: &[u8],
    ) -> Result<Self, CryptoError> {
        let key = quic::HeaderProtectionKey::new(algorithm, key_bytes)
            .map_err(|_| CryptoError::INTERNAL_ERROR.with_reason("invalid hp key length"))?;
        Ok(Self { key })
    }
}

impl HeaderKey for HeaderProtectionKey {
    fn protection_mask(&self, sample: &[u8]) -> Result<[u8; 5], CryptoError> {
        self.key
            .new_mask(sample)
            .map_err(|_| CryptoError::INTERNAL_ERROR.with_reason("header mask failed"))
    }

    fn sample_len(&self) -> usize {
        SAMPLE_LEN
    }
}

impl core::fmt::Debug for HeaderProtectionKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HeaderProtectionKey").finish_non_exhaustive()
    }
}
