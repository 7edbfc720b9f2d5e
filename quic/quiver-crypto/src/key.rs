// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use quiver_core::crypto::{CryptoError, Key};
use ring::aead;

//= https://www.rfc-editor.org/rfc/rfc9001#section-6.6
//# For AEAD_AES_128_GCM and AEAD_AES_256_GCM, the confidentiality limit
//# is 2^23 encrypted packets.
const AES_GCM_CONFIDENTIALITY_LIMIT: u64 = 1 << 23;
//= https://www.rfc-editor.org/rfc/rfc9001#section-6.6
//# For AEAD_CHACHA20_POLY1305, the confidentiality limit is greater than
//# the number of possible packets (2^62) and so can be disregarded.
const CHACHA20_CONFIDENTIALITY_LIMIT: u64 = 1 << 62;

/// An AEAD packet-protection key for one direction
pub struct PacketKey {
    key: aead::LessSafeKey,
    iv: [u8; aead::NONCE_LEN],
    confidentiality_limit: u64,
}

impl PacketKey {
    pub(crate) fn new(
        algorithm: &'static aead::Algorithm,
        key_bytes: &[u8],
        iv: [u8; aead::NONCE_LEN],
    ) -> Result<Self, CryptoError> {
        let key = aead::UnboundKey::new(algorithm, key_bytes)
            .map_err(|_| CryptoError::INTERNAL_ERROR.with_reason("invalid key length"))?;

        let confidentiality_limit = if algorithm == &aead::CHACHA20_POLY1305 {
            CHACHA20_CONFIDENTIALITY_LIMIT
        } else {
            AES_GCM_CONFIDENTIALITY_LIMIT
        };

        Ok(Self {
            key: aead::LessSafeKey::new(key),
            iv,
            confidentiality_limit,
        })
    }

    //= https://www.rfc-editor.org/rfc/rfc9001#section-5.3
    //# The nonce, N, is formed by combining the packet protection IV with
    //# the packet number.  The 62 bits of the reconstructed QUIC packet
    //# number in network byte order are left-padded with zeros to the size
    //# of the IV.  The exclusive OR of the padded packet number and the IV
    //# forms the AEAD nonce.
    #[inline]
    fn nonce(&self, packet_number: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        for (nonce_byte, pn_byte) in nonce[aead::NONCE_LEN - 8..]
            .iter_mut()
            .zip(packet_number.to_be_bytes())
        {
            *nonce_byte ^= pn_byte;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }
}

impl Key for PacketKey {
    fn decrypt(
        &self,
        packet_number: u64,
        header: &[u8],
        payload: &mut [u8],
    ) -> Result<usize, CryptoError> {
        let nonce = self.nonce(packet_number);
        let aad = aead::Aad::from(header);
        let plaintext = self
            .key
            .open_in_place(nonce, aad, payload)
            .map_err(|_| CryptoError::DECRYPT_ERROR)?;
        Ok(plaintext.len())
    }

    fn encrypt(
        &self,
        packet_number: u64,
        header: &[u8],
        payload: &mut [u8],
    ) -> Result<(), CryptoError> {
        let nonce = self.nonce(packet_number);
        let aad = aead::Aad::from(header);
        let tag_len = self.key.algorithm().tag_len();
        let data_len = payload
            .len()
            .checked_sub(tag_len)
            .ok_or(CryptoError::INTERNAL_ERROR.with_reason("payload too short for tag"))?;

        let (data, tag_out) = payload.split_at_mut(data_len);
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, aad, data)
            .map_err(|_| CryptoError::INTERNAL_ERROR.with_reason("seal failed"))?;
        tag_out.copy_from_slice(tag.as_ref());
        Ok(())
    }

    fn tag_len(&self) -> usize {
        self.key.algorithm().tag_len()
    }

    fn aead_confidentiality_limit(&self) -> u64 {
        self.confidentiality_limit
    }
}

impl core::fmt::Debug for PacketKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PacketKey").finish_non_exhaustive()
    }
}
