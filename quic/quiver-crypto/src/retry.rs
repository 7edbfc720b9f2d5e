// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Retry packet integrity protection

use quiver_core::crypto::CryptoError;
use ring::aead;

pub const INTEGRITY_TAG_LEN: usize = 16;
pub type IntegrityTag = [u8; INTEGRITY_TAG_LEN];

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.8
//# The secret key, K, is 128 bits equal to
//# 0xbe0c690b9f66575a1d766b54e368c84e.
const SECRET_KEY: [u8; 16] = hex_literal::hex!("be0c690b9f66575a1d766b54e368c84e");

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.8
//# The nonce, N, is 96 bits equal to 0x461599d35d632bf2239825bb.
const NONCE: [u8; 12] = hex_literal::hex!("461599d35d632bf2239825bb");

fn retry_key() -> aead::LessSafeKey {
    let key = aead::UnboundKey::new(&aead::AES_128_GCM, &SECRET_KEY)
        .expect("fixed key material is valid");
    aead::LessSafeKey::new(key)
}

/// Builds the pseudo-packet the tag covers: the ODCID (length-prefixed)
/// followed by the Retry packet up to the tag
pub fn pseudo_packet(odcid: &[u8], retry_without_tag: &[u8]) -> Vec<u8> {
    let mut pseudo = Vec::with_capacity(1 + odcid.len() + retry_without_tag.len());
    pseudo.push(odcid.len() as u8);
    pseudo.extend_from_slice(odcid);
    pseudo.extend_from_slice(retry_without_tag);
    pseudo
}

/// Computes the integrity tag over a pseudo-packet
pub fn generate_tag(pseudo_packet: &[u8]) -> IntegrityTag {
    let nonce = aead::Nonce::assume_unique_for_key(NONCE);
    let tag = retry_key()
        .seal_in_place_separate_tag(nonce, aead::Aad::from(pseudo_packet), &mut [])
        .expect("sealing an empty payload cannot fail");

    let mut out = [0u8; INTEGRITY_TAG_LEN];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Validates the tag carried by a received Retry packet
pub fn validate(pseudo_packet: &[u8], tag: &IntegrityTag) -> Result<(), CryptoError> {
    use ring::constant_time;

    let expected = generate_tag(pseudo_packet);
    constant_time::verify_slices_are_equal(&expected, tag)
        .map_err(|_| CryptoError::DECRYPT_ERROR.with_reason("retry integrity tag mismatch"))
}
