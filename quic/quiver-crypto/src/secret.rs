// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! HKDF-Expand-Label plumbing shared by every key schedule step

use quiver_core::crypto::{label, CryptoError};
use ring::hkdf::{self, KeyType as _};
use zeroize::Zeroizing;

/// An output length for `HKDF-Expand`
struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// HKDF-Expand-Label(secret, label, "", len)
pub fn hkdf_expand_label(
    prk: &hkdf::Prk,
    label_bytes: &[u8],
    len: usize,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let mut info = [0u8; 32];
    let info_len = label::hkdf_label(len as u16, label_bytes, &mut info);

    let mut out = Zeroizing::new(vec![0u8; len]);
    prk.expand(&[&info[..info_len]], OkmLen(len))
        .and_then(|okm| okm.fill(&mut out))
        .map_err(|_| CryptoError::INTERNAL_ERROR.with_reason("hkdf expansion failed"))?;

    Ok(out)
}

/// Imports a raw traffic secret for further expansion
pub fn import_secret(algorithm: hkdf::Algorithm, secret: &[u8]) -> hkdf::Prk {
    hkdf::Prk::new_less_safe(algorithm, secret)
}

/// Derives the next-generation 1-RTT secret for a key update
///
//= https://www.rfc-editor.org/rfc/rfc9001#section-6.1
//# secret_<n+1> = HKDF-Expand-Label(secret_<n>, "quic ku",
//#                                  "", Hash.length)
pub fn next_secret(
    algorithm: hkdf::Algorithm,
    secret: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let prk = import_secret(algorithm, secret);
    hkdf_expand_label(&prk, label::QUIC_KU, algorithm.len())
}
