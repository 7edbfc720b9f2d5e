// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Key-schedule expansion for the negotiated cipher suites

use crate::{
    header_key::HeaderProtectionKey,
    key::PacketKey,
    secret::{hkdf_expand_label, import_secret, next_secret},
    SecretPair,
};
use quiver_core::{
    crypto::{label, CryptoError, KeyPair},
    endpoint,
};
use ring::{aead, aead::quic, hkdf};
use zeroize::Zeroizing;

/// The TLS 1.3 cipher suites this engine negotiates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherSuite {
    Aes128GcmSha256,
    Aes256GcmSha384,
    ChaCha20Poly1305Sha256,
}

impl CipherSuite {
    #[inline]
    pub(crate) fn aead(self) -> &'static aead::Algorithm {
        match self {
            Self::Aes128GcmSha256 => &aead::AES_128_GCM,
            Self::Aes256GcmSha384 => &aead::AES_256_GCM,
            Self::ChaCha20Poly1305Sha256 => &aead::CHACHA20_POLY1305,
        }
    }

    #[inline]
    pub(crate) fn header_protection(self) -> &'static quic::Algorithm {
        match self {
            Self::Aes128GcmSha256 => &quic::AES_128,
            Self::Aes256GcmSha384 => &quic::AES_256,
            Self::ChaCha20Poly1305Sha256 => &quic::CHACHA20,
        }
    }

    #[inline]
    pub(crate) fn hkdf(self) -> hkdf::Algorithm {
        match self {
            Self::Aes128GcmSha256 | Self::ChaCha20Poly1305Sha256 => hkdf::HKDF_SHA256,
            Self::Aes256GcmSha384 => hkdf::HKDF_SHA384,
        }
    }

    #[inline]
    fn key_len(self) -> usize {
        self.aead().key_len()
    }
}

/// Expands one traffic secret into its AEAD and header-protection keys
pub(crate) fn expand_secret(
    suite: CipherSuite,
    secret: &[u8],
) -> Result<(PacketKey, HeaderProtectionKey), CryptoError> {
    let prk = import_secret(suite.hkdf(), secret);

    let key_bytes = hkdf_expand_label(&prk, label::QUIC_KEY, suite.key_len())?;
    let iv_bytes = hkdf_expand_label(&prk, label::QUIC_IV, aead::NONCE_LEN)?;
    let hp_bytes = hkdf_expand_label(&prk, label::QUIC_HP, suite.key_len())?;

    let mut iv = [0u8; aead::NONCE_LEN];
    iv.copy_from_slice(&iv_bytes);

    let key = PacketKey::new(suite.aead(), &key_bytes, iv)?;
    let header_key = HeaderProtectionKey::new(suite.header_protection(), &hp_bytes)?;
    Ok((key, header_key))
}

/// Builds the directional key pair for one encryption level.
///
/// The sealer is always this endpoint's own direction: a client seals with
/// the client secret and opens with the server secret.
pub fn key_pair(
    suite: CipherSuite,
    secrets: &SecretPair,
    local: endpoint::Type,
) -> Result<KeyPair, CryptoError> {
    let (client_key, client_header) = expand_secret(suite, &secrets.client)?;
    let (server_key, server_header) = expand_secret(suite, &secrets.server)?;

    let pair = match local {
        endpoint::Type::Client => KeyPair {
            sealer: Box::new(client_key),
            opener: Box::new(server_key),
            sealer_header: Box::new(client_header),
            opener_header: Box::new(server_header),
        },
        endpoint::Type::Server => KeyPair {
            sealer: Box::new(server_key),
            opener: Box::new(client_key),
            sealer_header: Box::new(server_header),
            opener_header: Box::new(client_header),
        },
    };
    Ok(pair)
}

/// Derives the next-generation secrets for a 1-RTT key update.
///
/// Header protection keys are not updated; only the packet keys rotate.
pub fn update_secrets(
    suite: CipherSuite,
    secrets: &SecretPair,
) -> Result<SecretPair, CryptoError> {
    Ok(SecretPair {
        client: next_secret(suite.hkdf(), &secrets.client)?,
        server: next_secret(suite.hkdf(), &secrets.server)?,
    })
}

/// Expands updated secrets into packet keys only
pub fn updated_packet_keys(
    suite: CipherSuite,
    secrets: &SecretPair,
    local: endpoint::Type,
) -> Result<(PacketKey, PacketKey), CryptoError> {
    let (client_key, _) = expand_secret(suite, &secrets.client)?;
    let (server_key, _) = expand_secret(suite, &secrets.server)?;

    Ok(match local {
        endpoint::Type::Client => (client_key, server_key),
        endpoint::Type::Server => (server_key, client_key),
    })
}

/// Copies a raw secret into an owned, zeroized buffer
pub fn secret_from_slice(secret: &[u8]) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(secret.to_vec())
}
