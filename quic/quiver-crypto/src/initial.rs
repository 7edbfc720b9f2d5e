// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Initial packet protection, derived from the client's first destination
//! connection ID

use crate::{suite::key_pair, CipherSuite, SecretPair};
use quiver_core::{
    crypto::{label, CryptoError, KeyPair},
    endpoint,
};
use ring::hkdf::{self, KeyType as _};
use zeroize::Zeroizing;

use crate::secret::hkdf_expand_label;

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.2
//# initial_secret = HKDF-Extract(initial_salt,
//#                               client_dst_connection_id)
//#
//# client_initial_secret = HKDF-Expand-Label(initial_secret,
//#                                           "client in", "", Hash.length)
//# server_initial_secret = HKDF-Expand-Label(initial_secret,
//#                                           "server in", "", Hash.length)

/// Derives the client and server initial secrets for `version_salt`
pub fn initial_secrets(
    version_salt: &[u8],
    client_dcid: &[u8],
) -> Result<SecretPair, CryptoError> {
    let algorithm = hkdf::HKDF_SHA256;
    let salt = hkdf::Salt::new(algorithm, version_salt);
    let initial_secret = salt.extract(client_dcid);

    let client = hkdf_expand_label(&initial_secret, label::CLIENT_IN, algorithm.len())?;
    let server = hkdf_expand_label(&initial_secret, label::SERVER_IN, algorithm.len())?;

    Ok(SecretPair {
        client: Zeroizing::new(client.to_vec()),
        server: Zeroizing::new(server.to_vec()),
    })
}

/// Builds the Initial-level key pair for an endpoint.
///
/// Initial packets always use AES-128-GCM with SHA-256, regardless of what
/// the handshake later negotiates.
pub fn initial_key_pair(client_dcid: &[u8], local: endpoint::Type) -> Result<KeyPair, CryptoError> {
    let secrets = initial_secrets(&label::INITIAL_SALT_V1, client_dcid)?;
    key_pair(CipherSuite::Aes128GcmSha256, &secrets, local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use quiver_core::crypto::Key as _;

    //= https://www.rfc-editor.org/rfc/rfc9001#appendix-A.1
    //# The client's initial connection ID is 0x8394c8f03e515708.
    const EXAMPLE_DCID: [u8; 8] = hex!("8394c8f03e515708");

    //= https://www.rfc-editor.org/rfc/rfc9001#appendix-A.1
    //# client_initial_secret
    //#     = HKDF-Expand-Label(initial_secret, "client in", "", 32)
    //#     = c00cf151ca5be075ed0ebfb5c80323c4
    //#       2d6b7db67881289af4008f1f6c357aea
    const EXAMPLE_CLIENT_INITIAL_SECRET: [u8; 32] = hex!(
        "c00cf151ca5be075ed0ebfb5c80323c4 2d6b7db67881289af4008f1f6c357aea"
    );

    const EXAMPLE_SERVER_INITIAL_SECRET: [u8; 32] = hex!(
        "3c199828fd139efd216c155ad844cc81 fb82fa8d7446fa7d78be803acdda951b"
    );

    #[test]
    fn rfc9001_a1_secrets() {
        let secrets = initial_secrets(&label::INITIAL_SALT_V1, &EXAMPLE_DCID).unwrap();
        assert_eq!(&secrets.client[..], &EXAMPLE_CLIENT_INITIAL_SECRET[..]);
        assert_eq!(&secrets.server[..], &EXAMPLE_SERVER_INITIAL_SECRET[..]);
    }

    #[test]
    fn initial_pairs_interoperate() {
        let client = initial_key_pair(&EXAMPLE_DCID, endpoint::Type::Client).unwrap();
        let server = initial_key_pair(&EXAMPLE_DCID, endpoint::Type::Server).unwrap();

        let header = [0xc3u8, 0, 0, 0, 1];
        let tag_len = client.sealer.tag_len();
        let mut payload = b"client hello".to_vec();
        payload.resize(payload.len() + tag_len, 0);

        client.sealer.encrypt(0, &header, &mut payload).unwrap();
        assert_ne!(&payload[..12], b"client hello");

        let len = server.opener.decrypt(0, &header, &mut payload).unwrap();
        assert_eq!(&payload[..len], b"client hello");

        // tampering with the header breaks the AEAD
        let mut tampered = b"client hello".to_vec();
        tampered.resize(tampered.len() + tag_len, 0);
        client.sealer.encrypt(1, &header, &mut tampered).unwrap();
        let bad_header = [0xc2u8, 0, 0, 0, 1];
        assert!(server.opener.decrypt(1, &bad_header, &mut tampered).is_err());
    }

    #[test]
    fn header_keys_produce_equal_masks() {
        use quiver_core::crypto::HeaderKey as _;

        let client = initial_key_pair(&EXAMPLE_DCID, endpoint::Type::Client).unwrap();
        let server = initial_key_pair(&EXAMPLE_DCID, endpoint::Type::Server).unwrap();

        let sample = [7u8; 16];
        let sealed = client.sealer_header.protection_mask(&sample).unwrap();
        let opened = server.opener_header.protection_mask(&sample).unwrap();
        assert_eq!(sealed, opened);
    }
}
