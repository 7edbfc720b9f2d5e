// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! HKDF-Expand-Label inputs used for QUIC packet protection

use hex_literal::hex;

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.2
//# initial_salt = 0x38762cf7f55934b34d179ae6a4c80cadccbb7f0a

/// The version 1 initial salt
pub const INITIAL_SALT_V1: [u8; 20] = hex!("38762cf7f55934b34d179ae6a4c80cadccbb7f0a");

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.2
//# client_initial_secret = HKDF-Expand-Label(initial_secret,
//#                                           "client in", "", Hash.length)

pub const CLIENT_IN: &[u8] = b"client in";
pub const SERVER_IN: &[u8] = b"server in";

//= https://www.rfc-editor.org/rfc/rfc9001#section-5.1
//# The current encryption level secret and the label "quic key" are
//# input to the KDF to produce the AEAD key; the label "quic iv" is used
//# to derive the Initialization Vector (IV); see Section 5.3.  The
//# header protection key uses the "quic hp" label; see Section 5.4.

pub const QUIC_KEY: &[u8] = b"quic key";
pub const QUIC_IV: &[u8] = b"quic iv";
pub const QUIC_HP: &[u8] = b"quic hp";

//= https://www.rfc-editor.org/rfc/rfc9001#section-6.1
//# secret_<n+1> = HKDF-Expand-Label(secret_<n>, "quic ku",
//#                                  "", Hash.length)

pub const QUIC_KU: &[u8] = b"quic ku";

/// Builds the TLS 1.3 `HkdfLabel` structure for HKDF-Expand-Label
///
/// Returns the encoded length; `out` must hold at least
/// `2 + 1 + 6 + label.len() + 1` bytes.
pub fn hkdf_label(output_len: u16, label: &[u8], out: &mut [u8]) -> usize {
    const PREFIX: &[u8] = b"tls13 ";

    let mut cursor = 0;
    out[cursor..cursor + 2].copy_from_slice(&output_len.to_be_bytes());
    cursor += 2;
    out[cursor] = (PREFIX.len() + label.len()) as u8;
    cursor += 1;
    out[cursor..cursor + PREFIX.len()].copy_from_slice(PREFIX);
    cursor += PREFIX.len();
    out[cursor..cursor + label.len()].copy_from_slice(label);
    cursor += label.len();
    out[cursor] = 0; // empty context
    cursor += 1;
    cursor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_layout() {
        let mut out = [0u8; 32];
        let len = hkdf_label(32, QUIC_KEY, &mut out);
        assert_eq!(&out[..len], b"\x00\x20\x0etls13 quic key\x00");
    }
}
