// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! ring-backed implementations of the packet-protection traits.
//!
//! Secrets flow in from TLS (or the initial-salt derivation), get expanded
//! into AEAD and header-protection keys here, and leave only as trait
//! objects; raw key material is zeroized on drop.

pub mod header_key;
pub mod initial;
pub mod key;
pub mod retry;
pub mod secret;
pub mod suite;

pub use suite::CipherSuite;

/// A pair of TLS traffic secrets for one encryption level
pub struct SecretPair {
    pub client: zeroize::Zeroizing<Vec<u8>>,
    pub server: zeroize::Zeroizing<Vec<u8>>,
}
