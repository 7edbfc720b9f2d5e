// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Packet-protection key slots.
//!
//! One slot per encryption level, plus staged (`next`) and retired (`old`)
//! 1-RTT slots for key updates. Header-protection keys only ever move
//! forward: the retired slot keeps the packet key for delayed packets but
//! never the header key.

use quiver_core::{
    crypto::{CryptoError, EncryptionLevel, KeyPhase, KeyPair, AEAD_INTEGRITY_FAILURE_LIMIT},
    transport::Error,
};

#[derive(Debug)]
pub struct KeySet {
    keys: [Option<KeyPair>; EncryptionLevel::COUNT],
    /// Staged keys for the next 1-RTT phase
    one_rtt_next: Option<KeyPair>,
    /// Retired packet keys kept briefly for delayed packets
    one_rtt_old: Option<KeyPair>,
    key_phase: KeyPhase,
    /// Bytes protected under the current 1-RTT key
    bytes_sent_on_key: u64,
    /// Lifetime AEAD open failures
    decryption_failures: u64,
    key_update_count: u64,
}

impl Default for KeySet {
    fn default() -> Self {
        Self {
            keys: [None, None, None, None],
            one_rtt_next: None,
            one_rtt_old: None,
            key_phase: KeyPhase::Zero,
            bytes_sent_on_key: 0,
            decryption_failures: 0,
            key_update_count: 0,
        }
    }
}

impl KeySet {
    /// Installs the key pair for a level
    pub fn install(&mut self, level: EncryptionLevel, keys: KeyPair) {
        self.keys[level.as_index()] = Some(keys);
    }

    /// Discards a level's keys entirely; idempotent
    pub fn discard(&mut self, level: EncryptionLevel) -> bool {
        debug_assert_ne!(level, EncryptionLevel::OneRtt, "1-RTT keys only rotate");
        self.keys[level.as_index()].take().is_some()
    }

    #[inline]
    pub fn has_keys(&self, level: EncryptionLevel) -> bool {
        self.keys[level.as_index()].is_some()
    }

    #[inline]
    pub fn keys(&self, level: EncryptionLevel) -> Option<&KeyPair> {
        self.keys[level.as_index()].as_ref()
    }

    #[inline]
    pub fn key_phase(&self) -> KeyPhase {
        self.key_phase
    }

    #[inline]
    pub fn key_update_count(&self) -> u64 {
        self.key_update_count
    }

    /// Stages the next-generation 1-RTT keys
    pub fn stage_key_update(&mut self, keys: KeyPair) {
        debug_assert!(self.has_keys(EncryptionLevel::OneRtt));
        self.one_rtt_next = Some(keys);
    }

    #[inline]
    pub fn key_update_staged(&self) -> bool {
        self.one_rtt_next.is_some()
    }

    /// Rotates to the staged keys: `old ← current`, `current ← next`.
    /// The header-protection key moves forward with the new pair.
    pub fn commit_key_update(&mut self) -> Result<(), Error> {
        let next = self
            .one_rtt_next
            .take()
            .ok_or(Error::KEY_UPDATE_ERROR.with_reason("no staged keys"))?;
        let current = self.keys[EncryptionLevel::OneRtt.as_index()]
            .replace(next)
            .ok_or(Error::KEY_UPDATE_ERROR.with_reason("no current 1-RTT keys"))?;
        self.one_rtt_old = Some(current);
        self.key_phase = self.key_phase.next();
        self.bytes_sent_on_key = 0;
        self.key_update_count += 1;
        Ok(())
    }

    /// Drops the retired keys once delayed packets can no longer be valid
    pub fn discard_old_keys(&mut self) {
        self.one_rtt_old = None;
    }

    /// Selects the opener for a short-header packet's key-phase bit.
    ///
    /// A phase mismatch prefers the staged keys (peer-initiated update) and
    /// falls back to the retired ones (delayed packet from the previous
    /// phase).
    pub fn select_one_rtt_opener(&self, packet_phase: KeyPhase) -> Option<(&KeyPair, PhaseMatch)> {
        if packet_phase == self.key_phase {
            return self
                .keys(EncryptionLevel::OneRtt)
                .map(|keys| (keys, PhaseMatch::Current));
        }
        if let Some(next) = self.one_rtt_next.as_ref() {
            return Some((next, PhaseMatch::Next));
        }
        self.one_rtt_old
            .as_ref()
            .map(|keys| (keys, PhaseMatch::Old))
    }

    /// Accounts bytes protected under the current 1-RTT key; returns true
    /// when a key update should be initiated
    pub fn on_bytes_sealed(&mut self, bytes: u64, max_bytes_per_key: u64) -> bool {
        self.bytes_sent_on_key = self.bytes_sent_on_key.saturating_add(bytes);
        self.bytes_sent_on_key >= max_bytes_per_key
    }

    /// Accounts an AEAD open failure; errors once the integrity limit is
    /// crossed
    ///
    //= https://www.rfc-editor.org/rfc/rfc9001#section-6.6
    //# In addition to counting packets sent, endpoints MUST count the number
    //# of received packets that fail authentication during the lifetime of a
    //# connection.
    pub fn on_decryption_failure(&mut self) -> Result<(), Error> {
        self.decryption_failures += 1;
        if self.decryption_failures >= AEAD_INTEGRITY_FAILURE_LIMIT {
            return Err(Error::AEAD_LIMIT_REACHED);
        }
        Ok(())
    }

    #[inline]
    pub fn decryption_failures(&self) -> u64 {
        self.decryption_failures
    }
}

/// Which slot an opener came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseMatch {
    Current,
    /// The staged keys opened it: the peer initiated a key update and the
    /// caller commits the rotation
    Next,
    /// The retired keys opened it: a delayed packet from the prior phase
    Old,
}

/// A placeholder error for packets that arrive before their level's keys
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NoKeys;

impl From<CryptoError> for NoKeys {
    fn from(_: CryptoError) -> Self {
        NoKeys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::crypto::{HeaderKey, Key};

    struct NullKey(u8);

    impl Key for NullKey {
        fn decrypt(&self, _: u64, _: &[u8], _: &mut [u8]) -> Result<usize, CryptoError> {
            Ok(0)
        }
        fn encrypt(&self, _: u64, _: &[u8], _: &mut [u8]) -> Result<(), CryptoError> {
            Ok(())
        }
        fn tag_len(&self) -> usize {
            16
        }
        fn aead_confidentiality_limit(&self) -> u64 {
            1 << 23
        }
    }

    struct NullHeaderKey;

    impl HeaderKey for NullHeaderKey {
        fn protection_mask(&self, _: &[u8]) -> Result<[u8; 5], CryptoError> {
            Ok([0; 5])
        }
        fn sample_len(&self) -> usize {
            16
        }
    }

    fn pair(tag: u8) -> KeyPair {
        KeyPair {
            sealer: Box::new(NullKey(tag)),
            opener: Box::new(NullKey(tag)),
            sealer_header: Box::new(NullHeaderKey),
            opener_header: Box::new(NullHeaderKey),
        }
    }

    #[test]
    fn install_and_discard() {
        let mut keys = KeySet::default();
        assert!(!keys.has_keys(EncryptionLevel::Initial));

        keys.install(EncryptionLevel::Initial, pair(1));
        assert!(keys.has_keys(EncryptionLevel::Initial));

        assert!(keys.discard(EncryptionLevel::Initial));
        assert!(!keys.has_keys(EncryptionLevel::Initial));
        assert!(!keys.discard(EncryptionLevel::Initial));
    }

    #[test]
    fn key_update_rotates_phases() {
        let mut keys = KeySet::default();
        keys.install(EncryptionLevel::OneRtt, pair(1));
        assert_eq!(keys.key_phase(), KeyPhase::Zero);

        assert!(keys.commit_key_update().is_err());

        keys.stage_key_update(pair(2));
        keys.commit_key_update().unwrap();
        assert_eq!(keys.key_phase(), KeyPhase::One);
        assert_eq!(keys.key_update_count(), 1);

        // the previous phase still opens delayed packets
        let (_, phase) = keys.select_one_rtt_opener(KeyPhase::Zero).unwrap();
        assert_eq!(phase, PhaseMatch::Old);

        keys.discard_old_keys();
        assert!(keys.select_one_rtt_opener(KeyPhase::Zero).is_none());
    }

    #[test]
    fn mismatched_phase_prefers_staged_keys() {
        let mut keys = KeySet::default();
        keys.install(EncryptionLevel::OneRtt, pair(1));
        keys.stage_key_update(pair(2));

        let (_, phase) = keys.select_one_rtt_opener(KeyPhase::One).unwrap();
        assert_eq!(phase, PhaseMatch::Next);
    }

    #[test]
    fn bytes_per_key_triggers_update() {
        let mut keys = KeySet::default();
        assert!(!keys.on_bytes_sealed(100, 1000));
        assert!(keys.on_bytes_sealed(900, 1000));
    }
}
