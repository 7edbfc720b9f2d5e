// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Source and destination connection ID tables.
//!
//! Source CIDs are the ids we issue: an optional deployment routing prefix
//! (server id and partition) followed by random bytes, registered with
//! every binding the connection uses, and announced with
//! NEW_CONNECTION_ID. Destination CIDs are the peer's ids, consumed by
//! paths and retired when the peer raises `retire_prior_to`.

use crate::config::{ACTIVE_CONNECTION_ID_LIMIT, LOCAL_CID_LEN, MAX_CID_COLLISION_RETRY,
    RETIRED_CID_LIMIT_MULTIPLIER};
use quiver_core::{
    connection::id::{LocalId, PeerId, RESET_TOKEN_LEN},
    random,
    transport::Error,
};

#[derive(Clone, Debug)]
pub struct SourceCid {
    pub id: LocalId,
    pub sequence: u64,
    /// The id handed out during the handshake
    pub is_initial: bool,
    pub retired: bool,
    /// A NEW_CONNECTION_ID frame still needs to go out
    pub needs_to_send: bool,
    pub reset_token: [u8; RESET_TOKEN_LEN],
}

#[derive(Clone, Debug)]
pub struct DestCid {
    pub id: PeerId,
    pub sequence: u64,
    pub reset_token: Option<[u8; RESET_TOKEN_LEN]>,
    pub retired: bool,
    /// A path currently addresses the peer with this id
    pub in_use: bool,
    /// A RETIRE_CONNECTION_ID frame still needs to go out
    pub retire_needs_send: bool,
}

/// What a NEW_CONNECTION_ID frame caused
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NewCidOutcome {
    /// The active path's destination id was retired and replaced
    pub active_cid_replaced: bool,
    /// No usable destination id remains for the active path
    pub active_path_broken: bool,
}

/// Random bytes every generated id keeps after the routing prefix
const MIN_RANDOM_TAIL: usize = 4;

#[derive(Debug, Default)]
pub struct CidManager {
    source_cids: Vec<SourceCid>,
    next_source_sequence: u64,
    /// Deployment routing bytes copied to the front of every generated id
    routing_prefix: Vec<u8>,
    dest_cids: Vec<DestCid>,
    /// Highest retire_prior_to the peer has advertised
    retire_prior_to: u64,
    /// Lifetime count of retired destination ids, for flood detection
    retired_dest_count: u64,
}

impl CidManager {
    /// Sets the routing prefix for generated ids, clamped so every id
    /// keeps an unpredictable tail
    pub fn set_routing_prefix(&mut self, prefix: &[u8]) {
        let max_len = LOCAL_CID_LEN - MIN_RANDOM_TAIL;
        self.routing_prefix = prefix[..prefix.len().min(max_len)].to_vec();
    }

    /// Seeds the destination table with the peer's handshake id
    pub fn set_initial_dest_cid(&mut self, id: PeerId) {
        debug_assert!(self.dest_cids.is_empty());
        self.dest_cids.push(DestCid {
            id,
            sequence: 0,
            reset_token: None,
            retired: false,
            in_use: true,
            retire_needs_send: false,
        });
    }

    /// Replaces the sequence-0 destination id (Retry, server handshake)
    pub fn update_initial_dest_cid(&mut self, id: PeerId) {
        if let Some(initial) = self
            .dest_cids
            .iter_mut()
            .find(|dest| dest.sequence == 0)
        {
            initial.id = id;
        } else {
            self.set_initial_dest_cid(id);
        }
    }

    /// Generates a fresh source id and registers it with the binding
    /// through `inserter`, retrying on hash collisions.
    ///
    /// `inserter` returns false if the id already routes somewhere; the
    /// binding undoes any partial registration itself.
    pub fn generate_source_cid(
        &mut self,
        rng: &mut dyn random::Generator,
        is_initial: bool,
        inserter: &mut dyn FnMut(&LocalId) -> bool,
    ) -> Result<u64, Error> {
        for _ in 0..MAX_CID_COLLISION_RETRY {
            let mut bytes = [0u8; LOCAL_CID_LEN];
            let prefix_len = self.routing_prefix.len();
            bytes[..prefix_len].copy_from_slice(&self.routing_prefix);
            rng.public_random_fill(&mut bytes[prefix_len..]);
            let id = LocalId::try_from_bytes(&bytes).expect("generated length is valid");

            if !inserter(&id) {
                continue;
            }

            let mut reset_token = [0u8; RESET_TOKEN_LEN];
            rng.public_random_fill(&mut reset_token);

            let sequence = self.next_source_sequence;
            self.next_source_sequence += 1;
            self.source_cids.push(SourceCid {
                id,
                sequence,
                is_initial,
                retired: false,
                // the initial server id is implicitly known to the peer
                needs_to_send: !is_initial,
                reset_token,
            });
            return Ok(sequence);
        }

        Err(Error::INTERNAL_ERROR.with_reason("source cid collision retries exhausted"))
    }

    #[inline]
    pub fn source_cids(&self) -> &[SourceCid] {
        &self.source_cids
    }

    /// Source ids with unsent NEW_CONNECTION_ID frames
    pub fn source_cids_to_send(&mut self) -> impl Iterator<Item = &mut SourceCid> {
        self.source_cids
            .iter_mut()
            .filter(|cid| cid.needs_to_send && !cid.retired)
    }

    /// The peer retired one of our source ids
    pub fn on_retire_connection_id(
        &mut self,
        sequence: u64,
        packet_dest_cid: &[u8],
    ) -> Result<Option<LocalId>, Error> {
        if sequence >= self.next_source_sequence {
            //= https://www.rfc-editor.org/rfc/rfc9000#section-19.16
            //# Receipt of a RETIRE_CONNECTION_ID frame containing a sequence
            //# number greater than any previously sent to the peer MUST be
            //# treated as a connection error of type PROTOCOL_VIOLATION.
            return Err(Error::PROTOCOL_VIOLATION.with_reason("retire of an unissued cid"));
        }

        let Some(cid) = self
            .source_cids
            .iter_mut()
            .find(|cid| cid.sequence == sequence && !cid.retired)
        else {
            return Ok(None);
        };

        //= https://www.rfc-editor.org/rfc/rfc9000#section-19.16
        //# The sequence number specified in a RETIRE_CONNECTION_ID frame MUST
        //# NOT refer to the Destination Connection ID field of the packet in
        //# which the frame is contained.
        if cid.id.as_bytes() == packet_dest_cid {
            return Err(Error::PROTOCOL_VIOLATION.with_reason("retired the carrying cid"));
        }

        cid.retired = true;
        Ok(Some(cid.id))
    }

    // === destination ids ===

    /// Handles a NEW_CONNECTION_ID frame
    pub fn on_new_connection_id(
        &mut self,
        id: PeerId,
        sequence: u64,
        retire_prior_to: u64,
        reset_token: [u8; RESET_TOKEN_LEN],
    ) -> Result<NewCidOutcome, Error> {
        //= https://www.rfc-editor.org/rfc/rfc9000#section-5.1.1
        //# ...or if a sequence number is used for different connection
        //# IDs, the endpoint MAY treat that receipt as a connection error of
        //# type PROTOCOL_VIOLATION.
        if let Some(existing) = self
            .dest_cids
            .iter()
            .find(|dest| dest.sequence == sequence)
        {
            if existing.id != id {
                return Err(Error::PROTOCOL_VIOLATION.with_reason("cid sequence reuse"));
            }
            return Ok(NewCidOutcome::default());
        }

        let immediately_retired = sequence < self.retire_prior_to.max(retire_prior_to);
        self.dest_cids.push(DestCid {
            id,
            sequence,
            reset_token: Some(reset_token),
            retired: immediately_retired,
            in_use: false,
            retire_needs_send: immediately_retired,
        });
        if immediately_retired {
            self.retired_dest_count += 1;
        }

        let mut outcome = NewCidOutcome::default();
        if retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = retire_prior_to;
            outcome = self.apply_retire_prior_to(retire_prior_to)?;
        }

        // an unreasonable retirement volume indicates a misbehaving peer
        if self.retired_dest_count
            > RETIRED_CID_LIMIT_MULTIPLIER * ACTIVE_CONNECTION_ID_LIMIT
        {
            return Err(Error::PROTOCOL_VIOLATION.with_reason("excessive cid retirement"));
        }

        //= https://www.rfc-editor.org/rfc/rfc9000#section-5.1.1
        //# After processing a NEW_CONNECTION_ID frame and adding and retiring
        //# active connection IDs, if the number of active connection IDs
        //# exceeds the value advertised in its active_connection_id_limit
        //# transport parameter, an endpoint MUST close the connection with an
        //# error of type CONNECTION_ID_LIMIT_ERROR.
        let active = self
            .dest_cids
            .iter()
            .filter(|dest| !dest.retired)
            .count() as u64;
        if active > ACTIVE_CONNECTION_ID_LIMIT {
            return Err(Error::CONNECTION_ID_LIMIT_ERROR);
        }

        Ok(outcome)
    }

    /// Retires every destination id below `retire_prior_to`, re-assigning
    /// the active path if its id was retired
    fn apply_retire_prior_to(&mut self, retire_prior_to: u64) -> Result<NewCidOutcome, Error> {
        let mut active_retired = false;
        for dest in self.dest_cids.iter_mut() {
            if dest.sequence < retire_prior_to && !dest.retired {
                dest.retired = true;
                dest.retire_needs_send = true;
                self.retired_dest_count += 1;
                if dest.in_use {
                    dest.in_use = false;
                    active_retired = true;
                }
            }
        }

        if !active_retired {
            return Ok(NewCidOutcome::default());
        }

        // re-home the active path onto an unused id
        if let Some(replacement) = self
            .dest_cids
            .iter_mut()
            .find(|dest| !dest.retired && !dest.in_use)
        {
            replacement.in_use = true;
            Ok(NewCidOutcome {
                active_cid_replaced: true,
                active_path_broken: false,
            })
        } else {
            Ok(NewCidOutcome {
                active_cid_replaced: false,
                active_path_broken: true,
            })
        }
    }

    /// The id the active path should address the peer with
    pub fn active_dest_cid(&self) -> Option<&DestCid> {
        self.dest_cids
            .iter()
            .find(|dest| dest.in_use && !dest.retired)
    }

    /// Claims an unused destination id for a new path
    pub fn claim_unused_dest_cid(&mut self) -> Option<u64> {
        let dest = self
            .dest_cids
            .iter_mut()
            .find(|dest| !dest.retired && !dest.in_use)?;
        dest.in_use = true;
        Some(dest.sequence)
    }

    /// Destination ids with unsent RETIRE_CONNECTION_ID frames
    pub fn dest_cids_to_retire(&mut self) -> impl Iterator<Item = &mut DestCid> {
        self.dest_cids
            .iter_mut()
            .filter(|dest| dest.retire_needs_send)
    }

    /// Re-flags a source id whose NEW_CONNECTION_ID frame was lost
    pub fn requeue_new_cid(&mut self, sequence: u64) {
        if let Some(cid) = self
            .source_cids
            .iter_mut()
            .find(|cid| cid.sequence == sequence && !cid.retired)
        {
            cid.needs_to_send = true;
        }
    }

    /// Re-flags a destination id whose RETIRE frame was lost
    pub fn requeue_retire_cid(&mut self, sequence: u64) {
        if let Some(dest) = self
            .dest_cids
            .iter_mut()
            .find(|dest| dest.sequence == sequence && dest.retired)
        {
            dest.retire_needs_send = true;
        }
    }

    /// Forgets a fully-retired id once its RETIRE frame is acknowledged
    pub fn on_retire_frame_acked(&mut self, sequence: u64) {
        self.dest_cids
            .retain(|dest| !(dest.sequence == sequence && dest.retired));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::random::{testing, Generator as _};

    fn new_cid(tag: u8) -> PeerId {
        PeerId::try_from_bytes(&[tag; 8]).unwrap()
    }

    fn token(tag: u8) -> [u8; RESET_TOKEN_LEN] {
        [tag; RESET_TOKEN_LEN]
    }

    #[test]
    fn source_generation_retries_collisions() {
        let mut manager = CidManager::default();
        let mut rng = testing::Generator::default();

        let mut attempts = 0;
        let sequence = manager
            .generate_source_cid(&mut rng, false, &mut |_| {
                attempts += 1;
                attempts > 2 // first two collide
            })
            .unwrap();

        assert_eq!(sequence, 0);
        assert_eq!(attempts, 3);
        assert!(manager.source_cids()[0].needs_to_send);
    }

    #[test]
    fn routing_prefix_leads_generated_ids() {
        let mut manager = CidManager::default();
        let mut rng = testing::Generator::default();
        manager.set_routing_prefix(&[0xab, 0xcd]);

        manager
            .generate_source_cid(&mut rng, false, &mut |_| true)
            .unwrap();
        manager
            .generate_source_cid(&mut rng, false, &mut |_| true)
            .unwrap();

        let first = manager.source_cids()[0].id;
        let second = manager.source_cids()[1].id;
        assert_eq!(&first.as_bytes()[..2], &[0xab, 0xcd]);
        assert_eq!(&second.as_bytes()[..2], &[0xab, 0xcd]);
        // the random tail still distinguishes the ids
        assert_ne!(first, second);

        // an oversized prefix is clamped to preserve the random tail
        manager.set_routing_prefix(&[0x11u8; 32]);
        assert!(LOCAL_CID_LEN - MIN_RANDOM_TAIL >= 1);
        manager
            .generate_source_cid(&mut rng, false, &mut |_| true)
            .unwrap();
        let third = manager.source_cids()[2].id;
        assert_eq!(
            &third.as_bytes()[..LOCAL_CID_LEN - MIN_RANDOM_TAIL],
            &[0x11u8; LOCAL_CID_LEN - MIN_RANDOM_TAIL]
        );
    }

    #[test]
    fn source_generation_gives_up_eventually() {
        let mut manager = CidManager::default();
        let mut rng = testing::Generator::default();

        let error = manager
            .generate_source_cid(&mut rng, false, &mut |_| false)
            .unwrap_err();
        assert_eq!(error.code, Error::INTERNAL_ERROR.code);
    }

    #[test]
    fn retire_prior_to_reassigns_active_path() {
        let mut manager = CidManager::default();
        manager.set_initial_dest_cid(new_cid(0));

        let outcome = manager
            .on_new_connection_id(new_cid(1), 1, 0, token(1))
            .unwrap();
        assert_eq!(outcome, NewCidOutcome::default());

        // retire everything below 1: the active id flips to sequence 1
        let outcome = manager
            .on_new_connection_id(new_cid(2), 2, 1, token(2))
            .unwrap();
        assert!(outcome.active_cid_replaced);
        assert_eq!(manager.active_dest_cid().unwrap().sequence, 1);

        // the retired id queues a RETIRE frame
        assert_eq!(manager.dest_cids_to_retire().count(), 1);
    }

    #[test]
    fn active_path_breaks_without_replacement() {
        let mut manager = CidManager::default();
        manager.set_initial_dest_cid(new_cid(0));

        // retire sequence 0 while the only other id is itself retired
        let outcome = manager
            .on_new_connection_id(new_cid(1), 1, 2, token(1))
            .unwrap();
        assert!(outcome.active_path_broken);
    }

    #[test]
    fn cid_limit_is_enforced() {
        let mut manager = CidManager::default();
        manager.set_initial_dest_cid(new_cid(0));

        for sequence in 1..ACTIVE_CONNECTION_ID_LIMIT {
            manager
                .on_new_connection_id(new_cid(sequence as u8), sequence, 0, token(0))
                .unwrap();
        }
        let error = manager
            .on_new_connection_id(new_cid(0xee), ACTIVE_CONNECTION_ID_LIMIT, 0, token(0))
            .unwrap_err();
        assert_eq!(error.code, Error::CONNECTION_ID_LIMIT_ERROR.code);
    }

    #[test]
    fn sequence_reuse_with_different_id_is_fatal() {
        let mut manager = CidManager::default();
        manager.set_initial_dest_cid(new_cid(0));
        manager
            .on_new_connection_id(new_cid(1), 1, 0, token(1))
            .unwrap();

        let error = manager
            .on_new_connection_id(new_cid(9), 1, 0, token(1))
            .unwrap_err();
        assert_eq!(error.code, Error::PROTOCOL_VIOLATION.code);

        // an exact duplicate is tolerated
        assert!(manager
            .on_new_connection_id(new_cid(1), 1, 0, token(1))
            .is_ok());
    }

    #[test]
    fn retirement_flood_is_fatal() {
        let mut manager = CidManager::default();
        manager.set_initial_dest_cid(new_cid(0));

        let mut sequence = 1;
        let result = loop {
            // every new id immediately retires its predecessor
            let result =
                manager.on_new_connection_id(new_cid(sequence as u8), sequence, sequence, token(0));
            if result.is_err() {
                break result;
            }
            sequence += 1;
            assert!(sequence < 100, "flood was never detected");
        };
        assert_eq!(result.unwrap_err().code, Error::PROTOCOL_VIOLATION.code);
    }

    #[test]
    fn retire_of_unissued_source_cid_is_fatal() {
        let mut manager = CidManager::default();
        let error = manager.on_retire_connection_id(5, &[]).unwrap_err();
        assert_eq!(error.code, Error::PROTOCOL_VIOLATION.code);
    }

    #[test]
    fn retire_of_carrying_cid_is_fatal() {
        let mut manager = CidManager::default();
        let mut rng = testing::Generator::default();
        manager
            .generate_source_cid(&mut rng, true, &mut |_| true)
            .unwrap();

        let id = manager.source_cids()[0].id;
        let error = manager
            .on_retire_connection_id(0, id.as_bytes())
            .unwrap_err();
        assert_eq!(error.code, Error::PROTOCOL_VIOLATION.code);
    }
}
