// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The default randomness provider: two independently-seeded ChaCha
//! generators, one for public material (connection IDs, reset tokens,
//! path challenges) and one for private jitter, so observable output never
//! reveals the private stream's state.

use rand::{rngs::OsRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

#[derive(Debug)]
pub struct Generator {
    public: ChaCha20Rng,
    private: ChaCha20Rng,
}

impl Default for Generator {
    fn default() -> Self {
        Self {
            public: ChaCha20Rng::from_rng(OsRng).expect("OS entropy available"),
            private: ChaCha20Rng::from_rng(OsRng).expect("OS entropy available"),
        }
    }
}

impl quiver_core::random::Generator for Generator {
    fn public_random_fill(&mut self, dest: &mut [u8]) {
        self.public.fill_bytes(dest);
    }

    fn private_random_fill(&mut self, dest: &mut [u8]) {
        self.private.fill_bytes(dest);
    }
}
