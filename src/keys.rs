/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
//! Key pairs as they are persisted: only the private half is stored, the
//! public half is derived again on load.
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub public: [u8; 32],
    pub private: [u8; 32],
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        OsRng.fill_bytes(&mut private);
        private[0] &= 248;
        private[31] &= 127;
        private[31] |= 64;
        Self::from_private(private)
    }

    pub fn from_private(private: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private);
        let public = PublicKey::from(&secret);
        KeyPair {
            public: public.to_bytes(),
            private,
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKey {
    pub key_pair: KeyPair,
    pub key_id: u32,
    /// Only set on signed prekeys.
    pub signature: Option<[u8; 64]>,
}

impl PreKey {
    pub fn generate(key_id: u32) -> Self {
        PreKey {
            key_pair: KeyPair::generate(),
            key_id,
            signature: None,
        }
    }
}
