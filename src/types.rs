/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
use chrono::{DateTime, Utc};

use crate::keys::{KeyPair, PreKey};

/// Width of the app state hash chain value.
pub const HASH_STATE_LEN: usize = 128;

/// Long-term material of the local device, the root every other record
/// hangs from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub jid: String,
    pub registration_id: u32,
    pub noise_key: KeyPair,
    pub identity_key: KeyPair,
    pub signed_pre_key: PreKey,
    pub adv_secret_key: Vec<u8>,
    pub account: AdvIdentity,
    pub platform: String,
    pub business_name: String,
    pub push_name: String,
    pub facebook_uuid: Option<String>,
}

/// Signed device identity issued when the device was paired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvIdentity {
    pub details: Vec<u8>,
    pub account_signature: [u8; 64],
    pub account_signature_key: [u8; 32],
    pub device_signature: [u8; 64],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStateSyncKey {
    pub data: Vec<u8>,
    pub fingerprint: Vec<u8>,
    pub timestamp: i64,
}

/// Position of a device in one app state ledger.
#[derive(Clone, PartialEq, Eq)]
pub struct HashState {
    pub version: u64,
    pub hash: [u8; HASH_STATE_LEN],
}

impl Default for HashState {
    fn default() -> Self {
        HashState {
            version: 0,
            hash: [0u8; HASH_STATE_LEN],
        }
    }
}

impl std::fmt::Debug for HashState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashState")
            .field("version", &self.version)
            .field("hash", &&self.hash[..8])
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStateMutationMac {
    pub index_mac: Vec<u8>,
    pub value_mac: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactInfo {
    pub found: bool,
    pub first_name: String,
    pub full_name: String,
    pub push_name: String,
    pub business_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactEntry {
    pub jid: String,
    pub first_name: String,
    pub full_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatSettings {
    pub muted_until: Option<DateTime<Utc>>,
    pub pinned: bool,
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSecretInsert {
    pub chat: String,
    pub sender: String,
    pub id: String,
    pub secret: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivacyToken {
    pub user: String,
    pub token: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}
