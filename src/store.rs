/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
//! Store contracts of a device-scoped handle.
//!
//! Every method is a blocking call. A lookup that finds nothing returns
//! `Ok(None)`; errors are reserved for backend failures and integrity
//! violations.
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::keys::PreKey;
use crate::types::{
    AppStateMutationMac, AppStateSyncKey, ChatSettings, ContactEntry, ContactInfo, HashState,
    MessageSecretInsert, PrivacyToken,
};

pub trait IdentityStore {
    fn put_identity(&self, address: &str, key: &[u8; 32]) -> Result<()>;
    fn get_identity(&self, address: &str) -> Result<Option<[u8; 32]>>;
    fn delete_identity(&self, address: &str) -> Result<()>;
    /// Delete the identities of every device of `phone`.
    fn delete_all_identities(&self, phone: &str) -> Result<()>;
    /// Trust on first use: an unknown address is trusted, a known one only
    /// with the exact stored key.
    fn is_trusted_identity(&self, address: &str, key: &[u8; 32]) -> Result<bool>;
}

pub trait SessionStore {
    fn put_session(&self, address: &str, session: &[u8]) -> Result<()>;
    fn get_session(&self, address: &str) -> Result<Option<Vec<u8>>>;
    fn has_session(&self, address: &str) -> Result<bool>;
    fn delete_session(&self, address: &str) -> Result<()>;
    fn delete_all_sessions(&self, phone: &str) -> Result<()>;
}

pub trait PreKeyStore {
    /// Return `count` prekeys, reusing the ones not uploaded yet before
    /// generating new ones.
    fn get_or_gen_pre_keys(&self, count: u32) -> Result<Vec<PreKey>>;
    /// Generate a single prekey that is considered uploaded right away.
    fn gen_one_pre_key(&self) -> Result<PreKey>;
    fn get_pre_key(&self, id: u32) -> Result<Option<PreKey>>;
    fn remove_pre_key(&self, id: u32) -> Result<()>;
    fn mark_pre_keys_as_uploaded(&self, up_to_id: u32) -> Result<()>;
    fn uploaded_pre_key_count(&self) -> Result<usize>;
}

pub trait SenderKeyStore {
    fn put_sender_key(&self, group: &str, sender: &str, key: &[u8]) -> Result<()>;
    fn get_sender_key(&self, group: &str, sender: &str) -> Result<Option<Vec<u8>>>;
    fn delete_sender_key(&self, group: &str, sender: &str) -> Result<()>;
}

pub trait AppStateSyncKeyStore {
    /// Store a key. An existing key is only replaced by a strictly newer
    /// timestamp.
    fn put_app_state_sync_key(&self, id: &[u8], key: &AppStateSyncKey) -> Result<()>;
    fn get_app_state_sync_key(&self, id: &[u8]) -> Result<Option<AppStateSyncKey>>;
    fn get_latest_app_state_sync_key_id(&self) -> Result<Option<Vec<u8>>>;
}

pub trait AppStateStore {
    /// Persist the chain value reached at `version`. `hash` must be exactly
    /// 128 bytes.
    fn put_app_state_version(&self, name: &str, version: u64, hash: &[u8]) -> Result<()>;
    fn get_app_state_version(&self, name: &str) -> Result<Option<HashState>>;
    fn delete_app_state_version(&self, name: &str) -> Result<()>;
    /// Fail with `HashMismatch` unless the stored state of `name` is at
    /// `version` with exactly `hash`.
    fn check_app_state_hash(&self, name: &str, version: u64, hash: &[u8]) -> Result<()>;
    fn put_app_state_mutation_macs(
        &self,
        name: &str,
        version: u64,
        mutations: &[AppStateMutationMac],
    ) -> Result<()>;
    fn delete_app_state_mutation_macs(&self, name: &str, index_macs: &[Vec<u8>]) -> Result<()>;
    /// Value MAC of the most recent version recorded for `index_mac`.
    fn get_app_state_mutation_mac(&self, name: &str, index_mac: &[u8]) -> Result<Option<Vec<u8>>>;
}

pub trait ContactStore {
    /// Returns whether the name changed and the previous name.
    fn put_push_name(&self, user: &str, push_name: &str) -> Result<(bool, String)>;
    /// Returns whether the name changed and the previous name.
    fn put_business_name(&self, user: &str, business_name: &str) -> Result<(bool, String)>;
    fn put_contact_name(&self, user: &str, first_name: &str, full_name: &str) -> Result<()>;
    fn put_all_contact_names(&self, contacts: &[ContactEntry]) -> Result<()>;
    fn get_contact(&self, user: &str) -> Result<ContactInfo>;
    fn get_all_contacts(&self) -> Result<Vec<(String, ContactInfo)>>;
}

pub trait ChatSettingsStore {
    fn put_muted_until(&self, chat: &str, muted_until: Option<DateTime<Utc>>) -> Result<()>;
    fn put_pinned(&self, chat: &str, pinned: bool) -> Result<()>;
    fn put_archived(&self, chat: &str, archived: bool) -> Result<()>;
    fn get_chat_settings(&self, chat: &str) -> Result<Option<ChatSettings>>;
}

pub trait MsgSecretStore {
    fn put_message_secrets(&self, inserts: &[MessageSecretInsert]) -> Result<()>;
    fn put_message_secret(&self, chat: &str, sender: &str, id: &str, secret: &[u8]) -> Result<()>;
    fn get_message_secret(&self, chat: &str, sender: &str, id: &str) -> Result<Option<Vec<u8>>>;
}

pub trait PrivacyTokenStore {
    fn put_privacy_tokens(&self, tokens: &[PrivacyToken]) -> Result<()>;
    fn get_privacy_token(&self, user: &str) -> Result<Option<PrivacyToken>>;
}
