/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
// Mirrors the tables created by the upgrade steps in upgrade.rs.

diesel::table! {
    store_version (version) {
        version -> BigInt,
    }
}

diesel::table! {
    devices (jid) {
        jid -> Text,
        registration_id -> BigInt,
        noise_key -> Binary,
        identity_key -> Binary,
        signed_pre_key -> Binary,
        signed_pre_key_id -> Integer,
        signed_pre_key_sig -> Binary,
        adv_key -> Binary,
        adv_details -> Binary,
        adv_account_sig -> Binary,
        adv_account_sig_key -> Nullable<Binary>,
        adv_device_sig -> Binary,
        platform -> Text,
        business_name -> Text,
        push_name -> Text,
        facebook_uuid -> Nullable<Text>,
    }
}

diesel::table! {
    identity_keys (our_jid, their_id) {
        our_jid -> Text,
        their_id -> Text,
        identity -> Binary,
    }
}

diesel::table! {
    pre_keys (jid, key_id) {
        jid -> Text,
        key_id -> BigInt,
        private_key -> Binary,
        uploaded -> Bool,
    }
}

diesel::table! {
    sessions (our_jid, their_id) {
        our_jid -> Text,
        their_id -> Text,
        session -> Binary,
    }
}

diesel::table! {
    sender_keys (our_jid, chat_id, sender_id) {
        our_jid -> Text,
        chat_id -> Text,
        sender_id -> Text,
        sender_key -> Binary,
    }
}

diesel::table! {
    app_state_sync_keys (jid, key_id) {
        jid -> Text,
        key_id -> Binary,
        key_data -> Binary,
        timestamp -> BigInt,
        fingerprint -> Binary,
    }
}

diesel::table! {
    app_state_versions (jid, name) {
        jid -> Text,
        name -> Text,
        version -> BigInt,
        hash -> Binary,
    }
}

diesel::table! {
    app_state_mutation_macs (jid, name, version, index_mac) {
        jid -> Text,
        name -> Text,
        version -> BigInt,
        index_mac -> Binary,
        value_mac -> Binary,
    }
}

diesel::table! {
    contacts (our_jid, their_jid) {
        our_jid -> Text,
        their_jid -> Text,
        first_name -> Nullable<Text>,
        full_name -> Nullable<Text>,
        push_name -> Nullable<Text>,
        business_name -> Nullable<Text>,
    }
}

diesel::table! {
    chat_settings (our_jid, chat_jid) {
        our_jid -> Text,
        chat_jid -> Text,
        muted_until -> BigInt,
        pinned -> Bool,
        archived -> Bool,
    }
}

diesel::table! {
    message_secrets (our_jid, chat_jid, sender_jid, message_id) {
        our_jid -> Text,
        chat_jid -> Text,
        sender_jid -> Text,
        message_id -> Text,
        secret -> Binary,
    }
}

diesel::table! {
    privacy_tokens (our_jid, their_jid) {
        our_jid -> Text,
        their_jid -> Text,
        token -> Binary,
        timestamp -> BigInt,
    }
}
