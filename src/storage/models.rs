/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
use diesel::prelude::*;

use super::schema::{devices, pre_keys};
use crate::error::{fixed, narrow, Result, StoreError};
use crate::keys::{KeyPair, PreKey};
use crate::types::{AdvIdentity, ContactInfo, Device};

#[derive(Queryable, Insertable)]
#[diesel(table_name = devices)]
pub struct DeviceRow {
    pub jid: String,
    pub registration_id: i64,
    pub noise_key: Vec<u8>,
    pub identity_key: Vec<u8>,
    pub signed_pre_key: Vec<u8>,
    pub signed_pre_key_id: i32,
    pub signed_pre_key_sig: Vec<u8>,
    pub adv_key: Vec<u8>,
    pub adv_details: Vec<u8>,
    pub adv_account_sig: Vec<u8>,
    pub adv_account_sig_key: Option<Vec<u8>>,
    pub adv_device_sig: Vec<u8>,
    pub platform: String,
    pub business_name: String,
    pub push_name: String,
    pub facebook_uuid: Option<String>,
}

impl TryFrom<&Device> for DeviceRow {
    type Error = StoreError;

    fn try_from(device: &Device) -> Result<Self> {
        Ok(DeviceRow {
            jid: device.jid.clone(),
            registration_id: device.registration_id.into(),
            noise_key: device.noise_key.private.to_vec(),
            identity_key: device.identity_key.private.to_vec(),
            signed_pre_key: device.signed_pre_key.key_pair.private.to_vec(),
            signed_pre_key_id: narrow("signed prekey id", device.signed_pre_key.key_id)?,
            signed_pre_key_sig: device
                .signed_pre_key
                .signature
                .map(|sig| sig.to_vec())
                .unwrap_or_default(),
            adv_key: device.adv_secret_key.clone(),
            adv_details: device.account.details.clone(),
            adv_account_sig: device.account.account_signature.to_vec(),
            adv_account_sig_key: Some(device.account.account_signature_key.to_vec()),
            adv_device_sig: device.account.device_signature.to_vec(),
            platform: device.platform.clone(),
            business_name: device.business_name.clone(),
            push_name: device.push_name.clone(),
            facebook_uuid: device.facebook_uuid.clone(),
        })
    }
}

impl TryFrom<DeviceRow> for Device {
    type Error = StoreError;

    fn try_from(row: DeviceRow) -> Result<Self> {
        let account_signature_key = row.adv_account_sig_key.unwrap_or_default();
        Ok(Device {
            registration_id: narrow("registration id", row.registration_id)?,
            noise_key: KeyPair::from_private(fixed("noise key", &row.noise_key)?),
            identity_key: KeyPair::from_private(fixed("identity key", &row.identity_key)?),
            signed_pre_key: PreKey {
                key_pair: KeyPair::from_private(fixed("signed prekey", &row.signed_pre_key)?),
                key_id: narrow("signed prekey id", row.signed_pre_key_id)?,
                signature: Some(fixed("signed prekey signature", &row.signed_pre_key_sig)?),
            },
            adv_secret_key: row.adv_key,
            account: AdvIdentity {
                details: row.adv_details,
                account_signature: fixed("account signature", &row.adv_account_sig)?,
                account_signature_key: fixed("account signature key", &account_signature_key)?,
                device_signature: fixed("device signature", &row.adv_device_sig)?,
            },
            jid: row.jid,
            platform: row.platform,
            business_name: row.business_name,
            push_name: row.push_name,
            facebook_uuid: row.facebook_uuid,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = pre_keys)]
pub struct NewPreKey<'a> {
    pub jid: &'a str,
    pub key_id: i64,
    pub private_key: &'a [u8],
    pub uploaded: bool,
}

pub fn pre_key_from_row(key_id: i64, private_key: &[u8]) -> Result<PreKey> {
    Ok(PreKey {
        key_pair: KeyPair::from_private(fixed("prekey", private_key)?),
        key_id: narrow("prekey id", key_id)?,
        signature: None,
    })
}

pub type ContactRow = (
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

pub fn contact_from_row((first, full, push, business): ContactRow) -> ContactInfo {
    ContactInfo {
        found: true,
        first_name: first.unwrap_or_default(),
        full_name: full.unwrap_or_default(),
        push_name: push.unwrap_or_default(),
        business_name: business.unwrap_or_default(),
    }
}
