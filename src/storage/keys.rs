/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
use diesel::prelude::*;

use super::conn::{with_conn, WriteTransaction};
use super::models::{pre_key_from_row, NewPreKey};
use super::schema::{identity_keys, pre_keys, sender_keys, sessions};
use super::DeviceStore;
use crate::error::{fixed, narrow, QueryContext, Result};
use crate::keys::PreKey;
use crate::store::{IdentityStore, PreKeyStore, SenderKeyStore, SessionStore};

/// Highest prekey id stored for the device, plus one. Callers must hold the
/// device's prekey lock and stay in one transaction until the new keys are
/// inserted.
macro_rules! next_pre_key_id {
    ($conn:expr, $jid:expr) => {
        pre_keys::table
            .filter(pre_keys::jid.eq($jid))
            .select(diesel::dsl::max(pre_keys::key_id))
            .first::<Option<i64>>($conn)
            .context("get last prekey id", $jid)
            .map(|last| last.unwrap_or(0) + 1)
    };
}

macro_rules! insert_pre_key {
    ($conn:expr, $jid:expr, $key:expr, $uploaded:expr) => {
        diesel::insert_into(pre_keys::table)
            .values(&NewPreKey {
                jid: $jid,
                key_id: i64::from($key.key_id),
                private_key: &$key.key_pair.private,
                uploaded: $uploaded,
            })
            .execute($conn)
            .context("insert prekey", $key.key_id)
    };
}

impl IdentityStore for DeviceStore {
    fn put_identity(&self, address: &str, key: &[u8; 32]) -> Result<()> {
        log::debug!("Save {address}'s identity");
        with_conn!(self.database, |conn| {
            diesel::insert_into(identity_keys::table)
                .values((
                    identity_keys::our_jid.eq(&self.jid),
                    identity_keys::their_id.eq(address),
                    identity_keys::identity.eq(&key[..]),
                ))
                .on_conflict((identity_keys::our_jid, identity_keys::their_id))
                .do_update()
                .set(identity_keys::identity.eq(&key[..]))
                .execute(conn)
                .context("put identity", address)?;
            Ok(())
        })
    }

    fn get_identity(&self, address: &str) -> Result<Option<[u8; 32]>> {
        log::debug!("Get {address}'s identity");
        let identity = with_conn!(self.database, |conn| {
            identity_keys::table
                .filter(identity_keys::our_jid.eq(&self.jid))
                .filter(identity_keys::their_id.eq(address))
                .select(identity_keys::identity)
                .first::<Vec<u8>>(conn)
                .optional()
                .context("get identity", address)?
        });
        identity.map(|key| fixed("identity", &key)).transpose()
    }

    fn delete_identity(&self, address: &str) -> Result<()> {
        log::debug!("Delete {address}'s identity");
        with_conn!(self.database, |conn| {
            diesel::delete(
                identity_keys::table
                    .filter(identity_keys::our_jid.eq(&self.jid))
                    .filter(identity_keys::their_id.eq(address)),
            )
            .execute(conn)
            .context("delete identity", address)?;
            Ok(())
        })
    }

    fn delete_all_identities(&self, phone: &str) -> Result<()> {
        log::debug!("Delete all identities of {phone}");
        with_conn!(self.database, |conn| {
            diesel::delete(
                identity_keys::table
                    .filter(identity_keys::our_jid.eq(&self.jid))
                    .filter(identity_keys::their_id.like(format!("{phone}:%"))),
            )
            .execute(conn)
            .context("delete identities", phone)?;
            Ok(())
        })
    }

    fn is_trusted_identity(&self, address: &str, key: &[u8; 32]) -> Result<bool> {
        match self.get_identity(address)? {
            // Trust on first use
            None => Ok(true),
            Some(stored) => {
                if &stored != key {
                    log::warn!("Untrusted identity for {address}");
                }
                Ok(&stored == key)
            }
        }
    }
}

impl SessionStore for DeviceStore {
    fn put_session(&self, address: &str, session: &[u8]) -> Result<()> {
        log::debug!("Save {address}'s session");
        with_conn!(self.database, |conn| {
            diesel::insert_into(sessions::table)
                .values((
                    sessions::our_jid.eq(&self.jid),
                    sessions::their_id.eq(address),
                    sessions::session.eq(session),
                ))
                .on_conflict((sessions::our_jid, sessions::their_id))
                .do_update()
                .set(sessions::session.eq(session))
                .execute(conn)
                .context("put session", address)?;
            Ok(())
        })
    }

    fn get_session(&self, address: &str) -> Result<Option<Vec<u8>>> {
        log::debug!("Get {address}'s session");
        with_conn!(self.database, |conn| {
            sessions::table
                .filter(sessions::our_jid.eq(&self.jid))
                .filter(sessions::their_id.eq(address))
                .select(sessions::session)
                .first::<Vec<u8>>(conn)
                .optional()
                .context("get session", address)
        })
    }

    fn has_session(&self, address: &str) -> Result<bool> {
        with_conn!(self.database, |conn| {
            diesel::select(diesel::dsl::exists(
                sessions::table
                    .filter(sessions::our_jid.eq(&self.jid))
                    .filter(sessions::their_id.eq(address)),
            ))
            .get_result::<bool>(conn)
            .context("check session", address)
        })
    }

    fn delete_session(&self, address: &str) -> Result<()> {
        log::debug!("Delete {address}'s session");
        with_conn!(self.database, |conn| {
            diesel::delete(
                sessions::table
                    .filter(sessions::our_jid.eq(&self.jid))
                    .filter(sessions::their_id.eq(address)),
            )
            .execute(conn)
            .context("delete session", address)?;
            Ok(())
        })
    }

    fn delete_all_sessions(&self, phone: &str) -> Result<()> {
        log::debug!("Delete all sessions of {phone}");
        with_conn!(self.database, |conn| {
            diesel::delete(
                sessions::table
                    .filter(sessions::our_jid.eq(&self.jid))
                    .filter(sessions::their_id.like(format!("{phone}:%"))),
            )
            .execute(conn)
            .context("delete sessions", phone)?;
            Ok(())
        })
    }
}

impl PreKeyStore for DeviceStore {
    fn get_or_gen_pre_keys(&self, count: u32) -> Result<Vec<PreKey>> {
        let _allocation = self.state.pre_key_lock.lock();
        with_conn!(self.database, |conn| {
            conn.write_transaction(|conn| {
                let mut keys = pre_keys::table
                    .filter(pre_keys::jid.eq(&self.jid))
                    .filter(pre_keys::uploaded.eq(false))
                    .order(pre_keys::key_id.asc())
                    .limit(i64::from(count))
                    .select((pre_keys::key_id, pre_keys::private_key))
                    .load::<(i64, Vec<u8>)>(conn)
                    .context("get unuploaded prekeys", &self.jid)?
                    .into_iter()
                    .map(|(key_id, private_key)| pre_key_from_row(key_id, &private_key))
                    .collect::<Result<Vec<_>>>()?;

                let missing = count - keys.len() as u32;
                if missing > 0 {
                    log::debug!("Generate {missing} prekeys for {}", self.jid);
                    let next: u32 = narrow("prekey id", next_pre_key_id!(conn, &self.jid)?)?;
                    for key_id in next..next + missing {
                        let key = PreKey::generate(key_id);
                        insert_pre_key!(conn, &self.jid, key, false)?;
                        keys.push(key);
                    }
                }
                Ok(keys)
            })
        })
    }

    fn gen_one_pre_key(&self) -> Result<PreKey> {
        let _allocation = self.state.pre_key_lock.lock();
        with_conn!(self.database, |conn| {
            conn.write_transaction(|conn| {
                let key = PreKey::generate(narrow("prekey id", next_pre_key_id!(conn, &self.jid)?)?);
                insert_pre_key!(conn, &self.jid, key, true)?;
                log::debug!("Generated prekey {} for {}", key.key_id, self.jid);
                Ok(key)
            })
        })
    }

    fn get_pre_key(&self, id: u32) -> Result<Option<PreKey>> {
        log::debug!("Get prekey {id}");
        let row = with_conn!(self.database, |conn| {
            pre_keys::table
                .filter(pre_keys::jid.eq(&self.jid))
                .filter(pre_keys::key_id.eq(i64::from(id)))
                .select((pre_keys::key_id, pre_keys::private_key))
                .first::<(i64, Vec<u8>)>(conn)
                .optional()
                .context("get prekey", id)?
        });
        row.map(|(key_id, private_key)| pre_key_from_row(key_id, &private_key))
            .transpose()
    }

    fn remove_pre_key(&self, id: u32) -> Result<()> {
        log::debug!("Remove prekey {id}");
        with_conn!(self.database, |conn| {
            diesel::delete(
                pre_keys::table
                    .filter(pre_keys::jid.eq(&self.jid))
                    .filter(pre_keys::key_id.eq(i64::from(id))),
            )
            .execute(conn)
            .context("remove prekey", id)?;
            Ok(())
        })
    }

    fn mark_pre_keys_as_uploaded(&self, up_to_id: u32) -> Result<()> {
        log::debug!("Mark prekeys up to {up_to_id} as uploaded");
        with_conn!(self.database, |conn| {
            diesel::update(
                pre_keys::table
                    .filter(pre_keys::jid.eq(&self.jid))
                    .filter(pre_keys::key_id.le(i64::from(up_to_id))),
            )
            .set(pre_keys::uploaded.eq(true))
            .execute(conn)
            .context("mark prekeys as uploaded", up_to_id)?;
            Ok(())
        })
    }

    fn uploaded_pre_key_count(&self) -> Result<usize> {
        let count = with_conn!(self.database, |conn| {
            pre_keys::table
                .filter(pre_keys::jid.eq(&self.jid))
                .filter(pre_keys::uploaded.eq(true))
                .count()
                .get_result::<i64>(conn)
                .context("count uploaded prekeys", &self.jid)?
        });
        Ok(count as usize)
    }
}

impl SenderKeyStore for DeviceStore {
    fn put_sender_key(&self, group: &str, sender: &str, key: &[u8]) -> Result<()> {
        log::debug!("Save sender key of {sender} in {group}");
        with_conn!(self.database, |conn| {
            diesel::insert_into(sender_keys::table)
                .values((
                    sender_keys::our_jid.eq(&self.jid),
                    sender_keys::chat_id.eq(group),
                    sender_keys::sender_id.eq(sender),
                    sender_keys::sender_key.eq(key),
                ))
                .on_conflict((
                    sender_keys::our_jid,
                    sender_keys::chat_id,
                    sender_keys::sender_id,
                ))
                .do_update()
                .set(sender_keys::sender_key.eq(key))
                .execute(conn)
                .context("put sender key", format_args!("{group}/{sender}"))?;
            Ok(())
        })
    }

    fn get_sender_key(&self, group: &str, sender: &str) -> Result<Option<Vec<u8>>> {
        log::debug!("Get sender key of {sender} in {group}");
        with_conn!(self.database, |conn| {
            sender_keys::table
                .filter(sender_keys::our_jid.eq(&self.jid))
                .filter(sender_keys::chat_id.eq(group))
                .filter(sender_keys::sender_id.eq(sender))
                .select(sender_keys::sender_key)
                .first::<Vec<u8>>(conn)
                .optional()
                .context("get sender key", format_args!("{group}/{sender}"))
        })
    }

    fn delete_sender_key(&self, group: &str, sender: &str) -> Result<()> {
        with_conn!(self.database, |conn| {
            diesel::delete(
                sender_keys::table
                    .filter(sender_keys::our_jid.eq(&self.jid))
                    .filter(sender_keys::chat_id.eq(group))
                    .filter(sender_keys::sender_id.eq(sender)),
            )
            .execute(conn)
            .context("delete sender key", format_args!("{group}/{sender}"))?;
            Ok(())
        })
    }
}
