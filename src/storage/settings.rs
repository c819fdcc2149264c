/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use diesel::prelude::*;

use super::batch::{BulkInsert, Param};
use super::conn::{with_conn, ExecuteStatement, WriteTransaction};
use super::schema::{chat_settings, message_secrets, privacy_tokens};
use super::DeviceStore;
use crate::error::{QueryContext, Result};
use crate::store::{ChatSettingsStore, MsgSecretStore, PrivacyTokenStore};
use crate::types::{ChatSettings, MessageSecretInsert, PrivacyToken};

pub const PRIVACY_TOKEN_BATCH_SIZE: usize = 300;

const PRIVACY_TOKENS: BulkInsert<'static> = BulkInsert {
    table: "privacy_tokens",
    shared_columns: &["our_jid"],
    row_columns: &["their_jid", "token", "timestamp"],
    suffix: "ON CONFLICT (our_jid, their_jid) DO UPDATE SET \
             token = excluded.token, timestamp = excluded.timestamp",
    chunk_size: PRIVACY_TOKEN_BATCH_SIZE,
};

fn from_unix(timestamp: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(timestamp, 0).single()
}

impl ChatSettingsStore for DeviceStore {
    fn put_muted_until(&self, chat: &str, muted_until: Option<DateTime<Utc>>) -> Result<()> {
        // 0 means not muted
        let muted_until = muted_until.map_or(0, |until| until.timestamp());
        with_conn!(self.database, |conn| {
            diesel::insert_into(chat_settings::table)
                .values((
                    chat_settings::our_jid.eq(&self.jid),
                    chat_settings::chat_jid.eq(chat),
                    chat_settings::muted_until.eq(muted_until),
                ))
                .on_conflict((chat_settings::our_jid, chat_settings::chat_jid))
                .do_update()
                .set(chat_settings::muted_until.eq(muted_until))
                .execute(conn)
                .context("put muted until", chat)?;
            Ok(())
        })
    }

    fn put_pinned(&self, chat: &str, pinned: bool) -> Result<()> {
        with_conn!(self.database, |conn| {
            diesel::insert_into(chat_settings::table)
                .values((
                    chat_settings::our_jid.eq(&self.jid),
                    chat_settings::chat_jid.eq(chat),
                    chat_settings::pinned.eq(pinned),
                ))
                .on_conflict((chat_settings::our_jid, chat_settings::chat_jid))
                .do_update()
                .set(chat_settings::pinned.eq(pinned))
                .execute(conn)
                .context("put pinned", chat)?;
            Ok(())
        })
    }

    fn put_archived(&self, chat: &str, archived: bool) -> Result<()> {
        with_conn!(self.database, |conn| {
            diesel::insert_into(chat_settings::table)
                .values((
                    chat_settings::our_jid.eq(&self.jid),
                    chat_settings::chat_jid.eq(chat),
                    chat_settings::archived.eq(archived),
                ))
                .on_conflict((chat_settings::our_jid, chat_settings::chat_jid))
                .do_update()
                .set(chat_settings::archived.eq(archived))
                .execute(conn)
                .context("put archived", chat)?;
            Ok(())
        })
    }

    fn get_chat_settings(&self, chat: &str) -> Result<Option<ChatSettings>> {
        let row = with_conn!(self.database, |conn| {
            chat_settings::table
                .filter(chat_settings::our_jid.eq(&self.jid))
                .filter(chat_settings::chat_jid.eq(chat))
                .select((
                    chat_settings::muted_until,
                    chat_settings::pinned,
                    chat_settings::archived,
                ))
                .first::<(i64, bool, bool)>(conn)
                .optional()
                .context("get chat settings", chat)?
        });
        Ok(row.map(|(muted_until, pinned, archived)| ChatSettings {
            muted_until: Some(muted_until).filter(|&until| until != 0).and_then(from_unix),
            pinned,
            archived,
        }))
    }
}

impl MsgSecretStore for DeviceStore {
    fn put_message_secrets(&self, inserts: &[MessageSecretInsert]) -> Result<()> {
        if inserts.is_empty() {
            return Ok(());
        }
        log::debug!("Save {} message secrets", inserts.len());
        with_conn!(self.database, |conn| {
            conn.write_transaction(|conn| {
                for insert in inserts {
                    diesel::insert_into(message_secrets::table)
                        .values((
                            message_secrets::our_jid.eq(&self.jid),
                            message_secrets::chat_jid.eq(&insert.chat),
                            message_secrets::sender_jid.eq(&insert.sender),
                            message_secrets::message_id.eq(&insert.id),
                            message_secrets::secret.eq(&insert.secret),
                        ))
                        .on_conflict_do_nothing()
                        .execute(conn)
                        .context("put message secret", &insert.id)?;
                }
                Ok(())
            })
        })
    }

    fn put_message_secret(&self, chat: &str, sender: &str, id: &str, secret: &[u8]) -> Result<()> {
        log::debug!("Save message secret of {id}");
        with_conn!(self.database, |conn| {
            diesel::insert_into(message_secrets::table)
                .values((
                    message_secrets::our_jid.eq(&self.jid),
                    message_secrets::chat_jid.eq(chat),
                    message_secrets::sender_jid.eq(sender),
                    message_secrets::message_id.eq(id),
                    message_secrets::secret.eq(secret),
                ))
                .on_conflict_do_nothing()
                .execute(conn)
                .context("put message secret", id)?;
            Ok(())
        })
    }

    fn get_message_secret(&self, chat: &str, sender: &str, id: &str) -> Result<Option<Vec<u8>>> {
        with_conn!(self.database, |conn| {
            message_secrets::table
                .filter(message_secrets::our_jid.eq(&self.jid))
                .filter(message_secrets::chat_jid.eq(chat))
                .filter(message_secrets::sender_jid.eq(sender))
                .filter(message_secrets::message_id.eq(id))
                .select(message_secrets::secret)
                .first::<Vec<u8>>(conn)
                .optional()
                .context("get message secret", id)
        })
    }
}

impl PrivacyTokenStore for DeviceStore {
    fn put_privacy_tokens(&self, tokens: &[PrivacyToken]) -> Result<()> {
        // A single upsert cannot touch a row twice, keep the last token per user.
        let latest: HashMap<&str, usize> = tokens
            .iter()
            .enumerate()
            .map(|(index, token)| (token.user.as_str(), index))
            .collect();
        let rows: Vec<Vec<Param>> = tokens
            .iter()
            .enumerate()
            .filter(|(index, token)| latest.get(token.user.as_str()) == Some(index))
            .map(|(_, token)| {
                vec![
                    Param::Text(token.user.clone()),
                    Param::Blob(token.token.clone()),
                    Param::BigInt(token.timestamp.timestamp()),
                ]
            })
            .collect();
        if rows.is_empty() {
            return Ok(());
        }
        log::debug!("Save {} privacy tokens", rows.len());

        let statements = self.database.composer().insert(
            &PRIVACY_TOKENS,
            &[Param::Text(self.jid.clone())],
            &rows,
        );
        with_conn!(self.database, |conn| {
            conn.write_transaction(|conn| {
                conn.run_statements(&statements)
                    .context("put privacy tokens", &self.jid)?;
                Ok(())
            })
        })
    }

    fn get_privacy_token(&self, user: &str) -> Result<Option<PrivacyToken>> {
        let row = with_conn!(self.database, |conn| {
            privacy_tokens::table
                .filter(privacy_tokens::our_jid.eq(&self.jid))
                .filter(privacy_tokens::their_jid.eq(user))
                .select((privacy_tokens::token, privacy_tokens::timestamp))
                .first::<(Vec<u8>, i64)>(conn)
                .optional()
                .context("get privacy token", user)?
        });
        Ok(row.map(|(token, timestamp)| PrivacyToken {
            user: user.to_string(),
            token,
            timestamp: from_unix(timestamp).unwrap_or_default(),
        }))
    }
}
