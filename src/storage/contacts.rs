/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
//! Contacts, behind a write-through cache.
//!
//! The cache lock is held for the whole of an operation, backing store round
//! trip included, so two writers to the same contact cannot lose an update.
use std::collections::{HashMap, HashSet};

use diesel::prelude::*;
#[cfg(test)]
use mockall::automock;
use parking_lot::{Mutex, MutexGuard};

use super::batch::{BulkInsert, Param};
use super::conn::{with_conn, Database, ExecuteStatement, WriteTransaction};
use super::models::{contact_from_row, ContactRow};
use super::schema::contacts;
use super::DeviceStore;
use crate::error::{QueryContext, Result};
use crate::store::ContactStore;
use crate::types::{ContactEntry, ContactInfo};

pub const CONTACT_BATCH_SIZE: usize = 300;

const CONTACT_NAMES: BulkInsert<'static> = BulkInsert {
    table: "contacts",
    shared_columns: &["our_jid"],
    row_columns: &["their_jid", "first_name", "full_name"],
    suffix: "ON CONFLICT (our_jid, their_jid) DO UPDATE SET \
             first_name = excluded.first_name, full_name = excluded.full_name",
    chunk_size: CONTACT_BATCH_SIZE,
};

#[derive(Default)]
pub(crate) struct ContactCache {
    entries: Mutex<HashMap<String, ContactInfo>>,
}

impl ContactCache {
    pub(crate) fn lock(&self) -> CacheGuard<'_> {
        CacheGuard(self.entries.lock())
    }
}

pub(crate) struct CacheGuard<'a>(MutexGuard<'a, HashMap<String, ContactInfo>>);

impl CacheGuard<'_> {
    pub(crate) fn get(&self, user: &str) -> Option<&ContactInfo> {
        self.0.get(user)
    }

    pub(crate) fn put(&mut self, user: &str, info: ContactInfo) {
        self.0.insert(user.to_string(), info);
    }

    pub(crate) fn invalidate(&mut self) {
        self.0.clear();
    }
}

/// Backing store of the contact cache.
#[cfg_attr(test, automock)]
pub(crate) trait ContactRepository {
    fn load_contact(&self, user: &str) -> Result<Option<ContactInfo>>;
    fn load_all_contacts(&self) -> Result<Vec<(String, ContactInfo)>>;
    fn store_push_name(&self, user: &str, push_name: &str) -> Result<()>;
    fn store_business_name(&self, user: &str, business_name: &str) -> Result<()>;
    fn store_contact_name(&self, user: &str, first_name: &str, full_name: &str) -> Result<()>;
    /// Store many names in one transaction. Jids must be unique.
    fn store_contact_names(&self, contacts: &[ContactEntry]) -> Result<()>;
}

pub(crate) struct SqlContactRepository<'a> {
    jid: &'a str,
    database: &'a Database,
}

impl ContactRepository for SqlContactRepository<'_> {
    fn load_contact(&self, user: &str) -> Result<Option<ContactInfo>> {
        let row = with_conn!(self.database, |conn| {
            contacts::table
                .filter(contacts::our_jid.eq(self.jid))
                .filter(contacts::their_jid.eq(user))
                .select((
                    contacts::first_name,
                    contacts::full_name,
                    contacts::push_name,
                    contacts::business_name,
                ))
                .first::<ContactRow>(conn)
                .optional()
                .context("get contact", user)?
        });
        Ok(row.map(contact_from_row))
    }

    fn load_all_contacts(&self) -> Result<Vec<(String, ContactInfo)>> {
        let rows = with_conn!(self.database, |conn| {
            contacts::table
                .filter(contacts::our_jid.eq(self.jid))
                .select((
                    contacts::their_jid,
                    (
                        contacts::first_name,
                        contacts::full_name,
                        contacts::push_name,
                        contacts::business_name,
                    ),
                ))
                .load::<(String, ContactRow)>(conn)
                .context("get all contacts", self.jid)?
        });
        Ok(rows
            .into_iter()
            .map(|(jid, row)| (jid, contact_from_row(row)))
            .collect())
    }

    fn store_push_name(&self, user: &str, push_name: &str) -> Result<()> {
        with_conn!(self.database, |conn| {
            diesel::insert_into(contacts::table)
                .values((
                    contacts::our_jid.eq(self.jid),
                    contacts::their_jid.eq(user),
                    contacts::push_name.eq(push_name),
                ))
                .on_conflict((contacts::our_jid, contacts::their_jid))
                .do_update()
                .set(contacts::push_name.eq(push_name))
                .execute(conn)
                .context("put push name", user)?;
            Ok(())
        })
    }

    fn store_business_name(&self, user: &str, business_name: &str) -> Result<()> {
        with_conn!(self.database, |conn| {
            diesel::insert_into(contacts::table)
                .values((
                    contacts::our_jid.eq(self.jid),
                    contacts::their_jid.eq(user),
                    contacts::business_name.eq(business_name),
                ))
                .on_conflict((contacts::our_jid, contacts::their_jid))
                .do_update()
                .set(contacts::business_name.eq(business_name))
                .execute(conn)
                .context("put business name", user)?;
            Ok(())
        })
    }

    fn store_contact_name(&self, user: &str, first_name: &str, full_name: &str) -> Result<()> {
        with_conn!(self.database, |conn| {
            diesel::insert_into(contacts::table)
                .values((
                    contacts::our_jid.eq(self.jid),
                    contacts::their_jid.eq(user),
                    contacts::first_name.eq(first_name),
                    contacts::full_name.eq(full_name),
                ))
                .on_conflict((contacts::our_jid, contacts::their_jid))
                .do_update()
                .set((
                    contacts::first_name.eq(first_name),
                    contacts::full_name.eq(full_name),
                ))
                .execute(conn)
                .context("put contact name", user)?;
            Ok(())
        })
    }

    fn store_contact_names(&self, entries: &[ContactEntry]) -> Result<()> {
        let rows: Vec<Vec<Param>> = entries
            .iter()
            .map(|entry| {
                vec![
                    Param::Text(entry.jid.clone()),
                    Param::Text(entry.first_name.clone()),
                    Param::Text(entry.full_name.clone()),
                ]
            })
            .collect();
        let statements = self.database.composer().insert(
            &CONTACT_NAMES,
            &[Param::Text(self.jid.to_string())],
            &rows,
        );
        with_conn!(self.database, |conn| {
            conn.write_transaction(|conn| {
                conn.run_statements(&statements)
                    .context("put contact names", self.jid)?;
                Ok(())
            })
        })
    }
}

pub(crate) struct CachedContacts<'a, R> {
    repository: R,
    cache: &'a ContactCache,
}

impl<'a, R: ContactRepository> CachedContacts<'a, R> {
    pub(crate) fn new(repository: R, cache: &'a ContactCache) -> Self {
        CachedContacts { repository, cache }
    }

    fn load(&self, cache: &mut CacheGuard, user: &str) -> Result<ContactInfo> {
        if let Some(info) = cache.get(user) {
            return Ok(info.clone());
        }
        // Misses are cached as well, with found = false.
        let info = self.repository.load_contact(user)?.unwrap_or_default();
        cache.put(user, info.clone());
        Ok(info)
    }

    pub(crate) fn get_contact(&self, user: &str) -> Result<ContactInfo> {
        let mut cache = self.cache.lock();
        self.load(&mut cache, user)
    }

    pub(crate) fn get_all_contacts(&self) -> Result<Vec<(String, ContactInfo)>> {
        let mut cache = self.cache.lock();
        let contacts = self.repository.load_all_contacts()?;
        for (jid, info) in &contacts {
            cache.put(jid, info.clone());
        }
        Ok(contacts)
    }

    pub(crate) fn put_push_name(&self, user: &str, push_name: &str) -> Result<(bool, String)> {
        let mut cache = self.cache.lock();
        let mut info = self.load(&mut cache, user)?;
        if info.push_name == push_name {
            return Ok((false, String::new()));
        }
        log::debug!("Update {user}'s push name");
        self.repository.store_push_name(user, push_name)?;
        let previous = std::mem::replace(&mut info.push_name, push_name.to_string());
        info.found = true;
        cache.put(user, info);
        Ok((true, previous))
    }

    pub(crate) fn put_business_name(
        &self,
        user: &str,
        business_name: &str,
    ) -> Result<(bool, String)> {
        let mut cache = self.cache.lock();
        let mut info = self.load(&mut cache, user)?;
        if info.business_name == business_name {
            return Ok((false, String::new()));
        }
        log::debug!("Update {user}'s business name");
        self.repository.store_business_name(user, business_name)?;
        let previous = std::mem::replace(&mut info.business_name, business_name.to_string());
        info.found = true;
        cache.put(user, info);
        Ok((true, previous))
    }

    pub(crate) fn put_contact_name(&self, user: &str, first_name: &str, full_name: &str) -> Result<()> {
        let mut cache = self.cache.lock();
        let mut info = self.load(&mut cache, user)?;
        if info.first_name == first_name && info.full_name == full_name {
            return Ok(());
        }
        log::debug!("Update {user}'s contact name");
        self.repository.store_contact_name(user, first_name, full_name)?;
        info.first_name = first_name.to_string();
        info.full_name = full_name.to_string();
        info.found = true;
        cache.put(user, info);
        Ok(())
    }

    pub(crate) fn put_all_contact_names(&self, contacts: &[ContactEntry]) -> Result<()> {
        let mut seen = HashSet::new();
        let unique: Vec<ContactEntry> = contacts
            .iter()
            .filter(|contact| {
                if contact.jid.is_empty() {
                    log::warn!("Skipping contact without jid");
                    false
                } else if !seen.insert(contact.jid.as_str()) {
                    log::warn!("Skipping duplicate contact {}", contact.jid);
                    false
                } else {
                    true
                }
            })
            .cloned()
            .collect();
        if unique.is_empty() {
            return Ok(());
        }

        let mut cache = self.cache.lock();
        log::debug!("Save {} contact names", unique.len());
        self.repository.store_contact_names(&unique)?;
        cache.invalidate();
        Ok(())
    }
}

impl DeviceStore {
    fn contacts(&self) -> CachedContacts<'_, SqlContactRepository<'_>> {
        CachedContacts::new(
            SqlContactRepository {
                jid: &self.jid,
                database: &self.database,
            },
            &self.state.contacts,
        )
    }
}

impl ContactStore for DeviceStore {
    fn put_push_name(&self, user: &str, push_name: &str) -> Result<(bool, String)> {
        self.contacts().put_push_name(user, push_name)
    }

    fn put_business_name(&self, user: &str, business_name: &str) -> Result<(bool, String)> {
        self.contacts().put_business_name(user, business_name)
    }

    fn put_contact_name(&self, user: &str, first_name: &str, full_name: &str) -> Result<()> {
        self.contacts().put_contact_name(user, first_name, full_name)
    }

    fn put_all_contact_names(&self, contacts: &[ContactEntry]) -> Result<()> {
        self.contacts().put_all_contact_names(contacts)
    }

    fn get_contact(&self, user: &str) -> Result<ContactInfo> {
        self.contacts().get_contact(user)
    }

    fn get_all_contacts(&self) -> Result<Vec<(String, ContactInfo)>> {
        self.contacts().get_all_contacts()
    }
}
