/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
//! App state synchronization: rotating sync keys and the per-name mutation
//! ledger.
//!
//! The ledger stores the chain value the caller computed for a version along
//! with the index/value MAC pairs of that version's mutations. Older versions
//! of a MAC are kept; lookups always answer with the most recent one.
use diesel::prelude::*;

use super::batch::{BulkDelete, BulkInsert, Param};
use super::conn::{with_conn, ExecuteStatement, WriteTransaction};
use super::schema::{app_state_mutation_macs, app_state_sync_keys, app_state_versions};
use super::DeviceStore;
use crate::error::{fixed, QueryContext, Result, StoreError};
use crate::store::{AppStateStore, AppStateSyncKeyStore};
use crate::types::{AppStateMutationMac, AppStateSyncKey, HashState, HASH_STATE_LEN};

pub const MUTATION_BATCH_SIZE: usize = 400;

const MUTATION_MACS: BulkInsert<'static> = BulkInsert {
    table: "app_state_mutation_macs",
    shared_columns: &["jid", "name", "version"],
    row_columns: &["index_mac", "value_mac"],
    suffix: "",
    chunk_size: MUTATION_BATCH_SIZE,
};

const MUTATION_MAC_DELETE: BulkDelete<'static> = BulkDelete {
    table: "app_state_mutation_macs",
    key_columns: &["jid", "name"],
    list_column: "index_mac",
};

impl AppStateSyncKeyStore for DeviceStore {
    fn put_app_state_sync_key(&self, id: &[u8], key: &AppStateSyncKey) -> Result<()> {
        log::debug!("Save app state sync key {id:02x?}");
        with_conn!(self.database, |conn| {
            conn.write_transaction(|conn| {
                let inserted = diesel::insert_into(app_state_sync_keys::table)
                    .values((
                        app_state_sync_keys::jid.eq(&self.jid),
                        app_state_sync_keys::key_id.eq(id),
                        app_state_sync_keys::key_data.eq(&key.data),
                        app_state_sync_keys::timestamp.eq(key.timestamp),
                        app_state_sync_keys::fingerprint.eq(&key.fingerprint),
                    ))
                    .on_conflict((app_state_sync_keys::jid, app_state_sync_keys::key_id))
                    .do_nothing()
                    .execute(conn)
                    .context("put app state sync key", &self.jid)?;
                if inserted > 0 {
                    return Ok(());
                }

                let updated = diesel::update(
                    app_state_sync_keys::table
                        .filter(app_state_sync_keys::jid.eq(&self.jid))
                        .filter(app_state_sync_keys::key_id.eq(id))
                        .filter(app_state_sync_keys::timestamp.lt(key.timestamp)),
                )
                .set((
                    app_state_sync_keys::key_data.eq(&key.data),
                    app_state_sync_keys::timestamp.eq(key.timestamp),
                    app_state_sync_keys::fingerprint.eq(&key.fingerprint),
                ))
                .execute(conn)
                .context("update app state sync key", &self.jid)?;
                if updated == 0 {
                    log::warn!("Ignoring stale app state sync key {id:02x?}");
                }
                Ok(())
            })
        })
    }

    fn get_app_state_sync_key(&self, id: &[u8]) -> Result<Option<AppStateSyncKey>> {
        let row = with_conn!(self.database, |conn| {
            app_state_sync_keys::table
                .filter(app_state_sync_keys::jid.eq(&self.jid))
                .filter(app_state_sync_keys::key_id.eq(id))
                .select((
                    app_state_sync_keys::key_data,
                    app_state_sync_keys::fingerprint,
                    app_state_sync_keys::timestamp,
                ))
                .first::<(Vec<u8>, Vec<u8>, i64)>(conn)
                .optional()
                .context("get app state sync key", &self.jid)?
        });
        Ok(row.map(|(data, fingerprint, timestamp)| AppStateSyncKey {
            data,
            fingerprint,
            timestamp,
        }))
    }

    fn get_latest_app_state_sync_key_id(&self) -> Result<Option<Vec<u8>>> {
        with_conn!(self.database, |conn| {
            app_state_sync_keys::table
                .filter(app_state_sync_keys::jid.eq(&self.jid))
                .order(app_state_sync_keys::timestamp.desc())
                .select(app_state_sync_keys::key_id)
                .first::<Vec<u8>>(conn)
                .optional()
                .context("get latest app state sync key", &self.jid)
        })
    }
}

impl AppStateStore for DeviceStore {
    fn put_app_state_version(&self, name: &str, version: u64, hash: &[u8]) -> Result<()> {
        StoreError::check_len("app state hash", HASH_STATE_LEN, hash.len())?;
        log::debug!("Save app state {name} at v{version}");
        with_conn!(self.database, |conn| {
            diesel::insert_into(app_state_versions::table)
                .values((
                    app_state_versions::jid.eq(&self.jid),
                    app_state_versions::name.eq(name),
                    app_state_versions::version.eq(version as i64),
                    app_state_versions::hash.eq(hash),
                ))
                .on_conflict((app_state_versions::jid, app_state_versions::name))
                .do_update()
                .set((
                    app_state_versions::version.eq(version as i64),
                    app_state_versions::hash.eq(hash),
                ))
                .execute(conn)
                .context("put app state version", name)?;
            Ok(())
        })
    }

    fn get_app_state_version(&self, name: &str) -> Result<Option<HashState>> {
        let row = with_conn!(self.database, |conn| {
            app_state_versions::table
                .filter(app_state_versions::jid.eq(&self.jid))
                .filter(app_state_versions::name.eq(name))
                .select((app_state_versions::version, app_state_versions::hash))
                .first::<(i64, Vec<u8>)>(conn)
                .optional()
                .context("get app state version", name)?
        });
        row.map(|(version, hash)| {
            Ok(HashState {
                version: version as u64,
                hash: fixed("app state hash", &hash)?,
            })
        })
        .transpose()
    }

    fn delete_app_state_version(&self, name: &str) -> Result<()> {
        log::debug!("Delete app state {name}");
        with_conn!(self.database, |conn| {
            diesel::delete(
                app_state_versions::table
                    .filter(app_state_versions::jid.eq(&self.jid))
                    .filter(app_state_versions::name.eq(name)),
            )
            .execute(conn)
            .context("delete app state version", name)?;
            Ok(())
        })
    }

    fn check_app_state_hash(&self, name: &str, version: u64, hash: &[u8]) -> Result<()> {
        let state = self.get_app_state_version(name)?.unwrap_or_default();
        if state.version == version && state.hash[..] == *hash {
            Ok(())
        } else {
            log::warn!(
                "App state {name} is at v{} but v{version} was asserted with another hash",
                state.version
            );
            Err(StoreError::HashMismatch {
                name: name.to_string(),
                version,
            })
        }
    }

    fn put_app_state_mutation_macs(
        &self,
        name: &str,
        version: u64,
        mutations: &[AppStateMutationMac],
    ) -> Result<()> {
        if mutations.is_empty() {
            return Ok(());
        }
        log::debug!(
            "Save {} mutation MACs of app state {name} at v{version}",
            mutations.len()
        );
        let shared = [
            Param::Text(self.jid.clone()),
            Param::Text(name.to_string()),
            Param::BigInt(version as i64),
        ];
        let rows: Vec<Vec<Param>> = mutations
            .iter()
            .map(|mutation| {
                vec![
                    Param::Blob(mutation.index_mac.clone()),
                    Param::Blob(mutation.value_mac.clone()),
                ]
            })
            .collect();
        let statements = self.database.composer().insert(&MUTATION_MACS, &shared, &rows);

        with_conn!(self.database, |conn| {
            conn.write_transaction(|conn| {
                conn.run_statements(&statements)
                    .context("put app state mutation MACs", name)?;
                Ok(())
            })
        })
    }

    fn delete_app_state_mutation_macs(&self, name: &str, index_macs: &[Vec<u8>]) -> Result<()> {
        let keys = [Param::Text(self.jid.clone()), Param::Text(name.to_string())];
        let statements = self
            .database
            .composer()
            .delete(&MUTATION_MAC_DELETE, &keys, index_macs);
        if statements.is_empty() {
            return Ok(());
        }
        log::debug!("Delete {} mutation MACs of app state {name}", index_macs.len());

        with_conn!(self.database, |conn| {
            conn.write_transaction(|conn| {
                conn.run_statements(&statements)
                    .context("delete app state mutation MACs", name)?;
                Ok(())
            })
        })
    }

    fn get_app_state_mutation_mac(&self, name: &str, index_mac: &[u8]) -> Result<Option<Vec<u8>>> {
        with_conn!(self.database, |conn| {
            app_state_mutation_macs::table
                .filter(app_state_mutation_macs::jid.eq(&self.jid))
                .filter(app_state_mutation_macs::name.eq(name))
                .filter(app_state_mutation_macs::index_mac.eq(index_mac))
                .order(app_state_mutation_macs::version.desc())
                .select(app_state_mutation_macs::value_mac)
                .first::<Vec<u8>>(conn)
                .optional()
                .context("get app state mutation MAC", name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_util::device_store;

    const ME: &str = "123:1@s.whatsapp.net";

    fn sync_key(data: u8, timestamp: i64) -> AppStateSyncKey {
        AppStateSyncKey {
            data: vec![data; 32],
            fingerprint: vec![data; 8],
            timestamp,
        }
    }

    fn mutations(range: std::ops::Range<u32>, value: u8) -> Vec<AppStateMutationMac> {
        range
            .map(|i| {
                let mut index_mac = vec![0u8; 32];
                index_mac[..4].copy_from_slice(&i.to_be_bytes());
                AppStateMutationMac {
                    index_mac,
                    value_mac: vec![value; 32],
                }
            })
            .collect()
    }

    #[derive(QueryableByName)]
    struct Row {
        #[diesel(sql_type = diesel::sql_types::Binary)]
        index_mac: Vec<u8>,
        #[diesel(sql_type = diesel::sql_types::Binary)]
        value_mac: Vec<u8>,
    }

    fn ledger(store: &DeviceStore) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut conn = crate::storage::conn::test_util::sqlite_conn(&store.database);
        diesel::sql_query(
            "SELECT index_mac, value_mac FROM app_state_mutation_macs ORDER BY version, index_mac",
        )
        .load::<Row>(&mut *conn)
        .unwrap()
        .into_iter()
        .map(|row| (row.index_mac, row.value_mac))
        .collect()
    }

    #[test]
    fn test_sync_key_only_newer_timestamp_overwrites() {
        // Given
        let (_dir, _container, store) = device_store(ME);
        store.put_app_state_sync_key(b"key", &sync_key(1, 100)).unwrap();

        // When
        store.put_app_state_sync_key(b"key", &sync_key(2, 100)).unwrap();
        store.put_app_state_sync_key(b"key", &sync_key(3, 50)).unwrap();

        // Then
        assert_eq!(
            store.get_app_state_sync_key(b"key").unwrap(),
            Some(sync_key(1, 100))
        );
        store.put_app_state_sync_key(b"key", &sync_key(4, 101)).unwrap();
        assert_eq!(
            store.get_app_state_sync_key(b"key").unwrap(),
            Some(sync_key(4, 101))
        );
    }

    #[test]
    fn test_latest_sync_key_id() {
        // Given
        let (_dir, _container, store) = device_store(ME);
        assert_eq!(store.get_latest_app_state_sync_key_id().unwrap(), None);

        // When
        store.put_app_state_sync_key(b"old", &sync_key(1, 100)).unwrap();
        store.put_app_state_sync_key(b"new", &sync_key(2, 200)).unwrap();
        store.put_app_state_sync_key(b"mid", &sync_key(3, 150)).unwrap();

        // Then
        assert_eq!(
            store.get_latest_app_state_sync_key_id().unwrap(),
            Some(b"new".to_vec())
        );
        assert_eq!(store.get_app_state_sync_key(b"none").unwrap(), None);
    }

    #[test]
    fn test_hash_is_preserved() {
        // Given
        let (_dir, _container, store) = device_store(ME);
        let hash: Vec<u8> = (0..128).collect();

        // When
        store.put_app_state_version("regular", 7, &hash).unwrap();

        // Then
        let state = store.get_app_state_version("regular").unwrap().unwrap();
        assert_eq!(state.version, 7);
        assert_eq!(state.hash[..], hash[..]);
        assert_eq!(store.get_app_state_version("critical_block").unwrap(), None);
    }

    #[test]
    fn test_hash_of_wrong_length_is_refused() {
        // Given
        let (_dir, _container, store) = device_store(ME);

        // When
        let result = store.put_app_state_version("regular", 1, &[0u8; 127]);

        // Then
        assert!(matches!(
            result,
            Err(StoreError::IntegrityViolation {
                expected: 128,
                actual: 127,
                ..
            })
        ));
    }

    #[test]
    fn test_check_app_state_hash() {
        // Given
        let (_dir, _container, store) = device_store(ME);
        store.put_app_state_version("regular", 2, &[5u8; 128]).unwrap();

        // When
        let matching = store.check_app_state_hash("regular", 2, &[5u8; 128]);
        let other_hash = store.check_app_state_hash("regular", 2, &[6u8; 128]);
        let other_version = store.check_app_state_hash("regular", 3, &[5u8; 128]);

        // Then
        assert!(matching.is_ok());
        assert!(matches!(other_hash, Err(StoreError::HashMismatch { version: 2, .. })));
        assert!(matches!(other_version, Err(StoreError::HashMismatch { version: 3, .. })));
        assert!(store.check_app_state_hash("unknown", 0, &[0u8; 128]).is_ok());
    }

    #[test]
    fn test_large_batch_equals_split_batches() {
        // Given
        let (_dir_a, _container_a, whole) = device_store(ME);
        let (_dir_b, _container_b, split) = device_store(ME);
        let batch = mutations(0..450, 1);
        whole.put_app_state_version("regular", 1, &[0u8; 128]).unwrap();
        split.put_app_state_version("regular", 1, &[0u8; 128]).unwrap();

        // When
        whole.put_app_state_mutation_macs("regular", 1, &batch).unwrap();
        split.put_app_state_mutation_macs("regular", 1, &batch[..400]).unwrap();
        split.put_app_state_mutation_macs("regular", 1, &batch[400..]).unwrap();

        // Then
        let rows = ledger(&whole);
        assert_eq!(rows.len(), 450);
        assert_eq!(rows, ledger(&split));
    }

    #[test]
    fn test_failed_batch_is_not_partially_applied() {
        // Given
        let (_dir, _container, store) = device_store(ME);
        store.put_app_state_version("regular", 1, &[0u8; 128]).unwrap();
        let mut batch = mutations(0..450, 1);
        batch[420].value_mac = vec![1u8; 31];

        // When
        let result = store.put_app_state_mutation_macs("regular", 1, &batch);

        // Then
        assert!(matches!(result, Err(StoreError::Query { .. })));
        assert!(ledger(&store).is_empty());
    }

    #[test]
    fn test_latest_version_of_mac_wins() {
        // Given
        let (_dir, _container, store) = device_store(ME);
        store.put_app_state_version("regular", 1, &[0u8; 128]).unwrap();
        store.put_app_state_mutation_macs("regular", 1, &mutations(0..2, 1)).unwrap();

        // When
        store.put_app_state_version("regular", 2, &[1u8; 128]).unwrap();
        store.put_app_state_mutation_macs("regular", 2, &mutations(0..1, 2)).unwrap();

        // Then
        let index = &mutations(0..2, 0);
        assert_eq!(
            store.get_app_state_mutation_mac("regular", &index[0].index_mac).unwrap(),
            Some(vec![2u8; 32])
        );
        assert_eq!(
            store.get_app_state_mutation_mac("regular", &index[1].index_mac).unwrap(),
            Some(vec![1u8; 32])
        );
        assert_eq!(ledger(&store).len(), 3);
    }

    #[test]
    fn test_delete_mutation_macs() {
        // Given
        let (_dir, _container, store) = device_store(ME);
        let batch = mutations(0..3, 1);
        store.put_app_state_version("regular", 1, &[0u8; 128]).unwrap();
        store.put_app_state_mutation_macs("regular", 1, &batch).unwrap();

        // When
        store
            .delete_app_state_mutation_macs(
                "regular",
                &[batch[0].index_mac.clone(), batch[2].index_mac.clone()],
            )
            .unwrap();

        // Then
        assert_eq!(ledger(&store), vec![(batch[1].index_mac.clone(), vec![1u8; 32])]);
        store.delete_app_state_mutation_macs("regular", &[]).unwrap();
    }

    #[test]
    fn test_deleting_version_cascades_to_macs() {
        // Given
        let (_dir, _container, store) = device_store(ME);
        store.put_app_state_version("regular", 1, &[0u8; 128]).unwrap();
        store.put_app_state_mutation_macs("regular", 1, &mutations(0..5, 1)).unwrap();

        // When
        store.delete_app_state_version("regular").unwrap();

        // Then
        assert_eq!(store.get_app_state_version("regular").unwrap(), None);
        assert!(ledger(&store).is_empty());
    }
}
