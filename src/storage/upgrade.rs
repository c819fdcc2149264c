/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
//! Versioned schema upgrades.
//!
//! The schema revision lives in the single row of `store_version`. Each
//! step moves the schema from `v` to `v + 1` and bumps that row inside the
//! same transaction, so a failed step leaves both untouched. Upgrades must
//! run once, from a single thread, before the store is shared.
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::result::QueryResult;
use diesel::sql_types::Integer;

use super::conn::{with_conn, Database};
use super::dialect::Dialect;
use super::schema::store_version;
use crate::error::{Result, StoreError};

pub type UpgradeFn = fn(&mut dyn SimpleConnection, &dyn Dialect) -> QueryResult<()>;

#[derive(Clone, Copy)]
pub struct Upgrade {
    pub description: &'static str,
    pub apply: UpgradeFn,
}

pub static UPGRADES: &[Upgrade] = &[
    Upgrade {
        description: "initial tables",
        apply: upgrade_v1,
    },
    Upgrade {
        description: "adv account signature key",
        apply: upgrade_v2,
    },
    Upgrade {
        description: "message secrets",
        apply: upgrade_v3,
    },
    Upgrade {
        description: "privacy tokens",
        apply: upgrade_v4,
    },
    Upgrade {
        description: "strip agent suffix from device jids",
        apply: upgrade_v5,
    },
    Upgrade {
        description: "facebook uuid",
        apply: upgrade_v6,
    },
];

#[derive(QueryableByName)]
struct ForeignKeys {
    #[diesel(sql_type = Integer)]
    foreign_keys: i32,
}

pub struct Migrator<'a> {
    database: &'a Database,
    steps: &'a [Upgrade],
}

impl<'a> Migrator<'a> {
    pub fn new(database: &'a Database) -> Self {
        Self::with_steps(database, UPGRADES)
    }

    pub fn with_steps(database: &'a Database, steps: &'a [Upgrade]) -> Self {
        Migrator { database, steps }
    }

    pub fn latest(&self) -> usize {
        self.steps.len()
    }

    /// Current schema version, 0 for a store that was never upgraded.
    pub fn version(&self) -> Result<usize> {
        with_conn!(self.database, |conn| {
            conn.batch_execute("CREATE TABLE IF NOT EXISTS store_version (version BIGINT)")?;
            let version = store_version::table
                .select(store_version::version)
                .first::<i64>(conn)
                .optional()?;
            Ok(version.unwrap_or(0) as usize)
        })
    }

    pub fn upgrade(&self) -> Result<usize> {
        self.upgrade_to(self.latest())
    }

    /// Apply pending steps up to `target` and return the version reached.
    pub fn upgrade_to(&self, target: usize) -> Result<usize> {
        let dialect = self.database.dialect();
        let mut version = self.version()?;
        if version > self.latest() {
            return Err(StoreError::SchemaTooNew {
                found: version,
                latest: self.latest(),
            });
        }

        with_conn!(self.database, |conn| {
            if dialect.name() == "sqlite" {
                let pragma = diesel::sql_query("PRAGMA foreign_keys").get_result::<ForeignKeys>(conn)?;
                if pragma.foreign_keys == 0 {
                    return Err(StoreError::ForeignKeysDisabled);
                }
            }

            let target = target.min(self.latest());
            while version < target {
                let step = &self.steps[version];
                let next = version + 1;
                log::info!("Upgrading database to v{} ({})", next, step.description);
                conn.transaction::<_, StoreError, _>(|conn| {
                    (step.apply)(&mut *conn, dialect)?;
                    diesel::delete(store_version::table).execute(conn)?;
                    diesel::insert_into(store_version::table)
                        .values(store_version::version.eq(next as i64))
                        .execute(conn)?;
                    Ok(())
                })
                .map_err(|source| StoreError::Migration {
                    version: next,
                    source: Box::new(source),
                })?;
                version = next;
            }
            Ok(version)
        })
    }
}

fn upgrade_v1(conn: &mut dyn SimpleConnection, dialect: &dyn Dialect) -> QueryResult<()> {
    let blob = dialect.blob_type();
    conn.batch_execute(&format!(
        "CREATE TABLE devices (
            jid TEXT PRIMARY KEY,
            registration_id BIGINT NOT NULL CHECK ( registration_id >= 0 AND registration_id < 4294967296 ),
            noise_key {blob} NOT NULL CHECK ( length(noise_key) = 32 ),
            identity_key {blob} NOT NULL CHECK ( length(identity_key) = 32 ),
            signed_pre_key {blob} NOT NULL CHECK ( length(signed_pre_key) = 32 ),
            signed_pre_key_id INTEGER NOT NULL CHECK ( signed_pre_key_id >= 0 AND signed_pre_key_id < 16777216 ),
            signed_pre_key_sig {blob} NOT NULL CHECK ( length(signed_pre_key_sig) = 64 ),
            adv_key {blob} NOT NULL,
            adv_details {blob} NOT NULL,
            adv_account_sig {blob} NOT NULL CHECK ( length(adv_account_sig) = 64 ),
            adv_device_sig {blob} NOT NULL CHECK ( length(adv_device_sig) = 64 ),
            platform TEXT NOT NULL DEFAULT '',
            business_name TEXT NOT NULL DEFAULT '',
            push_name TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE identity_keys (
            our_jid TEXT,
            their_id TEXT,
            identity {blob} NOT NULL CHECK ( length(identity) = 32 ),
            PRIMARY KEY (our_jid, their_id),
            FOREIGN KEY (our_jid) REFERENCES devices(jid) ON DELETE CASCADE ON UPDATE CASCADE
        );

        CREATE TABLE pre_keys (
            jid TEXT,
            key_id BIGINT CHECK ( key_id >= 0 AND key_id < 16777216 ),
            private_key {blob} NOT NULL CHECK ( length(private_key) = 32 ),
            uploaded BOOLEAN NOT NULL,
            PRIMARY KEY (jid, key_id),
            FOREIGN KEY (jid) REFERENCES devices(jid) ON DELETE CASCADE ON UPDATE CASCADE
        );

        CREATE TABLE sessions (
            our_jid TEXT,
            their_id TEXT,
            session {blob} NOT NULL,
            PRIMARY KEY (our_jid, their_id),
            FOREIGN KEY (our_jid) REFERENCES devices(jid) ON DELETE CASCADE ON UPDATE CASCADE
        );

        CREATE TABLE sender_keys (
            our_jid TEXT,
            chat_id TEXT,
            sender_id TEXT,
            sender_key {blob} NOT NULL,
            PRIMARY KEY (our_jid, chat_id, sender_id),
            FOREIGN KEY (our_jid) REFERENCES devices(jid) ON DELETE CASCADE ON UPDATE CASCADE
        );

        CREATE TABLE app_state_sync_keys (
            jid TEXT,
            key_id {blob},
            key_data {blob} NOT NULL,
            timestamp BIGINT NOT NULL,
            fingerprint {blob} NOT NULL,
            PRIMARY KEY (jid, key_id),
            FOREIGN KEY (jid) REFERENCES devices(jid) ON DELETE CASCADE ON UPDATE CASCADE
        );

        CREATE TABLE app_state_versions (
            jid TEXT,
            name TEXT,
            version BIGINT NOT NULL,
            hash {blob} NOT NULL CHECK ( length(hash) = 128 ),
            PRIMARY KEY (jid, name),
            FOREIGN KEY (jid) REFERENCES devices(jid) ON DELETE CASCADE ON UPDATE CASCADE
        );

        CREATE TABLE app_state_mutation_macs (
            jid TEXT,
            name TEXT,
            version BIGINT,
            index_mac {blob} CHECK ( length(index_mac) = 32 ),
            value_mac {blob} NOT NULL CHECK ( length(value_mac) = 32 ),
            PRIMARY KEY (jid, name, version, index_mac),
            FOREIGN KEY (jid, name) REFERENCES app_state_versions(jid, name) ON DELETE CASCADE ON UPDATE CASCADE
        );

        CREATE TABLE contacts (
            our_jid TEXT,
            their_jid TEXT,
            first_name TEXT,
            full_name TEXT,
            push_name TEXT,
            business_name TEXT,
            PRIMARY KEY (our_jid, their_jid),
            FOREIGN KEY (our_jid) REFERENCES devices(jid) ON DELETE CASCADE ON UPDATE CASCADE
        );

        CREATE TABLE chat_settings (
            our_jid TEXT,
            chat_jid TEXT,
            muted_until BIGINT NOT NULL DEFAULT 0,
            pinned BOOLEAN NOT NULL DEFAULT false,
            archived BOOLEAN NOT NULL DEFAULT false,
            PRIMARY KEY (our_jid, chat_jid),
            FOREIGN KEY (our_jid) REFERENCES devices(jid) ON DELETE CASCADE ON UPDATE CASCADE
        );"
    ))
}

fn upgrade_v2(conn: &mut dyn SimpleConnection, dialect: &dyn Dialect) -> QueryResult<()> {
    conn.batch_execute(&format!(
        "ALTER TABLE devices ADD COLUMN adv_account_sig_key {} CHECK ( length(adv_account_sig_key) = 32 )",
        dialect.blob_type()
    ))?;
    // The account signature key is the identity of the primary device.
    conn.batch_execute(&format!(
        "UPDATE devices SET adv_account_sig_key = (
            SELECT identity FROM identity_keys
            WHERE our_jid = devices.jid AND their_id = {} || ':0'
        )",
        dialect.jid_user_part("devices.jid")
    ))?;
    if dialect.name() == "postgres" {
        conn.batch_execute(
            "DELETE FROM devices WHERE adv_account_sig_key IS NULL;
            ALTER TABLE devices ALTER COLUMN adv_account_sig_key SET NOT NULL;",
        )?;
    }
    Ok(())
}

fn upgrade_v3(conn: &mut dyn SimpleConnection, dialect: &dyn Dialect) -> QueryResult<()> {
    conn.batch_execute(&format!(
        "CREATE TABLE message_secrets (
            our_jid TEXT,
            chat_jid TEXT,
            sender_jid TEXT,
            message_id TEXT,
            secret {} NOT NULL,
            PRIMARY KEY (our_jid, chat_jid, sender_jid, message_id),
            FOREIGN KEY (our_jid) REFERENCES devices(jid) ON DELETE CASCADE ON UPDATE CASCADE
        )",
        dialect.blob_type()
    ))
}

fn upgrade_v4(conn: &mut dyn SimpleConnection, dialect: &dyn Dialect) -> QueryResult<()> {
    conn.batch_execute(&format!(
        "CREATE TABLE privacy_tokens (
            our_jid TEXT,
            their_jid TEXT,
            token {} NOT NULL,
            timestamp BIGINT NOT NULL,
            PRIMARY KEY (our_jid, their_jid),
            FOREIGN KEY (our_jid) REFERENCES devices(jid) ON DELETE CASCADE ON UPDATE CASCADE
        )",
        dialect.blob_type()
    ))
}

fn upgrade_v5(conn: &mut dyn SimpleConnection, _dialect: &dyn Dialect) -> QueryResult<()> {
    conn.batch_execute("UPDATE devices SET jid = REPLACE(jid, '.0', '')")
}

fn upgrade_v6(conn: &mut dyn SimpleConnection, _dialect: &dyn Dialect) -> QueryResult<()> {
    conn.batch_execute("ALTER TABLE devices ADD COLUMN facebook_uuid TEXT")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::conn::test_util::{sqlite_conn, sqlite_database};
    use crate::storage::schema::devices;
    use diesel::sql_types::{Nullable, Text};

    #[derive(Debug, PartialEq, QueryableByName)]
    struct SchemaObject {
        #[diesel(sql_type = Text)]
        name: String,
        #[diesel(sql_type = Nullable<Text>)]
        sql: Option<String>,
    }

    fn schema_of(database: &Database) -> Vec<SchemaObject> {
        let mut conn = sqlite_conn(database);
        diesel::sql_query("SELECT name, sql FROM sqlite_master ORDER BY name")
            .load(&mut *conn)
            .unwrap()
    }

    fn broken_step(conn: &mut dyn SimpleConnection, _dialect: &dyn Dialect) -> QueryResult<()> {
        conn.batch_execute("CREATE TABLE half_done (id INTEGER)")?;
        conn.batch_execute("ALTER TABLE missing ADD COLUMN nope TEXT")
    }

    #[test]
    fn test_fresh_upgrade() {
        // Given
        let (_dir, database) = sqlite_database(true);
        let migrator = Migrator::new(&database);

        // When
        let version = migrator.upgrade().unwrap();

        // Then
        assert_eq!(version, UPGRADES.len());
        assert_eq!(migrator.version().unwrap(), UPGRADES.len());
        let names: Vec<String> = schema_of(&database).into_iter().map(|o| o.name).collect();
        assert!(names.contains(&String::from("privacy_tokens")));
        assert!(names.contains(&String::from("app_state_mutation_macs")));
    }

    #[test]
    fn test_upgrade_is_a_noop_when_current() {
        // Given
        let (_dir, database) = sqlite_database(true);
        let migrator = Migrator::new(&database);
        migrator.upgrade().unwrap();
        let before = schema_of(&database);

        // When
        let version = migrator.upgrade().unwrap();

        // Then
        assert_eq!(version, UPGRADES.len());
        assert_eq!(schema_of(&database), before);
    }

    #[test]
    fn test_interrupted_upgrade_converges() {
        // Given
        let (_dir_a, interrupted) = sqlite_database(true);
        let (_dir_b, clean) = sqlite_database(true);
        Migrator::new(&interrupted).upgrade_to(3).unwrap();

        // When
        Migrator::new(&interrupted).upgrade().unwrap();
        Migrator::new(&clean).upgrade().unwrap();

        // Then
        assert_eq!(schema_of(&interrupted), schema_of(&clean));
    }

    #[test]
    fn test_failing_step_rolls_back() {
        // Given
        let (_dir, database) = sqlite_database(true);
        let steps = [
            UPGRADES[0],
            Upgrade {
                description: "broken",
                apply: broken_step,
            },
        ];
        let migrator = Migrator::with_steps(&database, &steps);

        // When
        let result = migrator.upgrade();

        // Then
        assert!(matches!(result, Err(StoreError::Migration { version: 2, .. })));
        assert_eq!(migrator.version().unwrap(), 1);
        assert!(!schema_of(&database).iter().any(|o| o.name == "half_done"));
    }

    #[test]
    fn test_foreign_keys_must_be_enabled() {
        // Given
        let (_dir, database) = sqlite_database(false);

        // When
        let result = Migrator::new(&database).upgrade();

        // Then
        assert!(matches!(result, Err(StoreError::ForeignKeysDisabled)));
    }

    #[test]
    fn test_newer_schema_is_refused() {
        // Given
        let (_dir, database) = sqlite_database(true);
        Migrator::new(&database).upgrade().unwrap();

        // When
        let result = Migrator::with_steps(&database, &UPGRADES[..2]).upgrade();

        // Then
        assert!(matches!(
            result,
            Err(StoreError::SchemaTooNew { found: 6, latest: 2 })
        ));
    }

    #[test]
    fn test_legacy_device_is_backfilled_and_renamed() {
        // Given
        let (_dir, database) = sqlite_database(true);
        let migrator = Migrator::new(&database);
        migrator.upgrade_to(1).unwrap();
        let key32 = "11".repeat(32);
        let key64 = "22".repeat(64);
        {
            let mut conn = sqlite_conn(&database);
            conn.batch_execute(&format!(
                "INSERT INTO devices (jid, registration_id, noise_key, identity_key, signed_pre_key,
                    signed_pre_key_id, signed_pre_key_sig, adv_key, adv_details, adv_account_sig,
                    adv_device_sig)
                VALUES ('123.0:1@s.whatsapp.net', 1, X'{key32}', X'{key32}', X'{key32}', 1,
                    X'{key64}', X'00', X'00', X'{key64}', X'{key64}');
                INSERT INTO identity_keys (our_jid, their_id, identity)
                VALUES ('123.0:1@s.whatsapp.net', '123:0', X'{}');",
                "33".repeat(32)
            ))
            .unwrap();
        }

        // When
        migrator.upgrade().unwrap();

        // Then
        let mut conn = sqlite_conn(&database);
        let (jid, sig_key) = devices::table
            .select((devices::jid, devices::adv_account_sig_key))
            .first::<(String, Option<Vec<u8>>)>(&mut *conn)
            .unwrap();
        assert_eq!(jid, "123:1@s.whatsapp.net");
        assert_eq!(sig_key, Some(vec![0x33; 32]));
    }
}
