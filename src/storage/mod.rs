/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
mod appstate;
mod batch;
mod conn;
mod contacts;
mod device;
mod dialect;
mod keys;
mod models;
mod schema;
mod settings;
mod upgrade;

use std::collections::HashMap;
use std::sync::Arc;

use diesel::prelude::*;
use parking_lot::Mutex;

use crate::config::StoreConfig;
use crate::error::{QueryContext, Result};
use crate::types::Device;

pub use batch::{BatchComposer, BulkDelete, BulkInsert, Param, Statement};
pub use conn::Database;
pub use device::DeviceStore;
pub use dialect::{Dialect, PlaceholderStyle, PostgresDialect, SqliteDialect};
pub use upgrade::{Migrator, Upgrade, UpgradeFn, UPGRADES};

use conn::with_conn;
use contacts::ContactCache;
use models::DeviceRow;
use schema::devices;

/// In-process state shared by every handle of one device.
#[derive(Default)]
pub(crate) struct DeviceState {
    pub(crate) pre_key_lock: Mutex<()>,
    pub(crate) contacts: ContactCache,
}

/// Owner of the database and entry point to device-scoped stores.
#[derive(Clone)]
pub struct Container {
    database: Arc<Database>,
    devices: Arc<Mutex<HashMap<String, Arc<DeviceState>>>>,
}

impl Container {
    /// Connect and bring the schema up to date.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        Self::from_database(Database::connect(config)?)
    }

    pub fn from_database(database: Database) -> Result<Self> {
        Migrator::new(&database).upgrade()?;
        Ok(Container {
            database: Arc::new(database),
            devices: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    /// Handle on everything stored for `jid`. Handles of the same device
    /// share their prekey allocation lock and contact cache.
    pub fn device_store(&self, jid: &str) -> DeviceStore {
        let state = self
            .devices
            .lock()
            .entry(jid.to_string())
            .or_default()
            .clone();
        DeviceStore::new(jid.to_string(), self.database.clone(), state)
    }

    pub fn put_device(&self, device: &Device) -> Result<()> {
        log::debug!("Save device {}", device.jid);
        let row = DeviceRow::try_from(device)?;
        with_conn!(self.database, |conn| {
            diesel::insert_into(devices::table)
                .values(&row)
                .on_conflict(devices::jid)
                .do_update()
                .set((
                    devices::push_name.eq(&row.push_name),
                    devices::business_name.eq(&row.business_name),
                    devices::platform.eq(&row.platform),
                ))
                .execute(conn)
                .context("put device", &device.jid)?;
            Ok(())
        })
    }

    pub fn get_device(&self, jid: &str) -> Result<Option<Device>> {
        log::debug!("Get device {jid}");
        let row = with_conn!(self.database, |conn| {
            devices::table
                .filter(devices::jid.eq(jid))
                .first::<DeviceRow>(conn)
                .optional()
                .context("get device", jid)?
        });
        row.map(Device::try_from).transpose()
    }

    pub fn get_all_devices(&self) -> Result<Vec<Device>> {
        let rows = with_conn!(self.database, |conn| {
            devices::table
                .order(devices::jid.asc())
                .load::<DeviceRow>(conn)
                .context("get all devices", "*")?
        });
        rows.into_iter().map(Device::try_from).collect()
    }

    pub fn get_first_device(&self) -> Result<Option<Device>> {
        let row = with_conn!(self.database, |conn| {
            devices::table
                .order(devices::jid.asc())
                .first::<DeviceRow>(conn)
                .optional()
                .context("get first device", "*")?
        });
        row.map(Device::try_from).transpose()
    }

    /// Remove a device. Every record scoped to it goes with it, and the
    /// contacts cached by its live handles are dropped. The in-process state
    /// stays registered so that old handles and new ones for the same jid
    /// keep sharing one prekey lock.
    pub fn delete_device(&self, jid: &str) -> Result<()> {
        log::debug!("Delete device {jid}");
        let state = self.devices.lock().get(jid).cloned();
        let mut cache = state.as_ref().map(|state| state.contacts.lock());
        with_conn!(self.database, |conn| {
            diesel::delete(devices::table.filter(devices::jid.eq(jid)))
                .execute(conn)
                .context("delete device", jid)?;
        });
        if let Some(cache) = cache.as_mut() {
            cache.invalidate();
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::keys::{KeyPair, PreKey};
    use crate::types::AdvIdentity;
    use tempfile::TempDir;

    pub fn test_device(jid: &str) -> Device {
        Device {
            jid: jid.to_string(),
            registration_id: 0xdead_beef,
            noise_key: KeyPair::generate(),
            identity_key: KeyPair::generate(),
            signed_pre_key: PreKey {
                signature: Some([9u8; 64]),
                ..PreKey::generate(1)
            },
            adv_secret_key: vec![1u8; 32],
            account: AdvIdentity {
                details: vec![2u8; 16],
                account_signature: [3u8; 64],
                account_signature_key: [4u8; 32],
                device_signature: [5u8; 64],
            },
            platform: String::from("linux"),
            business_name: String::new(),
            push_name: String::from("me"),
            facebook_uuid: None,
        }
    }

    pub fn container() -> (TempDir, Container) {
        let (dir, database) = conn::test_util::sqlite_database(true);
        let container = Container::from_database(database).expect("cannot upgrade database");
        (dir, container)
    }

    /// A container holding one device, and that device's store.
    pub fn device_store(jid: &str) -> (TempDir, Container, DeviceStore) {
        let (dir, container) = container();
        container.put_device(&test_device(jid)).expect("cannot put device");
        let store = container.device_store(jid);
        (dir, container, store)
    }
}
