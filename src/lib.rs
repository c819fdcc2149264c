/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
//! Durable per-device state for multi-device end-to-end encrypted messaging.
//!
//! The [`storage::Container`] owns the database and hands out device-scoped
//! [`storage::DeviceStore`] handles once the schema is current. Each handle
//! implements the store traits of [`store`].
pub mod config;
pub mod error;
pub mod keys;
pub mod storage;
pub mod store;
pub mod types;

pub use config::{BackendKind, DatabaseConfig, StoreConfig};
pub use error::{Result, StoreError};
pub use storage::{Container, Database, DeviceStore, Migrator};
