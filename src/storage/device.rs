/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */
use std::sync::Arc;

use super::conn::Database;
use super::DeviceState;

/// Device-scoped view of the store. Implements every store trait for the
/// device it was created for; cheap to clone.
#[derive(Clone)]
pub struct DeviceStore {
    pub(super) jid: String,
    pub(super) database: Arc<Database>,
    pub(super) state: Arc<DeviceState>,
}

impl DeviceStore {
    pub(super) fn new(jid: String, database: Arc<Database>, state: Arc<DeviceState>) -> Self {
        DeviceStore {
            jid,
            database,
            state,
        }
    }

    pub fn jid(&self) -> &str {
        &self.jid
    }
}
