// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent-disk bookkeeping kept in the VM's own vApp properties.
//!
//! Device keys change whenever a disk is detached and reattached, so the
//! only durable link between a device and the caller's disk id is the
//! annotation written right after a successful attach. The annotation lives
//! on the VM object and survives host migration and reboots.

use std::sync::Arc;

use slog::{debug, Logger};
use vim_types::{
    managed_type, DatastorePath, ManagedObjectReference, VAppPropertyInfo,
};

use crate::api::{decode, VimApi};
use crate::Error;

/// Category tag separating CPI-managed annotations from unrelated vApp
/// properties.
pub const PERSISTENT_DISK_CATEGORY: &str = "BOSH Persistent Disks";

const VAPP_PROPERTY_PATH: &str = "config.vAppConfig.property";

/// The CPI-managed annotations read from one VM.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiskAnnotations(Vec<VAppPropertyInfo>);

impl DiskAnnotations {
    /// Keeps only the properties tagged with [`PERSISTENT_DISK_CATEGORY`].
    pub fn from_properties(
        properties: impl IntoIterator<Item = VAppPropertyInfo>,
    ) -> Self {
        Self(
            properties
                .into_iter()
                .filter(|p| p.category == PERSISTENT_DISK_CATEGORY)
                .collect(),
        )
    }

    pub fn contains_key(&self, key: i32) -> bool {
        self.by_key(key).is_some()
    }

    pub fn by_key(&self, key: i32) -> Option<&VAppPropertyInfo> {
        self.0.iter().find(|p| p.key == key)
    }

    pub fn device_keys(&self) -> impl Iterator<Item = i32> + '_ {
        self.0.iter().map(|p| p.key)
    }

    /// The datastore path recorded for device `key` when it was attached.
    pub fn recorded_path(
        &self,
        key: i32,
    ) -> Result<Option<DatastorePath>, Error> {
        self.by_key(key)
            .map(|p| p.value.parse().map_err(Error::from))
            .transpose()
    }
}

pub struct PersistentDiskLedger {
    client: Arc<dyn VimApi>,
    vm: ManagedObjectReference,
    log: Logger,
}

impl PersistentDiskLedger {
    pub fn new(
        client: Arc<dyn VimApi>,
        vm: ManagedObjectReference,
        log: Logger,
    ) -> Self {
        Self { client, vm, log }
    }

    /// Reads the current annotation set. A VM without any vApp configuration
    /// simply has none.
    pub async fn load(&self) -> Result<DiskAnnotations, Error> {
        let value = self
            .client
            .get_property(
                &self.vm,
                managed_type::VIRTUAL_MACHINE,
                VAPP_PROPERTY_PATH,
            )
            .await?;
        if value.is_null() {
            return Ok(DiskAnnotations::default());
        }
        let properties: Vec<VAppPropertyInfo> =
            decode(VAPP_PROPERTY_PATH, value)?;
        Ok(DiskAnnotations::from_properties(properties))
    }

    /// Records that device `key` is the caller's disk `cid`, attached from
    /// `path`.
    pub async fn record(
        &self,
        key: i32,
        cid: &str,
        path: &DatastorePath,
    ) -> Result<(), Error> {
        debug!(self.log, "adding persistent disk property";
            "key" => key,
            "disk" => cid,
            "path" => %path,
        );
        let property = VAppPropertyInfo {
            key,
            id: cid.to_string(),
            category: PERSISTENT_DISK_CATEGORY.to_string(),
            label: cid.to_string(),
            value: path.to_string(),
        };
        self.client.add_persistent_disk_property(&self.vm, &property).await
    }

    pub async fn forget(&self, key: i32) -> Result<(), Error> {
        debug!(self.log, "deleting persistent disk property"; "key" => key);
        self.client.delete_persistent_disk_property(&self.vm, key).await
    }
}
