// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The operations the VM controller needs from the management server.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use vim_types::{
    DatastorePath, ManagedObjectReference, VAppPropertyInfo,
    VirtualMachineConfigSpec,
};

use crate::Error;

/// Which of the requested paths must be present in a property read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Required {
    All,
    Paths(&'static [&'static str]),
}

impl Required {
    pub fn includes(&self, path: &str) -> bool {
        match self {
            Required::All => true,
            Required::Paths(paths) => paths.contains(&path),
        }
    }
}

/// Property values read from one managed object, keyed by property path.
/// A path whose value is null or absent is treated as missing.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyMap {
    object: ManagedObjectReference,
    values: BTreeMap<String, Value>,
}

impl PropertyMap {
    pub fn new(object: ManagedObjectReference) -> Self {
        Self { object, values: BTreeMap::new() }
    }

    pub fn insert(&mut self, path: impl Into<String>, value: Value) {
        if !value.is_null() {
            self.values.insert(path.into(), value);
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.values.contains_key(path)
    }

    /// Decodes `path`, if present.
    pub fn get<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, Error> {
        self.values
            .get(path)
            .map(|v| decode(path, v.clone()))
            .transpose()
    }

    /// Decodes `path`, failing when it is missing.
    pub fn require<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, Error> {
        self.get(path)?.ok_or_else(|| Error::MissingProperty {
            object: self.object.clone(),
            path: path.to_string(),
        })
    }
}

pub(crate) fn decode<T: DeserializeOwned>(
    path: &str,
    value: Value,
) -> Result<T, Error> {
    serde_json::from_value(value)
        .map_err(|source| Error::Decode { path: path.to_string(), source })
}

/// Named management operations. Every mutating operation is expected to go
/// through the retrying invoker; property reads are single attempts.
#[async_trait]
pub trait VimApi: Send + Sync {
    async fn power_on_vm(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<(), Error>;

    async fn power_off_vm(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<(), Error>;

    async fn shutdown_guest(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<(), Error>;

    async fn reboot_guest(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<(), Error>;

    async fn reconfig_vm(
        &self,
        vm: &ManagedObjectReference,
        spec: &VirtualMachineConfigSpec,
    ) -> Result<(), Error>;

    async fn answer_vm(
        &self,
        vm: &ManagedObjectReference,
        question_id: &str,
        choice_key: &str,
    ) -> Result<(), Error>;

    async fn delete_vm(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<(), Error>;

    async fn move_disk(
        &self,
        datacenter: &ManagedObjectReference,
        source: &DatastorePath,
        dest: &DatastorePath,
    ) -> Result<(), Error>;

    async fn disk_path_exists(
        &self,
        vm: &ManagedObjectReference,
        path: &DatastorePath,
    ) -> Result<bool, Error>;

    async fn add_persistent_disk_property(
        &self,
        vm: &ManagedObjectReference,
        property: &VAppPropertyInfo,
    ) -> Result<(), Error>;

    async fn delete_persistent_disk_property(
        &self,
        vm: &ManagedObjectReference,
        key: i32,
    ) -> Result<(), Error>;

    /// Walks up the inventory from `object` to the nearest ancestor of
    /// `type_name`.
    async fn find_parent(
        &self,
        object: &ManagedObjectReference,
        type_name: &'static str,
    ) -> Result<ManagedObjectReference, Error>;

    async fn set_custom_field(
        &self,
        vm: &ManagedObjectReference,
        name: &str,
        value: &str,
    ) -> Result<(), Error>;

    async fn get_property(
        &self,
        object: &ManagedObjectReference,
        type_name: &str,
        path: &str,
    ) -> Result<Value, Error>;

    /// Reads each of `paths` in turn, failing if a path `required` names
    /// comes back missing.
    async fn get_properties(
        &self,
        object: &ManagedObjectReference,
        type_name: &str,
        paths: &[&str],
        required: Required,
    ) -> Result<PropertyMap, Error> {
        let mut properties = PropertyMap::new(object.clone());
        for path in paths {
            let value = self.get_property(object, type_name, path).await?;
            properties.insert(*path, value);
        }
        if let Some(missing) = paths
            .iter()
            .find(|path| required.includes(path) && !properties.contains(path))
        {
            return Err(Error::MissingProperty {
                object: object.clone(),
                path: missing.to_string(),
            });
        }
        Ok(properties)
    }
}
