// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data types shared by the VIM client and the CPI crates.
//!
//! These mirror the subset of the vSphere management object model the CPI
//! reads and writes: managed object references, the virtual device
//! inventory of a VM, reconfiguration specs, runtime questions, vApp
//! properties and task state. Field names follow the wire's camelCase so the
//! types can be decoded directly from transport payloads.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod device;

pub use device::*;

/// An opaque handle to an object living on the management server.
///
/// The CPI never owns the object; the reference is only an address into
/// remote state, so it is cheap to clone and immutable once created.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ManagedObjectReference {
    #[serde(rename = "type")]
    type_name: String,
    value: String,
}

impl ManagedObjectReference {
    pub fn new(
        type_name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self { type_name: type_name.into(), value: value.into() }
    }

    /// The declared managed type, e.g. `VirtualMachine`.
    #[inline]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[inline]
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl Display for ManagedObjectReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.type_name, self.value)
    }
}

/// Names of the managed types the CPI talks to.
pub mod managed_type {
    pub const SERVICE_INSTANCE: &str = "ServiceInstance";
    pub const VIRTUAL_MACHINE: &str = "VirtualMachine";
    pub const VIRTUAL_DISK_MANAGER: &str = "VirtualDiskManager";
    pub const CUSTOM_FIELDS_MANAGER: &str = "CustomFieldsManager";
    pub const HOST_SYSTEM: &str = "HostSystem";
    pub const CLUSTER_COMPUTE_RESOURCE: &str = "ClusterComputeResource";
    pub const RESOURCE_POOL: &str = "ResourcePool";
    pub const DATASTORE: &str = "Datastore";
    pub const DATACENTER: &str = "Datacenter";
}

/// Remote power state of a VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOff,
    PoweredOn,
    Suspended,
}

/// A choice offered by a pending VM question.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementDescription {
    pub key: String,
    pub label: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceOption {
    #[serde(default)]
    pub choice_info: Vec<ElementDescription>,
    #[serde(default)]
    pub default_index: Option<usize>,
}

/// A blocking interactive prompt raised by the hypervisor. The VM makes no
/// progress on the current power operation until the prompt is answered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineQuestion {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub choice: ChoiceOption,
}

impl VirtualMachineQuestion {
    /// The choice the server marks as default, if it declared one.
    pub fn default_choice(&self) -> Option<&ElementDescription> {
        let idx = self.choice.default_index?;
        self.choice.choice_info.get(idx)
    }
}

/// The part of a VM's `runtime` property the CPI consumes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineRuntimeInfo {
    #[serde(default)]
    pub host: Option<ManagedObjectReference>,
    pub power_state: PowerState,
    #[serde(default)]
    pub question: Option<VirtualMachineQuestion>,
}

/// A vApp property: a key/label/value slot stored on the VM object itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VAppPropertyInfo {
    pub key: i32,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArrayUpdateOperation {
    Add,
    Remove,
    Edit,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VAppPropertySpec {
    pub operation: ArrayUpdateOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_key: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<VAppPropertyInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfigSpec {
    #[serde(default)]
    pub property: Vec<VAppPropertySpec>,
}

/// The argument to `ReconfigVM_Task`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineConfigSpec {
    #[serde(default)]
    pub device_change: Vec<VirtualDeviceConfigSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v_app_config: Option<VmConfigSpec>,
}

impl VirtualMachineConfigSpec {
    pub fn with_device_changes(
        device_change: Vec<VirtualDeviceConfigSpec>,
    ) -> Self {
        Self { device_change, v_app_config: None }
    }

    pub fn with_vapp_properties(property: Vec<VAppPropertySpec>) -> Self {
        Self {
            device_change: Vec::new(),
            v_app_config: Some(VmConfigSpec { property }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

/// The `info` property of a task object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub state: TaskState,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

/// Entry points to the server's singleton managers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceContent {
    pub root_folder: ManagedObjectReference,
    pub virtual_disk_manager: ManagedObjectReference,
    pub custom_fields_manager: ManagedObjectReference,
}

/// A field definition registered with the custom fields manager.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomFieldDef {
    pub key: i32,
    pub name: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid datastore path: {0:?}")]
pub struct InvalidDatastorePath(pub String);

/// A path of the form `[datastore] folder/file.vmdk`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DatastorePath {
    datastore: String,
    path: String,
}

impl DatastorePath {
    pub fn new(datastore: impl Into<String>, path: impl Into<String>) -> Self {
        Self { datastore: datastore.into(), path: path.into() }
    }

    /// The datastore name, without brackets.
    pub fn datastore(&self) -> &str {
        &self.datastore
    }

    /// The datastore-relative path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The final component of the relative path.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// The folder part of the relative path, empty at the datastore root.
    pub fn folder(&self) -> &str {
        match self.path.rfind('/') {
            Some(idx) => &self.path[..idx],
            None => "",
        }
    }

    /// The same relative path on another datastore.
    pub fn on_datastore(&self, datastore: &str) -> Self {
        Self::new(datastore, self.path.clone())
    }
}

impl FromStr for DatastorePath {
    type Err = InvalidDatastorePath;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let rest = trimmed
            .strip_prefix('[')
            .ok_or_else(|| InvalidDatastorePath(s.to_string()))?;
        let (datastore, path) = rest
            .split_once(']')
            .ok_or_else(|| InvalidDatastorePath(s.to_string()))?;
        let path = path.trim();
        if datastore.is_empty() || path.is_empty() {
            return Err(InvalidDatastorePath(s.to_string()));
        }
        Ok(Self::new(datastore, path))
    }
}

impl Display for DatastorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.datastore, self.path)
    }
}
