// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual device inventory and device-change specs.

use serde::{Deserialize, Serialize};

use crate::{DatastorePath, InvalidDatastorePath, ManagedObjectReference};

/// Lowest and highest unit numbers a device can occupy on one controller.
pub const MIN_UNIT_NUMBER: i32 = 0;
pub const MAX_UNIT_NUMBER: i32 = 15;

/// Access mode of a virtual disk's backing file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskMode {
    Persistent,
    Nonpersistent,
    Undoable,
    IndependentPersistent,
    IndependentNonpersistent,
    Append,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskBacking {
    pub file_name: String,
    pub disk_mode: DiskMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore: Option<ManagedObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thin_provisioned: Option<bool>,
}

impl DiskBacking {
    pub fn datastore_path(
        &self,
    ) -> Result<DatastorePath, InvalidDatastorePath> {
        self.file_name.parse()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDisk {
    pub backing: DiskBacking,
    #[serde(
        default,
        rename = "capacityInKB",
        skip_serializing_if = "Option::is_none"
    )]
    pub capacity_in_kb: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualEthernetCard {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

/// The closed set of device kinds the CPI distinguishes. Anything else the
/// server reports decodes as `Other`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_type")]
pub enum DeviceKind {
    #[serde(rename = "VirtualDisk")]
    Disk(VirtualDisk),

    #[serde(
        rename = "VirtualEthernetCard",
        alias = "VirtualE1000",
        alias = "VirtualE1000e",
        alias = "VirtualPCNet32",
        alias = "VirtualVmxnet",
        alias = "VirtualVmxnet2",
        alias = "VirtualVmxnet3"
    )]
    EthernetCard(VirtualEthernetCard),

    #[serde(rename = "VirtualCdrom")]
    Cdrom,

    #[serde(rename = "VirtualPCIController")]
    PciController,

    #[serde(
        rename = "VirtualSCSIController",
        alias = "VirtualLsiLogicController",
        alias = "VirtualLsiLogicSASController",
        alias = "VirtualBusLogicController",
        alias = "ParaVirtualSCSIController"
    )]
    ScsiController,

    #[serde(other)]
    Other,
}

/// One entry of a VM's `config.hardware.device` list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDevice {
    pub key: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_key: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_number: Option<i32>,
    #[serde(flatten)]
    pub kind: DeviceKind,
}

impl VirtualDevice {
    pub fn as_disk(&self) -> Option<&VirtualDisk> {
        match &self.kind {
            DeviceKind::Disk(disk) => Some(disk),
            _ => None,
        }
    }

    pub fn as_disk_mut(&mut self) -> Option<&mut VirtualDisk> {
        match &mut self.kind {
            DeviceKind::Disk(disk) => Some(disk),
            _ => None,
        }
    }

    /// Backing file name of a disk device.
    pub fn disk_file_name(&self) -> Option<&str> {
        self.as_disk().map(|d| d.backing.file_name.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceOperation {
    Add,
    Remove,
    Edit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileOperation {
    Destroy,
}

/// A single pending change to a VM's device list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDeviceConfigSpec {
    pub operation: DeviceOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_operation: Option<FileOperation>,
    pub device: VirtualDevice,
}

impl VirtualDeviceConfigSpec {
    pub fn add(device: VirtualDevice) -> Self {
        Self { operation: DeviceOperation::Add, file_operation: None, device }
    }

    /// Removes `device` from the VM. The backing file is only deleted when
    /// `destroy` is set.
    pub fn remove(device: VirtualDevice, destroy: bool) -> Self {
        Self {
            operation: DeviceOperation::Remove,
            file_operation: destroy.then_some(FileOperation::Destroy),
            device,
        }
    }

    pub fn edit(device: VirtualDevice) -> Self {
        Self { operation: DeviceOperation::Edit, file_operation: None, device }
    }
}
