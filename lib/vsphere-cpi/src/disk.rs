// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use vim_types::{
    DatastorePath, DeviceKind, DiskBacking, DiskMode, VirtualDevice,
    VirtualDeviceConfigSpec, VirtualDisk,
};

/// File name shared by every VM's scratch disk.
pub const EPHEMERAL_DISK_FILE: &str = "ephemeral_disk.vmdk";

// Placeholder key for a device that does not exist on the server yet.
const NEW_DEVICE_KEY: i32 = -1;

/// A caller-owned persistent disk living at `path`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Disk {
    pub cid: String,
    pub path: DatastorePath,
    pub capacity_mb: i64,
}

impl Disk {
    pub fn new(
        cid: impl Into<String>,
        path: DatastorePath,
        capacity_mb: i64,
    ) -> Self {
        Self { cid: cid.into(), path, capacity_mb }
    }

    /// A device-add change plugging this disk into `controller_key`. The
    /// unit number is left for the VM to assign.
    pub fn attachment_spec(
        &self,
        controller_key: i32,
    ) -> VirtualDeviceConfigSpec {
        let disk = VirtualDisk {
            backing: DiskBacking {
                file_name: self.path.to_string(),
                disk_mode: DiskMode::IndependentPersistent,
                datastore: None,
                thin_provisioned: None,
            },
            capacity_in_kb: Some(self.capacity_mb * 1024),
        };
        VirtualDeviceConfigSpec::add(VirtualDevice {
            key: NEW_DEVICE_KEY,
            controller_key: Some(controller_key),
            unit_number: None,
            kind: DeviceKind::Disk(disk),
        })
    }
}

/// The parsed backing path of a disk device.
pub(crate) fn backing_path(device: &VirtualDevice) -> Option<DatastorePath> {
    device.as_disk()?.backing.datastore_path().ok()
}

pub(crate) fn is_ephemeral(device: &VirtualDevice) -> bool {
    backing_path(device)
        .is_some_and(|path| path.file_name() == EPHEMERAL_DISK_FILE)
}
