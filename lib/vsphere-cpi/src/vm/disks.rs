// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, BTreeSet};

use slog::{debug, info};
use vim_types::{
    DatastorePath, VAppPropertyInfo, VirtualDevice, VirtualDeviceConfigSpec,
    VirtualMachineConfigSpec, MAX_UNIT_NUMBER, MIN_UNIT_NUMBER,
};

use super::ledger::DiskAnnotations;
use super::{disks, system_disk, Vm};
use crate::disk::{backing_path, Disk};
use crate::retry::retry_block;
use crate::Error;

/// Gives every pending change that names a controller but no unit the
/// lowest unit still free on that controller, in the order the changes are
/// listed. Either all such changes get a unit or none is modified.
pub fn assign_unit_numbers(
    devices: &[VirtualDevice],
    changes: &mut [VirtualDeviceConfigSpec],
) -> Result<(), Error> {
    let all_units =
        || (MIN_UNIT_NUMBER..=MAX_UNIT_NUMBER).collect::<BTreeSet<i32>>();

    let mut available: BTreeMap<i32, BTreeSet<i32>> = BTreeMap::new();
    for device in devices {
        if let Some(controller_key) = device.controller_key {
            let units =
                available.entry(controller_key).or_insert_with(all_units);
            if let Some(unit) = device.unit_number {
                units.remove(&unit);
            }
        }
    }

    let mut assignments = Vec::new();
    for (idx, change) in changes.iter().enumerate() {
        let device = &change.device;
        let (Some(controller_key), None) =
            (device.controller_key, device.unit_number)
        else {
            continue;
        };
        let unit = available
            .entry(controller_key)
            .or_insert_with(all_units)
            .pop_first()
            .ok_or(Error::NoAvailableUnitNumber {
                controller_key,
                device_key: device.key,
            })?;
        assignments.push((idx, unit));
    }

    for (idx, unit) in assignments {
        changes[idx].device.unit_number = Some(unit);
    }
    Ok(())
}

fn is_disk_named(device: &VirtualDevice, file_name: &str) -> bool {
    backing_path(device).is_some_and(|path| path.file_name() == file_name)
}

/// Whether `disk` now lives somewhere other than where `property` says it
/// was attached from. Datastores are ignored: only the relative path
/// counts.
fn path_mismatch(disk: &VirtualDevice, property: &VAppPropertyInfo) -> bool {
    let Some(current) = backing_path(disk) else {
        return false;
    };
    match property.value.parse::<DatastorePath>() {
        Ok(original) => current.path() != original.path(),
        Err(_) => false,
    }
}

impl Vm {
    /// Attaches `disk` next to the system disk and records it in the ledger
    /// once the reconfigure has gone through. Returns the attached device as
    /// the server reports it.
    pub async fn attach_disk(
        &mut self,
        disk: &Disk,
    ) -> Result<VirtualDevice, Error> {
        let annotations = self.ledger.load().await?;
        let devices = self.devices().await?.to_vec();
        let controller_key = system_disk(&devices, &annotations)
            .and_then(|d| d.controller_key)
            .ok_or_else(|| Error::NoSystemDisk(self.cid.clone()))?;

        let mut changes = vec![disk.attachment_spec(controller_key)];
        assign_unit_numbers(&devices, &mut changes)?;

        info!(self.log, "attaching disk";
            "disk" => &disk.cid,
            "path" => %disk.path,
            "controller" => controller_key,
            "unit" => ?changes[0].device.unit_number,
        );
        self.client
            .reconfig_vm(
                &self.mob,
                &VirtualMachineConfigSpec::with_device_changes(changes),
            )
            .await?;
        info!(self.log, "finished attaching disk"; "disk" => &disk.cid);
        self.reload();

        let attached = self
            .devices()
            .await?
            .iter()
            .find(|d| backing_path(d).as_ref() == Some(&disk.path))
            .cloned()
            .ok_or_else(|| {
                Error::AttachedDiskNotFound(disk.path.to_string())
            })?;
        self.ledger.record(attached.key, &disk.cid, &disk.path).await?;
        Ok(attached)
    }

    /// Detaches `disks` in a single reconfigure without touching their
    /// backing files. A disk that was relocated while attached, and whose
    /// recorded location is now free, is moved back there afterwards.
    pub async fn detach_disks(
        &mut self,
        disks: &[VirtualDevice],
    ) -> Result<(), Error> {
        self.reload();
        let annotations = self.ledger.load().await?;
        info!(self.log, "detaching persistent disks"; "count" => disks.len());

        let mut changes = Vec::with_capacity(disks.len());
        let mut to_move = Vec::new();
        for disk in disks {
            let current = backing_path(disk);
            info!(self.log, "detaching";
                "disk" => disk.disk_file_name().unwrap_or_default(),
            );
            changes.push(VirtualDeviceConfigSpec::remove(disk.clone(), false));

            let Some(property) = annotations.by_key(disk.key) else {
                continue;
            };
            let (Some(current), true) = (current, path_mismatch(disk, property))
            else {
                continue;
            };
            let original: DatastorePath = property.value.parse()?;
            if !self.client.disk_path_exists(&self.mob, &original).await? {
                info!(self.log, "persistent disk was moved, moving it back \
                    to its expected location";
                    "current" => %current,
                    "original" => %original,
                );
                let dest = original.on_datastore(current.datastore());
                to_move.push((current, dest));
            }
        }

        let spec = VirtualMachineConfigSpec::with_device_changes(changes);
        retry_block(
            &self.log,
            "detach disks",
            self.config.retry_block_attempts,
            || self.client.reconfig_vm(&self.mob, &spec),
        )
        .await?;
        self.reload();
        info!(self.log, "detached persistent disks"; "count" => disks.len());

        if !to_move.is_empty() {
            info!(self.log, "renaming persistent disks";
                "count" => to_move.len(),
            );
            let datacenter = self.datacenter().await?;
            for (source, dest) in &to_move {
                self.client.move_disk(&datacenter, source, dest).await?;
            }
        }

        for disk in disks {
            if annotations.contains_key(disk.key) {
                self.ledger.forget(disk.key).await?;
            }
        }
        debug!(self.log, "finished deleting persistent disk properties");
        Ok(())
    }

    /// Finds the disk the caller knows as `cid`: by the `<cid>.vmdk` file
    /// name first, then through the ledger for disks that were renamed.
    pub async fn disk_by_cid(
        &mut self,
        cid: &str,
    ) -> Result<Option<VirtualDevice>, Error> {
        let file_name = format!("{cid}.vmdk");
        let by_name = self
            .devices()
            .await?
            .iter()
            .find(|d| is_disk_named(d, &file_name))
            .cloned();
        if by_name.is_some() {
            return Ok(by_name);
        }

        // A failed detach can leave a stale annotation with the same label,
        // so only an annotation owned by a present disk counts.
        let annotations = self.ledger.load().await?;
        Ok(disks(self.devices().await?)
            .find(|d| {
                annotations.by_key(d.key).is_some_and(|p| p.label == cid)
            })
            .cloned())
    }

    pub async fn disk_path_by_cid(
        &mut self,
        cid: &str,
    ) -> Result<Option<String>, Error> {
        Ok(self
            .disk_by_cid(cid)
            .await?
            .and_then(|d| d.disk_file_name().map(str::to_owned)))
    }

    /// Whether `disk` is no longer at the path recorded for it on attach.
    /// Disks the ledger does not know about never mismatch.
    pub async fn has_persistent_disk_property_mismatch(
        &self,
        disk: &VirtualDevice,
    ) -> Result<bool, Error> {
        let annotations = self.ledger.load().await?;
        Ok(annotations
            .by_key(disk.key)
            .is_some_and(|property| path_mismatch(disk, property)))
    }

    /// The path device `key` was attached from, if the ledger recorded it.
    pub async fn original_disk_path(
        &self,
        key: i32,
    ) -> Result<Option<DatastorePath>, Error> {
        let annotations: DiskAnnotations = self.ledger.load().await?;
        annotations.recorded_path(key)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vim_types::{DeviceOperation, DiskMode};

    use super::*;
    use crate::fake::{
        disk_device, Call, FakeVimApi, SCSI_CONTROLLER_KEY, SYSTEM_DISK_KEY,
    };
    use crate::vm::tests::{annotate, test_vm};
    use crate::vm::PERSISTENT_DISK_CATEGORY;

    fn pending_disk(controller_key: i32) -> VirtualDeviceConfigSpec {
        Disk::new("d", "[ds1] bosh/d.vmdk".parse().unwrap(), 1)
            .attachment_spec(controller_key)
    }

    fn occupied(
        controller_key: i32,
        units: impl Iterator<Item = i32>,
    ) -> Vec<VirtualDevice> {
        units
            .map(|unit| {
                disk_device(
                    3000 + unit,
                    controller_key,
                    unit,
                    &format!("[ds1] vm/{unit}.vmdk"),
                    DiskMode::Persistent,
                )
            })
            .collect()
    }

    #[test]
    fn assigns_lowest_free_units_in_order() {
        let devices = occupied(1000, 0..1);
        let mut changes = vec![pending_disk(1000), pending_disk(1000)];
        assign_unit_numbers(&devices, &mut changes).unwrap();
        assert_eq!(changes[0].device.unit_number, Some(1));
        assert_eq!(changes[1].device.unit_number, Some(2));
    }

    #[test]
    fn unknown_controller_starts_at_zero() {
        let mut changes = vec![pending_disk(1001)];
        assign_unit_numbers(&[], &mut changes).unwrap();
        assert_eq!(changes[0].device.unit_number, Some(0));
    }

    #[test]
    fn preset_units_are_left_alone() {
        let devices = occupied(1000, 0..1);
        let mut preset = pending_disk(1000);
        preset.device.unit_number = Some(9);
        let mut changes = vec![preset, pending_disk(1000)];
        assign_unit_numbers(&devices, &mut changes).unwrap();
        assert_eq!(changes[0].device.unit_number, Some(9));
        assert_eq!(changes[1].device.unit_number, Some(1));
    }

    #[test]
    fn exhausted_controller_fails_without_partial_mutation() {
        let mut devices = occupied(1000, 0..16);
        devices.extend(occupied(2000, 0..1));
        let mut changes = vec![pending_disk(2000), pending_disk(1000)];
        let err = assign_unit_numbers(&devices, &mut changes).unwrap_err();

        assert!(matches!(
            err,
            Error::NoAvailableUnitNumber { controller_key: 1000, .. }
        ));
        assert_eq!(changes[0].device.unit_number, None);
        assert_eq!(changes[1].device.unit_number, None);
    }

    #[tokio::test]
    async fn attach_assigns_next_unit_and_records_disk() {
        let fake = Arc::new(FakeVimApi::new());
        let mut vm = test_vm(&fake);
        let disk = Disk::new(
            "disk-1234",
            "[ds1] bosh/disk-1234.vmdk".parse().unwrap(),
            1024,
        );

        let attached = vm.attach_disk(&disk).await.unwrap();

        assert_eq!(attached.controller_key, Some(SCSI_CONTROLLER_KEY));
        assert_eq!(attached.unit_number, Some(2));
        let calls = fake.calls();
        let Call::Reconfig(spec) = &calls[0] else {
            panic!("expected reconfigure first, got {calls:?}");
        };
        assert_eq!(spec.device_change[0].operation, DeviceOperation::Add);
        assert_eq!(spec.device_change[0].device.unit_number, Some(2));

        let Call::AddProperty(property) = &calls[1] else {
            panic!("expected annotation after reconfigure, got {calls:?}");
        };
        assert_eq!(property.key, attached.key);
        assert_eq!(property.label, "disk-1234");
        assert_eq!(property.value, "[ds1] bosh/disk-1234.vmdk");
        assert_eq!(property.category, PERSISTENT_DISK_CATEGORY);

        assert_eq!(
            vm.persistent_disks().await.unwrap(),
            vec![attached.clone()]
        );
        assert_eq!(vm.disk_by_cid("disk-1234").await.unwrap(), Some(attached));
    }

    #[tokio::test]
    async fn failed_attach_leaves_no_annotation() {
        let fake = Arc::new(FakeVimApi::new());
        fake.state().failures.insert("reconfig", 1);
        let mut vm = test_vm(&fake);
        let disk = Disk::new("d", "[ds1] bosh/d.vmdk".parse().unwrap(), 1);

        assert!(vm.attach_disk(&disk).await.is_err());
        assert!(fake.state().vapp_properties.is_empty());
        assert_eq!(fake.calls().len(), 1);
    }

    #[tokio::test]
    async fn attach_without_system_disk_fails() {
        let fake = Arc::new(FakeVimApi::new());
        fake.state().devices.retain(|d| d.key != SYSTEM_DISK_KEY);
        let mut vm = test_vm(&fake);
        let disk = Disk::new("d", "[ds1] bosh/d.vmdk".parse().unwrap(), 1);

        let err = vm.attach_disk(&disk).await.unwrap_err();
        assert!(matches!(err, Error::NoSystemDisk(cid) if cid == "vm-cid"));
        assert!(fake.calls().is_empty());
    }

    fn attached_disk(
        fake: &FakeVimApi,
        key: i32,
        path: &str,
    ) -> VirtualDevice {
        let device = disk_device(
            key,
            SCSI_CONTROLLER_KEY,
            key - 2008,
            path,
            DiskMode::IndependentPersistent,
        );
        fake.state().devices.push(device.clone());
        device
    }

    #[tokio::test]
    async fn detach_moves_relocated_disk_back_before_forgetting_it() {
        let fake = Arc::new(FakeVimApi::new());
        // Storage migration moved the disk to another datastore and folder.
        let disk = attached_disk(&fake, 2010, "[ds2] vm-1/vm-1_1.vmdk");
        annotate(&fake, 2010, "disk-a", "[ds1] bosh/disk-a.vmdk");
        fake.state().existing_paths.insert("[ds2] vm-1/vm-1_1.vmdk".into());
        let mut vm = test_vm(&fake);

        let moved = vm.has_persistent_disk_property_mismatch(&disk).await;
        assert!(moved.unwrap());
        vm.detach_disks(&[disk.clone()]).await.unwrap();

        let calls = fake.calls();
        assert_eq!(calls.len(), 3, "{calls:?}");
        let Call::Reconfig(spec) = &calls[0] else {
            panic!("expected reconfigure first, got {calls:?}");
        };
        assert_eq!(spec.device_change.len(), 1);
        assert_eq!(spec.device_change[0].operation, DeviceOperation::Remove);
        assert_eq!(spec.device_change[0].file_operation, None);
        assert_eq!(
            calls[1],
            Call::MoveDisk {
                source: DatastorePath::new("ds2", "vm-1/vm-1_1.vmdk"),
                dest: DatastorePath::new("ds2", "bosh/disk-a.vmdk"),
            }
        );
        assert_eq!(calls[2], Call::DeleteProperty(2010));
        assert!(vm.persistent_disks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn detach_leaves_disk_alone_when_original_path_is_taken() {
        let fake = Arc::new(FakeVimApi::new());
        let disk = attached_disk(&fake, 2010, "[ds2] vm-1/vm-1_1.vmdk");
        annotate(&fake, 2010, "disk-a", "[ds1] bosh/disk-a.vmdk");
        fake.state().existing_paths.insert("[ds1] bosh/disk-a.vmdk".into());
        let mut vm = test_vm(&fake);

        vm.detach_disks(&[disk]).await.unwrap();

        let calls = fake.calls();
        assert!(matches!(calls[0], Call::Reconfig(_)));
        assert_eq!(calls[1..], [Call::DeleteProperty(2010)]);
    }

    #[tokio::test]
    async fn detach_of_unmoved_disk_only_reconfigures_and_forgets() {
        let fake = Arc::new(FakeVimApi::new());
        let disk = attached_disk(&fake, 2010, "[ds2] bosh/disk-a.vmdk");
        annotate(&fake, 2010, "disk-a", "[ds1] bosh/disk-a.vmdk");
        let mut vm = test_vm(&fake);

        // Only the datastore changed, which does not count as a move.
        let moved = vm.has_persistent_disk_property_mismatch(&disk).await;
        assert!(!moved.unwrap());
        vm.detach_disks(&[disk]).await.unwrap();
        assert_eq!(fake.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn detach_reconfigure_is_retried_as_a_block() {
        let fake = Arc::new(FakeVimApi::new());
        let disk = attached_disk(&fake, 2010, "[ds1] bosh/disk-a.vmdk");
        fake.state().failures.insert("reconfig", 2);
        let mut vm = test_vm(&fake);

        vm.detach_disks(&[disk]).await.unwrap();
        let reconfigs = fake
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Reconfig(_)))
            .count();
        assert_eq!(reconfigs, 3);
        // Never annotated, so nothing to forget.
        assert!(!fake
            .calls()
            .iter()
            .any(|c| matches!(c, Call::DeleteProperty(_))));
    }

    #[tokio::test]
    async fn disk_by_cid_falls_back_to_annotation_label() {
        let fake = Arc::new(FakeVimApi::new());
        let disk = attached_disk(&fake, 2010, "[ds2] vm-1/vm-1_1.vmdk");
        annotate(&fake, 2010, "disk-a", "[ds1] bosh/disk-a.vmdk");
        let mut vm = test_vm(&fake);

        assert_eq!(vm.disk_by_cid("disk-a").await.unwrap(), Some(disk));
        assert_eq!(
            vm.disk_path_by_cid("disk-a").await.unwrap().as_deref(),
            Some("[ds2] vm-1/vm-1_1.vmdk")
        );
        assert_eq!(vm.disk_by_cid("disk-b").await.unwrap(), None);
        assert_eq!(
            vm.original_disk_path(2010).await.unwrap(),
            Some(DatastorePath::new("ds1", "bosh/disk-a.vmdk"))
        );
        assert_eq!(vm.original_disk_path(2011).await.unwrap(), None);
    }

    #[tokio::test]
    async fn disk_by_cid_ignores_foreign_annotations() {
        let fake = Arc::new(FakeVimApi::new());
        attached_disk(&fake, 2010, "[ds2] vm-1/vm-1_1.vmdk");
        fake.state().vapp_properties.push(VAppPropertyInfo {
            key: 2010,
            id: "disk-a".to_string(),
            category: "other".to_string(),
            label: "disk-a".to_string(),
            value: "[ds1] bosh/disk-a.vmdk".to_string(),
        });
        let mut vm = test_vm(&fake);
        assert_eq!(vm.disk_by_cid("disk-a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn disk_by_cid_skips_stale_annotation_with_same_label() {
        let fake = Arc::new(FakeVimApi::new());
        let disk = attached_disk(&fake, 2010, "[ds2] vm-1/vm-1_1.vmdk");
        annotate(&fake, 2099, "disk-a", "[ds1] bosh/disk-a.vmdk");
        annotate(&fake, 2010, "disk-a", "[ds1] bosh/disk-a.vmdk");
        let mut vm = test_vm(&fake);

        assert_eq!(vm.disk_by_cid("disk-a").await.unwrap(), Some(disk));
    }
}
