// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! An in-memory [`VimApi`] holding the state of a single VM, for driving
//! multi-step controller flows in tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use vim_client::Fault;
use vim_types::{
    managed_type, ArrayUpdateOperation, DatastorePath, DeviceKind,
    DeviceOperation, DiskBacking, DiskMode, ManagedObjectReference,
    PowerState, VAppPropertyInfo, VirtualDevice, VirtualDisk,
    VirtualEthernetCard, VirtualMachineConfigSpec, VirtualMachineQuestion,
};

use crate::api::VimApi;
use crate::Error;

pub(crate) const SYSTEM_DISK_KEY: i32 = 2000;
pub(crate) const EPHEMERAL_DISK_KEY: i32 = 2001;
pub(crate) const SCSI_CONTROLLER_KEY: i32 = 1000;

/// One call observed by the fake, in arrival order.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Call {
    PowerOn,
    PowerOff,
    ShutdownGuest,
    RebootGuest,
    Reconfig(VirtualMachineConfigSpec),
    Answer { id: String, choice: String },
    Delete,
    MoveDisk { source: DatastorePath, dest: DatastorePath },
    AddProperty(VAppPropertyInfo),
    DeleteProperty(i32),
    SetCustomField { name: String, value: String },
}

pub(crate) struct FakeState {
    pub power_state: PowerState,
    pub question: Option<VirtualMachineQuestion>,
    /// Whether answering the pending question also clears it.
    pub clear_question_on_answer: bool,
    pub devices: Vec<VirtualDevice>,
    pub vapp_properties: Vec<VAppPropertyInfo>,
    /// Datastore paths that currently hold a file.
    pub existing_paths: BTreeSet<String>,
    pub calls: Vec<Call>,
    pub next_device_key: i32,
    pub power_on_delay: Duration,
    /// When set, a guest shutdown request powers the VM off this long after
    /// it was issued.
    pub guest_shutdown_after: Option<Duration>,
    /// Remaining scripted failures, by operation name.
    pub failures: BTreeMap<&'static str, u32>,
    powers_off_at: Option<Instant>,
}

impl FakeState {
    fn take_failure(&mut self, op: &'static str) -> Result<(), Error> {
        match self.failures.get_mut(op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(fault("SystemError", &format!("scripted {op} failure")))
            }
            _ => Ok(()),
        }
    }

    fn current_power_state(&mut self) -> PowerState {
        if let Some(at) = self.powers_off_at {
            if Instant::now() >= at {
                self.power_state = PowerState::PoweredOff;
                self.powers_off_at = None;
            }
        }
        self.power_state
    }

    fn apply(&mut self, spec: &VirtualMachineConfigSpec) {
        for change in &spec.device_change {
            let device = change.device.clone();
            match change.operation {
                DeviceOperation::Add => {
                    let mut device = device;
                    if device.key < 0 {
                        device.key = self.next_device_key;
                        self.next_device_key += 1;
                    }
                    self.devices.push(device);
                }
                DeviceOperation::Remove => {
                    self.devices.retain(|d| d.key != device.key);
                }
                DeviceOperation::Edit => {
                    if let Some(d) =
                        self.devices.iter_mut().find(|d| d.key == device.key)
                    {
                        *d = device;
                    }
                }
            }
        }
        for property in
            spec.v_app_config.iter().flat_map(|config| &config.property)
        {
            match (property.operation, &property.info, property.remove_key) {
                (ArrayUpdateOperation::Add, Some(info), _) => {
                    self.vapp_properties.push(info.clone());
                }
                (ArrayUpdateOperation::Remove, _, Some(key)) => {
                    self.vapp_properties.retain(|p| p.key != key);
                }
                _ => {}
            }
        }
    }
}

pub(crate) struct FakeVimApi {
    vm: ManagedObjectReference,
    state: Mutex<FakeState>,
}

pub(crate) fn fault(fault_type: &str, msg: &str) -> Error {
    let payload = json!({ "_type": fault_type, "msg": msg });
    Error::Vim(Fault::from_payload(payload).into())
}

pub(crate) fn disk_device(
    key: i32,
    controller_key: i32,
    unit_number: i32,
    file_name: &str,
    disk_mode: DiskMode,
) -> VirtualDevice {
    VirtualDevice {
        key,
        controller_key: Some(controller_key),
        unit_number: Some(unit_number),
        kind: DeviceKind::Disk(VirtualDisk {
            backing: DiskBacking {
                file_name: file_name.to_string(),
                disk_mode,
                datastore: None,
                thin_provisioned: None,
            },
            capacity_in_kb: Some(1024),
        }),
    }
}

fn device(
    key: i32,
    controller_key: Option<i32>,
    unit_number: Option<i32>,
    kind: DeviceKind,
) -> VirtualDevice {
    VirtualDevice { key, controller_key, unit_number, kind }
}

impl FakeVimApi {
    /// A powered-on VM with a system disk and an ephemeral disk on SCSI
    /// controller 1000 (units 0 and 1), a NIC and a CD-ROM.
    pub fn new() -> Self {
        let devices = vec![
            device(100, None, None, DeviceKind::PciController),
            device(
                SCSI_CONTROLLER_KEY,
                Some(100),
                Some(3),
                DeviceKind::ScsiController,
            ),
            disk_device(
                SYSTEM_DISK_KEY,
                SCSI_CONTROLLER_KEY,
                0,
                "[ds1] vm-1/vm-1.vmdk",
                DiskMode::Persistent,
            ),
            disk_device(
                EPHEMERAL_DISK_KEY,
                SCSI_CONTROLLER_KEY,
                1,
                "[ds1] vm-1/ephemeral_disk.vmdk",
                DiskMode::IndependentNonpersistent,
            ),
            device(3000, Some(200), Some(0), DeviceKind::Cdrom),
            device(
                4000,
                Some(100),
                Some(7),
                DeviceKind::EthernetCard(VirtualEthernetCard {
                    mac_address: Some("00:50:56:00:00:01".to_string()),
                }),
            ),
        ];
        let state = FakeState {
            power_state: PowerState::PoweredOn,
            question: None,
            clear_question_on_answer: true,
            devices,
            vapp_properties: Vec::new(),
            existing_paths: BTreeSet::new(),
            calls: Vec::new(),
            next_device_key: 2002,
            power_on_delay: Duration::ZERO,
            guest_shutdown_after: None,
            failures: BTreeMap::new(),
            powers_off_at: None,
        };
        Self {
            vm: ManagedObjectReference::new(
                managed_type::VIRTUAL_MACHINE,
                "vm-1",
            ),
            state: Mutex::new(state),
        }
    }

    pub fn vm(&self) -> ManagedObjectReference {
        self.vm.clone()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    fn record(&self, call: Call) -> MutexGuard<'_, FakeState> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }

    fn vm_property(&self, path: &str) -> Value {
        let mut state = self.state();
        let power_state = state.current_power_state();
        match path {
            "runtime.powerState" => json!(power_state),
            "runtime.question" => json!(state.question),
            "config.hardware.device" => json!(state.devices),
            "config.vAppConfig.property" => json!(state.vapp_properties),
            "name" => json!("vm-1"),
            "resourcePool" => {
                json!({ "type": "ResourcePool", "value": "rp-1" })
            }
            "runtime" => json!({
                "host": { "type": "HostSystem", "value": "host-1" },
                "powerState": power_state,
                "question": state.question,
            }),
            _ => Value::Null,
        }
    }
}

#[async_trait]
impl VimApi for FakeVimApi {
    async fn power_on_vm(
        &self,
        _vm: &ManagedObjectReference,
    ) -> Result<(), Error> {
        let delay = {
            let mut state = self.record(Call::PowerOn);
            state.take_failure("power_on")?;
            state.power_on_delay
        };
        tokio::time::sleep(delay).await;
        self.state().power_state = PowerState::PoweredOn;
        Ok(())
    }

    async fn power_off_vm(
        &self,
        _vm: &ManagedObjectReference,
    ) -> Result<(), Error> {
        let mut state = self.record(Call::PowerOff);
        state.take_failure("power_off")?;
        state.power_state = PowerState::PoweredOff;
        state.powers_off_at = None;
        Ok(())
    }

    async fn shutdown_guest(
        &self,
        _vm: &ManagedObjectReference,
    ) -> Result<(), Error> {
        let mut state = self.record(Call::ShutdownGuest);
        state.take_failure("shutdown_guest")?;
        state.powers_off_at =
            state.guest_shutdown_after.map(|after| Instant::now() + after);
        Ok(())
    }

    async fn reboot_guest(
        &self,
        _vm: &ManagedObjectReference,
    ) -> Result<(), Error> {
        self.record(Call::RebootGuest).take_failure("reboot_guest")
    }

    async fn reconfig_vm(
        &self,
        _vm: &ManagedObjectReference,
        spec: &VirtualMachineConfigSpec,
    ) -> Result<(), Error> {
        let mut state = self.record(Call::Reconfig(spec.clone()));
        state.take_failure("reconfig")?;
        state.apply(spec);
        Ok(())
    }

    async fn answer_vm(
        &self,
        _vm: &ManagedObjectReference,
        question_id: &str,
        choice_key: &str,
    ) -> Result<(), Error> {
        let mut state = self.record(Call::Answer {
            id: question_id.to_string(),
            choice: choice_key.to_string(),
        });
        state.take_failure("answer")?;
        if state.clear_question_on_answer {
            state.question = None;
        }
        Ok(())
    }

    async fn delete_vm(
        &self,
        _vm: &ManagedObjectReference,
    ) -> Result<(), Error> {
        self.record(Call::Delete).take_failure("delete")
    }

    async fn move_disk(
        &self,
        _datacenter: &ManagedObjectReference,
        source: &DatastorePath,
        dest: &DatastorePath,
    ) -> Result<(), Error> {
        let mut state = self.record(Call::MoveDisk {
            source: source.clone(),
            dest: dest.clone(),
        });
        state.take_failure("move_disk")?;
        state.existing_paths.remove(&source.to_string());
        state.existing_paths.insert(dest.to_string());
        Ok(())
    }

    async fn disk_path_exists(
        &self,
        _vm: &ManagedObjectReference,
        path: &DatastorePath,
    ) -> Result<bool, Error> {
        Ok(self.state().existing_paths.contains(&path.to_string()))
    }

    async fn add_persistent_disk_property(
        &self,
        _vm: &ManagedObjectReference,
        property: &VAppPropertyInfo,
    ) -> Result<(), Error> {
        let mut state = self.record(Call::AddProperty(property.clone()));
        state.take_failure("add_property")?;
        state.vapp_properties.push(property.clone());
        Ok(())
    }

    async fn delete_persistent_disk_property(
        &self,
        _vm: &ManagedObjectReference,
        key: i32,
    ) -> Result<(), Error> {
        let mut state = self.record(Call::DeleteProperty(key));
        state.take_failure("delete_property")?;
        state.vapp_properties.retain(|p| p.key != key);
        Ok(())
    }

    async fn find_parent(
        &self,
        object: &ManagedObjectReference,
        type_name: &'static str,
    ) -> Result<ManagedObjectReference, Error> {
        match type_name {
            managed_type::DATACENTER => Ok(ManagedObjectReference::new(
                managed_type::DATACENTER,
                "datacenter-1",
            )),
            _ => Err(Error::NoParent { object: object.clone(), type_name }),
        }
    }

    async fn set_custom_field(
        &self,
        _vm: &ManagedObjectReference,
        name: &str,
        value: &str,
    ) -> Result<(), Error> {
        self.record(Call::SetCustomField {
            name: name.to_string(),
            value: value.to_string(),
        })
        .take_failure("set_custom_field")
    }

    async fn get_property(
        &self,
        object: &ManagedObjectReference,
        _type_name: &str,
        path: &str,
    ) -> Result<Value, Error> {
        let value = match (object.value(), path) {
            ("vm-1", path) => self.vm_property(path),
            ("host-1", "datastore") => json!([
                { "type": "Datastore", "value": "datastore-1" },
                { "type": "Datastore", "value": "datastore-2" },
            ]),
            ("host-1", "parent") => json!({
                "type": "ClusterComputeResource",
                "value": "domain-c1",
            }),
            ("domain-c1", "name") => json!("cluster-1"),
            ("rp-1", "name") => json!("pool-1"),
            ("datastore-1", "info") => json!({ "name": "ds1" }),
            ("datastore-2", "info") => json!({ "name": "ds2" }),
            _ => Value::Null,
        };
        Ok(value)
    }
}
