// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A single VM: device inventory, power control and disk attachment.
//!
//! Properties are fetched once and cached until [`Vm::reload`] is called.
//! Every operation here that changes the device list or the power state
//! reloads before returning, so reads after a mutation see server state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use slog::{info, o, Logger};
use vim_types::{
    managed_type, DeviceKind, DiskMode, ManagedObjectReference, PowerState,
    VirtualDevice, VirtualMachineQuestion, VirtualMachineRuntimeInfo,
};
use vsphere_cpi_config::VmConfig;

use crate::api::{decode, PropertyMap, Required, VimApi};
use crate::disk::is_ephemeral;
use crate::retry::retry_block;
use crate::Error;

mod disks;
mod ledger;
mod power;

pub use disks::assign_unit_numbers;
pub use ledger::{
    DiskAnnotations, PersistentDiskLedger, PERSISTENT_DISK_CATEGORY,
};

const VM_PROPERTIES: &[&str] = &[
    "runtime.powerState",
    "runtime.question",
    "config.hardware.device",
    "name",
    "runtime",
    "resourcePool",
];
const VM_REQUIRED: Required =
    Required::Paths(&["config.hardware.device", "runtime"]);

const HOST_PROPERTIES: &[&str] = &["datastore", "parent"];

/// The decoded VM property bundle.
#[derive(Clone, Debug)]
struct VmProperties {
    power_state: PowerState,
    question: Option<VirtualMachineQuestion>,
    devices: Vec<VirtualDevice>,
    runtime: VirtualMachineRuntimeInfo,
    resource_pool: Option<ManagedObjectReference>,
}

impl VmProperties {
    fn from_map(map: &PropertyMap) -> Result<Self, Error> {
        let runtime: VirtualMachineRuntimeInfo = map.require("runtime")?;
        Ok(Self {
            power_state: map
                .get("runtime.powerState")?
                .unwrap_or(runtime.power_state),
            question: map.get("runtime.question")?,
            devices: map.require("config.hardware.device")?,
            resource_pool: map.get("resourcePool")?,
            runtime,
        })
    }
}

#[derive(Clone, Debug)]
struct HostProperties {
    datastores: Vec<ManagedObjectReference>,
    parent: ManagedObjectReference,
}

#[derive(Deserialize)]
struct DatastoreInfo {
    name: String,
}

pub(crate) fn is_persistent(
    device: &VirtualDevice,
    annotations: &DiskAnnotations,
) -> bool {
    match device.as_disk() {
        Some(disk) => {
            disk.backing.disk_mode == DiskMode::IndependentPersistent
                || annotations.contains_key(device.key)
        }
        None => false,
    }
}

fn disks(devices: &[VirtualDevice]) -> impl Iterator<Item = &VirtualDevice> {
    devices.iter().filter(|d| d.as_disk().is_some())
}

pub(crate) fn system_disk<'a>(
    devices: &'a [VirtualDevice],
    annotations: &DiskAnnotations,
) -> Option<&'a VirtualDevice> {
    disks(devices)
        .find(|d| !is_ephemeral(d) && !is_persistent(d, annotations))
}

pub struct Vm {
    cid: String,
    mob: ManagedObjectReference,
    client: Arc<dyn VimApi>,
    ledger: PersistentDiskLedger,
    config: VmConfig,
    log: Logger,
    properties: Option<VmProperties>,
    host_properties: Option<HostProperties>,
}

impl Vm {
    pub fn new(
        cid: impl Into<String>,
        mob: ManagedObjectReference,
        client: Arc<dyn VimApi>,
        config: VmConfig,
        log: &Logger,
    ) -> Self {
        let cid = cid.into();
        let log = log.new(o!("vm" => cid.clone()));
        let ledger = PersistentDiskLedger::new(
            client.clone(),
            mob.clone(),
            log.clone(),
        );
        Self {
            cid,
            mob,
            client,
            ledger,
            config,
            log,
            properties: None,
            host_properties: None,
        }
    }

    pub fn cid(&self) -> &str {
        &self.cid
    }

    pub fn mob(&self) -> &ManagedObjectReference {
        &self.mob
    }

    pub fn ledger(&self) -> &PersistentDiskLedger {
        &self.ledger
    }

    /// Drops both cached property bundles.
    pub fn reload(&mut self) {
        self.properties = None;
        self.host_properties = None;
    }

    async fn properties(&mut self) -> Result<&VmProperties, Error> {
        let properties = match self.properties.take() {
            Some(properties) => properties,
            None => {
                let map = self
                    .client
                    .get_properties(
                        &self.mob,
                        managed_type::VIRTUAL_MACHINE,
                        VM_PROPERTIES,
                        VM_REQUIRED,
                    )
                    .await?;
                VmProperties::from_map(&map)?
            }
        };
        Ok(self.properties.insert(properties))
    }

    async fn host_properties(&mut self) -> Result<&HostProperties, Error> {
        let host_properties = match self.host_properties.take() {
            Some(host_properties) => host_properties,
            None => {
                let host = self.properties().await?.runtime.host.clone();
                let host = host.ok_or_else(|| Error::MissingProperty {
                    object: self.mob.clone(),
                    path: "runtime.host".to_string(),
                })?;
                let map = self
                    .client
                    .get_properties(
                        &host,
                        managed_type::HOST_SYSTEM,
                        HOST_PROPERTIES,
                        Required::All,
                    )
                    .await?;
                HostProperties {
                    datastores: map.require("datastore")?,
                    parent: map.require("parent")?,
                }
            }
        };
        Ok(self.host_properties.insert(host_properties))
    }

    pub async fn power_state(&mut self) -> Result<PowerState, Error> {
        Ok(self.properties().await?.power_state)
    }

    pub async fn is_powered_on(&mut self) -> Result<bool, Error> {
        Ok(self.power_state().await? == PowerState::PoweredOn)
    }

    /// The question the VM was blocked on when properties were last read.
    pub async fn question(
        &mut self,
    ) -> Result<Option<VirtualMachineQuestion>, Error> {
        Ok(self.properties().await?.question.clone())
    }

    pub async fn devices(&mut self) -> Result<&[VirtualDevice], Error> {
        Ok(&self.properties().await?.devices)
    }

    pub async fn nics(&mut self) -> Result<Vec<VirtualDevice>, Error> {
        Ok(self
            .devices()
            .await?
            .iter()
            .filter(|d| matches!(d.kind, DeviceKind::EthernetCard(_)))
            .cloned()
            .collect())
    }

    pub async fn cdrom(&mut self) -> Result<Option<VirtualDevice>, Error> {
        Ok(self
            .devices()
            .await?
            .iter()
            .find(|d| matches!(d.kind, DeviceKind::Cdrom))
            .cloned())
    }

    pub async fn pci_controller(
        &mut self,
    ) -> Result<Option<VirtualDevice>, Error> {
        Ok(self
            .devices()
            .await?
            .iter()
            .find(|d| matches!(d.kind, DeviceKind::PciController))
            .cloned())
    }

    /// The first plain disk that is neither the ephemeral disk nor a
    /// persistent disk.
    pub async fn system_disk(
        &mut self,
    ) -> Result<Option<VirtualDevice>, Error> {
        let annotations = self.ledger.load().await?;
        let devices = self.devices().await?;
        Ok(system_disk(devices, &annotations).cloned())
    }

    pub async fn ephemeral_disk(
        &mut self,
    ) -> Result<Option<VirtualDevice>, Error> {
        Ok(disks(self.devices().await?).find(|d| is_ephemeral(d)).cloned())
    }

    /// Disks in independent-persistent mode, plus any disk the ledger
    /// records as persistent whatever its current mode.
    pub async fn persistent_disks(
        &mut self,
    ) -> Result<Vec<VirtualDevice>, Error> {
        let annotations = self.ledger.load().await?;
        let devices = self.devices().await?;
        Ok(disks(devices)
            .filter(|d| is_persistent(d, &annotations))
            .cloned()
            .collect())
    }

    /// Persistent disks whose mode was changed away from
    /// independent-persistent outside the CPI.
    pub async fn disks_with_incorrect_mode(
        &mut self,
    ) -> Result<Vec<VirtualDevice>, Error> {
        Ok(self
            .persistent_disks()
            .await?
            .into_iter()
            .filter(|d| {
                d.as_disk().is_some_and(|disk| {
                    disk.backing.disk_mode != DiskMode::IndependentPersistent
                })
            })
            .collect())
    }

    pub async fn cluster(&mut self) -> Result<String, Error> {
        let parent = self.host_properties().await?.parent.clone();
        let map = self
            .client
            .get_properties(
                &parent,
                managed_type::CLUSTER_COMPUTE_RESOURCE,
                &["name"],
                Required::All,
            )
            .await?;
        map.require("name")
    }

    pub async fn resource_pool(&mut self) -> Result<String, Error> {
        let pool = self.properties().await?.resource_pool.clone();
        let pool = pool.ok_or_else(|| Error::MissingProperty {
            object: self.mob.clone(),
            path: "resourcePool".to_string(),
        })?;
        let name = self
            .client
            .get_property(&pool, managed_type::RESOURCE_POOL, "name")
            .await?;
        decode("name", name)
    }

    /// Names of the datastores mounted on the VM's current host.
    pub async fn accessible_datastores(
        &mut self,
    ) -> Result<Vec<String>, Error> {
        let datastores = self.host_properties().await?.datastores.clone();
        let mut names = Vec::with_capacity(datastores.len());
        for datastore in &datastores {
            let map = self
                .client
                .get_properties(
                    datastore,
                    managed_type::DATASTORE,
                    &["info"],
                    Required::All,
                )
                .await?;
            let info: DatastoreInfo = map.require("info")?;
            names.push(info.name);
        }
        Ok(names)
    }

    pub async fn datacenter(&self) -> Result<ManagedObjectReference, Error> {
        self.client.find_parent(&self.mob, managed_type::DATACENTER).await
    }

    /// Tags the VM with each metadata entry as a custom field.
    pub async fn set_metadata(
        &self,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), Error> {
        for (name, value) in metadata {
            self.client.set_custom_field(&self.mob, name, value).await?;
        }
        Ok(())
    }

    pub async fn delete(&mut self) -> Result<(), Error> {
        info!(self.log, "deleting vm");
        retry_block(
            &self.log,
            "delete vm",
            self.config.retry_block_attempts,
            || self.client.delete_vm(&self.mob),
        )
        .await?;
        self.reload();
        Ok(())
    }
}

impl fmt::Display for Vm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<VM: {} / {}>", self.mob, self.cid)
    }
}
