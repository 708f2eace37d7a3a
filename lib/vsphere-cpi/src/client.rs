// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`VimApi`] over a live management server.
//!
//! Each named operation maps onto one wire method, issued through the
//! [`ResilientInvoker`]. Methods that return a task are followed by polling
//! the task's `info` property until it settles.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use slog::{debug, o, trace, Logger};
use vim_client::{Fault, MethodInfo, PropertyInfo, ResilientInvoker, Transport};
use vim_types::{
    managed_type, ArrayUpdateOperation, CustomFieldDef, DatastorePath,
    ManagedObjectReference, ServiceContent, TaskInfo, TaskState,
    VAppPropertyInfo, VAppPropertySpec, VirtualMachineConfigSpec,
};

use crate::api::{decode, VimApi};
use crate::Error;

const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The well-known root object every session starts from.
pub fn service_instance() -> ManagedObjectReference {
    ManagedObjectReference::new(
        managed_type::SERVICE_INSTANCE,
        "ServiceInstance",
    )
}

#[derive(Deserialize)]
struct DatastoreInfo {
    name: String,
}

pub struct VimApiClient<T> {
    invoker: ResilientInvoker<T>,
    content: ServiceContent,
    log: Logger,
}

impl<T: Transport> VimApiClient<T> {
    /// Reads the service content once; the manager references in it are
    /// used for the lifetime of the client.
    pub async fn connect(
        invoker: ResilientInvoker<T>,
        log: &Logger,
    ) -> Result<Self, Error> {
        let content = invoker
            .invoke_property(
                &service_instance(),
                &PropertyInfo::new("content"),
            )
            .await?;
        let content: ServiceContent = decode("content", content)?;
        let log = log.new(o!(
            "component" => "vim-api",
            "api_version" => invoker.version(),
        ));
        debug!(log, "connected"; "root_folder" => %content.root_folder);
        Ok(Self { invoker, content, log })
    }

    pub fn service_content(&self) -> &ServiceContent {
        &self.content
    }

    async fn call(
        &self,
        target: &ManagedObjectReference,
        method: &str,
        args: Value,
    ) -> Result<Value, Error> {
        trace!(self.log, "invoking"; "target" => %target, "method" => method);
        let result = self
            .invoker
            .invoke_method(target, &MethodInfo::new(method), &args)
            .await?;
        Ok(result)
    }

    /// Issues a method returning a task and waits for the task.
    async fn run_task(
        &self,
        target: &ManagedObjectReference,
        method: &str,
        args: Value,
    ) -> Result<Option<Value>, Error> {
        let task = self.call(target, method, args).await?;
        let task: ManagedObjectReference = decode(method, task)?;
        self.wait_for_task(&task).await
    }

    /// Polls `task` every second until it succeeds, returning its result, or
    /// fails, returning its fault.
    pub async fn wait_for_task(
        &self,
        task: &ManagedObjectReference,
    ) -> Result<Option<Value>, Error> {
        loop {
            let info = self
                .invoker
                .invoke_property(task, &PropertyInfo::new("info"))
                .await?;
            let info: TaskInfo = decode("info", info)?;
            match info.state {
                TaskState::Success => return Ok(info.result),
                TaskState::Error => {
                    let fault =
                        Fault::from_payload(info.error.unwrap_or(Value::Null));
                    return Err(Error::Task { task: task.clone(), fault });
                }
                TaskState::Queued | TaskState::Running => {
                    tokio::time::sleep(TASK_POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn custom_field_key(
        &self,
        name: &str,
    ) -> Result<Option<i32>, Error> {
        let fields = self
            .get_property(
                &self.content.custom_fields_manager,
                managed_type::CUSTOM_FIELDS_MANAGER,
                "field",
            )
            .await?;
        if fields.is_null() {
            return Ok(None);
        }
        let fields: Vec<CustomFieldDef> = decode("field", fields)?;
        Ok(fields.into_iter().find(|f| f.name == name).map(|f| f.key))
    }

    async fn datastore_browser(
        &self,
        vm: &ManagedObjectReference,
        datastore: &str,
    ) -> Result<Option<ManagedObjectReference>, Error> {
        let datastores = self
            .get_property(vm, managed_type::VIRTUAL_MACHINE, "datastore")
            .await?;
        if datastores.is_null() {
            return Ok(None);
        }
        let datastores: Vec<ManagedObjectReference> =
            decode("datastore", datastores)?;
        for candidate in datastores {
            let info = self
                .get_property(&candidate, managed_type::DATASTORE, "info")
                .await?;
            let info: DatastoreInfo = decode("info", info)?;
            if info.name == datastore {
                let browser = self
                    .get_property(
                        &candidate,
                        managed_type::DATASTORE,
                        "browser",
                    )
                    .await?;
                return Ok(Some(decode("browser", browser)?));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl<T: Transport> VimApi for VimApiClient<T> {
    async fn power_on_vm(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<(), Error> {
        self.run_task(vm, "PowerOnVM_Task", json!({})).await?;
        Ok(())
    }

    async fn power_off_vm(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<(), Error> {
        self.run_task(vm, "PowerOffVM_Task", json!({})).await?;
        Ok(())
    }

    async fn shutdown_guest(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<(), Error> {
        self.call(vm, "ShutdownGuest", json!({})).await?;
        Ok(())
    }

    async fn reboot_guest(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<(), Error> {
        self.call(vm, "RebootGuest", json!({})).await?;
        Ok(())
    }

    async fn reconfig_vm(
        &self,
        vm: &ManagedObjectReference,
        spec: &VirtualMachineConfigSpec,
    ) -> Result<(), Error> {
        self.run_task(vm, "ReconfigVM_Task", json!({ "spec": spec })).await?;
        Ok(())
    }

    async fn answer_vm(
        &self,
        vm: &ManagedObjectReference,
        question_id: &str,
        choice_key: &str,
    ) -> Result<(), Error> {
        let args = json!({
            "questionId": question_id,
            "answerChoice": choice_key,
        });
        self.call(vm, "AnswerVM", args).await?;
        Ok(())
    }

    async fn delete_vm(
        &self,
        vm: &ManagedObjectReference,
    ) -> Result<(), Error> {
        self.run_task(vm, "Destroy_Task", json!({})).await?;
        Ok(())
    }

    async fn move_disk(
        &self,
        datacenter: &ManagedObjectReference,
        source: &DatastorePath,
        dest: &DatastorePath,
    ) -> Result<(), Error> {
        let args = json!({
            "sourceName": source.to_string(),
            "sourceDatacenter": datacenter,
            "destName": dest.to_string(),
            "destDatacenter": datacenter,
            "force": false,
        });
        self.run_task(
            &self.content.virtual_disk_manager,
            "MoveVirtualDisk_Task",
            args,
        )
        .await?;
        Ok(())
    }

    /// Searches the folder holding `path` on the VM's datastore for its file
    /// name. A missing datastore or folder means the path does not exist.
    async fn disk_path_exists(
        &self,
        vm: &ManagedObjectReference,
        path: &DatastorePath,
    ) -> Result<bool, Error> {
        let Some(browser) = self.datastore_browser(vm, path.datastore()).await?
        else {
            return Ok(false);
        };
        let folder = DatastorePath::new(path.datastore(), path.folder());
        let args = json!({
            "datastorePath": folder.to_string(),
            "searchSpec": { "matchPattern": [path.file_name()] },
        });
        match self.run_task(&browser, "SearchDatastore_Task", args).await {
            Ok(result) => Ok(result
                .as_ref()
                .and_then(|r| r.get("file"))
                .and_then(Value::as_array)
                .is_some_and(|files| !files.is_empty())),
            Err(e) if e.is_fault_type("FileNotFound") => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn add_persistent_disk_property(
        &self,
        vm: &ManagedObjectReference,
        property: &VAppPropertyInfo,
    ) -> Result<(), Error> {
        let spec = VirtualMachineConfigSpec::with_vapp_properties(vec![
            VAppPropertySpec {
                operation: ArrayUpdateOperation::Add,
                remove_key: None,
                info: Some(property.clone()),
            },
        ]);
        self.reconfig_vm(vm, &spec).await
    }

    async fn delete_persistent_disk_property(
        &self,
        vm: &ManagedObjectReference,
        key: i32,
    ) -> Result<(), Error> {
        let spec = VirtualMachineConfigSpec::with_vapp_properties(vec![
            VAppPropertySpec {
                operation: ArrayUpdateOperation::Remove,
                remove_key: Some(key),
                info: None,
            },
        ]);
        self.reconfig_vm(vm, &spec).await
    }

    async fn find_parent(
        &self,
        object: &ManagedObjectReference,
        type_name: &'static str,
    ) -> Result<ManagedObjectReference, Error> {
        let mut current = object.clone();
        loop {
            let parent = self
                .get_property(&current, current.type_name(), "parent")
                .await?;
            if parent.is_null() {
                return Err(Error::NoParent {
                    object: object.clone(),
                    type_name,
                });
            }
            let parent: ManagedObjectReference = decode("parent", parent)?;
            if parent.type_name() == type_name {
                return Ok(parent);
            }
            current = parent;
        }
    }

    /// Sets custom field `name` on `vm`, defining the field first. The
    /// definition is attempted every time; an existing one is looked up.
    async fn set_custom_field(
        &self,
        vm: &ManagedObjectReference,
        name: &str,
        value: &str,
    ) -> Result<(), Error> {
        let manager = &self.content.custom_fields_manager;
        let args = json!({ "name": name, "moType": vm.type_name() });
        let key = match self.call(manager, "AddCustomFieldDef", args).await {
            Ok(def) => decode::<CustomFieldDef>("AddCustomFieldDef", def)?.key,
            Err(e) if e.is_fault_type("DuplicateName") => {
                match self.custom_field_key(name).await? {
                    Some(key) => key,
                    None => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };
        let args = json!({ "entity": vm, "key": key, "value": value });
        self.call(manager, "SetField", args).await?;
        Ok(())
    }

    async fn get_property(
        &self,
        object: &ManagedObjectReference,
        type_name: &str,
        path: &str,
    ) -> Result<Value, Error> {
        trace!(self.log, "reading property";
            "object" => %object,
            "type" => type_name,
            "path" => path,
        );
        let value = self
            .invoker
            .invoke_property(object, &PropertyInfo::new(path))
            .await?;
        Ok(value)
    }
}
