// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use thiserror::Error;
use vim_client::Fault;
use vim_types::{InvalidDatastorePath, ManagedObjectReference};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Vim(#[from] vim_client::Error),

    /// A polling wait ran past its bound.
    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: &'static str, waited: Duration },

    #[error(
        "no available unit numbers on controller {controller_key} \
         for device {device_key}"
    )]
    NoAvailableUnitNumber { controller_key: i32, device_key: i32 },

    #[error("{object} is missing required property {path}")]
    MissingProperty { object: ManagedObjectReference, path: String },

    #[error("failed to decode property {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no {type_name} found above {object}")]
    NoParent { object: ManagedObjectReference, type_name: &'static str },

    #[error("VM {0} has no system disk")]
    NoSystemDisk(String),

    #[error("disk {0} is not attached after reconfigure")]
    AttachedDiskNotFound(String),

    #[error("question {id} ({text}) declares no default answer")]
    QuestionWithoutDefault { id: String, text: String },

    #[error(transparent)]
    InvalidDatastorePath(#[from] InvalidDatastorePath),

    #[error("task {task} failed: {fault}")]
    Task { task: ManagedObjectReference, fault: Fault },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The remote fault behind this error, whether raised by a call or
    /// reported by a failed task.
    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            Error::Vim(e) => e.as_fault(),
            Error::Task { fault, .. } => Some(fault),
            _ => None,
        }
    }

    pub(crate) fn is_fault_type(&self, fault_type: &str) -> bool {
        self.as_fault().and_then(Fault::fault_type) == Some(fault_type)
    }
}
