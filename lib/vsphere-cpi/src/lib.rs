// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The VM side of a vSphere cloud provider interface.
//!
//! A [`Vm`] tracks one virtual machine's devices, power state and
//! persistent disks. It talks to the server through the [`VimApi`] trait,
//! implemented over the retrying RPC layer by [`VimApiClient`]. Persistent
//! disks are identified across detach and reattach by annotations stored on
//! the VM itself (see [`vm::PersistentDiskLedger`]).

pub mod api;
mod client;
pub mod disk;
mod error;
#[cfg(test)]
mod fake;
pub mod log;
mod retry;
pub mod stub;
pub mod vm;

pub use api::{PropertyMap, Required, VimApi};
pub use client::{service_instance, VimApiClient};
pub use disk::Disk;
pub use error::Error;
pub use vm::Vm;
