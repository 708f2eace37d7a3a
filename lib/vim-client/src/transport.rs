// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;
use serde_json::Value;
use vim_types::ManagedObjectReference;

use crate::Error;

/// Describes a remote method by its wire name, e.g. `PowerOnVM_Task`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodInfo {
    wsdl_name: String,
}

impl MethodInfo {
    pub fn new(wsdl_name: impl Into<String>) -> Self {
        Self { wsdl_name: wsdl_name.into() }
    }

    pub fn wsdl_name(&self) -> &str {
        &self.wsdl_name
    }
}

/// Describes a remote property by its dotted path, e.g. `runtime.powerState`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyInfo {
    path: String,
}

impl PropertyInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Status and decoded body of one method call.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: u16,
    pub payload: Value,
}

impl Response {
    pub fn new(status: u16, payload: Value) -> Self {
        Self { status, payload }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Moves calls to the management server and back.
///
/// A transport reports the server's status code for method calls rather than
/// interpreting it, leaving retry decisions to its caller. `Err` is reserved
/// for failures to exchange a message at all.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn invoke_method(
        &self,
        target: &ManagedObjectReference,
        method: &MethodInfo,
        args: &Value,
    ) -> Result<Response, Error>;

    async fn invoke_property(
        &self,
        target: &ManagedObjectReference,
        property: &PropertyInfo,
    ) -> Result<Value, Error>;

    /// The API version namespace spoken on this transport.
    fn version(&self) -> String;
}
