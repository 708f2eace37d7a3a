// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use serde_json::Value;
use thiserror::Error;

const UNKNOWN_FAULT: &str = "Unknown remote fault";

/// A failed remote call, as reported by the management server.
///
/// The raw payload is kept as-is so callers can inspect the server-side
/// fault type when they need to tolerate a specific condition.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{message}")]
pub struct Fault {
    message: String,
    payload: Value,
}

impl Fault {
    pub fn new(message: impl Into<String>, payload: Value) -> Self {
        Self { message: message.into(), payload }
    }

    /// Builds a fault from a failed call's payload. A structured method
    /// fault contributes its `msg`; anything else becomes an unknown fault
    /// wrapping the raw payload.
    pub fn from_payload(payload: Value) -> Self {
        let msg = payload
            .as_object()
            .and_then(|obj| obj.get("msg"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        match msg {
            Some(msg) => Self::new(msg, payload),
            None => Self::new(UNKNOWN_FAULT, payload),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// The server-side fault type (e.g. `FileNotFound`), when present.
    pub fn fault_type(&self) -> Option<&str> {
        self.payload.get("_type").and_then(Value::as_str)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// The server answered with a fault, and it was either not safe to
    /// replay or kept failing until the attempt budget ran out.
    #[error("remote fault: {0}")]
    Fault(#[from] Fault),

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("audit log: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The remote fault behind this error, if the server produced one.
    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            Error::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}
