// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A client for the vSphere management (VIM) API.
//!
//! Every outbound method call goes through [`ResilientInvoker`], which
//! replays failed calls with capped exponential back-off as long as the
//! [`RetryJudge`] considers the method safe to replay. Calls that move disks
//! or reconfigure a VM are never replayed: a failure there may already have
//! been partially applied on the server.

mod fault;
pub mod http;
mod invoker;
pub mod retry_judge;
mod transport;

pub use fault::{Error, Fault};
pub use http::HttpTransport;
pub use invoker::{
    retry_interval, ResilientInvoker, MAX_ATTEMPTS, RETRY_INTERVAL_CAP,
};
pub use retry_judge::{RetryJudge, RetryPolicy, NON_RETRYABLE_METHODS};
pub use transport::{MethodInfo, PropertyInfo, Response, Transport};

