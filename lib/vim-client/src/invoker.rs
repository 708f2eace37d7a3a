// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use serde_json::Value;
use slog::{o, warn, Logger};
use vim_types::ManagedObjectReference;

use crate::retry_judge::{RetryJudge, RetryPolicy};
use crate::transport::{MethodInfo, PropertyInfo, Transport};
use crate::{Error, Fault};

/// Attempts made for one method call, including the first.
pub const MAX_ATTEMPTS: u32 = 5;

/// Upper bound on the delay between two attempts.
pub const RETRY_INTERVAL_CAP: Duration = Duration::from_secs(32);

/// Delay before the attempt following attempt number `attempt` (zero-based).
pub fn retry_interval(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(RETRY_INTERVAL_CAP)
}

/// Wraps a [`Transport`] so that failed method calls are replayed with
/// capped exponential back-off, unless the retry policy says replaying the
/// method is unsafe.
///
/// Property reads are passed straight through and never retried.
pub struct ResilientInvoker<T> {
    transport: T,
    policy: Box<dyn RetryPolicy>,
    log: Logger,
}

impl<T: Transport> ResilientInvoker<T> {
    pub fn new(transport: T, log: Logger) -> Self {
        Self::with_policy(transport, Box::new(RetryJudge), log)
    }

    pub fn with_policy(
        transport: T,
        policy: Box<dyn RetryPolicy>,
        log: Logger,
    ) -> Self {
        let log = log.new(o!("component" => "vim-invoker"));
        Self { transport, policy, log }
    }

    /// Invokes `method` on `target`, returning the decoded result.
    ///
    /// A non-2xx status becomes a [`Fault`]. The fault is raised at once if
    /// the method may not be replayed or the attempt budget is spent;
    /// otherwise the call is issued again after [`retry_interval`].
    pub async fn invoke_method(
        &self,
        target: &ManagedObjectReference,
        method: &MethodInfo,
        args: &Value,
    ) -> Result<Value, Error> {
        let mut retryable = None;
        let mut attempt = 0;
        loop {
            let response =
                self.transport.invoke_method(target, method, args).await?;
            if response.is_success() {
                return Ok(response.payload);
            }

            let fault = Fault::from_payload(response.payload);
            let last_attempt = attempt + 1 >= MAX_ATTEMPTS;
            let retryable = *retryable.get_or_insert_with(|| {
                self.policy.retryable(target.type_name(), method.wsdl_name())
            });
            if last_attempt || !retryable {
                return Err(fault.into());
            }

            let delay = retry_interval(attempt);
            warn!(self.log, "remote call failed, retrying";
                "target" => %target,
                "method" => method.wsdl_name(),
                "status" => response.status,
                "attempt" => attempt + 1,
                "delay" => ?delay,
                "fault" => %fault,
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    pub async fn invoke_property(
        &self,
        target: &ManagedObjectReference,
        property: &PropertyInfo,
    ) -> Result<Value, Error> {
        self.transport.invoke_property(target, property).await
    }

    pub fn version(&self) -> String {
        self.transport.version()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}
