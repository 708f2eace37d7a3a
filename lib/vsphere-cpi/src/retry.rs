// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coarse retry loop around whole multi-call sequences.
//!
//! This is distinct from the per-call replay in the invoker: it re-runs a
//! sequence the caller knows to be safe to repeat as a unit, even when
//! individual calls inside it are never replayed at the RPC level.

use std::future::Future;
use std::time::Duration;

use slog::{warn, Logger};

use crate::Error;

fn policy() -> backoff::ExponentialBackoff {
    backoff::ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Runs `op` until it succeeds or `attempts` runs have failed, returning
/// the last error in the latter case.
pub(crate) async fn retry_block<T, F, Fut>(
    log: &Logger,
    what: &'static str,
    attempts: u32,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    backoff::future::retry(policy(), || {
        attempt += 1;
        let this_attempt = attempt;
        let log = log.clone();
        let fut = op();
        async move {
            fut.await.map_err(|e| {
                if this_attempt >= attempts {
                    backoff::Error::permanent(e)
                } else {
                    warn!(log, "{} failed, retrying", what;
                        "attempt" => this_attempt,
                        "error" => %e,
                    );
                    backoff::Error::transient(e)
                }
            })
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::{o, Discard};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky(calls: &AtomicU32, failures: u32) -> Result<u32, Error> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= failures {
            Err(Error::NoSystemDisk(format!("attempt {n}")))
        } else {
            Ok(n)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_from_transient_failures() {
        let log = Logger::root(Discard, o!());
        let calls = AtomicU32::new(0);
        let result = retry_block(&log, "flaky op", 10, || async {
            flaky(&calls, 2)
        })
        .await
        .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempt_budget() {
        let log = Logger::root(Discard, o!());
        let calls = AtomicU32::new(0);
        let err = retry_block(&log, "flaky op", 4, || async {
            flaky(&calls, u32::MAX)
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "VM attempt 4 has no system disk");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
