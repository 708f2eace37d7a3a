// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Replay safety of remote methods.

use vim_types::managed_type;

/// Methods that must never be replayed after a failure, keyed by the managed
/// type they are invoked on. Anything not listed here is safe to retry.
pub const NON_RETRYABLE_METHODS: &[(&str, &[&str])] = &[
    (
        managed_type::VIRTUAL_DISK_MANAGER,
        &[
            // Replaying a half-finished move can lose persistent data.
            "MoveVirtualDisk_Task",
        ],
    ),
    (
        managed_type::VIRTUAL_MACHINE,
        &[
            // Used for attach, detach and vApp property edits; a failed call
            // may have been partially applied.
            "ReconfigVM_Task",
            // Moves disks.
            "RelocateVM_Task",
        ],
    ),
    (
        managed_type::CUSTOM_FIELDS_MANAGER,
        &[
            // Issued even when the field already exists.
            "AddCustomFieldDef",
            // Metadata only; a failure is cosmetic.
            "SetField",
        ],
    ),
];

/// Decides whether a failed call may be issued again.
#[cfg_attr(test, mockall::automock)]
pub trait RetryPolicy: Send + Sync {
    fn retryable(&self, type_name: &str, method: &str) -> bool;
}

/// The default policy, backed by [`NON_RETRYABLE_METHODS`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryJudge;

impl RetryPolicy for RetryJudge {
    fn retryable(&self, type_name: &str, method: &str) -> bool {
        NON_RETRYABLE_METHODS
            .iter()
            .find(|(ty, _)| *ty == type_name)
            .map_or(true, |(_, methods)| !methods.contains(&method))
    }
}
