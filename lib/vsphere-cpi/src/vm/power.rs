// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::convert::Infallible;
use std::time::Duration;

use slog::{debug, info, warn};
use tokio::time::Instant;
use vim_types::{
    managed_type, DiskMode, PowerState, VirtualDeviceConfigSpec,
    VirtualMachineConfigSpec, VirtualMachineQuestion,
};

use super::Vm;
use crate::api::{decode, Required};
use crate::retry::retry_block;
use crate::Error;

/// Text identifying the prompt raised when a disk still has a redo log.
pub(crate) const REDO_LOG_QUESTION: &str = "msg.disk.redoLogPersistent";

/// Choice key committing the redo log into the base disk.
pub(crate) const REDO_LOG_COMMIT: &str = "0";

const POWER_STATE_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn default_answer(question: &VirtualMachineQuestion) -> Result<&str, Error> {
    question
        .default_choice()
        .map(|choice| choice.key.as_str())
        .ok_or_else(|| Error::QuestionWithoutDefault {
            id: question.id.clone(),
            text: question.text.clone(),
        })
}

impl Vm {
    async fn read_power_state(&self) -> Result<PowerState, Error> {
        let value = self
            .client
            .get_property(
                &self.mob,
                managed_type::VIRTUAL_MACHINE,
                "runtime.powerState",
            )
            .await?;
        decode("runtime.powerState", value)
    }

    /// One pass of the forced power-off sequence. Reads fresh state rather
    /// than the cache, since it may run several times.
    async fn power_off_once(&self) -> Result<(), Error> {
        let props = self
            .client
            .get_properties(
                &self.mob,
                managed_type::VIRTUAL_MACHINE,
                &["runtime.question", "runtime.powerState"],
                Required::Paths(&["runtime.powerState"]),
            )
            .await?;
        let question: Option<VirtualMachineQuestion> =
            props.get("runtime.question")?;

        let power_state = match question {
            Some(question) => {
                let answer = default_answer(&question)?;
                info!(self.log, "VM is blocked on a question, providing \
                    default answer";
                    "question" => &question.text,
                    "answer" => answer,
                );
                self.client.answer_vm(&self.mob, &question.id, answer).await?;
                self.read_power_state().await?
            }
            None => props.require("runtime.powerState")?,
        };

        if power_state != PowerState::PoweredOff {
            info!(self.log, "powering off vm");
            self.client.power_off_vm(&self.mob).await?;
        }
        Ok(())
    }

    /// Forces the VM off, answering any question blocking it first.
    pub async fn power_off(&mut self) -> Result<(), Error> {
        retry_block(
            &self.log,
            "power off vm",
            self.config.retry_block_attempts,
            || self.power_off_once(),
        )
        .await?;
        self.reload();
        Ok(())
    }

    async fn ensure_persistent_disks_have_correct_mode(
        &mut self,
    ) -> Result<(), Error> {
        let disks = self.disks_with_incorrect_mode().await?;
        if disks.is_empty() {
            return Ok(());
        }

        let mut changes = Vec::with_capacity(disks.len());
        for mut device in disks {
            if let Some(disk) = device.as_disk_mut() {
                info!(self.log, "found persistent disk with unsafe disk mode, \
                    changing to independent_persistent";
                    "disk" => &disk.backing.file_name,
                    "mode" => ?disk.backing.disk_mode,
                );
                disk.backing.disk_mode = DiskMode::IndependentPersistent;
            }
            changes.push(VirtualDeviceConfigSpec::edit(device));
        }
        self.client
            .reconfig_vm(
                &self.mob,
                &VirtualMachineConfigSpec::with_device_changes(changes),
            )
            .await?;
        self.reload();
        Ok(())
    }

    /// Asks the guest to shut down, forcing the VM off if it has not done so
    /// within the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        debug!(self.log, "changing attached disks to persistent mode before \
            shutdown");
        self.ensure_persistent_disks_have_correct_mode().await?;

        debug!(self.log, "waiting for the VM to shut down");
        if let Err(e) = self.client.shutdown_guest(&self.mob).await {
            // The VM may already be off by the time it is asked.
            debug!(self.log, "ignoring guest shutdown failure"; "error" => %e);
        }

        match self.wait_until_off(self.config.shutdown_timeout()).await {
            Ok(()) => {}
            Err(Error::Timeout { .. }) => {
                debug!(self.log, "the guest did not shut down in time, \
                    powering off");
                self.client.power_off_vm(&self.mob).await?;
            }
            Err(e) => return Err(e),
        }
        self.reload();
        Ok(())
    }

    async fn answer_pending_question(&self) -> Result<(), Error> {
        let value = self
            .client
            .get_property(
                &self.mob,
                managed_type::VIRTUAL_MACHINE,
                "runtime.question",
            )
            .await?;
        if value.is_null() {
            return Ok(());
        }
        let question: VirtualMachineQuestion =
            decode("runtime.question", value)?;

        let answer = if question.text.contains(REDO_LOG_QUESTION) {
            info!(self.log, "VM is blocked on a question about a disk's redo \
                log, committing it");
            REDO_LOG_COMMIT
        } else {
            let answer = default_answer(&question)?;
            info!(self.log, "VM is blocked on a question, providing default \
                answer";
                "question" => &question.text,
                "answer" => answer,
            );
            answer
        };
        self.client.answer_vm(&self.mob, &question.id, answer).await
    }

    /// Answers questions raised while the VM powers on. Only ever ends by
    /// being dropped.
    async fn answer_questions(&self) -> Infallible {
        let interval = self.config.question_poll_interval();
        loop {
            if let Err(e) = self.answer_pending_question().await {
                warn!(self.log, "failed to answer pending question";
                    "error" => %e,
                );
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Powers the VM on, answering any question the hypervisor raises
    /// while the power-on call is outstanding.
    pub async fn power_on(&mut self) -> Result<(), Error> {
        info!(self.log, "powering on vm");
        let result = {
            let power_on = self.client.power_on_vm(&self.mob);
            let watcher = self.answer_questions();
            // The watcher is dropped, and so cancelled, as soon as the
            // power-on call completes.
            tokio::select! {
                biased;
                result = power_on => result,
                never = watcher => match never {},
            }
        };
        self.reload();
        result
    }

    pub async fn reboot(&self) -> Result<(), Error> {
        info!(self.log, "rebooting vm");
        self.client.reboot_guest(&self.mob).await
    }

    /// Polls the power state every second until the VM is off, failing with
    /// [`Error::Timeout`] once `timeout` has elapsed.
    pub async fn wait_until_off(&self, timeout: Duration) -> Result<(), Error> {
        let started = Instant::now();
        loop {
            if self.read_power_state().await? == PowerState::PoweredOff {
                return Ok(());
            }
            if started.elapsed() > timeout {
                return Err(Error::Timeout {
                    what: "VM to power off",
                    waited: timeout,
                });
            }
            tokio::time::sleep(POWER_STATE_POLL_INTERVAL).await;
        }
    }
}
