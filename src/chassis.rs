use std::sync::Arc;

use async_trait::async_trait;

use crate::dispatch::{CommandHandler, CommandReply, RequestContext};
use crate::hypervisor::{BootDevice, HypervisorControl, PowerState, VmId};
use crate::protocol::{CompletionCode, IpmiRequest};

/// Chassis control operation codes (request data byte 0).
mod control {
    pub const POWER_DOWN: u8 = 0x00;
    pub const POWER_UP: u8 = 0x01;
    pub const POWER_CYCLE: u8 = 0x02;
    pub const HARD_RESET: u8 = 0x03;
}

/// Boot option parameter selector for boot flags.
const BOOT_PARAM_BOOT_FLAGS: u8 = 0x05;

/// Boot device codes inside the boot flags parameter (data byte 1, after
/// masking the persistent/EFI bits).
mod boot_device {
    pub const NO_OVERRIDE: u8 = 0x00;
    pub const PXE: u8 = 0x04;
    pub const DISK: u8 = 0x08;
    pub const CDROM: u8 = 0x14;
    pub const FLOPPY: u8 = 0x3C;
}

/// Bit set in the chassis status power-state byte when the system is on.
const SYSTEM_POWER_ON: u8 = 0x01;

/// Shared state of the chassis handlers: one hypervisor reference scoped to
/// exactly one VM.
struct ChassisTarget {
    vm: VmId,
    hypervisor: Arc<dyn HypervisorControl>,
}

/// `Chassis Control` (Chassis, 0x02).
pub(crate) struct ChassisControlHandler {
    target: ChassisTarget,
}

impl ChassisControlHandler {
    pub(crate) fn new(vm: VmId, hypervisor: Arc<dyn HypervisorControl>) -> Self {
        Self {
            target: ChassisTarget { vm, hypervisor },
        }
    }
}

#[async_trait]
impl CommandHandler for ChassisControlHandler {
    async fn handle(&self, _ctx: &RequestContext, request: &IpmiRequest) -> CommandReply {
        let ChassisTarget { vm, hypervisor } = &self.target;

        let Some(&op) = request.data.first() else {
            return CommandReply::code(CompletionCode::InvalidDataField);
        };

        let result = match op {
            control::POWER_DOWN => {
                tracing::info!(%vm, "power down command received");
                hypervisor.power_off(vm).await
            }
            control::POWER_UP => {
                tracing::info!(%vm, "power up command received");
                hypervisor.power_on(vm).await
            }
            control::HARD_RESET => {
                tracing::info!(%vm, "reset command received");
                hypervisor.reset(vm).await
            }
            control::POWER_CYCLE => {
                // Power off then on with no settle delay; a failed power off
                // suppresses the power-on attempt.
                tracing::info!(%vm, "power cycle command received");
                match hypervisor.power_off(vm).await {
                    Ok(()) => hypervisor.power_on(vm).await,
                    Err(err) => Err(err),
                }
            }
            other => {
                tracing::warn!(%vm, op = other, "unsupported chassis control operation");
                return CommandReply::code(CompletionCode::InvalidCommand);
            }
        };

        match result {
            Ok(()) => CommandReply::code(CompletionCode::Completed),
            Err(err) => {
                tracing::error!(%vm, error = %err, "chassis control action failed");
                CommandReply::code(CompletionCode::Unspecified)
            }
        }
    }
}

/// `Get Chassis Status` (Chassis, 0x01).
pub(crate) struct ChassisStatusHandler {
    target: ChassisTarget,
}

impl ChassisStatusHandler {
    pub(crate) fn new(vm: VmId, hypervisor: Arc<dyn HypervisorControl>) -> Self {
        Self {
            target: ChassisTarget { vm, hypervisor },
        }
    }
}

#[async_trait]
impl CommandHandler for ChassisStatusHandler {
    async fn handle(&self, _ctx: &RequestContext, _request: &IpmiRequest) -> CommandReply {
        let ChassisTarget { vm, hypervisor } = &self.target;
        tracing::debug!(%vm, "querying chassis status");

        match hypervisor.power_state(vm).await {
            Ok(state) => {
                let power_byte = match state {
                    PowerState::On => SYSTEM_POWER_ON,
                    PowerState::Off => 0x00,
                };
                // Current power state, last power event, misc chassis state.
                CommandReply::ok(vec![power_byte, 0x00, 0x00])
            }
            Err(err) => {
                tracing::error!(%vm, error = %err, "failed to query power state");
                CommandReply::code(CompletionCode::Unspecified)
            }
        }
    }
}

/// `Set System Boot Options` (Chassis, 0x08).
///
/// Only the boot flags parameter is interpreted; every other parameter is
/// acknowledged with no effect. A mapped boot device triggers a one-shot
/// next-boot hint, never a persistent default.
pub(crate) struct SetBootOptionsHandler {
    target: ChassisTarget,
}

impl SetBootOptionsHandler {
    pub(crate) fn new(vm: VmId, hypervisor: Arc<dyn HypervisorControl>) -> Self {
        Self {
            target: ChassisTarget { vm, hypervisor },
        }
    }
}

#[async_trait]
impl CommandHandler for SetBootOptionsHandler {
    async fn handle(&self, _ctx: &RequestContext, request: &IpmiRequest) -> CommandReply {
        let ChassisTarget { vm, hypervisor } = &self.target;

        let Some(&param) = request.data.first() else {
            return CommandReply::code(CompletionCode::InvalidDataField);
        };
        if param & 0x7F != BOOT_PARAM_BOOT_FLAGS {
            tracing::debug!(%vm, param, "ignoring non-boot-flags parameter");
            return CommandReply::code(CompletionCode::Completed);
        }

        let Some(&device_byte) = request.data.get(2) else {
            return CommandReply::code(CompletionCode::InvalidDataField);
        };

        // Mask out the persistent/EFI bits before mapping the device field.
        let device = match device_byte & 0x3F {
            boot_device::NO_OVERRIDE => return CommandReply::code(CompletionCode::Completed),
            boot_device::DISK => BootDevice::Hdd,
            boot_device::CDROM => BootDevice::Cdrom,
            boot_device::PXE => BootDevice::Pxe,
            boot_device::FLOPPY => BootDevice::Floppy,
            other => {
                tracing::warn!(%vm, device = other, "unsupported boot device");
                return CommandReply::code(CompletionCode::InvalidObjCommand);
            }
        };

        tracing::info!(%vm, %device, "setting next boot device");
        match hypervisor.set_next_boot(vm, device).await {
            Ok(()) => CommandReply::code(CompletionCode::Completed),
            Err(err) => {
                tracing::error!(%vm, error = %err, "failed to set boot device");
                CommandReply::code(CompletionCode::Unspecified)
            }
        }
    }
}
