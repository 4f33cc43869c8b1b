use core::fmt;

use async_trait::async_trait;

use crate::error::Result;

/// Identifier of a virtual machine within the hypervisor inventory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VmId(pub String);

impl VmId {
    /// Create a VM identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Power state of a virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    /// The VM is powered on.
    On,
    /// The VM is powered off.
    Off,
}

/// Boot device for a one-shot next-boot override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDevice {
    /// Boot from the first hard disk.
    Hdd,
    /// Boot from CD/DVD.
    Cdrom,
    /// Network (PXE) boot.
    Pxe,
    /// Boot from floppy.
    Floppy,
}

impl fmt::Display for BootDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hdd => "hdd",
            Self::Cdrom => "cdrom",
            Self::Pxe => "pxe",
            Self::Floppy => "floppy",
        };
        f.write_str(name)
    }
}

/// Narrow capability interface over the hypervisor's VM control operations.
///
/// Each call blocks until the underlying action completes or fails. The
/// protocol layer maps any failure to an `Unspecified` completion code and
/// never retries.
#[async_trait]
pub trait HypervisorControl: Send + Sync {
    /// Power the VM on.
    async fn power_on(&self, vm: &VmId) -> Result<()>;

    /// Power the VM off.
    async fn power_off(&self, vm: &VmId) -> Result<()>;

    /// Hard-reset the VM.
    async fn reset(&self, vm: &VmId) -> Result<()>;

    /// Query the VM's current power state.
    async fn power_state(&self, vm: &VmId) -> Result<PowerState>;

    /// Set a one-shot next-boot device override.
    async fn set_next_boot(&self, vm: &VmId, device: BootDevice) -> Result<()>;
}
