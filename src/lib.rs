//! Virtual baseboard management controllers for virtualized hosts.
//!
//! This crate emulates the BMC of a physical server for VMs that have none:
//! each managed VM gets its own UDP endpoint speaking IPMI over LAN, so
//! standard tooling (`ipmitool` and friends) can power machines on and off,
//! query chassis status, and set boot devices without knowing the target is
//! virtual.
//!
//! The main pieces:
//!
//! - [`protocol`]: RMCP/RMCP+ frame codec and IPMI LAN message codec.
//! - [`session`]: session directory, challenge/activate/close handlers.
//! - [`dispatch`]: (network function, command) dispatch table.
//! - [`hypervisor`]: the [`HypervisorControl`] capability instances act
//!   through.
//! - [`instance`]: one UDP server per VM, tying the above together.
//! - [`fleet`]: supervision of many instances with durable address
//!   assignment.
//! - [`lanplus`]: client-role RMCP+ transport (framing only, no RAKP).
//!
//! # Example
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use std::sync::Arc;
//!
//! use vbmc::{InstanceSpec, NoopAddressManager, VirtualBmcInstance, VmId};
//!
//! # async fn run(hypervisor: Arc<dyn vbmc::HypervisorControl>) -> vbmc::Result<()> {
//! let spec = InstanceSpec {
//!     vm: VmId::new("guest-01"),
//!     addr: Ipv4Addr::LOCALHOST,
//!     port: 623,
//!     strict_sequence: false,
//! };
//! let mut bmc = VirtualBmcInstance::new(spec, hypervisor, Arc::new(NoopAddressManager));
//! bmc.start().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Host interface address management.
pub mod addr;
mod chassis;
/// Service configuration loading and validation.
pub mod config;
/// Secrets and frame authentication codes.
pub mod crypto;
mod debug;
/// Command dispatch table.
pub mod dispatch;
/// Crate-wide error type.
pub mod error;
/// Fleet supervision: many instances, one address range.
pub mod fleet;
/// Hypervisor control capability.
pub mod hypervisor;
/// A single virtual BMC endpoint.
pub mod instance;
/// Durable VM-to-address assignments.
pub mod ipdb;
/// Client-role RMCP+ transport.
pub mod lanplus;
/// RMCP/RMCP+ and IPMI LAN codecs.
pub mod protocol;
/// Sessions, users, and session-management command handlers.
pub mod session;

pub use addr::{AddressManager, IpCommand, NoopAddressManager};
pub use config::{Config, IpRange, NetworkConfig};
pub use crypto::SecretBytes;
pub use dispatch::{CommandHandler, CommandReply, CommandTable, RequestContext};
pub use error::{Error, Result};
pub use fleet::Fleet;
pub use hypervisor::{BootDevice, HypervisorControl, PowerState, VmId};
pub use instance::{InstanceSpec, InstanceState, VirtualBmcInstance};
pub use ipdb::IpDatabase;
pub use lanplus::LanPlusClient;
pub use protocol::CompletionCode;
pub use session::{PrivilegeLevel, SessionDirectory};
