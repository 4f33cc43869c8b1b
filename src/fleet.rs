use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::addr::AddressManager;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hypervisor::{HypervisorControl, VmId};
use crate::instance::{InstanceSpec, InstanceState, VirtualBmcInstance};
use crate::ipdb::IpDatabase;

/// Supervisor for a set of virtual BMC instances, one per managed VM.
///
/// Endpoint addresses are drawn from the configured range, recorded durably,
/// and reused across restarts. Each VM gets an exclusive address; the fleet
/// refuses to start when the range is exhausted.
pub struct Fleet {
    config: Config,
    db: IpDatabase,
    hypervisor: Arc<dyn HypervisorControl>,
    addresses: Arc<dyn AddressManager>,
    instances: HashMap<VmId, VirtualBmcInstance>,
}

impl Fleet {
    /// Build an empty fleet.
    pub fn new(
        config: Config,
        db: IpDatabase,
        hypervisor: Arc<dyn HypervisorControl>,
        addresses: Arc<dyn AddressManager>,
    ) -> Self {
        Self {
            config,
            db,
            hypervisor,
            addresses,
            instances: HashMap::new(),
        }
    }

    /// Pick an exclusive endpoint address for `vm`.
    ///
    /// A persisted assignment is reused as long as it still falls inside the
    /// configured range; otherwise the lowest free address of the range is
    /// taken and recorded.
    pub async fn assign_address(&self, vm: &VmId) -> Result<Ipv4Addr> {
        if let Some(existing) = self.db.get(vm).await {
            if self.config.ip_range.contains(existing) {
                tracing::debug!(%vm, addr = %existing, "reusing persisted address");
                return Ok(existing);
            }
            tracing::warn!(%vm, addr = %existing,
                "persisted address fell outside the configured range, reassigning");
            self.db.remove(vm).await?;
        }

        let taken = self.db.assigned().await;
        let addr = self
            .config
            .ip_range
            .iter()
            .find(|candidate| !taken.contains(candidate))
            .ok_or_else(|| {
                Error::configuration(format!(
                    "address range {}-{} is exhausted",
                    self.config.ip_range.start, self.config.ip_range.end
                ))
            })?;

        self.db.assign(vm, addr).await?;
        tracing::info!(%vm, %addr, "assigned endpoint address");
        Ok(addr)
    }

    /// Start an instance for `vm`, assigning it an address if needed.
    pub async fn start_vm(&mut self, vm: VmId) -> Result<()> {
        if let Some(instance) = self.instances.get(&vm) {
            if instance.state() == InstanceState::Listening {
                return Err(Error::InvalidArgument("instance already running"));
            }
        }

        let addr = self.assign_address(&vm).await?;
        let spec = InstanceSpec {
            vm: vm.clone(),
            addr,
            port: self.config.port,
            strict_sequence: self.config.strict_sequence,
        };
        let mut instance =
            VirtualBmcInstance::new(spec, self.hypervisor.clone(), self.addresses.clone());
        instance.start().await?;
        self.instances.insert(vm, instance);
        Ok(())
    }

    /// Start one instance per VM. Stops on the first failure, leaving
    /// already-started instances running.
    pub async fn start_all(&mut self, vms: &[VmId]) -> Result<()> {
        for vm in vms {
            self.start_vm(vm.clone()).await?;
        }
        tracing::info!(count = vms.len(), "fleet started");
        Ok(())
    }

    /// Stop a single VM's instance and release its persisted assignment.
    pub async fn stop_vm(&mut self, vm: &VmId) -> Result<()> {
        let Some(mut instance) = self.instances.remove(vm) else {
            return Ok(());
        };
        instance.stop().await?;
        self.db.remove(vm).await?;
        Ok(())
    }

    /// Stop every running instance. Failures are logged and do not keep the
    /// remaining instances from stopping; assignments are kept for reuse on
    /// the next start.
    pub async fn stop_all(&mut self) {
        for (vm, mut instance) in self.instances.drain() {
            if let Err(err) = instance.stop().await {
                tracing::warn!(%vm, error = %err, "failed to stop instance");
            }
        }
        tracing::info!("fleet stopped");
    }

    /// Drop persisted assignments for VMs no longer managed.
    pub async fn prune(&self, live: &[VmId]) -> Result<()> {
        let released = self.db.retain(live).await?;
        for addr in released {
            if let Err(err) = self.addresses.remove(addr).await {
                tracing::warn!(%addr, error = %err, "failed to release pruned address");
            }
        }
        Ok(())
    }

    /// Bound address of a running instance, for diagnostics and tests.
    pub fn instance_addr(&self, vm: &VmId) -> Option<std::net::SocketAddr> {
        self.instances.get(vm).and_then(|i| i.local_addr())
    }

    /// Number of running instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether no instances are running.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
