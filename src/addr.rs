use std::net::Ipv4Addr;
use std::process::Output;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Management of host IP addresses backing BMC endpoints.
///
/// Implementations must be idempotent: adding an address that is already
/// present and removing one that is already absent both succeed.
#[async_trait]
pub trait AddressManager: Send + Sync {
    /// Whether `addr` is currently assigned to the interface.
    async fn is_present(&self, addr: Ipv4Addr) -> Result<bool>;

    /// Assign `addr` to the interface. No-op when already present.
    async fn add(&self, addr: Ipv4Addr) -> Result<()>;

    /// Remove `addr` from the interface. No-op when already absent.
    async fn remove(&self, addr: Ipv4Addr) -> Result<()>;
}

/// Address manager shelling out to the `ip` utility.
pub struct IpCommand {
    nic: String,
    prefix_len: u8,
}

impl IpCommand {
    /// Manage addresses on network interface `nic` with the given prefix
    /// length (e.g. 24 for a /24 netmask).
    pub fn new(nic: impl Into<String>, prefix_len: u8) -> Self {
        Self {
            nic: nic.into(),
            prefix_len,
        }
    }

    fn cidr(&self, addr: Ipv4Addr) -> String {
        format!("{addr}/{}", self.prefix_len)
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        tracing::debug!(nic = %self.nic, ?args, "running ip command");
        let output = tokio::process::Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|err| {
                Error::AddressManagement(format!("failed to spawn ip {}: {err}", args.join(" ")))
            })?;
        Ok(output)
    }
}

#[async_trait]
impl AddressManager for IpCommand {
    async fn is_present(&self, addr: Ipv4Addr) -> Result<bool> {
        let output = self
            .run(&["addr", "show", "dev", &self.nic, "to", &addr.to_string()])
            .await?;
        if !output.status.success() {
            return Err(Error::AddressManagement(format!(
                "ip addr show failed for {}: {}",
                self.nic,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        // `ip addr show to <addr>` prints nothing when the address is absent.
        Ok(!output.stdout.is_empty())
    }

    async fn add(&self, addr: Ipv4Addr) -> Result<()> {
        if self.is_present(addr).await? {
            tracing::debug!(%addr, nic = %self.nic, "address already present");
            return Ok(());
        }
        let cidr = self.cidr(addr);
        let output = self.run(&["addr", "add", &cidr, "dev", &self.nic]).await?;
        if !output.status.success() {
            return Err(Error::AddressManagement(format!(
                "ip addr add {cidr} dev {} failed: {}",
                self.nic,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tracing::info!(%addr, nic = %self.nic, "assigned address");
        Ok(())
    }

    async fn remove(&self, addr: Ipv4Addr) -> Result<()> {
        if !self.is_present(addr).await? {
            tracing::debug!(%addr, nic = %self.nic, "address already absent");
            return Ok(());
        }
        let cidr = self.cidr(addr);
        let output = self.run(&["addr", "del", &cidr, "dev", &self.nic]).await?;
        if !output.status.success() {
            return Err(Error::AddressManagement(format!(
                "ip addr del {cidr} dev {} failed: {}",
                self.nic,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        tracing::info!(%addr, nic = %self.nic, "released address");
        Ok(())
    }
}

/// Address manager that assumes every address is already present.
///
/// Suitable for loopback deployments and tests, where sockets bind without
/// touching interface configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAddressManager;

#[async_trait]
impl AddressManager for NoopAddressManager {
    async fn is_present(&self, _addr: Ipv4Addr) -> Result<bool> {
        Ok(true)
    }

    async fn add(&self, _addr: Ipv4Addr) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _addr: Ipv4Addr) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_formats_prefix_length() {
        let mgr = IpCommand::new("eth0", 24);
        assert_eq!(mgr.cidr(Ipv4Addr::new(192, 168, 1, 20)), "192.168.1.20/24");
    }

    #[tokio::test]
    async fn noop_manager_reports_present() {
        let mgr = NoopAddressManager;
        assert!(mgr.is_present(Ipv4Addr::LOCALHOST).await.unwrap());
        mgr.add(Ipv4Addr::LOCALHOST).await.unwrap();
        mgr.remove(Ipv4Addr::LOCALHOST).await.unwrap();
    }
}
