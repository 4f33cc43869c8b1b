use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default IPMI-over-LAN UDP port.
pub const DEFAULT_PORT: u16 = 623;

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Inclusive IPv4 address range to draw BMC endpoint addresses from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    /// First address of the range.
    pub start: Ipv4Addr,
    /// Last address of the range (inclusive).
    pub end: Ipv4Addr,
}

impl IpRange {
    /// Number of addresses covered by the range.
    pub fn len(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }

    /// Whether the range is empty (never true for a validated config).
    pub fn is_empty(&self) -> bool {
        u32::from(self.end) < u32::from(self.start)
    }

    /// Whether `addr` falls within the range.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let n = u32::from(addr);
        n >= u32::from(self.start) && n <= u32::from(self.end)
    }

    /// Iterate the addresses of the range in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.start)..=u32::from(self.end)).map(Ipv4Addr::from)
    }
}

/// Layer-3 parameters shared by every managed endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Subnet mask, e.g. 255.255.255.0.
    pub netmask: Ipv4Addr,
    /// Default gateway for the managed subnet.
    pub gateway: Ipv4Addr,
}

impl NetworkConfig {
    /// Prefix length derived from the netmask.
    pub fn prefix_len(&self) -> u8 {
        u32::from(self.netmask).count_ones() as u8
    }
}

/// Service configuration, loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Address range BMC endpoints are drawn from.
    pub ip_range: IpRange,
    /// Network interface that carries the endpoint addresses.
    pub nic: String,
    /// Subnet parameters for the endpoint addresses.
    pub network: NetworkConfig,
    /// UDP port every instance listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Reject session sequence numbers at or below the last accepted one.
    #[serde(default)]
    pub strict_sequence: bool,
    /// Log level filter, e.g. "info" or "vbmc=debug".
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Config {
    /// Load and validate configuration from a JSON file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            Error::configuration(format!("cannot read {}: {err}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|err| {
            Error::configuration(format!("invalid JSON in {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.nic.trim().is_empty() {
            return Err(Error::configuration("nic must not be empty"));
        }
        if self.ip_range.is_empty() {
            return Err(Error::configuration(format!(
                "ip_range end {} precedes start {}",
                self.ip_range.end, self.ip_range.start
            )));
        }
        if self.port == 0 {
            return Err(Error::configuration("port must not be zero"));
        }
        let mask = u32::from(self.network.netmask);
        // A valid mask is a run of ones followed by a run of zeros.
        if mask != 0 && (!mask).wrapping_add(1) & !mask != 0 {
            return Err(Error::configuration(format!(
                "netmask {} is not contiguous",
                self.network.netmask
            )));
        }
        let network = u32::from(self.ip_range.start) & mask;
        if u32::from(self.network.gateway) & mask != network {
            return Err(Error::configuration(format!(
                "gateway {} is outside the {}/{} subnet",
                self.network.gateway,
                Ipv4Addr::from(network),
                self.network.prefix_len()
            )));
        }
        if u32::from(self.ip_range.end) & mask != network {
            return Err(Error::configuration(
                "ip_range spans more than one subnet".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            ip_range: IpRange {
                start: Ipv4Addr::new(192, 168, 1, 10),
                end: Ipv4Addr::new(192, 168, 1, 20),
            },
            nic: "eth0".to_string(),
            network: NetworkConfig {
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: Ipv4Addr::new(192, 168, 1, 1),
            },
            port: DEFAULT_PORT,
            strict_sequence: false,
            log_level: None,
        }
    }

    #[test]
    fn valid_config_passes_validation() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn inverted_range_is_rejected() {
        let mut config = valid_config();
        config.ip_range.end = Ipv4Addr::new(192, 168, 1, 5);
        assert!(matches!(
            config.validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn non_contiguous_netmask_is_rejected() {
        let mut config = valid_config();
        config.network.netmask = Ipv4Addr::new(255, 0, 255, 0);
        assert!(matches!(
            config.validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn gateway_outside_subnet_is_rejected() {
        let mut config = valid_config();
        config.network.gateway = Ipv4Addr::new(10, 0, 0, 1);
        assert!(matches!(
            config.validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn defaults_apply_when_fields_are_omitted() {
        let raw = r#"{
            "ip_range": { "start": "192.168.1.10", "end": "192.168.1.20" },
            "nic": "eth0",
            "network": { "netmask": "255.255.255.0", "gateway": "192.168.1.1" }
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(!config.strict_sequence);
        assert!(config.log_level.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn range_helpers() {
        let range = IpRange {
            start: Ipv4Addr::new(192, 168, 1, 10),
            end: Ipv4Addr::new(192, 168, 1, 12),
        };
        assert_eq!(range.len(), 3);
        assert!(range.contains(Ipv4Addr::new(192, 168, 1, 11)));
        assert!(!range.contains(Ipv4Addr::new(192, 168, 1, 13)));
        let addrs: Vec<_> = range.iter().collect();
        assert_eq!(
            addrs,
            vec![
                Ipv4Addr::new(192, 168, 1, 10),
                Ipv4Addr::new(192, 168, 1, 11),
                Ipv4Addr::new(192, 168, 1, 12),
            ]
        );
    }

    #[tokio::test]
    async fn load_reads_and_validates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let raw = serde_json::to_string(&valid_config()).unwrap();
        tokio::fs::write(&path, raw).await.unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config, valid_config());
    }

    #[tokio::test]
    async fn load_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        assert!(matches!(
            Config::load(&path).await,
            Err(Error::Configuration(_))
        ));
    }
}
