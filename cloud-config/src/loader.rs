use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use cloud_core::{Ipv4Subnet, PollPolicy};
use cloud_ports::PortRange;
use tracing::debug;

use crate::config::{CloudConfig, NetworkConfig, TimeoutConfig};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "CLOUD_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cloud-orchestrator/config.yaml";

impl CloudConfig {
    /// Load and validate the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading config from: {}", path.display());
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        Self::from_yaml_str(&contents)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: CloudConfig =
            serde_yaml_ng::from_str(contents).context("Failed to parse configuration YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `$CLOUD_CONFIG`, falling back to the system-wide path.
    pub fn load_from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load(&path)
    }

    pub fn container_base_fqdn(&self) -> String {
        format!("container.{}", self.network.base_fqdn)
    }

    pub fn vps_base_fqdn(&self) -> String {
        format!("vps.{}", self.network.base_fqdn)
    }
}

impl NetworkConfig {
    pub fn subnet(&self) -> Result<Ipv4Subnet> {
        self.subnet
            .parse()
            .with_context(|| format!("Invalid network.subnet `{}`", self.subnet))
    }

    /// Configured gateway, or the first host address of the subnet.
    pub fn gateway(&self) -> Result<std::net::Ipv4Addr> {
        if let Some(gateway) = self.gateway {
            return Ok(gateway);
        }
        self.subnet()?
            .first_host()
            .context("Subnet has no host addresses for a gateway")
    }

    pub fn port_range(&self) -> Result<PortRange> {
        PortRange::parse(&self.port_forward.range).context("Invalid network.port_forward.range")
    }
}

impl TimeoutConfig {
    fn policy(&self, secs: u64) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(secs),
            Duration::from_millis(self.poll_interval_ms.max(1)),
        )
    }

    pub fn lock_policy(&self) -> PollPolicy {
        self.policy(self.lock_secs)
    }

    pub fn create_policy(&self) -> PollPolicy {
        self.policy(self.create_secs)
    }

    pub fn migrate_policy(&self) -> PollPolicy {
        self.policy(self.migrate_secs)
    }

    pub fn agent_policy(&self) -> PollPolicy {
        self.policy(self.agent_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_defaults_to_first_host() {
        let network = NetworkConfig {
            subnet: "10.50.0.0/24".to_string(),
            gateway: None,
            ..NetworkConfig::default()
        };
        assert_eq!(
            network.gateway().unwrap(),
            std::net::Ipv4Addr::new(10, 50, 0, 1)
        );
    }

    #[test]
    fn test_policies_use_configured_interval() {
        let timeouts = TimeoutConfig {
            poll_interval_ms: 250,
            ..TimeoutConfig::default()
        };
        let policy = timeouts.lock_policy();
        assert_eq!(policy.timeout, Duration::from_secs(25));
        assert_eq!(policy.interval, Duration::from_millis(250));
        assert_eq!(timeouts.create_policy().timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_kind_base_domains() {
        let mut config = CloudConfig::default();
        config.network.base_fqdn = "cloud.example.org".to_string();
        assert_eq!(config.container_base_fqdn(), "container.cloud.example.org");
        assert_eq!(config.vps_base_fqdn(), "vps.cloud.example.org");
    }
}
