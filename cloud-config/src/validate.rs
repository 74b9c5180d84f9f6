use anyhow::{bail, Context, Result};
use url::Url;

use crate::config::CloudConfig;

impl CloudConfig {
    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.validate_hypervisor()?;
        self.validate_network()?;
        self.validate_requests()?;
        Ok(())
    }

    fn validate_hypervisor(&self) -> Result<()> {
        Url::parse(&self.hypervisor.api_url)
            .with_context(|| format!("Invalid hypervisor.api_url `{}`", self.hypervisor.api_url))?;
        Ok(())
    }

    fn validate_network(&self) -> Result<()> {
        let network = &self.network;
        let subnet = network.subnet()?;

        if network.base_fqdn.trim().is_empty() {
            bail!("network.base_fqdn must not be empty");
        }

        if let Some(gateway) = network.gateway {
            if !subnet.contains(gateway) {
                bail!("Gateway {} is outside subnet {}", gateway, subnet);
            }
        }

        if let Some(range) = &network.range {
            if !subnet.contains(range.start) || !subnet.contains(range.end) {
                bail!(
                    "Allocation range {}-{} is outside subnet {}",
                    range.start,
                    range.end,
                    subnet
                );
            }
            if u32::from(range.start) > u32::from(range.end) {
                bail!(
                    "Allocation range start {} is after end {}",
                    range.start,
                    range.end
                );
            }
        }

        network.port_range()?;
        Ok(())
    }

    fn validate_requests(&self) -> Result<()> {
        if self.requests.signing_secret.trim().is_empty() {
            bail!("requests.signing_secret must be set");
        }
        if self.requests.token_ttl_secs == 0 {
            bail!("requests.token_ttl_secs must be greater than zero");
        }
        Ok(())
    }
}
