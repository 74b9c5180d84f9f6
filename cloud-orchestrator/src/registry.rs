//! Vhosts and forwarded ports recorded on instances.
//!
//! Both live in the instance metadata. Port and vhost uniqueness is checked
//! against a scan of every instance while the allocation lock is held.

use cloud_core::{CloudError, Result};
use cloud_ports::{PortClaim, PortForwardMap};
use cloud_provider::{Instance, VhostOptions};
use tracing::info;

use crate::domain::is_valid_hostname;
use crate::lifecycle::InstanceManager;

fn normalize_vhost(vhost: &str) -> String {
    vhost.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Port claims of every instance in a scan.
pub fn port_claims<'a, I>(instances: I) -> Vec<PortClaim>
where
    I: IntoIterator<Item = &'a Instance>,
{
    instances
        .into_iter()
        .flat_map(|instance| {
            let address = instance.primary_address();
            instance
                .metadata
                .network
                .ports
                .iter()
                .map(move |(external, internal)| PortClaim {
                    fqdn: instance.fqdn.clone(),
                    address,
                    external: *external,
                    internal: *internal,
                })
        })
        .collect()
}

impl InstanceManager {
    /// Cluster-wide `external -> instance port` map.
    pub async fn port_forward_map(&self) -> Result<PortForwardMap> {
        let instances = self.scan_instances(true).await?;
        Ok(PortForwardMap::build(
            &self.port_range,
            port_claims(instances.values()),
        ))
    }

    pub async fn random_available_port(&self) -> Result<u16> {
        self.port_forward_map()
            .await?
            .random_available(&self.port_range)
    }

    /// Forward `external` to `internal` on the instance.
    pub async fn add_port(&self, instance: &mut Instance, external: u16, internal: u16) -> Result<()> {
        if !self.port_range.contains(external) {
            return Err(CloudError::Unavailable(format!(
                "external port {external} is outside the forward range {}",
                self.port_range
            )));
        }
        if internal == 0 {
            return Err(CloudError::Unavailable("internal port 0 is not valid".to_string()));
        }

        let mut updated = instance.clone();
        let what = format!("add port {external} to {}", instance.fqdn);
        let updated = self
            .lock
            .with_lock(&what, move || async move {
                if let Some(holder) = self.port_forward_map().await?.get(external) {
                    return Err(CloudError::Unavailable(format!(
                        "external port {external} is already forwarded to {}",
                        holder.fqdn
                    )));
                }
                updated.metadata.network.ports.insert(external, internal);
                self.write_metadata(&mut updated).await?;
                Ok(updated)
            })
            .await?;

        *instance = updated;
        info!(fqdn = %instance.fqdn, external, internal, "port forward added");
        Ok(())
    }

    /// Drop a forwarded port. Removing a port the instance does not hold is a no-op.
    pub async fn remove_port(&self, instance: &mut Instance, external: u16) -> Result<()> {
        if instance.metadata.network.ports.remove(&external).is_none() {
            return Ok(());
        }
        self.write_metadata(instance).await?;
        info!(fqdn = %instance.fqdn, external, "port forward removed");
        Ok(())
    }

    /// Route `vhost` to the instance. Ownership of the domain is not checked
    /// here; it surfaces as remarks when the instance is read.
    pub async fn add_vhost(
        &self,
        instance: &mut Instance,
        vhost: &str,
        options: VhostOptions,
    ) -> Result<()> {
        let vhost = normalize_vhost(vhost);
        if !is_valid_hostname(&vhost) {
            return Err(CloudError::Unavailable(format!("invalid vhost `{vhost}`")));
        }

        let mut updated = instance.clone();
        let what = format!("add vhost {vhost} to {}", instance.fqdn);
        let updated = self
            .lock
            .with_lock(&what, move || async move {
                for other in self.scan_instances(true).await?.values() {
                    if other.fqdn == updated.fqdn
                        || !other.metadata.network.vhosts.contains_key(&vhost)
                    {
                        continue;
                    }
                    let held = self
                        .validator
                        .validate(other.owner(), &other.fqdn, &vhost)
                        .await;
                    if held.valid {
                        return Err(CloudError::AlreadyExists(format!(
                            "vhost {vhost} is already in use by {}",
                            other.fqdn
                        )));
                    }
                }
                updated.metadata.network.vhosts.insert(vhost, options);
                self.write_metadata(&mut updated).await?;
                Ok(updated)
            })
            .await?;

        *instance = updated;
        info!(fqdn = %instance.fqdn, "vhost added");
        Ok(())
    }

    pub async fn remove_vhost(&self, instance: &mut Instance, vhost: &str) -> Result<()> {
        let vhost = normalize_vhost(vhost);
        if instance.metadata.network.vhosts.remove(&vhost).is_none() {
            return Err(CloudError::NotFound(format!(
                "vhost {vhost} is not routed to {}",
                instance.fqdn
            )));
        }
        self.write_metadata(instance).await?;
        info!(fqdn = %instance.fqdn, vhost = %vhost, "vhost removed");
        Ok(())
    }
}
