use async_trait::async_trait;
use cloud_core::{shell_quote, CloudError, Result};
use cloud_provider::{params, ConfigString, Instance};
use tracing::{debug, instrument};

use super::{enable_spoof_filter, KindContext, KindDriver, RootFiles, StartMode};
use crate::render::{AUTHORIZED_KEYS_PATH, BANNER_PATH, SSHD_CONFIG_PATH};

/// Containers get their network through the hypervisor config and are
/// reached with `pct` on their node.
pub struct ContainerDriver {
    ctx: KindContext,
}

impl ContainerDriver {
    pub fn new(ctx: KindContext) -> Self {
        Self { ctx }
    }

    fn net0(&self, instance: &Instance) -> Result<String> {
        let nic = &instance.metadata.network.nic_allocation;
        let address = nic.addresses.first().ok_or_else(|| {
            CloudError::Unavailable(format!("{} has no allocated address", instance.fqdn))
        })?;

        let mut net0 = ConfigString::new()
            .with("name", "eth0")
            .with("bridge", &self.ctx.config.network.bridge)
            .with("hwaddr", &nic.macaddress)
            .with("ip", address)
            .with("gw", nic.gateway4)
            .with("mtu", 1500)
            .with("rate", "12.5");
        if let Some(tag) = nic.vlan {
            net0 = net0.with("tag", tag);
        }
        Ok(net0.to_string())
    }

    async fn pct(&self, instance: &Instance, step: &str, command: String) -> Result<()> {
        self.ctx
            .shell
            .exec(&instance.node, &command)
            .await?
            .check(step)?;
        Ok(())
    }

    async fn pct_push(
        &self,
        instance: &Instance,
        path: &str,
        perms: &str,
        contents: &str,
    ) -> Result<()> {
        let command = format!(
            "pct push {} /dev/stdin {} --perms {} --user 0 --group 0",
            instance.id,
            shell_quote(path),
            perms
        );
        self.ctx
            .shell
            .exec_with_stdin(&instance.node, &command, contents.as_bytes().to_vec())
            .await?
            .check(&format!("writing {path}"))?;
        Ok(())
    }
}

#[async_trait]
impl KindDriver for ContainerDriver {
    #[instrument(skip_all, fields(fqdn = %instance.fqdn))]
    async fn prepare_start(&self, instance: &Instance, _mode: StartMode) -> Result<()> {
        let guest = instance.guest_ref();
        let nameservers = self
            .ctx
            .config
            .network
            .nameservers
            .iter()
            .map(|ns| ns.to_string())
            .collect::<Vec<_>>()
            .join(" ");

        let mut update = params([("net0", self.net0(instance)?)]);
        if !nameservers.is_empty() {
            update.insert("nameserver".to_string(), nameservers);
        }
        self.ctx.hypervisor.update_guest_config(&guest, &update).await?;
        enable_spoof_filter(self.ctx.hypervisor.as_ref(), &guest).await?;
        debug!("container network applied");
        Ok(())
    }

    #[instrument(skip_all, fields(fqdn = %instance.fqdn))]
    async fn install_root_user(&self, instance: &Instance, files: &RootFiles) -> Result<()> {
        let id = instance.id;
        let entry = format!("root:{}", files.password_hash);

        self.pct(
            instance,
            "setting root password",
            format!("echo {} | pct exec {id} -- chpasswd -e", shell_quote(&entry)),
        )
        .await?;
        self.pct(
            instance,
            "creating /root/.ssh",
            format!("pct exec {id} -- mkdir -p /root/.ssh"),
        )
        .await?;
        self.pct_push(instance, AUTHORIZED_KEYS_PATH, "0600", &files.authorized_keys)
            .await?;
        self.pct_push(instance, BANNER_PATH, "0644", &files.banner).await?;
        self.pct_push(instance, SSHD_CONFIG_PATH, "0644", &files.sshd_config)
            .await?;
        self.pct(
            instance,
            "restarting sshd",
            format!("pct exec {id} -- service ssh restart"),
        )
        .await
    }

    async fn cleanup(&self, _instance: &Instance) -> Result<()> {
        Ok(())
    }
}
