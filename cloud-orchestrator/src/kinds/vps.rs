use async_trait::async_trait;
use cloud_core::{poll_until, shell_quote, CloudError, Result};
use cloud_provider::{params, ConfigString, Instance};
use tracing::{debug, info, instrument};

use super::{enable_spoof_filter, KindContext, KindDriver, RootFiles, StartMode};
use crate::render::{
    latin1_only, render_network_config, render_userdata, AUTHORIZED_KEYS_PATH, BANNER_PATH,
    SSHD_CONFIG_PATH,
};

const SNIPPET_SUFFIXES: [&str; 3] = ["userdata.yml", "networkconfig.yml", "metadata.yml"];

/// VMs are provisioned by cloud-init from snippet files and reached through
/// the guest agent afterwards.
pub struct VpsDriver {
    ctx: KindContext,
}

impl VpsDriver {
    pub fn new(ctx: KindContext) -> Self {
        Self { ctx }
    }

    async fn snippets_dir(&self) -> Result<String> {
        let storage = self
            .ctx
            .hypervisor
            .storage_path(&self.ctx.config.hypervisor.snippet_storage)
            .await?;
        Ok(format!("{}/snippets", storage.trim_end_matches('/')))
    }

    async fn remove_snippets(&self, instance: &Instance, dir: &str) -> Result<()> {
        let files = SNIPPET_SUFFIXES
            .iter()
            .map(|suffix| shell_quote(&format!("{dir}/{}.{suffix}", instance.fqdn)))
            .collect::<Vec<_>>()
            .join(" ");
        self.ctx
            .shell
            .exec(&instance.node, &format!("rm -f {files}"))
            .await?
            .check("removing cloud-init snippets")?;
        Ok(())
    }

    fn net0(&self, instance: &Instance) -> String {
        let nic = &instance.metadata.network.nic_allocation;
        let mut net0 = ConfigString::new()
            .with("virtio", &nic.macaddress)
            .with("bridge", &self.ctx.config.network.bridge)
            .with("rate", "12.5");
        if let Some(tag) = nic.vlan {
            net0 = net0.with("tag", tag);
        }
        net0.to_string()
    }

    /// Recreate `ipfilter-net<i>` for every address so the guest may only
    /// send from its own IPs.
    async fn reset_ip_filters(&self, instance: &Instance) -> Result<()> {
        let hypervisor = self.ctx.hypervisor.as_ref();
        let guest = instance.guest_ref();

        for (i, address) in instance.metadata.network.nic_allocation.addresses.iter().enumerate() {
            let name = format!("ipfilter-net{i}");
            match hypervisor.ipset_entries(&guest, &name).await {
                Ok(entries) => {
                    for cidr in entries {
                        hypervisor.delete_ipset_entry(&guest, &name, &cidr).await?;
                    }
                    hypervisor.delete_ipset(&guest, &name).await?;
                }
                Err(e) => info!(ipset = %name, error = %e, "ipset not present, creating it"),
            }
            hypervisor.create_ipset(&guest, &name).await?;
            hypervisor
                .add_ipset_entry(&guest, &name, &address.ip().to_string())
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl KindDriver for VpsDriver {
    #[instrument(skip_all, fields(fqdn = %instance.fqdn, ?mode))]
    async fn prepare_start(&self, instance: &Instance, mode: StartMode) -> Result<()> {
        let hypervisor = self.ctx.hypervisor.as_ref();
        let config = &self.ctx.config;
        let guest = instance.guest_ref();
        let fqdn = &instance.fqdn;

        let dir = self.snippets_dir().await?;
        self.remove_snippets(instance, &dir).await?;

        // detach the previous cloud-init drive so it is regenerated
        hypervisor
            .update_guest_config(
                &guest,
                &params([
                    ("ide2", "none,media=cdrom".to_string()),
                    ("cicustom", String::new()),
                ]),
            )
            .await?;

        let userdata = render_userdata(fqdn, mode == StartMode::ClearCloudInit)?;
        let network = render_network_config(
            &instance.metadata.network.nic_allocation,
            &config.network.nameservers,
        )?;
        let shell = self.ctx.shell.as_ref();
        shell
            .push_file(&instance.node, &format!("{dir}/{fqdn}.userdata.yml"), userdata.as_bytes())
            .await?;
        shell
            .push_file(&instance.node, &format!("{dir}/{fqdn}.networkconfig.yml"), network.as_bytes())
            .await?;
        shell
            .push_file(&instance.node, &format!("{dir}/{fqdn}.metadata.yml"), b"")
            .await?;

        let snippets = &config.hypervisor.snippet_storage;
        let cicustom = ConfigString::new()
            .with("user", format!("{snippets}:snippets/{fqdn}.userdata.yml"))
            .with("network", format!("{snippets}:snippets/{fqdn}.networkconfig.yml"))
            .with("meta", format!("{snippets}:snippets/{fqdn}.metadata.yml"));
        hypervisor
            .update_guest_config(
                &guest,
                &params([
                    ("cicustom", cicustom.to_string()),
                    (
                        "ide2",
                        format!("{}:cloudinit,format=qcow2", config.hypervisor.instance_storage),
                    ),
                ]),
            )
            .await?;

        hypervisor
            .update_guest_config(&guest, &params([("net0", self.net0(instance))]))
            .await?;
        enable_spoof_filter(hypervisor, &guest).await?;
        self.reset_ip_filters(instance).await?;
        debug!("cloud-init drive attached");
        Ok(())
    }

    #[instrument(skip_all, fields(fqdn = %instance.fqdn))]
    async fn install_root_user(&self, instance: &Instance, files: &RootFiles) -> Result<()> {
        let hypervisor = self.ctx.hypervisor.as_ref();
        let guest = instance.guest_ref();

        poll_until(
            self.ctx.config.timeouts.agent_policy(),
            &format!("guest agent of {}", instance.fqdn),
            || {
                let guest = guest.clone();
                async move { Ok(hypervisor.agent_ping(&guest).await.is_ok()) }
            },
        )
        .await?;

        let steps = async {
            hypervisor.agent_exec(&guest, &["passwd", "-u", "root"]).await?;
            hypervisor
                .agent_set_password(&guest, "root", &files.password_hash)
                .await?;
            hypervisor
                .agent_exec(&guest, &["mkdir", "-p", "/root/.ssh"])
                .await?;
            hypervisor
                .agent_file_write(&guest, AUTHORIZED_KEYS_PATH, &files.authorized_keys)
                .await?;
            hypervisor
                .agent_file_write(&guest, SSHD_CONFIG_PATH, &files.sshd_config)
                .await?;
            hypervisor
                .agent_file_write(&guest, BANNER_PATH, &latin1_only(&files.banner))
                .await?;
            hypervisor
                .agent_exec(&guest, &["service", "ssh", "restart"])
                .await
        };
        steps
            .await
            .map_err(|e: CloudError| e.into_failed(&format!("resetting root user of {}", instance.fqdn)))
    }

    async fn cleanup(&self, instance: &Instance) -> Result<()> {
        let dir = self.snippets_dir().await?;
        self.remove_snippets(instance, &dir).await
    }
}
