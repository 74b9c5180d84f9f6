//! Service handles the orchestrator is built from.

use anyhow::Context;
use cloud_config::CloudConfig;
use cloud_core::{RemoteShell, SshJumpExecutor, SshTarget};
use cloud_provider::{HypervisorApi, ProxmoxClient};
use std::sync::Arc;
use tracing::info;

use crate::domain::{DnsResolver, HickoryResolver};

/// The external systems an [`InstanceManager`](crate::InstanceManager) talks to.
#[derive(Clone)]
pub struct Backends {
    pub hypervisor: Arc<dyn HypervisorApi>,
    pub shell: Arc<dyn RemoteShell>,
    pub resolver: Arc<dyn DnsResolver>,
}

impl Backends {
    /// Build the production backends from configuration.
    pub fn connect(config: &CloudConfig) -> anyhow::Result<Self> {
        let hv = &config.hypervisor;
        let hypervisor = ProxmoxClient::new(&hv.api_url, &hv.token_id, &hv.token_secret, hv.verify_tls)
            .map_err(anyhow::Error::new)
            .context("Failed to build the hypervisor client")?;

        let ssh = &config.ssh;
        let shell = SshJumpExecutor::new(SshTarget {
            jump_host: ssh.jump_host.clone(),
            jump_port: ssh.jump_port,
            jump_user: ssh.jump_user.clone(),
            node_port: ssh.node_port,
            node_user: ssh.node_user.clone(),
            identity_file: ssh.identity_file.clone(),
            node_domain: ssh.node_domain.clone(),
        });

        let resolver = HickoryResolver::from_system_conf()?;
        info!(api_url = %hv.api_url, jump_host = %ssh.jump_host, "backends ready");

        Ok(Self {
            hypervisor: Arc::new(hypervisor),
            shell: Arc::new(shell),
            resolver: Arc::new(resolver),
        })
    }
}
