//! Per kind behaviour of the lifecycle.
//!
//! Containers and VMs differ in how their network is applied, how root
//! credentials reach the guest and what is left behind on node storage. The
//! lifecycle manager picks a [`KindDriver`] once per call and never branches
//! on the kind itself.

mod container;
mod vps;

pub use container::ContainerDriver;
pub use vps::VpsDriver;

use async_trait::async_trait;
use cloud_config::CloudConfig;
use cloud_core::{RemoteShell, Result};
use cloud_provider::{params, GuestRef, HypervisorApi, Instance, RootUser};
use std::sync::Arc;

use crate::render;

/// How a start prepares the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartMode {
    #[default]
    Normal,
    /// VMs only: wipe cloud-init state and power off so the next boot
    /// provisions from scratch. Ignored for containers.
    ClearCloudInit,
}

/// Handles shared by the drivers.
#[derive(Clone)]
pub struct KindContext {
    pub hypervisor: Arc<dyn HypervisorApi>,
    pub shell: Arc<dyn RemoteShell>,
    pub config: Arc<CloudConfig>,
}

/// Files written into a guest when its root login is reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootFiles {
    pub password_hash: String,
    pub authorized_keys: String,
    pub sshd_config: String,
    pub banner: String,
}

impl RootFiles {
    pub fn render(instance: &Instance, root_user: &RootUser) -> Result<Self> {
        Ok(Self {
            password_hash: root_user.password_hash.clone(),
            authorized_keys: render::authorized_keys(&root_user.ssh_public_key),
            sshd_config: render::render_sshd_config()?,
            banner: render::render_banner(&instance.fqdn, instance.owner())?,
        })
    }
}

#[async_trait]
pub trait KindDriver: Send + Sync {
    /// Apply network, firewall and guest configuration ahead of a start.
    async fn prepare_start(&self, instance: &Instance, mode: StartMode) -> Result<()>;

    /// Install new root credentials in the running guest.
    async fn install_root_user(&self, instance: &Instance, files: &RootFiles) -> Result<()>;

    /// Remove node-side artifacts before the guest is deleted.
    async fn cleanup(&self, instance: &Instance) -> Result<()>;
}

/// MAC and IP anti-spoofing on the guest firewall.
pub(crate) async fn enable_spoof_filter(hypervisor: &dyn HypervisorApi, guest: &GuestRef) -> Result<()> {
    hypervisor
        .set_firewall_options(
            guest,
            &params([("macfilter", "1".to_string()), ("ipfilter", "1".to_string())]),
        )
        .await
}
