//! Domain records shared by the hypervisor layer and the orchestrator.

use chrono::{Duration, NaiveDate};
use cloud_core::{CloudError, Ipv4Interface};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::hypervisor::GuestRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    Container,
    Vps,
}

impl InstanceKind {
    pub const ALL: [InstanceKind; 2] = [InstanceKind::Container, InstanceKind::Vps];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::Container => "container",
            InstanceKind::Vps => "vps",
        }
    }

    /// Path segment of the hypervisor API for this kind.
    pub fn api_segment(&self) -> &'static str {
        match self {
            InstanceKind::Container => "lxc",
            InstanceKind::Vps => "qemu",
        }
    }

    pub fn from_api_segment(segment: &str) -> Option<Self> {
        match segment {
            "lxc" => Some(InstanceKind::Container),
            "qemu" => Some(InstanceKind::Vps),
            _ => None,
        }
    }

    /// Config key holding the guest's name.
    pub fn name_key(&self) -> &'static str {
        match self {
            InstanceKind::Container => "hostname",
            InstanceKind::Vps => "name",
        }
    }

    /// Config key of the primary disk.
    pub fn root_disk_key(&self) -> &'static str {
        match self {
            InstanceKind::Container => "rootfs",
            InstanceKind::Vps => "virtio0",
        }
    }

    /// Disk format a template of this kind must ship.
    pub fn required_disk_format(&self) -> DiskFormat {
        match self {
            InstanceKind::Container => DiskFormat::TarGz,
            InstanceKind::Vps => DiskFormat::Qcow2,
        }
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceKind {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "container" | "lxc" => Ok(InstanceKind::Container),
            "vps" | "vm" => Ok(InstanceKind::Vps),
            other => Err(CloudError::NotFound(format!("unknown instance kind `{other}`"))),
        }
    }
}

/// Resources of an instance or template. Memory and swap in MB, disk in GB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Specs {
    pub cores: u32,
    pub memory: u64,
    pub disk_space: u64,
    #[serde(default)]
    pub swap: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Running,
    Stopped,
    #[serde(rename = "n/a")]
    Unknown,
}

impl Status {
    pub fn from_api(status: &str) -> Self {
        match status {
            "running" => Status::Running,
            "stopped" => Status::Stopped,
            _ => Status::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskFormat {
    #[serde(rename = "qcow2")]
    Qcow2,
    #[serde(rename = "tar.gz")]
    TarGz,
}

impl DiskFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::TarGz => "tar.gz",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tos {
    #[serde(default)]
    pub suspended: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Activity tracking and the notification counters kept alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inactivity {
    pub marked_active_at: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emailed_shutdown_warning_at: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emailed_shutdown_at: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emailed_deletion_warning_at: Option<NaiveDate>,
    #[serde(default)]
    pub shutdown_warning_email_count: u32,
    #[serde(default)]
    pub shutdown_email_count: u32,
    #[serde(default)]
    pub deletion_warning_email_count: u32,
}

impl Inactivity {
    pub fn fresh(today: NaiveDate) -> Self {
        Self {
            marked_active_at: today,
            emailed_shutdown_warning_at: None,
            emailed_shutdown_at: None,
            emailed_deletion_warning_at: None,
            shutdown_warning_email_count: 0,
            shutdown_email_count: 0,
            deletion_warning_email_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootUser {
    pub password_hash: String,
    pub ssh_public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicAllocation {
    #[serde(default)]
    pub addresses: Vec<Ipv4Interface>,
    pub gateway4: Ipv4Addr,
    pub macaddress: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VhostOptions {
    #[serde(default = "default_vhost_port")]
    pub port: u16,
    #[serde(default)]
    pub https: bool,
}

fn default_vhost_port() -> u16 {
    80
}

impl Default for VhostOptions {
    fn default() -> Self {
        Self {
            port: default_vhost_port(),
            https: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    #[serde(default)]
    pub vhosts: BTreeMap<String, VhostOptions>,
    /// external port -> internal port
    #[serde(default)]
    pub ports: BTreeMap<u16, u16>,
    pub nic_allocation: NicAllocation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDetail {
    pub template_id: String,
    #[serde(default)]
    pub reason: String,
}

/// The persisted record of an instance, stored in the guest's description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub groups: BTreeSet<String>,
    pub owner: String,
    #[serde(default)]
    pub tos: Tos,
    pub inactivity: Inactivity,
    pub network: Network,
    pub root_user: RootUser,
    pub request_detail: RequestDetail,
    #[serde(default)]
    pub permanent: bool,
    /// Bumped on every write; a write against a stale revision is refused.
    #[serde(default)]
    pub revision: u64,
}

impl Metadata {
    /// ToS suspension wins over everything, then the permanent flag, then the
    /// inactivity window.
    pub fn is_active(&self, today: NaiveDate, shutdown_days: u32) -> bool {
        if self.tos.suspended {
            return false;
        }
        if self.permanent {
            return true;
        }
        (today - self.inactivity.marked_active_at).num_days() <= i64::from(shutdown_days)
    }

    pub fn primary_address(&self) -> Option<Ipv4Addr> {
        self.network
            .nic_allocation
            .addresses
            .first()
            .map(|iface| iface.ip())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub kind: InstanceKind,
    pub node: String,
    pub id: u32,
    pub fqdn: String,
    pub hostname: String,
    pub specs: Specs,
    pub status: Status,
    pub active: bool,
    pub metadata: Metadata,
    pub remarks: Vec<String>,
    pub inactivity_shutdown_date: NaiveDate,
    pub inactivity_deletion_date: NaiveDate,
    /// Runtime memory use in bytes.
    pub mem: u64,
    pub disk: u64,
    pub uptime: u64,
}

impl Instance {
    pub fn guest_ref(&self) -> GuestRef {
        GuestRef::new(self.kind, &self.node, self.id)
    }

    pub fn primary_address(&self) -> Option<Ipv4Addr> {
        self.metadata.primary_address()
    }

    pub fn owner(&self) -> &str {
        &self.metadata.owner
    }
}

/// Derived inactivity dates for a record marked active on `marked_active_at`.
pub fn inactivity_dates(
    marked_active_at: NaiveDate,
    shutdown_days: u32,
    deletion_days: u32,
) -> (NaiveDate, NaiveDate) {
    (
        marked_active_at + Duration::days(i64::from(shutdown_days)),
        marked_active_at + Duration::days(i64::from(deletion_days)),
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMetadata {
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub logo_url: String,
    pub disk_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_fallback_url: Option<String>,
    pub disk_sha256sum: String,
    pub disk_format: DiskFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Template {
    pub kind: InstanceKind,
    pub node: String,
    pub id: u32,
    pub fqdn: String,
    /// Short name the template is requested by.
    pub template_id: String,
    pub specs: Specs,
    pub metadata: TemplateMetadata,
}

impl Template {
    pub fn guest_ref(&self) -> GuestRef {
        GuestRef::new(self.kind, &self.node, self.id)
    }
}
