//! The hypervisor control API as the orchestrator sees it.

use async_trait::async_trait;
use cloud_core::{CloudError, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::models::{InstanceKind, Status};

/// Address of one guest (container or VM) in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GuestRef {
    pub kind: InstanceKind,
    pub node: String,
    pub id: u32,
}

impl GuestRef {
    pub fn new(kind: InstanceKind, node: &str, id: u32) -> Self {
        Self {
            kind,
            node: node.to_string(),
            id,
        }
    }
}

impl fmt::Display for GuestRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node, self.kind.api_segment(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NodeStats {
    #[serde(rename = "node")]
    pub name: String,
    #[serde(default)]
    pub mem: u64,
    #[serde(default)]
    pub maxmem: u64,
    #[serde(default)]
    pub maxcpu: u32,
    #[serde(default)]
    pub status: Option<String>,
}

/// One entry of the cluster-wide guest listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestResource {
    pub kind: InstanceKind,
    pub node: String,
    pub id: u32,
    pub name: Option<String>,
    pub template: bool,
}

impl GuestResource {
    pub fn guest_ref(&self) -> GuestRef {
        GuestRef::new(self.kind, &self.node, self.id)
    }

    pub fn name_ends_with(&self, suffix: &str) -> bool {
        self.name.as_deref().is_some_and(|n| n.ends_with(suffix))
    }
}

/// A guest's configuration as returned by the API.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuestConfig(pub BTreeMap<String, Value>);

impl GuestConfig {
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn require_str(&self, key: &str) -> Result<String> {
        self.get_str(key)
            .ok_or_else(|| CloudError::Unavailable(format!("guest config has no `{key}`")))
    }

    pub fn require_u64(&self, key: &str) -> Result<u64> {
        self.get_u64(key)
            .ok_or_else(|| CloudError::Unavailable(format!("guest config has no numeric `{key}`")))
    }

    /// The hypervisor sets `lock` while a clone, migration or resize runs.
    pub fn is_locked(&self) -> bool {
        self.0.contains_key("lock")
    }

    pub fn is_template(&self) -> bool {
        self.get_u64("template") == Some(1)
    }

    pub fn description(&self) -> String {
        self.get_str("description").unwrap_or_default()
    }

    pub fn name(&self, kind: InstanceKind) -> Option<String> {
        self.get_str(kind.name_key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestStatus {
    pub status: Status,
    pub mem: u64,
    pub disk: u64,
    pub uptime: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    pub new_id: u32,
    pub name: String,
    pub description: String,
    pub storage: String,
    pub pool: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Start,
    Stop,
    Shutdown,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Shutdown => "shutdown",
        }
    }
}

/// Ordered `key -> value` parameters of a config or firewall update.
pub type Params = BTreeMap<String, String>;

pub fn params<const N: usize>(pairs: [(&str, String); N]) -> Params {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

#[async_trait]
pub trait HypervisorApi: Send + Sync {
    async fn nodes(&self) -> Result<Vec<NodeStats>>;

    /// Every container and VM in the cluster, templates included.
    async fn guests(&self) -> Result<Vec<GuestResource>>;

    /// Fails `NotFound` when the guest does not exist.
    async fn guest_config(&self, guest: &GuestRef) -> Result<GuestConfig>;

    /// Set config keys; an empty value deletes the key.
    async fn update_guest_config(&self, guest: &GuestRef, params: &Params) -> Result<()>;

    /// Full clone of a template on the template's own node.
    async fn clone_guest(&self, template: &GuestRef, request: &CloneRequest) -> Result<()>;

    async fn resize_disk(&self, guest: &GuestRef, disk: &str, size: &str) -> Result<()>;

    async fn migrate_guest(&self, guest: &GuestRef, target_node: &str) -> Result<()>;

    async fn guest_status(&self, guest: &GuestRef) -> Result<GuestStatus>;

    async fn power(&self, guest: &GuestRef, action: PowerAction) -> Result<()>;

    async fn set_firewall_options(&self, guest: &GuestRef, params: &Params) -> Result<()>;

    /// CIDRs in the named ipset; `NotFound` if the set does not exist.
    async fn ipset_entries(&self, guest: &GuestRef, name: &str) -> Result<Vec<String>>;

    async fn create_ipset(&self, guest: &GuestRef, name: &str) -> Result<()>;

    async fn add_ipset_entry(&self, guest: &GuestRef, name: &str, cidr: &str) -> Result<()>;

    async fn delete_ipset_entry(&self, guest: &GuestRef, name: &str, cidr: &str) -> Result<()>;

    async fn delete_ipset(&self, guest: &GuestRef, name: &str) -> Result<()>;

    /// Filesystem path backing a storage, on every node.
    async fn storage_path(&self, storage: &str) -> Result<String>;

    async fn delete_guest(&self, guest: &GuestRef) -> Result<()>;

    async fn agent_ping(&self, guest: &GuestRef) -> Result<()>;

    async fn agent_exec(&self, guest: &GuestRef, command: &[&str]) -> Result<()>;

    async fn agent_set_password(&self, guest: &GuestRef, username: &str, crypted: &str) -> Result<()>;

    async fn agent_file_write(&self, guest: &GuestRef, path: &str, content: &str) -> Result<()>;
}

pub(crate) fn require_agent(guest: &GuestRef) -> Result<()> {
    if guest.kind != InstanceKind::Vps {
        return Err(CloudError::Unavailable(format!(
            "guest agent is only available on vps instances, not {guest}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: Value) -> GuestConfig {
        GuestConfig(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn test_config_accessors() {
        let cfg = config(json!({
            "hostname": "web.alice.container.example.org",
            "cores": 2,
            "memory": "1024",
            "template": 1,
            "lock": "clone"
        }));
        assert_eq!(
            cfg.name(InstanceKind::Container).as_deref(),
            Some("web.alice.container.example.org")
        );
        assert_eq!(cfg.get_u64("cores"), Some(2));
        assert_eq!(cfg.get_u64("memory"), Some(1024));
        assert!(cfg.is_template());
        assert!(cfg.is_locked());
        assert_eq!(cfg.description(), "");
        assert!(cfg.require_u64("swap").is_err());
    }

    #[test]
    fn test_agent_requires_vps() {
        assert!(require_agent(&GuestRef::new(InstanceKind::Vps, "pve1", 100)).is_ok());
        assert!(require_agent(&GuestRef::new(InstanceKind::Container, "pve1", 100)).is_err());
    }
}
