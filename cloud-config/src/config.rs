use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Root configuration document for the orchestrator and its API service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CloudConfig {
    pub hypervisor: HypervisorConfig,
    pub ssh: SshConfig,
    pub network: NetworkConfig,
    pub proxy: ProxyConfig,
    pub container: KindConfig,
    pub vps: KindConfig,
    /// Nodes never considered for placement.
    pub blacklisted_nodes: Vec<String>,
    pub timeouts: TimeoutConfig,
    pub requests: RequestConfig,
    pub allocation_lock_path: PathBuf,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            hypervisor: HypervisorConfig::default(),
            ssh: SshConfig::default(),
            network: NetworkConfig::default(),
            proxy: ProxyConfig::default(),
            container: KindConfig::default(),
            vps: KindConfig::default(),
            blacklisted_nodes: Vec::new(),
            timeouts: TimeoutConfig::default(),
            requests: RequestConfig::default(),
            allocation_lock_path: PathBuf::from("/run/cloud-orchestrator/allocation.lock"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Base URL of the control API, e.g. `https://pve.internal:8006`.
    pub api_url: String,
    /// `user@realm!tokenname`
    pub token_id: String,
    pub token_secret: String,
    pub verify_tls: bool,
    /// Pool every instance and template lives in.
    pub resource_pool: Option<String>,
    /// Storage holding instance disks and the template disk cache.
    pub instance_storage: String,
    /// Storage holding cloud-init snippets.
    pub snippet_storage: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            api_url: "https://localhost:8006".to_string(),
            token_id: String::new(),
            token_secret: String::new(),
            verify_tls: true,
            resource_pool: None,
            instance_storage: "local".to_string(),
            snippet_storage: "local".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SshConfig {
    pub jump_host: String,
    pub jump_port: u16,
    pub jump_user: String,
    pub node_port: u16,
    pub node_user: String,
    pub identity_file: Option<PathBuf>,
    pub node_domain: Option<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            jump_host: "localhost".to_string(),
            jump_port: 22,
            jump_user: "root".to_string(),
            node_port: 22,
            node_user: "root".to_string(),
            identity_file: None,
            node_domain: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Suffix of every kind base domain, e.g. `cloud.example.org`.
    pub base_fqdn: String,
    pub bridge: String,
    pub vlan: Option<u16>,
    /// Instance address pool in CIDR form.
    pub subnet: String,
    /// Defaults to the first host address of the subnet.
    pub gateway: Option<Ipv4Addr>,
    /// Restrict allocation to part of the subnet.
    pub range: Option<AddressRange>,
    pub nameservers: Vec<Ipv4Addr>,
    pub port_forward: PortForwardConfig,
    pub vhosts: VhostConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_fqdn: "cloud.localhost".to_string(),
            bridge: "vmbr0".to_string(),
            vlan: None,
            subnet: "10.50.0.0/24".to_string(),
            gateway: None,
            range: None,
            nameservers: vec![Ipv4Addr::new(1, 1, 1, 1)],
            port_forward: PortForwardConfig::default(),
            vhosts: VhostConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PortForwardConfig {
    /// Inclusive `START-END`.
    pub range: String,
}

impl Default for PortForwardConfig {
    fn default() -> Self {
        Self {
            range: "16384-32767".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VhostConfig {
    pub service_subdomain: ServiceSubdomainConfig,
    pub user_domain: UserDomainConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceSubdomainConfig {
    /// Tenants may use `<username>.<base_domain>` without DNS checks.
    pub base_domain: String,
    pub blacklisted_subdomains: Vec<String>,
}

impl Default for ServiceSubdomainConfig {
    fn default() -> Self {
        Self {
            base_domain: "users.localhost".to_string(),
            blacklisted_subdomains: vec!["www".to_string(), "mail".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UserDomainConfig {
    /// TXT label under the registrable domain that must hold the owner name.
    pub verification_txt_name: String,
    /// Addresses a custom domain is allowed to resolve to.
    pub allowed_a_aaaa: Vec<IpAddr>,
}

impl Default for UserDomainConfig {
    fn default() -> Self {
        Self {
            verification_txt_name: "_cloud".to_string(),
            allowed_a_aaaa: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    pub service_subdomain_cert_resolver: String,
    pub user_domain_cert_resolver: String,
    /// TCP/UDP entrypoints are named `<prefix>-<port>-tcp|udp`.
    pub entrypoint_prefix: String,
    /// Entrypoints HTTP routers attach to when the caller names none.
    pub web_entrypoints: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            service_subdomain_cert_resolver: "service".to_string(),
            user_domain_cert_resolver: "userdomain".to_string(),
            entrypoint_prefix: "cloud".to_string(),
            web_entrypoints: vec!["web".to_string(), "websecure".to_string()],
        }
    }
}

/// Per instance kind inactivity windows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KindConfig {
    pub inactivity_shutdown_num_days: u32,
    pub inactivity_deletion_num_days: u32,
}

impl Default for KindConfig {
    fn default() -> Self {
        Self {
            inactivity_shutdown_num_days: 60,
            inactivity_deletion_num_days: 90,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub lock_secs: u64,
    pub create_secs: u64,
    pub migrate_secs: u64,
    pub agent_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            lock_secs: 25,
            create_secs: 300,
            migrate_secs: 300,
            agent_secs: 25,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequestConfig {
    pub signing_secret: String,
    pub token_ttl_secs: u64,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            // one week for an admin to act on it
            token_ttl_secs: 7 * 24 * 3600,
        }
    }
}
