//! Configuration for the cloud orchestrator.
//!
//! A single YAML document describes the hypervisor API, the ssh jump host, the
//! instance network, reverse proxy naming, inactivity windows, timeouts and
//! request signing. Every section has defaults, so a minimal file only needs
//! the values that differ.

pub mod config;
pub mod loader;
pub mod validate;

pub use config::{
    AddressRange, CloudConfig, HypervisorConfig, KindConfig, NetworkConfig, PortForwardConfig,
    ProxyConfig, RequestConfig, ServiceSubdomainConfig, SshConfig, TimeoutConfig,
    UserDomainConfig, VhostConfig,
};
pub use loader::{CONFIG_ENV_VAR, DEFAULT_CONFIG_PATH};
