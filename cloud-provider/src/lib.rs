//! Hypervisor provider layer.
//!
//! The orchestrator keeps no database: every instance is a guest on the
//! hypervisor and its [`Metadata`] is stored as YAML in the guest's
//! description. This crate holds those records, the codec that reads and
//! writes them, and the [`HypervisorApi`] the orchestrator drives, with a
//! REST client for Proxmox-style clusters in [`proxmox`].
//!
//! With the `test-helpers` feature, [`mock`] provides an in-memory cluster and
//! a recording remote shell.

pub mod config_string;
pub mod hypervisor;
pub mod metadata;
pub mod models;
pub mod proxmox;

#[cfg(feature = "test-helpers")]
pub mod mock;

pub use config_string::{disk_size_gb, parse_size_gb, ConfigString};
pub use hypervisor::{
    params, CloneRequest, GuestConfig, GuestRef, GuestResource, GuestStatus, HypervisorApi,
    NodeStats, Params, PowerAction,
};
pub use metadata::{
    decode_metadata, decode_template_metadata, encode_metadata, encode_template_metadata,
};
pub use models::{
    inactivity_dates, DiskFormat, Inactivity, Instance, InstanceKind, Metadata, NicAllocation,
    Network, RequestDetail, RootUser, Specs, Status, Template, TemplateMetadata, Tos,
    VhostOptions,
};
pub use proxmox::ProxmoxClient;
