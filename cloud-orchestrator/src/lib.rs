//! Instance orchestration business logic
//!
//! Places, provisions and manages tenant instances (containers and VMs) on the
//! hypervisor cluster, keeps their vhosts and forwarded ports, and builds the
//! reverse-proxy configuration from them. It is consumed by the cloud-api
//! HTTP service but holds no HTTP concerns itself.
//!
//! [`InstanceManager`] is the entry point; it is built once at start-up from
//! a [`cloud_config::CloudConfig`] and the [`Backends`] it talks to.

pub mod credentials;
pub mod domain;
pub mod inventory;
pub mod kinds;
pub mod lifecycle;
pub mod lock;
pub mod network;
pub mod placement;
pub mod proxy;
pub mod registry;
pub mod render;
pub mod request;
pub mod services;
pub mod template_disk;

pub use credentials::RootCredentials;
pub use domain::{
    DnsResolver, DomainRules, DomainValidation, DomainValidator, HickoryResolver, StaticResolver,
};
pub use kinds::{KindDriver, StartMode};
pub use lifecycle::{guest_id_for, InstanceManager, Provisioned};
pub use lock::AllocationLock;
pub use network::AddressPool;
pub use placement::select_best_node;
pub use proxy::{build_proxy_document, ProxyDocument, RoutedVhost};
pub use request::{InstanceRequest, RequestSigner};
pub use services::Backends;
