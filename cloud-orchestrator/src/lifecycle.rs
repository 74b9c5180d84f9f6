//! Instance lifecycle.
//!
//! ```text
//! Requested --approve--> Provisioning --> Stopped <--start/stop--> Running
//!                                            |
//!                                          delete
//!                                            v
//!                                         Deleted
//! ```
//!
//! Every operation works on a freshly read [`Instance`]; writes go through
//! [`InstanceManager::write_metadata`], which refuses to overwrite a record
//! whose revision moved since it was read.

use chrono::Utc;
use cloud_config::CloudConfig;
use cloud_core::{poll_until, CloudError, PollPolicy, RemoteShell, Result};
use cloud_ports::PortRange;
use cloud_provider::{
    encode_metadata, CloneRequest, GuestRef, GuestResource, HypervisorApi, Inactivity, Instance,
    InstanceKind, Metadata, Network, PowerAction, RequestDetail, Status, Tos, VhostOptions,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::credentials::{generate_root_credentials, RootCredentials};
use crate::domain::{is_valid_label, DomainRules, DomainValidator};
use crate::kinds::{ContainerDriver, KindContext, KindDriver, RootFiles, StartMode, VpsDriver};
use crate::lock::AllocationLock;
use crate::network::AddressPool;
use crate::placement::select_best_node;
use crate::request::{InstanceRequest, RequestSigner};
use crate::services::Backends;
use crate::template_disk::ensure_template_disk;

/// Guest ids are drawn from `[ID_MIN, ID_MAX)`.
pub const ID_MIN: u32 = 1000;
pub const ID_MAX: u32 = 5_000_000;

/// A new instance and the only copy of its root login.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub instance: Instance,
    pub credentials: RootCredentials,
}

#[derive(Clone)]
pub struct InstanceManager {
    pub(crate) config: Arc<CloudConfig>,
    pub(crate) hypervisor: Arc<dyn HypervisorApi>,
    pub(crate) shell: Arc<dyn RemoteShell>,
    pub(crate) validator: Arc<DomainValidator>,
    pub(crate) pool: AddressPool,
    pub(crate) port_range: PortRange,
    pub(crate) lock: AllocationLock,
    pub(crate) signer: RequestSigner,
    container: Arc<ContainerDriver>,
    vps: Arc<VpsDriver>,
}

impl InstanceManager {
    pub fn new(config: CloudConfig, backends: Backends) -> anyhow::Result<Self> {
        let pool = AddressPool::from_config(&config.network)?;
        let port_range = config.network.port_range()?;

        // allocation holds the lock until a clone is visible
        let create = config.timeouts.create_policy();
        let lock_policy = PollPolicy::new(
            create.timeout + config.timeouts.lock_policy().timeout,
            create.interval,
        );
        let lock = AllocationLock::new(config.allocation_lock_path.clone(), lock_policy);
        let signer = RequestSigner::new(
            &config.requests.signing_secret,
            config.requests.token_ttl_secs,
        );
        let validator = DomainValidator::new(backends.resolver, DomainRules::from_config(&config));

        let config = Arc::new(config);
        let ctx = KindContext {
            hypervisor: backends.hypervisor.clone(),
            shell: backends.shell.clone(),
            config: config.clone(),
        };

        Ok(Self {
            container: Arc::new(ContainerDriver::new(ctx.clone())),
            vps: Arc::new(VpsDriver::new(ctx)),
            hypervisor: backends.hypervisor,
            shell: backends.shell,
            validator: Arc::new(validator),
            config,
            pool,
            port_range,
            lock,
            signer,
        })
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    pub fn signer(&self) -> &RequestSigner {
        &self.signer
    }

    pub fn validator(&self) -> &DomainValidator {
        &self.validator
    }

    pub(crate) fn driver(&self, kind: InstanceKind) -> &dyn KindDriver {
        match kind {
            InstanceKind::Container => self.container.as_ref(),
            InstanceKind::Vps => self.vps.as_ref(),
        }
    }

    /// Clone a template into a new instance for `owner`.
    #[instrument(skip(self, detail), fields(template = %detail.template_id))]
    pub async fn create_instance(
        &self,
        kind: InstanceKind,
        owner: &str,
        hostname: &str,
        detail: RequestDetail,
    ) -> Result<Provisioned> {
        if !is_valid_label(hostname) {
            return Err(CloudError::Unavailable(format!(
                "invalid hostname `{hostname}`"
            )));
        }
        if !is_valid_label(owner) {
            return Err(CloudError::Unavailable(format!("invalid owner `{owner}`")));
        }

        let template = self.read_template(kind, &detail.template_id).await?;
        let required = kind.required_disk_format();
        if template.metadata.disk_format != required {
            return Err(CloudError::Unavailable(format!(
                "template {} ships a {} disk but {kind} instances need {}",
                template.template_id,
                template.metadata.disk_format.extension(),
                required.extension()
            )));
        }

        let fqdn = self.instance_fqdn(kind, owner, hostname);
        let specs = template.specs;

        // checked again under the allocation lock
        self.ensure_name_free(kind, &fqdn, hostname).await?;

        let nodes = self.hypervisor.nodes().await?;
        let target = select_best_node(&nodes, &specs, &self.config.blacklisted_nodes)
            .ok_or_else(|| {
                CloudError::Unavailable("no suitable node available for the instance".to_string())
            })?;

        let storage = self
            .hypervisor
            .storage_path(&self.config.hypervisor.instance_storage)
            .await?;
        ensure_template_disk(self.shell.as_ref(), &target, &storage, &template).await?;

        let credentials = generate_root_credentials(&fqdn)?;
        let today = Utc::now().date_naive();

        let guest = self
            .lock
            .with_lock(&format!("create {fqdn}"), || async {
                let guests = self.ensure_name_free(kind, &fqdn, hostname).await?;

                let held = self.held_addresses().await?;
                let nic_allocation = self.pool.allocate(&held)?;

                let metadata = Metadata {
                    groups: BTreeSet::from([
                        format!("cloud_{}", kind.as_str()),
                        "cloud_instance".to_string(),
                    ]),
                    owner: owner.to_string(),
                    tos: Tos::default(),
                    inactivity: Inactivity::fresh(today),
                    network: Network {
                        vhosts: BTreeMap::from([(fqdn.clone(), VhostOptions::default())]),
                        ports: BTreeMap::new(),
                        nic_allocation,
                    },
                    root_user: credentials.root_user.clone(),
                    request_detail: detail.clone(),
                    permanent: false,
                    revision: 0,
                };

                let taken: BTreeSet<u32> = guests.iter().map(|g| g.id).collect();
                let new_id = guest_id_for(&fqdn, &taken)?;

                self.hypervisor
                    .clone_guest(
                        &template.guest_ref(),
                        &CloneRequest {
                            new_id,
                            name: fqdn.clone(),
                            description: encode_metadata(&metadata)?,
                            storage: self.config.hypervisor.instance_storage.clone(),
                            pool: self.config.hypervisor.resource_pool.clone(),
                        },
                    )
                    .await?;
                info!(fqdn = %fqdn, id = new_id, node = %template.node, "clone issued");

                self.wait_for_guest(kind, &fqdn, None, self.config.timeouts.create_policy())
                    .await
            })
            .await?;

        let guest = if guest.node != target {
            info!(fqdn = %fqdn, from = %guest.node, to = %target, "migrating to selected node");
            self.hypervisor.migrate_guest(&guest, &target).await?;
            self.wait_for_guest(
                kind,
                &fqdn,
                Some(&target),
                self.config.timeouts.migrate_policy(),
            )
            .await?
        } else {
            guest
        };

        self.hypervisor
            .resize_disk(&guest, kind.root_disk_key(), &format!("{}G", specs.disk_space))
            .await?;
        self.wait_unlocked(&guest).await?;

        let instance = self.read_instance_at(&guest).await?;
        info!(fqdn = %instance.fqdn, node = %instance.node, "instance created");
        Ok(Provisioned {
            instance,
            credentials,
        })
    }

    /// Verify a signed request and provision it.
    pub async fn approve_request(&self, token: &str) -> Result<Provisioned> {
        let request = self.signer.verify(token)?;
        info!(owner = %request.owner, hostname = %request.hostname, kind = %request.kind, "request approved");
        self.create_instance(
            request.kind,
            &request.owner,
            &request.hostname,
            request.detail,
        )
        .await
    }

    /// Verify a signed request that is being turned down.
    pub fn deny_request(&self, token: &str) -> Result<InstanceRequest> {
        let request = self.signer.verify(token)?;
        info!(owner = %request.owner, hostname = %request.hostname, kind = %request.kind, "request denied");
        Ok(request)
    }

    #[instrument(skip_all, fields(fqdn = %instance.fqdn))]
    pub async fn delete_instance(&self, instance: &Instance) -> Result<()> {
        if instance.status != Status::Stopped {
            return Err(CloudError::Unavailable(format!(
                "cannot delete {}, the instance is not stopped",
                instance.fqdn
            )));
        }
        self.driver(instance.kind).cleanup(instance).await?;
        self.hypervisor.delete_guest(&instance.guest_ref()).await?;
        info!("instance deleted");
        Ok(())
    }

    /// Apply network and guest config, then power on. A running instance is
    /// left alone.
    #[instrument(skip_all, fields(fqdn = %instance.fqdn, ?mode))]
    pub async fn start_instance(&self, instance: &Instance, mode: StartMode) -> Result<()> {
        if instance.status == Status::Running {
            return Ok(());
        }
        if instance.metadata.tos.suspended {
            return Err(CloudError::Unavailable(format!(
                "{} is suspended and cannot be started",
                instance.fqdn
            )));
        }
        let guest = instance.guest_ref();
        self.wait_unlocked(&guest).await?;
        self.driver(instance.kind).prepare_start(instance, mode).await?;
        self.hypervisor.power(&guest, PowerAction::Start).await
    }

    /// Hard stop.
    pub async fn stop_instance(&self, instance: &Instance) -> Result<()> {
        self.power_off(instance, PowerAction::Stop).await
    }

    /// ACPI shutdown.
    pub async fn shutdown_instance(&self, instance: &Instance) -> Result<()> {
        self.power_off(instance, PowerAction::Shutdown).await
    }

    async fn power_off(&self, instance: &Instance, action: PowerAction) -> Result<()> {
        if instance.status != Status::Running {
            return Ok(());
        }
        self.hypervisor.power(&instance.guest_ref(), action).await
    }

    /// Install a fresh root password and ssh key in the running guest and
    /// persist the public half.
    #[instrument(skip_all, fields(fqdn = %instance.fqdn))]
    pub async fn reset_root_user(&self, instance: &mut Instance) -> Result<RootCredentials> {
        if instance.status != Status::Running {
            return Err(CloudError::Unavailable(format!(
                "{} must be running to reset its root user",
                instance.fqdn
            )));
        }
        self.wait_unlocked(&instance.guest_ref()).await?;

        let credentials = generate_root_credentials(&instance.fqdn)?;
        let files = RootFiles::render(instance, &credentials.root_user)?;
        self.driver(instance.kind)
            .install_root_user(instance, &files)
            .await?;

        instance.metadata.root_user = credentials.root_user.clone();
        self.write_metadata(instance).await?;
        Ok(credentials)
    }

    /// Restart the inactivity window from today. ToS suspension is untouched.
    pub async fn mark_active(&self, instance: &mut Instance) -> Result<()> {
        let today = Utc::now().date_naive();
        instance.metadata.inactivity = Inactivity::fresh(today);
        self.write_metadata(instance).await?;
        self.refresh_activity(instance, today);
        Ok(())
    }

    /// Persist `instance.metadata` if the stored revision still matches the
    /// one it was read at. Bumps the revision on success.
    pub async fn write_metadata(&self, instance: &mut Instance) -> Result<()> {
        let guest = instance.guest_ref();
        let stored = self.hypervisor.guest_config(&guest).await?;
        let stored = cloud_provider::decode_metadata(&stored.description())?;

        if stored.revision != instance.metadata.revision {
            return Err(CloudError::Conflict(format!(
                "metadata of {} changed since it was read (stored revision {}, read at {})",
                instance.fqdn, stored.revision, instance.metadata.revision
            )));
        }

        let mut next = instance.metadata.clone();
        next.revision += 1;
        self.hypervisor
            .update_guest_config(
                &guest,
                &cloud_provider::params([("description", encode_metadata(&next)?)]),
            )
            .await?;
        instance.metadata = next;
        Ok(())
    }

    /// Wait until the hypervisor releases its lock on `guest`.
    pub(crate) async fn wait_unlocked(&self, guest: &GuestRef) -> Result<()> {
        let hypervisor = self.hypervisor.as_ref();
        poll_until(
            self.config.timeouts.lock_policy(),
            &format!("{guest} to unlock"),
            || async move {
                let config = hypervisor.guest_config(guest).await?;
                Ok::<bool, CloudError>(!config.is_locked())
            },
        )
        .await
    }

    /// Wait until a guest named `fqdn` is listed (on `node` when given) and its
    /// config is complete and unlocked.
    async fn wait_for_guest(
        &self,
        kind: InstanceKind,
        fqdn: &str,
        node: Option<&str>,
        policy: PollPolicy,
    ) -> Result<GuestRef> {
        let found: Mutex<Option<GuestRef>> = Mutex::new(None);
        let what = match node {
            Some(node) => format!("{fqdn} to arrive on {node}"),
            None => format!("{fqdn} to be created"),
        };

        poll_until(policy, &what, || {
            let found = &found;
            async move {
                let guest = self.locate_settled(kind, fqdn, node).await?;
                let done = guest.is_some();
                *found.lock().await = guest;
                Ok::<bool, CloudError>(done)
            }
        })
        .await?;

        found
            .into_inner()
            .ok_or_else(|| CloudError::Unavailable(format!("{fqdn} vanished while waiting")))
    }

    async fn locate_settled(
        &self,
        kind: InstanceKind,
        fqdn: &str,
        node: Option<&str>,
    ) -> Result<Option<GuestRef>> {
        let candidates: Vec<GuestResource> = self
            .hypervisor
            .guests()
            .await?
            .into_iter()
            .filter(|g| g.kind == kind && g.name.as_deref() == Some(fqdn))
            .filter(|g| node.map_or(true, |n| n == g.node))
            .collect();

        for resource in candidates {
            let guest = resource.guest_ref();
            match self.hypervisor.guest_config(&guest).await {
                Ok(config) if !config.is_locked() && config.name(kind).as_deref() == Some(fqdn) => {
                    return Ok(Some(guest));
                }
                Ok(_) => {}
                // the listing can lag behind a migration
                Err(e) if e.is_not_found() => warn!(%guest, "listed guest has no config yet"),
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Addresses of every instance that reads cleanly.
    async fn ensure_name_free(&self, kind: InstanceKind, fqdn: &str, hostname: &str) -> Result<Vec<GuestResource>> {
        let guests = self.hypervisor.guests().await?;
        if guests
            .iter()
            .any(|g| g.kind == kind && g.name.as_deref() == Some(fqdn))
        {
            return Err(CloudError::AlreadyExists(format!(
                "instance {hostname} already exists"
            )));
        }
        Ok(guests)
    }

    async fn held_addresses(&self) -> Result<BTreeSet<Ipv4Addr>> {
        Ok(self
            .scan_instances(true)
            .await?
            .values()
            .flat_map(|i| i.metadata.network.nic_allocation.addresses.iter())
            .map(|a| a.ip())
            .collect())
    }
}

/// Guest id for `fqdn`: SHA-256 of the name reduced into the id range,
/// probing upwards past ids already in use.
pub fn guest_id_for(fqdn: &str, taken: &BTreeSet<u32>) -> Result<u32> {
    let digest = Sha256::digest(fqdn.as_bytes());
    let seed = digest[..8]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    let span = ID_MAX - ID_MIN;
    let start = (seed % u64::from(span)) as u32;

    (0..span)
        .map(|offset| ID_MIN + (start + offset) % span)
        .find(|id| !taken.contains(id))
        .ok_or_else(|| CloudError::Unavailable("no free guest ids left".to_string()))
}
