//! Reading instances and templates back from the cluster.
//!
//! Guests are found through the cluster-wide listing by name:
//!
//! - instances: `<hostname>.<owner>.<kind>.<base fqdn>`
//! - templates: `<template id>.<kind>.template.<base fqdn>`

use chrono::{NaiveDate, Utc};
use cloud_config::KindConfig;
use cloud_core::{CloudError, Result};
use cloud_provider::{
    decode_metadata, decode_template_metadata, disk_size_gb, inactivity_dates, GuestConfig,
    GuestRef, GuestResource, Instance, InstanceKind, Specs, Template,
};
use std::collections::BTreeMap;
use tracing::info;

use crate::lifecycle::InstanceManager;

fn specs_from_config(config: &GuestConfig, kind: InstanceKind) -> Result<Specs> {
    let cores = u32::try_from(config.require_u64("cores")?)
        .map_err(|_| CloudError::Unavailable("core count out of range".to_string()))?;
    Ok(Specs {
        cores,
        memory: config.require_u64("memory")?,
        disk_space: disk_size_gb(&config.require_str(kind.root_disk_key())?)?,
        swap: config.get_u64("swap").unwrap_or(0),
    })
}

impl InstanceManager {
    pub fn kind_config(&self, kind: InstanceKind) -> KindConfig {
        match kind {
            InstanceKind::Container => self.config.container,
            InstanceKind::Vps => self.config.vps,
        }
    }

    pub fn kind_base_fqdn(&self, kind: InstanceKind) -> String {
        match kind {
            InstanceKind::Container => self.config.container_base_fqdn(),
            InstanceKind::Vps => self.config.vps_base_fqdn(),
        }
    }

    pub fn instance_fqdn(&self, kind: InstanceKind, owner: &str, hostname: &str) -> String {
        format!("{hostname}.{owner}.{}", self.kind_base_fqdn(kind))
    }

    fn owner_suffix(&self, kind: InstanceKind, owner: &str) -> String {
        format!(".{owner}.{}", self.kind_base_fqdn(kind))
    }

    fn template_base_fqdn(&self, kind: InstanceKind) -> String {
        format!("{}.template.{}", kind.as_str(), self.config.network.base_fqdn)
    }

    pub fn template_fqdn(&self, kind: InstanceKind, template_id: &str) -> String {
        format!("{template_id}.{}", self.template_base_fqdn(kind))
    }

    async fn find_guest(&self, kind: InstanceKind, fqdn: &str) -> Result<Option<GuestResource>> {
        Ok(self
            .hypervisor
            .guests()
            .await?
            .into_iter()
            .find(|g| g.kind == kind && g.name.as_deref() == Some(fqdn)))
    }

    pub(crate) fn refresh_activity(&self, instance: &mut Instance, today: NaiveDate) {
        let windows = self.kind_config(instance.kind);
        let (shutdown, deletion) = inactivity_dates(
            instance.metadata.inactivity.marked_active_at,
            windows.inactivity_shutdown_num_days,
            windows.inactivity_deletion_num_days,
        );
        instance.active = instance
            .metadata
            .is_active(today, windows.inactivity_shutdown_num_days);
        instance.inactivity_shutdown_date = shutdown;
        instance.inactivity_deletion_date = deletion;
    }

    /// Read one guest as an instance, without domain remarks.
    pub async fn read_instance_at(&self, guest: &GuestRef) -> Result<Instance> {
        let kind = guest.kind;
        let config = self.hypervisor.guest_config(guest).await?;
        let fqdn = config.name(kind).ok_or_else(|| {
            CloudError::Unavailable(format!("{guest} has no `{}`", kind.name_key()))
        })?;
        let metadata = decode_metadata(&config.description())?;

        let suffix = self.owner_suffix(kind, &metadata.owner);
        let hostname = fqdn
            .strip_suffix(&suffix)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| {
                CloudError::Unavailable(format!(
                    "Owner / FQDN do not align, FQDN is {fqdn} but owner is {}",
                    metadata.owner
                ))
            })?
            .to_string();

        let specs = specs_from_config(&config, kind)?;
        let status = self.hypervisor.guest_status(guest).await?;
        let marked = metadata.inactivity.marked_active_at;

        let mut instance = Instance {
            kind,
            node: guest.node.clone(),
            id: guest.id,
            fqdn,
            hostname,
            specs,
            status: status.status,
            active: false,
            metadata,
            remarks: Vec::new(),
            inactivity_shutdown_date: marked,
            inactivity_deletion_date: marked,
            mem: status.mem,
            disk: status.disk,
            uptime: status.uptime,
        };
        self.refresh_activity(&mut instance, Utc::now().date_naive());
        Ok(instance)
    }

    /// Attach a remark for every vhost that does not currently validate.
    pub async fn attach_remarks(&self, instance: &mut Instance) {
        for vhost in instance.metadata.network.vhosts.keys() {
            let validation = self
                .validator
                .validate(&instance.metadata.owner, &instance.fqdn, vhost)
                .await;
            if !validation.valid {
                instance.remarks.extend(validation.remarks);
            }
        }
    }

    pub async fn read_instance(
        &self,
        kind: InstanceKind,
        owner: &str,
        hostname: &str,
    ) -> Result<Instance> {
        let fqdn = self.instance_fqdn(kind, owner, hostname);
        let resource = self
            .find_guest(kind, &fqdn)
            .await?
            .ok_or_else(|| CloudError::NotFound(format!("instance {fqdn} does not exist")))?;

        let mut instance = self.read_instance_at(&resource.guest_ref()).await?;
        self.attach_remarks(&mut instance).await;
        Ok(instance)
    }

    /// Instances of `owner`, keyed by fqdn. Unreadable guests are skipped.
    pub async fn read_instances_by_owner(
        &self,
        kind: Option<InstanceKind>,
        owner: &str,
    ) -> Result<BTreeMap<String, Instance>> {
        let kinds: Vec<InstanceKind> = match kind {
            Some(kind) => vec![kind],
            None => InstanceKind::ALL.to_vec(),
        };

        let mut found = BTreeMap::new();
        for resource in self.hypervisor.guests().await? {
            if resource.template || !kinds.contains(&resource.kind) {
                continue;
            }
            if !resource.name_ends_with(&self.owner_suffix(resource.kind, owner)) {
                continue;
            }
            match self.read_instance_at(&resource.guest_ref()).await {
                Ok(mut instance) => {
                    self.attach_remarks(&mut instance).await;
                    found.insert(instance.fqdn.clone(), instance);
                }
                Err(e) => info!(guest = %resource.guest_ref(), error = %e, "skipping unreadable instance"),
            }
        }
        Ok(found)
    }

    /// Every instance in the cluster keyed by fqdn, without domain remarks.
    pub(crate) async fn scan_instances(&self, ignore_errors: bool) -> Result<BTreeMap<String, Instance>> {
        let mut found = BTreeMap::new();
        for resource in self.hypervisor.guests().await? {
            if resource.template
                || !resource.name_ends_with(&format!(".{}", self.kind_base_fqdn(resource.kind)))
            {
                continue;
            }
            match self.read_instance_at(&resource.guest_ref()).await {
                Ok(instance) => {
                    found.insert(instance.fqdn.clone(), instance);
                }
                Err(e) if ignore_errors => {
                    info!(guest = %resource.guest_ref(), error = %e, "ignoring instance that failed to read")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }

    /// Every instance in the cluster keyed by fqdn, with domain remarks.
    pub async fn read_all_instances(&self, ignore_errors: bool) -> Result<BTreeMap<String, Instance>> {
        let mut instances = self.scan_instances(ignore_errors).await?;
        for instance in instances.values_mut() {
            self.attach_remarks(instance).await;
        }
        Ok(instances)
    }

    async fn read_template_at(&self, guest: &GuestRef) -> Result<Template> {
        let kind = guest.kind;
        let config = match self.hypervisor.guest_config(guest).await {
            Ok(config) => config,
            Err(e) if e.is_not_found() => {
                return Err(CloudError::NotFound(format!("template {guest} does not exist")))
            }
            Err(e) => return Err(e),
        };
        if !config.is_template() {
            return Err(CloudError::NotFound(format!("{guest} is not a template")));
        }

        let fqdn = config.name(kind).ok_or_else(|| {
            CloudError::Unavailable(format!("template {guest} has no `{}`", kind.name_key()))
        })?;
        let metadata = decode_template_metadata(&config.description())?;
        let template_id = fqdn
            .strip_suffix(&format!(".{}", self.template_base_fqdn(kind)))
            .unwrap_or_else(|| fqdn.split('.').next().unwrap_or_default())
            .to_string();

        Ok(Template {
            kind,
            node: guest.node.clone(),
            id: guest.id,
            specs: specs_from_config(&config, kind)?,
            fqdn,
            template_id,
            metadata,
        })
    }

    pub async fn read_template(&self, kind: InstanceKind, template_id: &str) -> Result<Template> {
        let fqdn = self.template_fqdn(kind, template_id);
        let resource = self
            .find_guest(kind, &fqdn)
            .await?
            .ok_or_else(|| CloudError::NotFound(format!("template {template_id} does not exist")))?;
        self.read_template_at(&resource.guest_ref()).await
    }

    /// Templates of `kind` keyed by template id. Broken templates are skipped.
    pub async fn read_templates(&self, kind: InstanceKind) -> Result<BTreeMap<String, Template>> {
        let suffix = format!(".{}", self.template_base_fqdn(kind));
        let mut found = BTreeMap::new();
        for resource in self.hypervisor.guests().await? {
            if resource.kind != kind || !resource.name_ends_with(&suffix) {
                continue;
            }
            match self.read_template_at(&resource.guest_ref()).await {
                Ok(template) => {
                    found.insert(template.template_id.clone(), template);
                }
                Err(e) => info!(guest = %resource.guest_ref(), error = %e, "skipping unreadable template"),
            }
        }
        Ok(found)
    }
}
