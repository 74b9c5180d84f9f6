//! REST client for a Proxmox-style hypervisor control API.
//!
//! Authenticates with an API token, sends form-encoded parameters and unwraps
//! the `{"data": ...}` envelope every endpoint answers with.

use async_trait::async_trait;
use cloud_core::{CloudError, Result};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::hypervisor::{
    require_agent, CloneRequest, GuestConfig, GuestRef, GuestResource, GuestStatus, HypervisorApi,
    NodeStats, Params, PowerAction,
};
use crate::models::{InstanceKind, Status};

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct RawResource {
    #[serde(rename = "type")]
    kind: String,
    node: String,
    vmid: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    template: Option<u8>,
}

#[derive(Deserialize)]
struct RawStatus {
    status: String,
    #[serde(default)]
    mem: u64,
    #[serde(default)]
    disk: u64,
    #[serde(default)]
    uptime: u64,
}

#[derive(Deserialize)]
struct RawIpsetEntry {
    cidr: String,
}

#[derive(Deserialize)]
struct RawStorage {
    path: Option<String>,
}

pub struct ProxmoxClient {
    client: Client,
    base: Url,
    auth_header: String,
}

impl ProxmoxClient {
    pub fn new(api_url: &str, token_id: &str, token_secret: &str, verify_tls: bool) -> Result<Self> {
        let mut base = Url::parse(api_url)
            .map_err(|e| CloudError::Unavailable(format!("invalid hypervisor url {api_url}: {e}")))?;
        base.path_segments_mut()
            .map_err(|_| CloudError::Unavailable(format!("hypervisor url {api_url} cannot be a base")))?
            .pop_if_empty()
            .extend(["api2", "json"]);

        let client = Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CloudError::Unavailable(format!("cannot build http client: {e}")))?;

        Ok(Self {
            client,
            base,
            auth_header: format!("PVEAPIToken={token_id}={token_secret}"),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| CloudError::Unavailable("hypervisor url cannot be a base".to_string()))?
            .extend(segments);
        Ok(url)
    }

    fn guest_path<'a>(guest: &'a GuestRef, id: &'a str, rest: &[&'a str]) -> Vec<&'a str> {
        let mut path = vec!["nodes", guest.node.as_str(), guest.kind.api_segment(), id];
        path.extend_from_slice(rest);
        path
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        segments: &[&str],
        form: &[(String, String)],
    ) -> Result<T> {
        let url = self.endpoint(segments)?;
        debug!(%method, %url, "hypervisor request");

        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .header("Authorization", &self.auth_header);
        if !form.is_empty() {
            request = if method == Method::GET || method == Method::DELETE {
                request.query(form)
            } else {
                request.form(form)
            };
        }

        let response = request
            .send()
            .await
            .map_err(|e| CloudError::Unavailable(format!("hypervisor request {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let reason = format!("hypervisor {method} {url} returned {status}: {}", body.trim());
            if status == StatusCode::NOT_FOUND || body.contains("does not exist") {
                return Err(CloudError::NotFound(reason));
            }
            warn!("{reason}");
            return Err(CloudError::Unavailable(reason));
        }

        let envelope: Envelope<T> = response.json().await.map_err(|e| {
            CloudError::Unavailable(format!("unexpected hypervisor response from {url}: {e}"))
        })?;
        Ok(envelope.data)
    }

    async fn send(&self, method: Method, segments: &[&str], form: &[(String, String)]) -> Result<()> {
        self.call::<Value>(method, segments, form).await.map(|_| ())
    }
}

fn form_of(params: &Params) -> Vec<(String, String)> {
    params.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

fn pair(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

#[async_trait]
impl HypervisorApi for ProxmoxClient {
    async fn nodes(&self) -> Result<Vec<NodeStats>> {
        self.call(Method::GET, &["nodes"], &[]).await
    }

    async fn guests(&self) -> Result<Vec<GuestResource>> {
        let raw: Vec<RawResource> = self
            .call(Method::GET, &["cluster", "resources"], &[pair("type", "vm")])
            .await?;
        Ok(raw
            .into_iter()
            .filter_map(|r| {
                InstanceKind::from_api_segment(&r.kind).map(|kind| GuestResource {
                    kind,
                    node: r.node,
                    id: r.vmid,
                    name: r.name,
                    template: r.template == Some(1),
                })
            })
            .collect())
    }

    async fn guest_config(&self, guest: &GuestRef) -> Result<GuestConfig> {
        let id = guest.id.to_string();
        let map: BTreeMap<String, Value> = self
            .call(Method::GET, &Self::guest_path(guest, &id, &["config"]), &[])
            .await?;
        Ok(GuestConfig(map))
    }

    async fn update_guest_config(&self, guest: &GuestRef, params: &Params) -> Result<()> {
        let id = guest.id.to_string();
        let mut form = Vec::new();
        let mut delete = Vec::new();
        for (key, value) in params {
            if value.is_empty() {
                delete.push(key.as_str());
            } else {
                form.push(pair(key, value));
            }
        }
        if !delete.is_empty() {
            form.push(pair("delete", delete.join(",")));
        }
        self.send(Method::PUT, &Self::guest_path(guest, &id, &["config"]), &form)
            .await
    }

    async fn clone_guest(&self, template: &GuestRef, request: &CloneRequest) -> Result<()> {
        let id = template.id.to_string();
        let mut form = vec![
            pair("newid", request.new_id),
            pair(template.kind.name_key(), &request.name),
            pair("description", &request.description),
            pair("storage", &request.storage),
            pair("full", 1),
        ];
        if let Some(pool) = &request.pool {
            form.push(pair("pool", pool));
        }
        self.send(Method::POST, &Self::guest_path(template, &id, &["clone"]), &form)
            .await
    }

    async fn resize_disk(&self, guest: &GuestRef, disk: &str, size: &str) -> Result<()> {
        let id = guest.id.to_string();
        let form = [pair("disk", disk), pair("size", size)];
        self.send(Method::PUT, &Self::guest_path(guest, &id, &["resize"]), &form)
            .await
    }

    async fn migrate_guest(&self, guest: &GuestRef, target_node: &str) -> Result<()> {
        let id = guest.id.to_string();
        let mut form = vec![pair("target", target_node)];
        if guest.kind == InstanceKind::Container {
            form.push(pair("restart", 1));
        }
        self.send(Method::POST, &Self::guest_path(guest, &id, &["migrate"]), &form)
            .await
    }

    async fn guest_status(&self, guest: &GuestRef) -> Result<GuestStatus> {
        let id = guest.id.to_string();
        let raw: RawStatus = self
            .call(Method::GET, &Self::guest_path(guest, &id, &["status", "current"]), &[])
            .await?;
        Ok(GuestStatus {
            status: Status::from_api(&raw.status),
            mem: raw.mem,
            disk: raw.disk,
            uptime: raw.uptime,
        })
    }

    async fn power(&self, guest: &GuestRef, action: PowerAction) -> Result<()> {
        let id = guest.id.to_string();
        self.send(
            Method::POST,
            &Self::guest_path(guest, &id, &["status", action.as_str()]),
            &[],
        )
        .await
    }

    async fn set_firewall_options(&self, guest: &GuestRef, params: &Params) -> Result<()> {
        let id = guest.id.to_string();
        self.send(
            Method::PUT,
            &Self::guest_path(guest, &id, &["firewall", "options"]),
            &form_of(params),
        )
        .await
    }

    async fn ipset_entries(&self, guest: &GuestRef, name: &str) -> Result<Vec<String>> {
        let id = guest.id.to_string();
        let raw: Vec<RawIpsetEntry> = self
            .call(
                Method::GET,
                &Self::guest_path(guest, &id, &["firewall", "ipset", name]),
                &[],
            )
            .await?;
        Ok(raw.into_iter().map(|e| e.cidr).collect())
    }

    async fn create_ipset(&self, guest: &GuestRef, name: &str) -> Result<()> {
        let id = guest.id.to_string();
        self.send(
            Method::POST,
            &Self::guest_path(guest, &id, &["firewall", "ipset"]),
            &[pair("name", name)],
        )
        .await
    }

    async fn add_ipset_entry(&self, guest: &GuestRef, name: &str, cidr: &str) -> Result<()> {
        let id = guest.id.to_string();
        self.send(
            Method::POST,
            &Self::guest_path(guest, &id, &["firewall", "ipset", name]),
            &[pair("cidr", cidr)],
        )
        .await
    }

    async fn delete_ipset_entry(&self, guest: &GuestRef, name: &str, cidr: &str) -> Result<()> {
        let id = guest.id.to_string();
        self.send(
            Method::DELETE,
            &Self::guest_path(guest, &id, &["firewall", "ipset", name, cidr]),
            &[],
        )
        .await
    }

    async fn delete_ipset(&self, guest: &GuestRef, name: &str) -> Result<()> {
        let id = guest.id.to_string();
        self.send(
            Method::DELETE,
            &Self::guest_path(guest, &id, &["firewall", "ipset", name]),
            &[],
        )
        .await
    }

    async fn storage_path(&self, storage: &str) -> Result<String> {
        let raw: RawStorage = self.call(Method::GET, &["storage", storage], &[]).await?;
        raw.path.ok_or_else(|| {
            CloudError::Unavailable(format!("storage {storage} is not backed by a directory"))
        })
    }

    async fn delete_guest(&self, guest: &GuestRef) -> Result<()> {
        let id = guest.id.to_string();
        self.send(Method::DELETE, &Self::guest_path(guest, &id, &[]), &[])
            .await
    }

    async fn agent_ping(&self, guest: &GuestRef) -> Result<()> {
        require_agent(guest)?;
        let id = guest.id.to_string();
        self.send(Method::POST, &Self::guest_path(guest, &id, &["agent", "ping"]), &[])
            .await
    }

    async fn agent_exec(&self, guest: &GuestRef, command: &[&str]) -> Result<()> {
        require_agent(guest)?;
        let id = guest.id.to_string();
        let form: Vec<_> = command.iter().map(|part| pair("command", part)).collect();
        self.send(Method::POST, &Self::guest_path(guest, &id, &["agent", "exec"]), &form)
            .await
    }

    async fn agent_set_password(&self, guest: &GuestRef, username: &str, crypted: &str) -> Result<()> {
        require_agent(guest)?;
        let id = guest.id.to_string();
        let form = [
            pair("username", username),
            pair("password", crypted),
            pair("crypted", 1),
        ];
        self.send(
            Method::POST,
            &Self::guest_path(guest, &id, &["agent", "set-user-password"]),
            &form,
        )
        .await
    }

    async fn agent_file_write(&self, guest: &GuestRef, path: &str, content: &str) -> Result<()> {
        require_agent(guest)?;
        let id = guest.id.to_string();
        let form = [pair("file", path), pair("content", content)];
        self.send(
            Method::POST,
            &Self::guest_path(guest, &id, &["agent", "file-write"]),
            &form,
        )
        .await
    }
}
