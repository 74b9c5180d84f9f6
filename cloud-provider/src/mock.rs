//! In-memory stand-ins for the hypervisor and the remote shell.

use async_trait::async_trait;
use cloud_core::{CloudError, CommandOutput, RemoteShell, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use crate::hypervisor::{
    require_agent, CloneRequest, GuestConfig, GuestRef, GuestResource, GuestStatus, HypervisorApi,
    NodeStats, Params, PowerAction,
};
use crate::models::{InstanceKind, Specs, Status};

#[derive(Debug, Clone)]
pub struct FakeGuest {
    pub kind: InstanceKind,
    pub node: String,
    pub config: BTreeMap<String, Value>,
    pub status: Status,
    pub firewall: BTreeMap<String, String>,
    pub ipsets: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Default)]
struct FakeState {
    nodes: Vec<NodeStats>,
    guests: BTreeMap<u32, FakeGuest>,
    storage_paths: BTreeMap<String, String>,
    /// Number of config reads that still report a lock, per guest id.
    pending_locks: BTreeMap<u32, u32>,
    /// Clones land on this node instead of the template's.
    clone_node_override: Option<String>,
    agent_ready_after: u32,
    agent_pings: u32,
    failing: BTreeSet<String>,
    calls: Vec<String>,
    agent_log: Vec<String>,
}

/// A cluster held in memory. Operations succeed immediately unless a failure
/// was injected with [`FakeHypervisor::fail_on`].
#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<FakeState>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn record(&self, op: &str, detail: String) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("{op} {detail}"));
        if state.failing.contains(op) {
            return Err(CloudError::Unavailable(format!("injected failure in {op}")));
        }
        Ok(())
    }

    pub fn add_node(&self, name: &str, mem: u64, maxmem: u64, maxcpu: u32) {
        self.state().nodes.push(NodeStats {
            name: name.to_string(),
            mem,
            maxmem,
            maxcpu,
            status: Some("online".to_string()),
        });
    }

    pub fn set_storage_path(&self, storage: &str, path: &str) {
        self.state()
            .storage_paths
            .insert(storage.to_string(), path.to_string());
    }

    /// Insert a guest with a raw config.
    pub fn insert_guest(&self, id: u32, guest: FakeGuest) {
        self.state().guests.insert(id, guest);
    }

    pub fn add_template(
        &self,
        kind: InstanceKind,
        node: &str,
        id: u32,
        name: &str,
        description: &str,
        specs: Specs,
    ) {
        let mut config = BTreeMap::new();
        config.insert(kind.name_key().to_string(), Value::from(name));
        config.insert("description".to_string(), Value::from(description));
        config.insert("template".to_string(), Value::from(1));
        config.insert("cores".to_string(), Value::from(specs.cores));
        config.insert("memory".to_string(), Value::from(specs.memory));
        config.insert("swap".to_string(), Value::from(specs.swap));
        config.insert(
            kind.root_disk_key().to_string(),
            Value::from(format!("local:{id}/base-{id}-disk-0,size={}G", specs.disk_space)),
        );
        self.insert_guest(
            id,
            FakeGuest {
                kind,
                node: node.to_string(),
                config,
                status: Status::Stopped,
                firewall: BTreeMap::new(),
                ipsets: BTreeMap::new(),
            },
        );
    }

    pub fn guest(&self, id: u32) -> Option<FakeGuest> {
        self.state().guests.get(&id).cloned()
    }

    pub fn guest_ids(&self) -> Vec<u32> {
        self.state().guests.keys().copied().collect()
    }

    pub fn set_status(&self, id: u32, status: Status) {
        if let Some(guest) = self.state().guests.get_mut(&id) {
            guest.status = status;
        }
    }

    pub fn set_config_value(&self, id: u32, key: &str, value: Value) {
        if let Some(guest) = self.state().guests.get_mut(&id) {
            guest.config.insert(key.to_string(), value);
        }
    }

    /// Report the guest as locked for the next `reads` config reads.
    pub fn lock_for(&self, id: u32, reads: u32) {
        self.state().pending_locks.insert(id, reads);
    }

    pub fn clone_onto(&self, node: &str) {
        self.state().clone_node_override = Some(node.to_string());
    }

    /// Agent pings fail until this many have been attempted.
    pub fn agent_ready_after(&self, pings: u32) {
        self.state().agent_ready_after = pings;
    }

    pub fn fail_on(&self, op: &str) {
        self.state().failing.insert(op.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn agent_log(&self) -> Vec<String> {
        self.state().agent_log.clone()
    }

    fn with_guest<T>(
        &self,
        guest: &GuestRef,
        f: impl FnOnce(&mut FakeGuest) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state();
        match state.guests.get_mut(&guest.id) {
            Some(g) if g.kind == guest.kind && g.node == guest.node => f(g),
            _ => Err(CloudError::NotFound(format!(
                "Configuration file for {guest} does not exist"
            ))),
        }
    }
}

#[async_trait]
impl HypervisorApi for FakeHypervisor {
    async fn nodes(&self) -> Result<Vec<NodeStats>> {
        self.record("nodes", String::new())?;
        Ok(self.state().nodes.clone())
    }

    async fn guests(&self) -> Result<Vec<GuestResource>> {
        self.record("guests", String::new())?;
        Ok(self
            .state()
            .guests
            .iter()
            .map(|(id, g)| GuestResource {
                kind: g.kind,
                node: g.node.clone(),
                id: *id,
                name: g
                    .config
                    .get(g.kind.name_key())
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                template: g.config.get("template").and_then(|v| v.as_u64()) == Some(1),
            })
            .collect())
    }

    async fn guest_config(&self, guest: &GuestRef) -> Result<GuestConfig> {
        let mut config = self.with_guest(guest, |g| Ok(g.config.clone()))?;
        let mut state = self.state();
        if let Some(remaining) = state.pending_locks.get_mut(&guest.id) {
            if *remaining > 0 {
                *remaining -= 1;
                config.insert("lock".to_string(), Value::from("clone"));
            }
        }
        Ok(GuestConfig(config))
    }

    async fn update_guest_config(&self, guest: &GuestRef, params: &Params) -> Result<()> {
        self.record("update_config", format!("{guest} {params:?}"))?;
        self.with_guest(guest, |g| {
            for (key, value) in params {
                if value.is_empty() {
                    g.config.remove(key);
                } else {
                    g.config.insert(key.clone(), Value::from(value.as_str()));
                }
            }
            Ok(())
        })
    }

    async fn clone_guest(&self, template: &GuestRef, request: &CloneRequest) -> Result<()> {
        self.record("clone", format!("{template} -> {}", request.new_id))?;
        let mut source = self.with_guest(template, |g| Ok(g.clone()))?;

        let mut state = self.state();
        if state.guests.contains_key(&request.new_id) {
            return Err(CloudError::Unavailable(format!(
                "VM {} already exists",
                request.new_id
            )));
        }
        if let Some(node) = &state.clone_node_override {
            source.node = node.clone();
        }
        source.config.remove("template");
        source.config.insert(
            template.kind.name_key().to_string(),
            Value::from(request.name.as_str()),
        );
        source
            .config
            .insert("description".to_string(), Value::from(request.description.as_str()));
        source.status = Status::Stopped;
        state.guests.insert(request.new_id, source);
        Ok(())
    }

    async fn resize_disk(&self, guest: &GuestRef, disk: &str, size: &str) -> Result<()> {
        self.record("resize", format!("{guest} {disk} {size}"))?;
        let gb = size.trim_start_matches('+').trim_end_matches('G').to_string();
        self.with_guest(guest, |g| {
            let current = g
                .config
                .get(disk)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let volume = current.split(',').next().unwrap_or_default().to_string();
            g.config
                .insert(disk.to_string(), Value::from(format!("{volume},size={gb}G")));
            Ok(())
        })
    }

    async fn migrate_guest(&self, guest: &GuestRef, target_node: &str) -> Result<()> {
        self.record("migrate", format!("{guest} -> {target_node}"))?;
        self.with_guest(guest, |g| {
            g.node = target_node.to_string();
            Ok(())
        })
    }

    async fn guest_status(&self, guest: &GuestRef) -> Result<GuestStatus> {
        self.with_guest(guest, |g| {
            let running = g.status == Status::Running;
            Ok(GuestStatus {
                status: g.status,
                mem: if running { 512 * 1024 * 1024 } else { 0 },
                disk: 0,
                uptime: if running { 3600 } else { 0 },
            })
        })
    }

    async fn power(&self, guest: &GuestRef, action: PowerAction) -> Result<()> {
        self.record("power", format!("{guest} {}", action.as_str()))?;
        self.with_guest(guest, |g| {
            g.status = match action {
                PowerAction::Start => Status::Running,
                PowerAction::Stop | PowerAction::Shutdown => Status::Stopped,
            };
            Ok(())
        })
    }

    async fn set_firewall_options(&self, guest: &GuestRef, params: &Params) -> Result<()> {
        self.record("firewall_options", format!("{guest} {params:?}"))?;
        self.with_guest(guest, |g| {
            g.firewall
                .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        })
    }

    async fn ipset_entries(&self, guest: &GuestRef, name: &str) -> Result<Vec<String>> {
        self.with_guest(guest, |g| {
            g.ipsets
                .get(name)
                .map(|set| set.iter().cloned().collect())
                .ok_or_else(|| CloudError::NotFound(format!("no such IPSet '{name}'")))
        })
    }

    async fn create_ipset(&self, guest: &GuestRef, name: &str) -> Result<()> {
        self.record("create_ipset", format!("{guest} {name}"))?;
        self.with_guest(guest, |g| {
            if g.ipsets.contains_key(name) {
                return Err(CloudError::Unavailable(format!("IPSet '{name}' already exists")));
            }
            g.ipsets.insert(name.to_string(), BTreeSet::new());
            Ok(())
        })
    }

    async fn add_ipset_entry(&self, guest: &GuestRef, name: &str, cidr: &str) -> Result<()> {
        self.record("add_ipset_entry", format!("{guest} {name} {cidr}"))?;
        self.with_guest(guest, |g| {
            g.ipsets
                .get_mut(name)
                .ok_or_else(|| CloudError::NotFound(format!("no such IPSet '{name}'")))?
                .insert(cidr.to_string());
            Ok(())
        })
    }

    async fn delete_ipset_entry(&self, guest: &GuestRef, name: &str, cidr: &str) -> Result<()> {
        self.record("delete_ipset_entry", format!("{guest} {name} {cidr}"))?;
        self.with_guest(guest, |g| {
            if let Some(set) = g.ipsets.get_mut(name) {
                set.remove(cidr);
            }
            Ok(())
        })
    }

    async fn delete_ipset(&self, guest: &GuestRef, name: &str) -> Result<()> {
        self.record("delete_ipset", format!("{guest} {name}"))?;
        self.with_guest(guest, |g| {
            g.ipsets.remove(name);
            Ok(())
        })
    }

    async fn storage_path(&self, storage: &str) -> Result<String> {
        self.state()
            .storage_paths
            .get(storage)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(format!("storage '{storage}' does not exist")))
    }

    async fn delete_guest(&self, guest: &GuestRef) -> Result<()> {
        self.record("delete", format!("{guest}"))?;
        self.with_guest(guest, |_| Ok(()))?;
        self.state().guests.remove(&guest.id);
        Ok(())
    }

    async fn agent_ping(&self, guest: &GuestRef) -> Result<()> {
        require_agent(guest)?;
        self.with_guest(guest, |_| Ok(()))?;
        let mut state = self.state();
        state.agent_pings += 1;
        if state.agent_pings <= state.agent_ready_after {
            return Err(CloudError::Unavailable("QEMU guest agent is not running".to_string()));
        }
        Ok(())
    }

    async fn agent_exec(&self, guest: &GuestRef, command: &[&str]) -> Result<()> {
        require_agent(guest)?;
        self.record("agent_exec", format!("{guest} {}", command.join(" ")))?;
        self.state().agent_log.push(format!("exec {}", command.join(" ")));
        Ok(())
    }

    async fn agent_set_password(&self, guest: &GuestRef, username: &str, crypted: &str) -> Result<()> {
        require_agent(guest)?;
        self.record("agent_set_password", format!("{guest} {username}"))?;
        self.state()
            .agent_log
            .push(format!("set-password {username} {crypted}"));
        Ok(())
    }

    async fn agent_file_write(&self, guest: &GuestRef, path: &str, content: &str) -> Result<()> {
        require_agent(guest)?;
        self.record("agent_file_write", format!("{guest} {path}"))?;
        self.state()
            .agent_log
            .push(format!("file-write {path} {}", content.len()));
        Ok(())
    }
}

/// One command seen by [`RecordingShell`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub node: String,
    pub command: String,
    pub stdin: Vec<u8>,
}

#[derive(Default)]
struct ShellState {
    commands: Vec<RecordedCommand>,
    responses: Vec<(String, CommandOutput)>,
}

/// Remote shell that records commands and answers from canned responses.
///
/// A command matching no response succeeds with empty output.
#[derive(Default)]
pub struct RecordingShell {
    state: Mutex<ShellState>,
}

impl RecordingShell {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ShellState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Answer commands containing `needle` with the given exit status and output.
    pub fn respond(&self, needle: &str, status: i32, stdout: &str, stderr: &str) {
        self.state().responses.push((
            needle.to_string(),
            CommandOutput {
                command: String::new(),
                status: Some(status),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        ));
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state().commands.clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.state()
            .commands
            .iter()
            .map(|c| c.command.clone())
            .collect()
    }
}

#[async_trait]
impl RemoteShell for RecordingShell {
    async fn exec(&self, node: &str, command: &str) -> Result<CommandOutput> {
        self.exec_with_stdin(node, command, Vec::new()).await
    }

    async fn exec_with_stdin(
        &self,
        node: &str,
        command: &str,
        stdin: Vec<u8>,
    ) -> Result<CommandOutput> {
        let mut state = self.state();
        state.commands.push(RecordedCommand {
            node: node.to_string(),
            command: command.to_string(),
            stdin,
        });
        let mut output = state
            .responses
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or(CommandOutput {
                command: String::new(),
                status: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            });
        output.command = command.to_string();
        Ok(output)
    }
}
