//! Shared setup for the HTTP tests: an app backed by the in-memory
//! hypervisor with one node and one container template.

#![allow(dead_code)]

use axum::{body::Body, http::Request, response::Response, Router};
use cloud_api::{create_app, AppState};
use cloud_config::CloudConfig;
use cloud_orchestrator::{Backends, InstanceManager, StaticResolver};
use cloud_provider::mock::{FakeHypervisor, RecordingShell};
use cloud_provider::{
    encode_template_metadata, DiskFormat, InstanceKind, RequestDetail, Specs, TemplateMetadata,
};
use serde::de::DeserializeOwned;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tempfile::TempDir;

pub const BASE_FQDN: &str = "cloud.example.org";
const DISK_SUM: &str = "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae";
const GB: u64 = 1 << 30;

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub manager: InstanceManager,
    pub hypervisor: Arc<FakeHypervisor>,
    _dir: TempDir,
}

fn test_config(dir: &TempDir) -> CloudConfig {
    let mut config = CloudConfig::default();
    config.network.base_fqdn = BASE_FQDN.to_string();
    config.network.subnet = "10.60.0.0/24".to_string();
    config.network.gateway = Some(Ipv4Addr::new(10, 60, 0, 1));
    config.hypervisor.instance_storage = "local".to_string();
    config.hypervisor.snippet_storage = "local".to_string();
    config.requests.signing_secret = "api-secret".to_string();
    config.requests.token_ttl_secs = 3600;
    config.timeouts.lock_secs = 1;
    config.timeouts.create_secs = 1;
    config.timeouts.migrate_secs = 1;
    config.timeouts.agent_secs = 1;
    config.timeouts.poll_interval_ms = 1;
    config.allocation_lock_path = dir.path().join("allocation.lock");
    config
}

pub fn test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let hypervisor = Arc::new(FakeHypervisor::new());
    hypervisor.add_node("pve1", 2 * GB, 32 * GB, 8);
    hypervisor.set_storage_path("local", "/var/lib/vz");
    let metadata = encode_template_metadata(&TemplateMetadata {
        title: "Alpine".to_string(),
        subtitle: "3.20".to_string(),
        description: "Small and quick".to_string(),
        logo_url: String::new(),
        disk_url: "https://images.example.org/alpine.tar.gz".to_string(),
        disk_fallback_url: None,
        disk_sha256sum: DISK_SUM.to_string(),
        disk_format: DiskFormat::TarGz,
    })
    .unwrap();
    hypervisor.add_template(
        InstanceKind::Container,
        "pve1",
        900,
        &format!("alpine.container.template.{BASE_FQDN}"),
        &metadata,
        Specs {
            cores: 1,
            memory: 512,
            disk_space: 4,
            swap: 0,
        },
    );

    let shell = Arc::new(RecordingShell::new());
    shell.respond("sha256sum", 0, &format!("{DISK_SUM}  disk"), "");

    let backends = Backends {
        hypervisor: hypervisor.clone(),
        shell,
        resolver: Arc::new(StaticResolver::new()),
    };
    let manager = InstanceManager::new(config, backends).unwrap();
    let state = AppState::new(manager.clone());
    let app = create_app(state.clone());

    TestApp {
        app,
        state,
        manager,
        hypervisor,
        _dir: dir,
    }
}

impl TestApp {
    pub fn token(&self, owner: &str, hostname: &str) -> String {
        self.manager
            .signer()
            .issue(
                owner,
                hostname,
                InstanceKind::Container,
                RequestDetail {
                    template_id: "alpine".to_string(),
                    reason: "thesis".to_string(),
                },
            )
            .unwrap()
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn extract_json_body<T: DeserializeOwned>(response: Response) -> T {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}
