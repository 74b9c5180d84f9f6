#![allow(dead_code)]

use cloud_config::CloudConfig;
use cloud_orchestrator::{Backends, InstanceManager, StaticResolver};
use cloud_provider::mock::{FakeHypervisor, RecordingShell};
use cloud_provider::{
    encode_template_metadata, DiskFormat, Instance, InstanceKind, RequestDetail, Specs,
    TemplateMetadata,
};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tempfile::TempDir;

pub const BASE_FQDN: &str = "cloud.example.org";
pub const SERVICE_DOMAIN: &str = "users.example.org";
pub const PROXY_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10));
pub const DISK_SUM: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

const GB: u64 = 1 << 30;

pub struct TestCloud {
    pub hypervisor: Arc<FakeHypervisor>,
    pub shell: Arc<RecordingShell>,
    pub resolver: Arc<StaticResolver>,
    pub manager: InstanceManager,
    _dir: TempDir,
}

pub fn test_config(dir: &TempDir) -> CloudConfig {
    let mut config = CloudConfig::default();
    config.network.base_fqdn = BASE_FQDN.to_string();
    config.network.subnet = "10.50.0.0/24".to_string();
    config.network.gateway = Some(Ipv4Addr::new(10, 50, 0, 1));
    config.network.vhosts.service_subdomain.base_domain = SERVICE_DOMAIN.to_string();
    config.network.vhosts.user_domain.allowed_a_aaaa = vec![PROXY_IP];
    config.hypervisor.resource_pool = Some("cloud".to_string());
    config.hypervisor.instance_storage = "local".to_string();
    config.hypervisor.snippet_storage = "local".to_string();
    config.requests.signing_secret = "integration-secret".to_string();
    config.requests.token_ttl_secs = 3600;
    config.timeouts.lock_secs = 1;
    config.timeouts.create_secs = 1;
    config.timeouts.migrate_secs = 1;
    config.timeouts.agent_secs = 1;
    config.timeouts.poll_interval_ms = 1;
    config.allocation_lock_path = dir.path().join("allocation.lock");
    config
}

pub fn template_specs() -> Specs {
    Specs {
        cores: 2,
        memory: 1024,
        disk_space: 8,
        swap: 512,
    }
}

fn template_metadata(format: DiskFormat) -> String {
    encode_template_metadata(&TemplateMetadata {
        title: "Debian 12".to_string(),
        subtitle: "Bookworm".to_string(),
        description: "Stable Debian".to_string(),
        logo_url: String::new(),
        disk_url: format!("https://images.example.org/debian12.{}", format.extension()),
        disk_fallback_url: None,
        disk_sha256sum: DISK_SUM.to_string(),
        disk_format: format,
    })
    .unwrap()
}

/// Two nodes: `pve1` is busy and holds the templates, `pve2` is idle and
/// wins placement.
pub fn test_cloud() -> TestCloud {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);

    let hypervisor = Arc::new(FakeHypervisor::new());
    hypervisor.add_node("pve1", 12 * GB, 16 * GB, 8);
    hypervisor.add_node("pve2", 2 * GB, 64 * GB, 16);
    hypervisor.set_storage_path("local", "/var/lib/vz");
    hypervisor.add_template(
        InstanceKind::Container,
        "pve1",
        900,
        &format!("debian12.container.template.{BASE_FQDN}"),
        &template_metadata(DiskFormat::TarGz),
        template_specs(),
    );
    hypervisor.add_template(
        InstanceKind::Vps,
        "pve1",
        901,
        &format!("debian12.vps.template.{BASE_FQDN}"),
        &template_metadata(DiskFormat::Qcow2),
        template_specs(),
    );
    hypervisor.add_template(
        InstanceKind::Container,
        "pve1",
        902,
        &format!("mismatched.container.template.{BASE_FQDN}"),
        &template_metadata(DiskFormat::Qcow2),
        template_specs(),
    );

    let shell = Arc::new(RecordingShell::new());
    shell.respond("sha256sum", 0, &format!("{DISK_SUM}  disk"), "");

    let resolver = Arc::new(StaticResolver::new());

    let backends = Backends {
        hypervisor: hypervisor.clone(),
        shell: shell.clone(),
        resolver: resolver.clone(),
    };
    let manager = InstanceManager::new(config, backends).unwrap();

    TestCloud {
        hypervisor,
        shell,
        resolver,
        manager,
        _dir: dir,
    }
}

pub fn detail(template_id: &str) -> RequestDetail {
    RequestDetail {
        template_id: template_id.to_string(),
        reason: "coursework".to_string(),
    }
}

impl TestCloud {
    pub async fn create(&self, kind: InstanceKind, owner: &str, hostname: &str) -> Instance {
        self.manager
            .create_instance(kind, owner, hostname, detail("debian12"))
            .await
            .unwrap()
            .instance
    }

    pub async fn reread(&self, instance: &Instance) -> Instance {
        self.manager
            .read_instance(instance.kind, instance.owner(), &instance.hostname)
            .await
            .unwrap()
    }
}
