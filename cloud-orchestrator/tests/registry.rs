//! Forwarded ports, vhosts and the proxy document built from them.

mod common;

use cloud_core::CloudError;
use cloud_provider::{InstanceKind, VhostOptions};
use common::{test_cloud, PROXY_IP, SERVICE_DOMAIN};

#[tokio::test]
async fn test_port_claims_are_unique_cluster_wide() {
    let cloud = test_cloud();
    let mut x = cloud.create(InstanceKind::Container, "alice", "x").await;
    let mut y = cloud.create(InstanceKind::Container, "bob", "y").await;

    cloud.manager.add_port(&mut x, 20000, 22).await.unwrap();

    let err = cloud.manager.add_port(&mut y, 20000, 80).await.unwrap_err();
    assert!(matches!(err, CloudError::Unavailable(_)));

    cloud.manager.add_port(&mut y, 20001, 80).await.unwrap();

    let map = cloud.manager.port_forward_map().await.unwrap();
    assert_eq!(map.len(), 2);
    let target = map.get(20001).unwrap();
    assert_eq!(target.fqdn, y.fqdn);
    assert_eq!(target.address, y.primary_address());
    assert_eq!(target.internal, 80);
    assert_eq!(map.get(20000).unwrap().fqdn, x.fqdn);
}

#[tokio::test]
async fn test_remove_port_is_idempotent() {
    let cloud = test_cloud();
    let mut x = cloud.create(InstanceKind::Container, "alice", "x").await;

    cloud.manager.add_port(&mut x, 20000, 80).await.unwrap();
    assert!(cloud.manager.port_forward_map().await.unwrap().get(20000).is_some());

    cloud.manager.remove_port(&mut x, 20000).await.unwrap();
    assert!(cloud.manager.port_forward_map().await.unwrap().get(20000).is_none());

    let revision = x.metadata.revision;
    cloud.manager.remove_port(&mut x, 20000).await.unwrap();
    assert_eq!(x.metadata.revision, revision);
}

#[tokio::test]
async fn test_port_outside_range_is_refused() {
    let cloud = test_cloud();
    let mut x = cloud.create(InstanceKind::Container, "alice", "x").await;

    let err = cloud.manager.add_port(&mut x, 8080, 80).await.unwrap_err();
    assert!(matches!(err, CloudError::Unavailable(_)));
    assert!(x.metadata.network.ports.is_empty());
}

#[tokio::test]
async fn test_random_port_is_free_and_in_range() {
    let cloud = test_cloud();
    let mut x = cloud.create(InstanceKind::Container, "alice", "x").await;
    cloud.manager.add_port(&mut x, 16384, 22).await.unwrap();

    for _ in 0..20 {
        let port = cloud.manager.random_available_port().await.unwrap();
        assert!((16385..=32767).contains(&port));
    }
}

#[tokio::test]
async fn test_service_subdomain_vhost() {
    let cloud = test_cloud();
    let mut alice = cloud.create(InstanceKind::Container, "alice", "web").await;
    let mut bob = cloud.create(InstanceKind::Container, "bob", "web").await;
    let vhost = format!("alice.{SERVICE_DOMAIN}");

    cloud
        .manager
        .add_vhost(&mut alice, &format!("Alice.{SERVICE_DOMAIN}."), VhostOptions::default())
        .await
        .unwrap();
    assert!(alice.metadata.network.vhosts.contains_key(&vhost));
    assert!(cloud.reread(&alice).await.remarks.is_empty());

    // held validly by alice, so nobody else can claim it
    let err = cloud
        .manager
        .add_vhost(&mut bob, &vhost, VhostOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CloudError::AlreadyExists(_)));

    // bob may record his own subdomain; ownership is not checked on write
    cloud
        .manager
        .add_vhost(&mut bob, &format!("carol.{SERVICE_DOMAIN}"), VhostOptions::default())
        .await
        .unwrap();
    assert!(!cloud.reread(&bob).await.remarks.is_empty());
}

#[tokio::test]
async fn test_custom_domain_vhost_remarks() {
    let cloud = test_cloud();
    let mut alice = cloud.create(InstanceKind::Container, "alice", "web").await;

    cloud
        .manager
        .add_vhost(&mut alice, "blog.alice.dev", VhostOptions { port: 8080, https: false })
        .await
        .unwrap();
    let remarks = cloud.reread(&alice).await.remarks;
    assert!(!remarks.is_empty());
    assert!(remarks.iter().all(|r| r.contains("blog.alice.dev")));

    cloud.resolver.add_ip("blog.alice.dev", PROXY_IP);
    cloud.resolver.add_txt("_cloud.alice.dev", "alice");
    assert!(cloud.reread(&alice).await.remarks.is_empty());
}

#[tokio::test]
async fn test_vhost_errors() {
    let cloud = test_cloud();
    let mut alice = cloud.create(InstanceKind::Container, "alice", "web").await;

    let err = cloud
        .manager
        .add_vhost(&mut alice, "not a host", VhostOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CloudError::Unavailable(_)));

    let err = cloud
        .manager
        .remove_vhost(&mut alice, "missing.example.net")
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let fqdn = alice.fqdn.clone();
    cloud.manager.remove_vhost(&mut alice, &fqdn).await.unwrap();
    assert!(cloud.reread(&alice).await.metadata.network.vhosts.is_empty());
}

#[tokio::test]
async fn test_proxy_document_from_cluster() {
    let cloud = test_cloud();
    let mut alice = cloud.create(InstanceKind::Container, "alice", "web").await;
    cloud
        .manager
        .add_vhost(&mut alice, "blog.alice.dev", VhostOptions::default())
        .await
        .unwrap();
    cloud.manager.add_port(&mut alice, 20000, 22).await.unwrap();

    let first = cloud.manager.build_proxy_config(&[]).await.unwrap();
    let second = cloud.manager.build_proxy_config(&[]).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );

    let value = serde_json::to_value(&first).unwrap();
    let prefix = alice.fqdn.replace('.', "-");
    let own = format!("{prefix}-{prefix}");
    let address = alice.primary_address().unwrap();

    let routers = value["http"]["routers"].as_object().unwrap();
    assert_eq!(routers.len(), 1, "unverified custom domain is not routed");
    assert_eq!(routers[&own]["entryPoints"], serde_json::json!(["web", "websecure"]));
    assert_eq!(routers[&own]["tls"]["certResolver"], "service");
    assert_eq!(
        value["http"]["services"][&own]["loadBalancer"]["servers"][0]["url"],
        format!("http://{address}:80")
    );
    assert_eq!(
        value["tcp"]["services"][format!("{prefix}-20000-tcp")]["loadBalancer"]["servers"][0]
            ["address"],
        format!("{address}:22")
    );
    assert!(value["udp"]["routers"][format!("{prefix}-20000-udp")].is_object());

    cloud.resolver.add_ip("blog.alice.dev", PROXY_IP);
    cloud.resolver.add_txt("_cloud.alice.dev", "alice");
    let routed = cloud
        .manager
        .build_proxy_config(&["websecure".to_string()])
        .await
        .unwrap();
    let value = serde_json::to_value(&routed).unwrap();
    let custom = &value["http"]["routers"][format!("{prefix}-blog-alice-dev")];
    assert_eq!(custom["tls"]["certResolver"], "userdomain");
    assert_eq!(custom["entryPoints"], serde_json::json!(["websecure"]));
}
