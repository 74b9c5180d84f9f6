//! Integration tests for the HTTP endpoints.

mod common;

use axum::http::StatusCode;
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`

#[tokio::test]
async fn test_health_check() {
    let t = common::test_app();

    let response = t.app.oneshot(common::get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = common::extract_json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "cloud-api");
}

#[tokio::test]
async fn test_proxy_config_without_instances_is_empty() {
    let t = common::test_app();

    let response = t.app.oneshot(common::get("/proxy/config")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = common::extract_json_body(response).await;
    assert_eq!(body, json!({}));
}

#[tokio::test]
async fn test_proxy_config_lists_instance_vhosts() {
    let t = common::test_app();
    let token = t.token("alice", "web");
    let provisioned = t.manager.approve_request(&token).await.unwrap();
    let fqdn = provisioned.instance.fqdn.clone();

    let response = t
        .app
        .oneshot(common::get("/proxy/config?entrypoints=https"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = common::extract_json_body(response).await;
    let routers = body["http"]["routers"].as_object().unwrap();
    assert_eq!(routers.len(), 1);
    let router = routers.values().next().unwrap();
    assert_eq!(router["entryPoints"], json!(["https"]));
    assert_eq!(router["rule"], format!("Host(`{fqdn}`)"));
}

#[tokio::test]
async fn test_approve_provisions_in_background() {
    let t = common::test_app();
    let token = t.token("alice", "web");

    let response = t
        .app
        .clone()
        .oneshot(common::post_json(
            "/api/v1/requests/approve",
            json!({ "token": token }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body: Value = common::extract_json_body(response).await;
    assert_eq!(body["decision"], "approved");
    assert_eq!(body["owner"], "alice");
    assert_eq!(body["template_id"], "alpine");

    t.state.drain_provisioning().await;
    let created = t.manager.read_all_instances(false).await.unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created.values().next().unwrap().hostname, "web");
}

#[tokio::test]
async fn test_approve_with_bad_token_is_rejected() {
    let t = common::test_app();

    let response = t
        .app
        .oneshot(common::post_json(
            "/api/v1/requests/approve",
            json!({ "token": "not-a-token" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body: Value = common::extract_json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("malformed"));
    assert!(t.hypervisor.calls().iter().all(|c| !c.starts_with("clone")));
}

#[tokio::test]
async fn test_deny_returns_request_summary() {
    let t = common::test_app();
    let token = t.token("bob", "lab");

    let response = t
        .app
        .oneshot(common::post_json(
            "/api/v1/requests/deny",
            json!({ "token": token }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = common::extract_json_body(response).await;
    assert_eq!(body["decision"], "denied");
    assert_eq!(body["hostname"], "lab");
    assert_eq!(body["kind"], "container");
    assert!(t.manager.read_all_instances(false).await.unwrap().is_empty());
}
