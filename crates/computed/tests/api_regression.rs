//! API regression tests.
//!
//! Drives the full router against an in-memory store: resource lifecycles,
//! error mapping, ownership checks and NDJSON streams.

use std::collections::BTreeMap;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, Response, StatusCode};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};
use tower::ServiceExt;

use compute_api::build_router;
use compute_core::config::{InstanceTypeConfig, MachineImageConfig, QuotaConfig};
use compute_core::{ControlPlaneConfig, InstanceCategory};
use compute_quota::{QuotaEvaluator, QuotaSource};
use compute_service::{ComputeServices, ServiceContext};
use compute_state::StateStore;

const ACCOUNT: &str = "123456789012";

fn test_router(instance_limit: u64) -> Router {
    let config = ControlPlaneConfig {
        instance_types: vec![InstanceTypeConfig {
            name: "vm-small".into(),
            category: InstanceCategory::VirtualMachine,
        }],
        machine_images: vec![MachineImageConfig {
            name: "ubuntu-22.04".into(),
            instance_categories: Vec::new(),
            instance_types: Vec::new(),
        }],
        quota: QuotaConfig {
            system_default: BTreeMap::from([
                ("instances/vm-small".to_string(), instance_limit),
                ("load_balancers".to_string(), 1),
                ("load_balancer_listeners".to_string(), 2),
                ("load_balancer_source_ips".to_string(), 2),
            ]),
            ..Default::default()
        },
        ..Default::default()
    };
    let quota = QuotaEvaluator::new(QuotaSource::from_config(&config.quota));
    let store = StateStore::open_in_memory().unwrap();
    build_router(ComputeServices::new(ServiceContext::new(store, quota, config)))
}

fn account_uri(path: &str) -> String {
    format!("/api/v1/cloudaccounts/{ACCOUNT}{path}")
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> Response<Body> {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    router.clone().oneshot(req).await.unwrap()
}

async fn json_body(resp: Response<Body>) -> Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn ndjson_lines(resp: Response<Body>) -> Vec<Value> {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    std::str::from_utf8(&bytes)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

async fn put_default_vnet(router: &Router) {
    let resp = send(
        router,
        "PUT",
        &account_uri("/vnets"),
        Some(json!({
            "name": "default",
            "spec": {"region": "us-dev-1", "availability_zone": "us-dev-1a", "prefix_length": 24}
        })),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
}

fn instance_body(name: &str) -> Value {
    json!({
        "metadata": {"name": name, "labels": {"team": "infra"}},
        "spec": {
            "availability_zone": "us-dev-1a",
            "instance_type": "vm-small",
            "machine_image": "ubuntu-22.04",
            "interfaces": [{"name": "eth0", "vnet": "default"}],
            "user_data": "#cloud-config"
        }
    })
}

fn ed25519_key() -> String {
    let mut blob = Vec::new();
    blob.extend_from_slice(&11u32.to_be_bytes());
    blob.extend_from_slice(b"ssh-ed25519");
    blob.extend_from_slice(&32u32.to_be_bytes());
    blob.extend_from_slice(&[7u8; 32]);
    format!("ssh-ed25519 {} alice@laptop", STANDARD.encode(blob))
}

// ── Instances ──────────────────────────────────────────────────

#[tokio::test]
async fn instance_create_get_and_list() {
    let router = test_router(5);
    put_default_vnet(&router).await;

    let resp = send(&router, "POST", &account_uri("/instances"), Some(instance_body("vm-1"))).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created = json_body(resp).await;
    assert_eq!(created["success"], true);
    assert_eq!(created["data"]["spec"]["user_data"], "OMITTED");
    assert_eq!(created["data"]["status"]["phase"], "Provisioning");
    let id = created["data"]["metadata"]["resource_id"].as_str().unwrap().to_string();

    let resp = send(&router, "GET", &account_uri(&format!("/instances/id/{id}")), None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["data"]["metadata"]["name"], "vm-1");

    let resp = send(&router, "GET", &account_uri("/instances?team=infra"), None).await;
    assert_eq!(json_body(resp).await["data"].as_array().unwrap().len(), 1);
    let resp = send(&router, "GET", &account_uri("/instances?team=web"), None).await;
    assert!(json_body(resp).await["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn errors_map_to_http_status() {
    let router = test_router(2);
    put_default_vnet(&router).await;

    let resp = send(&router, "GET", &account_uri("/instances/name/missing"), None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body = json_body(resp).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "NotFound");

    let resp = send(&router, "GET", "/api/v1/cloudaccounts/not-an-account/instances", None).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = send(&router, "GET", &account_uri("/instances/label/vm-1"), None).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = send(&router, "POST", &account_uri("/instances"), Some(instance_body("vm-1"))).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let resp = send(&router, "POST", &account_uri("/instances"), Some(instance_body("vm-1"))).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = send(&router, "POST", &account_uri("/instances"), Some(instance_body("vm-2"))).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    // Quota of two is used up.
    let resp = send(&router, "POST", &account_uri("/instances"), Some(instance_body("vm-3"))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = json_body(resp).await;
    assert!(body["error"]["message"].as_str().unwrap().contains("quota exceeded"));
}

#[tokio::test]
async fn stale_resource_version_is_a_conflict() {
    let router = test_router(5);
    put_default_vnet(&router).await;
    let resp = send(&router, "POST", &account_uri("/instances"), Some(instance_body("vm-1"))).await;
    let version = json_body(resp).await["data"]["metadata"]["resource_version"]
        .as_u64()
        .unwrap();

    let update = json!({"resource_version": version, "ssh_public_key_names": []});
    let resp = send(&router, "PUT", &account_uri("/instances/name/vm-1"), Some(update.clone())).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = send(&router, "PUT", &account_uri("/instances/name/vm-1"), Some(update)).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn delete_then_finalize() {
    let router = test_router(5);
    put_default_vnet(&router).await;
    send(&router, "POST", &account_uri("/instances"), Some(instance_body("vm-1"))).await;

    let resp = send(&router, "DELETE", &account_uri("/instances/name/vm-1"), None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = send(&router, "GET", &account_uri("/instances/name/vm-1"), None).await;
    let body = json_body(resp).await;
    assert!(body["data"]["metadata"]["deletion_timestamp"].is_string());

    let finalizer = format!("/api/v1/private/cloudaccounts/{ACCOUNT}/instances/name/vm-1/finalizer");
    let resp = send(&router, "DELETE", &finalizer, None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = send(&router, "GET", &account_uri("/instances/name/vm-1"), None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_callback_is_private() {
    let router = test_router(5);
    put_default_vnet(&router).await;
    send(&router, "POST", &account_uri("/instances"), Some(instance_body("vm-1"))).await;

    let uri = format!("/api/v1/private/cloudaccounts/{ACCOUNT}/instances/name/vm-1/status");
    let resp = send(
        &router,
        "PUT",
        &uri,
        Some(json!({"status": {"phase": "Ready", "message": "Instance is running"}})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    // Private responses are not masked.
    assert_eq!(body["data"]["spec"]["user_data"], "#cloud-config");
    assert_eq!(body["data"]["status"]["phase"], "Ready");
}

// ── Instance groups ────────────────────────────────────────────

#[tokio::test]
async fn instance_group_lifecycle() {
    let router = test_router(10);
    put_default_vnet(&router).await;

    let group = json!({
        "name": "workers",
        "instance_count": 2,
        "instance_spec": instance_body("ignored")["spec"],
    });
    let resp = send(&router, "POST", &account_uri("/instancegroups"), Some(group)).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(json_body(resp).await["data"]["instance_count"], 2);

    let resp = send(
        &router,
        "POST",
        &account_uri("/instancegroups/workers/scale-up"),
        Some(json!({"desired_count": 3})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let status = json_body(resp).await;
    assert_eq!(status["data"]["current_count"], 3);
    assert_eq!(status["data"]["new_members"], json!(["workers-2"]));

    // Members cannot be deleted through the plain instance route.
    let resp = send(&router, "DELETE", &account_uri("/instances/name/workers-0"), None).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = send(
        &router,
        "DELETE",
        &account_uri("/instancegroups/workers/instances/name/workers-0"),
        None,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = send(&router, "DELETE", &account_uri("/instancegroups/workers"), None).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

// ── Networking ─────────────────────────────────────────────────

#[tokio::test]
async fn load_balancer_quota_and_update() {
    let router = test_router(5);
    let lb = |name: &str| {
        json!({
            "metadata": {"name": name},
            "spec": {
                "listeners": [{
                    "port": 443,
                    "pool": {"port": 8443, "monitor": "tcp", "members": {"instance_selectors": {"app": "web"}}}
                }],
                "security": {"source_ips": ["any"]}
            }
        })
    };

    let resp = send(&router, "POST", &account_uri("/loadbalancers"), Some(lb("lb-1"))).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let resp = send(&router, "POST", &account_uri("/loadbalancers"), Some(lb("lb-2"))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // An update must carry both listeners and security.
    let resp = send(
        &router,
        "PUT",
        &account_uri("/loadbalancers/name/lb-1"),
        Some(json!({"listeners": lb("x")["spec"]["listeners"]})),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn vnet_in_use_cannot_be_deleted() {
    let router = test_router(5);
    put_default_vnet(&router).await;
    send(&router, "POST", &account_uri("/instances"), Some(instance_body("vm-1"))).await;

    let resp = send(&router, "DELETE", &account_uri("/vnets/name/default"), None).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["error"]["code"], "FailedPrecondition");
}

#[tokio::test]
async fn ssh_key_owner_controls_delete() {
    let router = test_router(5);
    let req = Request::builder()
        .method("POST")
        .uri(account_uri("/sshpublickeys"))
        .header("content-type", "application/json")
        .header("x-user-email", "alice@example.com")
        .body(Body::from(
            serde_json::to_vec(&json!({
                "metadata": {"name": "laptop"},
                "ssh_public_key": ed25519_key(),
            }))
            .unwrap(),
        ))
        .unwrap();
    let resp = router.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created = json_body(resp).await;
    assert_eq!(created["data"]["spec"]["owner_email"], "alice@example.com");
    assert_eq!(created["data"]["allow_delete"], true);

    let delete_as = |email: &'static str| {
        Request::builder()
            .method("DELETE")
            .uri(account_uri("/sshpublickeys/name/laptop"))
            .header("x-user-email", email)
            .body(Body::empty())
            .unwrap()
    };
    let resp = router.clone().oneshot(delete_as("bob@example.com")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let resp = router.clone().oneshot(delete_as("alice@example.com")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

// ── Streams ────────────────────────────────────────────────────

#[tokio::test]
async fn snapshot_stream_is_ndjson_with_bookmark() {
    let router = test_router(5);
    put_default_vnet(&router).await;
    send(&router, "POST", &account_uri("/instances"), Some(instance_body("vm-1"))).await;
    send(&router, "POST", &account_uri("/instances"), Some(instance_body("vm-2"))).await;

    let resp = send(&router, "GET", &account_uri("/instances/stream"), None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()["content-type"],
        compute_watch::ndjson::CONTENT_TYPE
    );
    let lines = ndjson_lines(resp).await;
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["type"], "Updated");
    assert_eq!(lines[0]["object"]["spec"]["user_data"], "OMITTED");
    assert_eq!(lines[2]["type"], "Bookmark");
    assert!(lines[2]["resource_version"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn private_vnet_stream_spans_accounts() {
    let router = test_router(5);
    put_default_vnet(&router).await;

    let resp = send(&router, "GET", "/api/v1/private/vnets/stream", None).await;
    let lines = ndjson_lines(resp).await;
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["object"]["metadata"]["name"], "default");
}

#[tokio::test]
async fn watch_from_future_version_is_rejected() {
    let router = test_router(5);
    let resp = send(
        &router,
        "GET",
        "/api/v1/private/instances/watch?resource_version=999999",
        None,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
