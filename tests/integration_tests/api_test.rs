//! Status API tests
//!
//! Drives the full router, layers included, with `tower::ServiceExt::oneshot`.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use kettle::bus::MemoryBus;
use kettle::coordinator::{Coordinator, CoordinatorServer, Role, ServerConfig};
use kettle::lock::MemoryLock;

use crate::common::{coordinator, spawn_workers, stop_workers, wait_for_role, GROUP};

fn router(coordinator: &Arc<Coordinator>) -> Router {
    CoordinatorServer::new(ServerConfig::default(), Arc::clone(coordinator)).build_router()
}

async fn call(router: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };

    let response = router.oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn started_master(bus: &MemoryBus) -> Arc<Coordinator> {
    let master = Arc::new(coordinator("api", Arc::new(MemoryLock::new()), bus));
    master.start();
    wait_for_role(&master, Role::Master, Duration::from_millis(200)).await;
    master
}

// ============================================================================
// Read-only Endpoints
// ============================================================================

#[tokio::test]
async fn test_health() {
    let node = Arc::new(coordinator("api", Arc::new(MemoryLock::new()), &MemoryBus::new()));

    let (status, body) = call(router(&node), Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "healthy");
}

#[tokio::test]
async fn test_role_reports_identity() {
    let bus = MemoryBus::new();
    let idle = Arc::new(coordinator("idle", Arc::new(MemoryLock::new()), &bus));

    let (status, body) = call(router(&idle), Method::GET, "/api/role", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["name"], GROUP);
    assert_eq!(body["data"]["instance_id"], "idle");
    assert_eq!(body["data"]["role"], "candidate");
    assert!(body["data"].get("fencing_token").is_none());

    let master = started_master(&bus).await;
    let (_, body) = call(router(&master), Method::GET, "/api/role", None).await;
    assert_eq!(body["data"]["role"], "master");
    assert!(body["data"]["fencing_token"].as_u64().unwrap() >= 1);

    master.stop().await;
}

#[tokio::test]
async fn test_roster_starts_empty() {
    let node = Arc::new(coordinator("api", Arc::new(MemoryLock::new()), &MemoryBus::new()));

    let (status, body) = call(router(&node), Method::GET, "/api/roster", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["workers"], json!([]));
    assert_eq!(body["data"]["stats"]["total_workers"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let node = Arc::new(coordinator("api", Arc::new(MemoryLock::new()), &MemoryBus::new()));

    let response = router(&node)
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ============================================================================
// Broadcast Endpoints
// ============================================================================

#[tokio::test]
async fn test_broadcasts_conflict_when_not_master() {
    let node = Arc::new(coordinator("api", Arc::new(MemoryLock::new()), &MemoryBus::new()));

    let (status, body) = call(router(&node), Method::POST, "/api/discover", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);

    let (status, _) = call(
        router(&node),
        Method::POST,
        "/api/start-work",
        Some(json!({ "payload": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_discover_and_start_work_as_master() {
    let bus = MemoryBus::new();
    let workers = spawn_workers(&bus, &["w1", "w2"]).await;
    let master = started_master(&bus).await;

    let (status, body) = call(
        router(&master),
        Method::POST,
        "/api/discover",
        Some(json!({ "timeout_ms": 200 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body["data"]["workers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|w| w["worker_name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["w1", "w2"]);
    assert_eq!(body["data"]["stats"]["reporting"], 2);

    let (status, body) = call(
        router(&master),
        Method::POST,
        "/api/start-work",
        Some(json!({ "payload": "job-1", "timeout_ms": 200 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["acknowledged"], json!(["w1", "w2"]));

    let (_, body) = call(router(&master), Method::GET, "/api/roster", None).await;
    assert_eq!(body["data"]["stats"]["active"], 2);

    master.stop().await;
    stop_workers(workers).await;
}
