//! End-to-end middleware flow against a mock gateway.
//!
//! The mock serves the Login, Task/Plan, plan status and plan deletion
//! endpoints with the payload shapes of the real gateway, reporting the
//! deployment active on the third status poll.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use netapp_client::{
    ClientConfig, Error, EventHandlers, MiddlewareClient, MiddlewareConfig, MonitorConfig,
    NetAppClient, RunTaskMode, RuntimeEndpoint, TaskDescriptor,
};

const KNOWN_TASK: &str = "22222222-2222-2222-2222-222222222222";

// =============================================================================
// Mock Middleware
// =============================================================================

#[derive(Clone)]
struct MockState {
    polls: Arc<AtomicU32>,
    deletes: Arc<AtomicU32>,
    fail_deployment: bool,
}

async fn login(Json(body): Json<Value>) -> Json<Value> {
    if body["Password"] == "pass" {
        Json(json!({"token": "valid-token"}))
    } else {
        Json(json!({"errors": ["Invalid credentials"]}))
    }
}

async fn plan(Json(body): Json<Value>) -> Json<Value> {
    if body["TaskId"] == KNOWN_TASK {
        Json(json!({"ActionPlanId": "plan-1"}))
    } else {
        Json(json!({"statusCode": 404, "message": "task not found"}))
    }
}

async fn plan_status(State(state): State<MockState>, Path(_plan): Path<String>) -> Json<Value> {
    let polls = state.polls.fetch_add(1, Ordering::SeqCst) + 1;
    let service = if state.fail_deployment {
        json!({"serviceStatus": "Failed"})
    } else if polls >= 3 {
        json!({"serviceStatus": "Active", "serviceUrl": "http://localhost:5800"})
    } else {
        json!({"serviceStatus": "Booting"})
    };
    Json(json!({"actionSequence": [{"Services": [service]}]}))
}

async fn plan_delete(State(state): State<MockState>, Path(_plan): Path<String>) -> StatusCode {
    if state.deletes.fetch_add(1, Ordering::SeqCst) == 0 {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn spawn_middleware(fail_deployment: bool) -> (String, MockState) {
    let state = MockState {
        polls: Arc::new(AtomicU32::new(0)),
        deletes: Arc::new(AtomicU32::new(0)),
        fail_deployment,
    };
    let app = Router::new()
        .route("/Login", post(login))
        .route("/Task/Plan", post(plan))
        .route(
            "/orchestrate/orchestrate/plan/:plan",
            get(plan_status).delete(plan_delete),
        )
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr.to_string(), state)
}

fn middleware_config(address: &str, password: &str) -> MiddlewareConfig {
    MiddlewareConfig {
        address: address.to_string(),
        user_id: "11111111-1111-1111-1111-111111111111".into(),
        password: password.into(),
    }
}

fn fast_client_config() -> ClientConfig {
    ClientConfig {
        ready_timeout: Some(Duration::from_secs(5)),
        monitor: MonitorConfig {
            poll_interval: Duration::from_millis(10),
            max_transient_failures: None,
        },
        ..ClientConfig::default()
    }
}

fn task() -> TaskDescriptor {
    TaskDescriptor {
        task_id: KNOWN_TASK.into(),
        robot_id: "33333333-3333-3333-3333-333333333333".into(),
        lock_resource_reuse: false,
    }
}

// =============================================================================
// Middleware Client
// =============================================================================

#[tokio::test]
async fn test_provisioning_flow() {
    let (addr, state) = spawn_middleware(false).await;
    let mut client = MiddlewareClient::new(middleware_config(&addr, "pass"));

    client.authenticate().await.unwrap();
    let plan = client.request_plan(&task()).await.unwrap();
    assert_eq!(plan.as_str(), "plan-1");

    let monitor = client
        .start_monitor(
            &plan,
            MonitorConfig {
                poll_interval: Duration::from_millis(10),
                max_transient_failures: None,
            },
            5896,
        )
        .unwrap();
    monitor
        .wait_until_ready(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(
        monitor.endpoint().unwrap(),
        RuntimeEndpoint::new("localhost", 5800)
    );
    assert!(state.polls.load(Ordering::SeqCst) >= 3);
    monitor.stop().await;

    client.delete_resources(Some(&plan)).await.unwrap();
    assert_eq!(state.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bad_credentials() {
    let (addr, _state) = spawn_middleware(false).await;
    let mut client = MiddlewareClient::new(middleware_config(&addr, "wrong"));

    let err = client.authenticate().await.unwrap_err();
    assert_matches!(err, Error::AuthenticationFailed(m) if m.contains("Invalid credentials"));

    // Authenticated operations stay unavailable
    let err = client.request_plan(&task()).await.unwrap_err();
    assert_matches!(err, Error::AuthenticationFailed(_));
}

#[tokio::test]
async fn test_unknown_task_rejected() {
    let (addr, _state) = spawn_middleware(false).await;
    let mut client = MiddlewareClient::new(middleware_config(&addr, "pass"));
    client.authenticate().await.unwrap();

    let unknown = TaskDescriptor {
        task_id: "00000000-0000-0000-0000-000000000000".into(),
        ..task()
    };
    let err = client.request_plan(&unknown).await.unwrap_err();
    assert_matches!(err, Error::PlanRequestFailed(m) if m.contains("task not found"));
}

#[tokio::test]
async fn test_delete_is_idempotent() {
    let (addr, state) = spawn_middleware(false).await;
    let mut client = MiddlewareClient::new(middleware_config(&addr, "pass"));
    client.authenticate().await.unwrap();
    let plan = client.request_plan(&task()).await.unwrap();

    // The second delete hits a missing plan and still succeeds
    client.delete_resources(Some(&plan)).await.unwrap();
    client.delete_resources(Some(&plan)).await.unwrap();
    assert_eq!(state.deletes.load(Ordering::SeqCst), 2);

    // No plan, no request
    client.delete_resources(None).await.unwrap();
    assert_eq!(state.deletes.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Facade
// =============================================================================

#[tokio::test]
async fn test_run_task_until_ready() {
    let (addr, state) = spawn_middleware(false).await;
    let mut client = NetAppClient::new(
        middleware_config(&addr, "pass"),
        fast_client_config(),
        EventHandlers::new(),
    );

    client.connect_to_middleware().await.unwrap();
    client
        .run_task(&task(), RunTaskMode::Wait, json!({}))
        .await
        .unwrap();
    assert!(client.plan().is_some());

    client.release_resources().await.unwrap();
    assert!(client.plan().is_none());
    assert_eq!(state.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disconnect_releases_resources() {
    let (addr, state) = spawn_middleware(false).await;
    let mut client = NetAppClient::new(
        middleware_config(&addr, "pass"),
        fast_client_config(),
        EventHandlers::new(),
    );

    client.connect_to_middleware().await.unwrap();
    client
        .run_task(&task(), RunTaskMode::Wait, json!({}))
        .await
        .unwrap();
    assert!(client.plan().is_some());

    // Normal disconnect deletes the provisioned plan
    client.disconnect().await;
    assert_eq!(state.deletes.load(Ordering::SeqCst), 1);
    assert!(client.plan().is_none());

    // Disconnecting again issues no further delete
    client.disconnect().await;
    assert_eq!(state.deletes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_run_task_compensates_on_failed_deployment() {
    let (addr, state) = spawn_middleware(true).await;
    let mut client = NetAppClient::new(
        middleware_config(&addr, "pass"),
        fast_client_config(),
        EventHandlers::new(),
    );

    client.connect_to_middleware().await.unwrap();
    let err = client
        .run_task(&task(), RunTaskMode::Wait, json!({}))
        .await
        .unwrap_err();
    assert_matches!(err, Error::ResourceNotReady(_));

    // The provisioned plan was deleted before the error surfaced
    assert_eq!(state.deletes.load(Ordering::SeqCst), 1);
    assert!(client.plan().is_none());
}

#[tokio::test]
async fn test_deploy_only_returns_immediately() {
    let (addr, state) = spawn_middleware(false).await;
    let mut client = NetAppClient::new(
        middleware_config(&addr, "pass"),
        fast_client_config(),
        EventHandlers::new(),
    );

    client.connect_to_middleware().await.unwrap();
    client
        .run_task(&task(), RunTaskMode::DeployOnly, json!({}))
        .await
        .unwrap();
    assert!(client.plan().is_some());
    assert_eq!(state.deletes.load(Ordering::SeqCst), 0);
    client.release_resources().await.unwrap();
}
