//! Integration tests for the operator HTTP API.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::Value;
use tower::ServiceExt;

use warden_agent::admin;
use warden_agent::broker::{BrokerRegistry, MockBrokerFactory};
use warden_agent::endpoints::InMemoryEndpoints;
use warden_agent::spec::{
    BackendConfig, CommandSettings, FleetSpec, InstanceSpec, LifecycleSettings, SpecReload,
};
use warden_agent::{FleetManager, InstanceServices};

async fn app() -> Router {
    let mut brokers = BrokerRegistry::new();
    brokers.register("cmd", Arc::new(MockBrokerFactory::new()));
    let fleet = FleetManager::new(
        brokers,
        Arc::new(InMemoryEndpoints::new()),
        InstanceServices::default(),
    );

    let lobby = InstanceSpec {
        name: "lobby".to_string(),
        backend: BackendConfig::Cmd(CommandSettings {
            command: vec!["./start.sh".to_string()],
            working_dir: None,
            env: BTreeMap::new(),
            address: None,
        }),
        lifecycle: LifecycleSettings::default(),
    };
    fleet
        .handle_reload(SpecReload {
            old: fleet.current_spec(),
            new: Arc::new(FleetSpec {
                instances: vec![lobby],
                ..FleetSpec::default()
            }),
            allowed: true,
        })
        .await
        .unwrap();

    admin::router(fleet)
}

async fn send(app: &Router, method: &str, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_healthz() {
    let app = app().await;
    let (status, body) = send(&app, "GET", "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_list_and_get_instances() {
    let app = app().await;

    let (status, body) = send(&app, "GET", "/v1/instances").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"][0]["name"], "lobby");
    assert_eq!(body["items"][0]["status"], "removed");

    let (status, body) = send(&app, "GET", "/v1/instances/lobby").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "cmd");
}

#[tokio::test]
async fn test_unknown_instance_is_404() {
    let app = app().await;
    let (status, body) = send(&app, "GET", "/v1/instances/ghost").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, _) = send(&app, "POST", "/v1/instances/ghost/start").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_start_pin_and_stop() {
    let app = app().await;

    let (status, body) = send(&app, "POST", "/v1/instances/lobby/start").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");

    let (status, body) = send(&app, "POST", "/v1/instances/lobby/pin").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pinned"], true);

    let (status, body) = send(&app, "POST", "/v1/instances/lobby/stop").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "pinned");

    send(&app, "POST", "/v1/instances/lobby/unpin").await;
    let (status, body) = send(&app, "POST", "/v1/instances/lobby/stop").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");
}

#[tokio::test]
async fn test_reconcile_and_unknown_action() {
    let app = app().await;

    let (status, body) = send(&app, "POST", "/v1/instances/lobby/reconcile").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "lobby");

    let (status, body) = send(&app, "POST", "/v1/instances/lobby/explode").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "unknown_action");
}
