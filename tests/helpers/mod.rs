#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;

use orchest_api::config::Config;
use orchest_api::cra::fake::FakeContainerRuntime;
use orchest_api::store::AppState;
use orchest_api::taskbus::TaskRegistry;

/// Build a test `AppState` over the migrated `pool` with a `FakeContainerRuntime`
/// standing in for the Docker engine (no real container runtime required).
pub fn test_state(pool: PgPool) -> (AppState, FakeContainerRuntime) {
    let cra = FakeContainerRuntime::new();
    let config = Config {
        listen: "127.0.0.1:0".into(),
        database_url: "postgres://localhost/test".into(),
        dispatch_poll_interval: Duration::from_millis(50),
        gc_sweep_interval_minutes: 15,
        telemetry_interval_minutes: 60,
        examples_poll_interval_minutes: 60 * 24,
        cra_call_timeout: Duration::from_secs(5),
        cra_retries: 1,
    };

    let state = AppState {
        pool,
        cra: Arc::new(cra.clone()),
        tasks: Arc::new(TaskRegistry::new()),
        config: Arc::new(config),
    };

    (state, cra)
}

/// Build the full API router with the given state.
pub fn test_router(state: AppState) -> Router {
    orchest_api::api::router().with_state(state)
}

/// Seed a project row, returning its uuid.
pub async fn seed_project(pool: &PgPool) -> Uuid {
    let project_uuid = Uuid::new_v4();
    sqlx::query!(
        "INSERT INTO projects (uuid, path) VALUES ($1, $2)",
        project_uuid,
        format!("/projects/{project_uuid}"),
    )
    .execute(pool)
    .await
    .expect("insert project");
    project_uuid
}

pub async fn get_json(app: &Router, path: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    (status, body_json(resp).await)
}

pub async fn post_json(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    (status, body_json(resp).await)
}

pub async fn put_json(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("PUT")
        .uri(path)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    (status, body_json(resp).await)
}

pub async fn delete_json(app: &Router, path: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("DELETE")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    (status, body_json(resp).await)
}

async fn body_json(resp: axum::http::Response<Body>) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}
