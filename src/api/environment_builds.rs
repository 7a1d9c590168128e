//! `/environment-builds/` HTTP facade (§6, §4.2.1).

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::controllers::environment_build::{self, BuildRequest};
use crate::error::ApiError;
use crate::status::{Status, StatusUpdate, update_status_db};
use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/environment-builds/", get(list).post(create))
        .route(
            "/environment-builds/{uuid}",
            get(get_one).put(put_status).delete(delete_one),
        )
        .route(
            "/environment-builds/most-recent/{project_uuid}",
            get(most_recent_for_project),
        )
        .route(
            "/environment-builds/most-recent/{project_uuid}/{env_uuid}",
            get(most_recent_for_env),
        )
}

#[derive(Deserialize)]
struct CreateBody {
    environment_build_requests: Vec<BuildRequest>,
}

#[derive(Serialize)]
struct CreateResponse {
    environment_builds: Vec<crate::models::EnvironmentBuild>,
    failed_requests: Vec<environment_build::FailedRequest>,
}

async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateBody>,
) -> impl IntoResponse {
    let (created, failed) = environment_build::create(&state, body.environment_build_requests).await;
    let status = if failed.is_empty() {
        axum::http::StatusCode::CREATED
    } else {
        axum::http::StatusCode::INTERNAL_SERVER_ERROR
    };

    (
        status,
        Json(CreateResponse {
            environment_builds: created,
            failed_requests: failed,
        }),
    )
}

async fn list(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(environment_build::list(&state).await?))
}

async fn get_one(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(environment_build::get(&state, uuid).await?))
}

async fn delete_one(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    environment_build::abort(&state, uuid).await?;
    Ok(axum::http::StatusCode::OK)
}

#[derive(Deserialize)]
struct StatusUpdatePayload {
    status: Status,
    started_time: Option<DateTime<Utc>>,
    finished_time: Option<DateTime<Utc>>,
}

async fn put_status(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
    Json(payload): Json<StatusUpdatePayload>,
) -> Result<impl IntoResponse, ApiError> {
    let update = StatusUpdate {
        status: payload.status,
        started_time: payload.started_time,
        finished_time: payload.finished_time,
    };
    let changed =
        update_status_db(&state.pool, "environment_builds", "uuid", uuid, &update).await?;

    if changed && update.status.terminal() {
        state.tasks.unregister(uuid);
    }

    Ok(axum::http::StatusCode::OK)
}

async fn most_recent_for_project(
    State(state): State<AppState>,
    Path(project_uuid): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        environment_build::most_recent_for_project(&state, project_uuid).await?,
    ))
}

async fn most_recent_for_env(
    State(state): State<AppState>,
    Path((project_uuid, env_uuid)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        environment_build::most_recent_for_env(&state, project_uuid, env_uuid).await?,
    ))
}
