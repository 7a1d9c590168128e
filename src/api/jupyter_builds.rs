//! `/jupyter-builds/` HTTP facade (§6, §4.2.2).

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::controllers::jupyter_build;
use crate::error::ApiError;
use crate::status::{Status, StatusUpdate, update_status_db};
use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jupyter-builds/", get(list).post(create))
        .route(
            "/jupyter-builds/{uuid}",
            get(get_one).put(put_status).delete(delete_one),
        )
        .route("/jupyter-builds/most-recent/", get(most_recent))
}

async fn create(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let build = jupyter_build::create(&state).await?;
    Ok((axum::http::StatusCode::CREATED, Json(build)))
}

async fn list(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(jupyter_build::list(&state).await?))
}

async fn get_one(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(jupyter_build::get(&state, uuid).await?))
}

async fn delete_one(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    jupyter_build::abort(&state, uuid).await?;
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
    let changed = update_status_db(&state.pool, "jupyter_builds", "uuid", uuid, &update).await?;

    if changed && update.status.terminal() {
        state.tasks.unregister(uuid);
    }

    Ok(axum::http::StatusCode::OK)
}

async fn most_recent(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(jupyter_build::most_recent(&state).await?))
}
