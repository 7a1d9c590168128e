//! `/sessions/` HTTP facade (§6, §4.2.3).

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::controllers::session::{self, LaunchSpec};
use crate::error::ApiError;
use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/sessions/", get(list).post(launch))
        .route("/sessions/{project_uuid}/{pipeline_uuid}", get(get_one).delete(stop))
}

/// The legacy API also carries `project_dir`, `pipeline_path`, and
/// `host_userdir` on this body; none of the three is persisted on the
/// session row, so they're accepted and ignored here rather than rejected.
#[derive(Deserialize)]
struct LaunchBody {
    project_uuid: Uuid,
    pipeline_uuid: Uuid,
    #[allow(dead_code)]
    #[serde(default)]
    project_dir: Option<String>,
    #[allow(dead_code)]
    #[serde(default)]
    pipeline_path: Option<String>,
    #[allow(dead_code)]
    #[serde(default)]
    host_userdir: Option<String>,
}

async fn launch(
    State(state): State<AppState>,
    Json(body): Json<LaunchBody>,
) -> Result<impl IntoResponse, ApiError> {
    let session = session::launch(
        &state,
        LaunchSpec {
            project_uuid: body.project_uuid,
            pipeline_uuid: body.pipeline_uuid,
        },
    )
    .await?;

    Ok((axum::http::StatusCode::CREATED, Json(session)))
}

async fn list(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(session::list(&state).await?))
}

async fn get_one(
    State(state): State<AppState>,
    Path((project_uuid, pipeline_uuid)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(session::get(&state, project_uuid, pipeline_uuid).await?))
}

async fn stop(
    State(state): State<AppState>,
    Path((project_uuid, pipeline_uuid)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    session::stop(&state, project_uuid, pipeline_uuid).await?;
    Ok(axum::http::StatusCode::OK)
}
