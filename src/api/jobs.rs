//! `/jobs/` HTTP facade (§6, §4.2.5).

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::controllers::job::{self, JobSpec};
use crate::error::ApiError;
use crate::store::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/jobs/", get(list).post(create))
        .route("/jobs/{uuid}", get(get_one).put(update).delete(abort))
        .route("/jobs/{uuid}/start", post(start))
}

#[derive(Deserialize)]
struct CreateBody {
    project_uuid: Uuid,
    pipeline_uuid: Uuid,
    pipeline_definition: serde_json::Value,
    #[serde(default)]
    pipeline_run_spec: serde_json::Value,
    #[serde(default)]
    job_parameters: serde_json::Value,
    #[serde(default)]
    schedule: Option<String>,
}

async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let job = job::create(
        &state,
        JobSpec {
            project_uuid: body.project_uuid,
            pipeline_uuid: body.pipeline_uuid,
            pipeline_definition: body.pipeline_definition,
            pipeline_run_spec: body.pipeline_run_spec,
            job_parameters: body.job_parameters,
            schedule: body.schedule,
        },
    )
    .await?;

    Ok((axum::http::StatusCode::CREATED, Json(job)))
}

async fn list(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(job::list(&state).await?))
}

async fn get_one(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(job::get(&state, uuid).await?))
}

/// `PUT /jobs/<uuid>` starts a `DRAFT` job; the legacy surface overloads
/// the same verb `POST /jobs/<uuid>/start` is kept alongside it for
/// symmetry with the other resources' status-update PUT.
async fn update(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(job::start(&state, uuid).await?))
}

async fn start(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(job::start(&state, uuid).await?))
}

async fn abort(
    State(state): State<AppState>,
    Path(uuid): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    job::abort(&state, uuid).await?;
    Ok(axum::http::StatusCode::OK)
}
