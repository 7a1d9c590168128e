use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::cra::ContainerRuntimeError;

/// The error kinds surfaced to HTTP clients. Controllers catch exceptions
/// across TPE boundaries and convert them here; task workers never raise
/// across the task bus boundary, they emit FAILURE status updates instead.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation error")]
    Validation(Vec<String>),

    /// A `JupyterBuild` was requested while an `InteractiveSession` is
    /// `LAUNCHING`/`RUNNING`/`STOPPING` (I2). Kept as 500 to match the
    /// legacy-client compatibility requirement called out in the design,
    /// rather than the more natural 409.
    #[error("session in progress")]
    SessionInProgress,

    /// `lock_images` found an environment with no materialized image.
    #[error("image not found for environment {0}")]
    ImageNotFound(String),

    #[error("internal error: {0}")]
    Internal(anyhow::Error),
}

/// A controller's transaction phase reports domain errors (e.g.
/// [`ApiError::SessionInProgress`]) by `anyhow::bail!`-ing the variant
/// itself through the TPE's `anyhow::Result` plumbing; unwrap that
/// variant back out here instead of flattening every TPE failure to
/// `Internal`.
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ApiError>() {
            Ok(api_err) => api_err,
            Err(err) => Self::Internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, serde_json::json!({ "error": msg })),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, serde_json::json!({ "error": msg })),
            Self::Conflict(msg) => (StatusCode::CONFLICT, serde_json::json!({ "error": msg })),
            Self::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": "validation error", "fields": errors }),
            ),
            Self::SessionInProgress => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": "SessionInProgressException" }),
            ),
            Self::ImageNotFound(env_uuid) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({
                    "error": "ImageNotFoundException",
                    "environment_uuid": env_uuid,
                }),
            ),
            Self::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": "internal server error" }),
                )
            }
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("resource not found".into()),
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                Self::Conflict("resource already exists".into())
            }
            _ => {
                tracing::error!(error = %err, "database error");
                Self::Internal(err.into())
            }
        }
    }
}

impl From<ContainerRuntimeError> for ApiError {
    fn from(err: ContainerRuntimeError) -> Self {
        match err {
            ContainerRuntimeError::NotFound(msg) => Self::ImageNotFound(msg),
            other => {
                tracing::error!(error = %other, "container runtime error");
                Self::Internal(other.into())
            }
        }
    }
}
