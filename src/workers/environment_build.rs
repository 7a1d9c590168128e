//! Worker for a claimed `EnvironmentBuild`: drives the CRA to build the
//! environment's image and reports the outcome back through the same
//! guarded `update_status_db` the HTTP status-callback endpoint uses.

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::controllers::{ENV_BUILD_INTERMEDIATE_LABEL, ENV_BUILD_TASK_LABEL, ENVIRONMENT_LABEL, PROJECT_LABEL};
use crate::cra::{BuildSpec, environment_image_name};
use crate::status::{Status, StatusUpdate, update_status_db};
use crate::store::AppState;

pub(crate) struct ClaimedBuild {
    pub uuid: Uuid,
    pub project_uuid: Uuid,
    pub environment_uuid: Uuid,
    pub project_path: String,
}

/// Claims the oldest `PENDING` row, flipping it to `STARTED` atomically
/// (`SELECT ... FOR UPDATE SKIP LOCKED` lets multiple dispatcher replicas
/// poll concurrently without claiming the same row twice).
pub(crate) async fn claim_pending(pool: &PgPool) -> anyhow::Result<Option<ClaimedBuild>> {
    let mut tx = pool.begin().await?;

    let candidate = sqlx::query!(
        r#"
        SELECT uuid, project_uuid, environment_uuid, project_path
        FROM environment_builds
        WHERE status = 'PENDING'
        ORDER BY requested_time
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        "#
    )
    .fetch_optional(&mut *tx)
    .await?;

    let Some(candidate) = candidate else {
        return Ok(None);
    };

    update_status_db(
        &mut *tx,
        "environment_builds",
        "uuid",
        candidate.uuid,
        &StatusUpdate::to(Status::Started, Utc::now()),
    )
    .await?;

    tx.commit().await?;

    Ok(Some(ClaimedBuild {
        uuid: candidate.uuid,
        project_uuid: candidate.project_uuid,
        environment_uuid: candidate.environment_uuid,
        project_path: candidate.project_path,
    }))
}

/// Runs the claimed build to completion, checking `token` before starting
/// the build and before recording its outcome (§5's "poll the aborted flag
/// before committing any image").
pub(crate) async fn run(state: &AppState, build: ClaimedBuild, token: CancellationToken) {
    if token.is_cancelled() {
        state.tasks.unregister(build.uuid);
        return;
    }

    let tag = environment_image_name(&build.project_uuid, &build.environment_uuid);
    let mut labels = std::collections::HashMap::new();
    labels.insert(ENV_BUILD_TASK_LABEL.to_string(), build.uuid.to_string());
    labels.insert(ENV_BUILD_INTERMEDIATE_LABEL.to_string(), "0".to_string());
    labels.insert(PROJECT_LABEL.to_string(), build.project_uuid.to_string());
    labels.insert(ENVIRONMENT_LABEL.to_string(), build.environment_uuid.to_string());

    let spec = BuildSpec {
        context_path: std::path::PathBuf::from(&build.project_path),
        dockerfile: "Dockerfile".to_string(),
        tag,
        labels,
    };

    let outcome = crate::cra::with_retry(
        state.config.cra_call_timeout,
        state.config.cra_retries,
        || state.cra.build_image(&spec),
    )
    .await;

    let final_status = if token.is_cancelled() {
        None
    } else {
        Some(match outcome {
            Ok(image_id) => {
                tracing::info!(build_uuid = %build.uuid, %image_id, "environment build succeeded");
                Status::Success
            }
            Err(err) => {
                tracing::warn!(build_uuid = %build.uuid, error = %err, "environment build failed");
                Status::Failure
            }
        })
    };

    if let Some(status) = final_status {
        if let Err(err) = update_status_db(
            &state.pool,
            "environment_builds",
            "uuid",
            build.uuid,
            &StatusUpdate::to(status, Utc::now()),
        )
        .await
        {
            tracing::error!(build_uuid = %build.uuid, error = %err, "failed to record build outcome");
        }
    }

    state.tasks.unregister(build.uuid);
}
