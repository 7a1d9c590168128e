//! Worker for a claimed `JupyterBuild`: same shape as the environment
//! build worker, building the single system-wide Jupyter server image
//! instead of a per-environment one.

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cra::BuildSpec;
use crate::status::{Status, StatusUpdate, update_status_db};
use crate::store::AppState;

const JUPYTER_IMAGE_TAG: &str = "orchest-jupyter-server";
const JUPYTER_CONTEXT_PATH: &str = "services/jupyter";

pub(crate) struct ClaimedBuild {
    pub uuid: Uuid,
}

pub(crate) async fn claim_pending(pool: &PgPool) -> anyhow::Result<Option<ClaimedBuild>> {
    let mut tx = pool.begin().await?;

    let candidate = sqlx::query!(
        r#"
        SELECT uuid FROM jupyter_builds
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
        "jupyter_builds",
        "uuid",
        candidate.uuid,
        &StatusUpdate::to(Status::Started, Utc::now()),
    )
    .await?;

    tx.commit().await?;

    Ok(Some(ClaimedBuild { uuid: candidate.uuid }))
}

pub(crate) async fn run(state: &AppState, build: ClaimedBuild, token: CancellationToken) {
    if token.is_cancelled() {
        state.tasks.unregister(build.uuid);
        return;
    }

    let mut labels = std::collections::HashMap::new();
    labels.insert("_orchest_jupyter_build_task_uuid".to_string(), build.uuid.to_string());

    let spec = BuildSpec {
        context_path: std::path::PathBuf::from(JUPYTER_CONTEXT_PATH),
        dockerfile: "Dockerfile".to_string(),
        tag: JUPYTER_IMAGE_TAG.to_string(),
        labels,
    };

    let outcome = crate::cra::with_retry(
        state.config.cra_call_timeout,
        state.config.cra_retries,
        || state.cra.build_image(&spec),
    )
    .await;

    if !token.is_cancelled() {
        let status = match outcome {
            Ok(image_id) => {
                tracing::info!(build_uuid = %build.uuid, %image_id, "jupyter build succeeded");
                Status::Success
            }
            Err(err) => {
                tracing::warn!(build_uuid = %build.uuid, error = %err, "jupyter build failed");
                Status::Failure
            }
        };

        if let Err(err) = update_status_db(
            &state.pool,
            "jupyter_builds",
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
