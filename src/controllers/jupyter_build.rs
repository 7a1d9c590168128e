//! JupyterBuild lifecycle controller (§4.2.2). Unlike environment builds
//! there's no project dimension: at most one active Jupyter image build
//! exists system-wide, and it is refused outright (not superseded) while
//! any interactive session is launching, running, or stopping (I2).

use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::audit::{AuditEntry, write_audit};
use crate::error::ApiError;
use crate::models::JupyterBuild;
use crate::status::{Status, StatusUpdate, update_status_db};
use crate::store::AppState;

use super::remove_task_intermediate_images;

/// §4.2.2 `create`: refuses with [`ApiError::SessionInProgress`] while any
/// session is in a blocking state (I2), otherwise aborts any existing
/// active build and inserts a fresh `PENDING` one.
#[tracing::instrument(skip(state))]
pub async fn create(state: &AppState) -> Result<JupyterBuild, ApiError> {
    let (build, collateral_result) = crate::tpe::run_with_revert(
        &state.pool,
        |tx| Box::pin(async move { transaction_phase(tx).await }),
        |build| {
            let cra = state.cra.clone();
            let build = build.clone();
            Box::pin(async move { collateral_phase(cra.as_ref(), &build).await })
        },
        |pool, build| {
            let build = build.clone();
            Box::pin(async move { revert_phase(pool, build.uuid).await })
        },
    )
    .await?;

    write_audit(
        &state.pool,
        &AuditEntry {
            action: "jupyter_build.create",
            resource: "jupyter_build",
            resource_id: Some(build.uuid),
            project_uuid: None,
            detail: None,
        },
    )
    .await;

    collateral_result?;
    Ok(build)
}

async fn transaction_phase(tx: &mut Transaction<'_, Postgres>) -> anyhow::Result<JupyterBuild> {
    let blocking_session = sqlx::query!(
        r#"SELECT 1 AS "exists!" FROM interactive_sessions WHERE status IN ('LAUNCHING', 'RUNNING', 'STOPPING') LIMIT 1"#
    )
    .fetch_optional(&mut **tx)
    .await?;

    if blocking_session.is_some() {
        anyhow::bail!(ApiError::SessionInProgress);
    }

    let existing = sqlx::query!(
        r#"SELECT uuid FROM jupyter_builds WHERE status IN ('PENDING', 'STARTED')"#
    )
    .fetch_all(&mut **tx)
    .await?;

    for row in existing {
        update_status_db(
            &mut **tx,
            "jupyter_builds",
            "uuid",
            row.uuid,
            &StatusUpdate::to(Status::Aborted, Utc::now()),
        )
        .await?;
    }

    let build = sqlx::query_as!(
        JupyterBuildRow,
        r#"
        INSERT INTO jupyter_builds (uuid, status) VALUES ($1, 'PENDING')
        RETURNING uuid, requested_time, started_time, finished_time, status AS "status: Status"
        "#,
        Uuid::new_v4(),
    )
    .fetch_one(&mut **tx)
    .await?;

    Ok(build.into())
}

async fn collateral_phase(
    _cra: &dyn crate::cra::ContainerRuntime,
    build: &JupyterBuild,
) -> anyhow::Result<()> {
    tracing::info!(build_uuid = %build.uuid, "jupyter build submitted to dispatcher");
    Ok(())
}

async fn revert_phase(pool: &PgPool, build_uuid: Uuid) -> anyhow::Result<()> {
    update_status_db(
        pool,
        "jupyter_builds",
        "uuid",
        build_uuid,
        &StatusUpdate::to(Status::Failure, Utc::now()),
    )
    .await?;
    Ok(())
}

/// §4.2.2 `abort`.
#[tracing::instrument(skip(state))]
pub async fn abort(state: &AppState, build_uuid: Uuid) -> Result<bool, ApiError> {
    let changed = update_status_db(
        &state.pool,
        "jupyter_builds",
        "uuid",
        build_uuid,
        &StatusUpdate::to(Status::Aborted, Utc::now()),
    )
    .await?;

    if changed {
        state.tasks.abort(build_uuid);
        remove_task_intermediate_images(state.cra.as_ref(), build_uuid).await;

        write_audit(
            &state.pool,
            &AuditEntry {
                action: "jupyter_build.abort",
                resource: "jupyter_build",
                resource_id: Some(build_uuid),
                project_uuid: None,
                detail: None,
            },
        )
        .await;
    }

    Ok(changed)
}

pub async fn get(state: &AppState, build_uuid: Uuid) -> Result<JupyterBuild, ApiError> {
    let row = sqlx::query_as!(
        JupyterBuildRow,
        r#"
        SELECT uuid, requested_time, started_time, finished_time, status AS "status: Status"
        FROM jupyter_builds WHERE uuid = $1
        "#,
        build_uuid,
    )
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("jupyter build {build_uuid} not found")))?;

    Ok(row.into())
}

pub async fn list(state: &AppState) -> Result<Vec<JupyterBuild>, ApiError> {
    let rows = sqlx::query_as!(
        JupyterBuildRow,
        r#"
        SELECT uuid, requested_time, started_time, finished_time, status AS "status: Status"
        FROM jupyter_builds ORDER BY requested_time DESC
        "#,
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn most_recent(state: &AppState) -> Result<JupyterBuild, ApiError> {
    let row = sqlx::query_as!(
        JupyterBuildRow,
        r#"
        SELECT uuid, requested_time, started_time, finished_time, status AS "status: Status"
        FROM jupyter_builds ORDER BY requested_time DESC LIMIT 1
        "#,
    )
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::NotFound("no jupyter builds yet".into()))?;

    Ok(row.into())
}

struct JupyterBuildRow {
    uuid: Uuid,
    requested_time: chrono::DateTime<Utc>,
    started_time: Option<chrono::DateTime<Utc>>,
    finished_time: Option<chrono::DateTime<Utc>>,
    status: Status,
}

impl From<JupyterBuildRow> for JupyterBuild {
    fn from(row: JupyterBuildRow) -> Self {
        Self {
            uuid: row.uuid,
            requested_time: row.requested_time,
            started_time: row.started_time,
            finished_time: row.finished_time,
            status: row.status,
        }
    }
}
