//! InteractiveSession lifecycle controller (§4.2.3). Strictly forward:
//! `LAUNCHING -> RUNNING -> STOPPING -> STOPPED`, with `STOPPED` terminal.

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::audit::{AuditEntry, write_audit};
use crate::error::ApiError;
use crate::models::{InteractiveSession, SessionStatus};
use crate::store::AppState;

use super::pipeline_run;

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub project_uuid: Uuid,
    pub pipeline_uuid: Uuid,
}

/// §4.2.3 launch: inserts a `LAUNCHING` row. Fails with [`ApiError::Conflict`]
/// if a session already exists for `(project_uuid, pipeline_uuid)` (I3).
#[tracing::instrument(skip(state))]
pub async fn launch(state: &AppState, spec: LaunchSpec) -> Result<InteractiveSession, ApiError> {
    let row = sqlx::query_as!(
        SessionRow,
        r#"
        INSERT INTO interactive_sessions (project_uuid, pipeline_uuid, status)
        VALUES ($1, $2, 'LAUNCHING')
        RETURNING project_uuid, pipeline_uuid, status AS "status: SessionStatus",
                  jupyter_server_ip, notebook_server_info
        "#,
        spec.project_uuid,
        spec.pipeline_uuid,
    )
    .fetch_one(&state.pool)
    .await?;

    write_audit(
        &state.pool,
        &AuditEntry {
            action: "session.launch",
            resource: "interactive_session",
            resource_id: None,
            project_uuid: Some(spec.project_uuid),
            detail: Some(serde_json::json!({ "pipeline_uuid": spec.pipeline_uuid })),
        },
    )
    .await;

    Ok(row.into())
}

/// Marks a launching session `RUNNING` once its gateway/notebook containers
/// are up. Only a forward transition from `LAUNCHING`.
#[tracing::instrument(skip(state))]
pub async fn mark_running(
    state: &AppState,
    project_uuid: Uuid,
    pipeline_uuid: Uuid,
    jupyter_server_ip: String,
) -> Result<bool, ApiError> {
    let result = sqlx::query!(
        r#"
        UPDATE interactive_sessions SET status = 'RUNNING', jupyter_server_ip = $1
        WHERE project_uuid = $2 AND pipeline_uuid = $3 AND status = 'LAUNCHING'
        "#,
        jupyter_server_ip,
        project_uuid,
        pipeline_uuid,
    )
    .execute(&state.pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// §4.2.3 `stop`: a TPE whose transaction first aborts any interactive
/// PipelineRuns for this `(project_uuid, pipeline_uuid)`, then flips the
/// session to `STOPPING`; collateral instructs the CRA to stop its
/// containers, landing the session in `STOPPED`.
#[tracing::instrument(skip(state))]
pub async fn stop(
    state: &AppState,
    project_uuid: Uuid,
    pipeline_uuid: Uuid,
) -> Result<bool, ApiError> {
    let (stopping, collateral_result) = crate::tpe::run(
        &state.pool,
        |tx| {
            Box::pin(
                async move { transaction_phase(tx, project_uuid, pipeline_uuid).await },
            )
        },
        |stopping| {
            let cra = state.cra.clone();
            let stopping = *stopping;
            Box::pin(async move { collateral_phase(state, cra.as_ref(), stopping, project_uuid, pipeline_uuid).await })
        },
    )
    .await?;

    collateral_result?;

    if stopping {
        write_audit(
            &state.pool,
            &AuditEntry {
                action: "session.stop",
                resource: "interactive_session",
                resource_id: None,
                project_uuid: Some(project_uuid),
                detail: Some(serde_json::json!({ "pipeline_uuid": pipeline_uuid })),
            },
        )
        .await;
    }

    Ok(stopping)
}

async fn transaction_phase(
    tx: &mut Transaction<'_, Postgres>,
    project_uuid: Uuid,
    pipeline_uuid: Uuid,
) -> anyhow::Result<bool> {
    let runs = sqlx::query!(
        r#"
        SELECT uuid FROM pipeline_runs
        WHERE project_uuid = $1 AND pipeline_uuid = $2
          AND kind = 'interactive' AND status IN ('PENDING', 'STARTED')
        "#,
        project_uuid,
        pipeline_uuid,
    )
    .fetch_all(&mut **tx)
    .await?;

    for run in runs {
        pipeline_run::abort_in_tx(tx, run.uuid).await?;
    }

    let result = sqlx::query!(
        r#"
        UPDATE interactive_sessions SET status = 'STOPPING'
        WHERE project_uuid = $1 AND pipeline_uuid = $2
          AND status IN ('LAUNCHING', 'RUNNING')
        "#,
        project_uuid,
        pipeline_uuid,
    )
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn collateral_phase(
    state: &AppState,
    cra: &dyn crate::cra::ContainerRuntime,
    stopping: bool,
    project_uuid: Uuid,
    pipeline_uuid: Uuid,
) -> anyhow::Result<()> {
    if !stopping {
        return Ok(());
    }

    let label = format!("_orchest_project_uuid={project_uuid}");
    let containers = cra.list_containers_by_label(&label).await?;
    for container_id in containers {
        if let Err(err) = cra.stop_container(&container_id).await {
            tracing::warn!(error = %err, %container_id, "failed to stop session container");
        }
        if let Err(err) = cra.remove_container(&container_id).await {
            tracing::warn!(error = %err, %container_id, "failed to remove session container");
        }
    }

    sqlx::query!(
        r#"UPDATE interactive_sessions SET status = 'STOPPED' WHERE project_uuid = $1 AND pipeline_uuid = $2 AND status = 'STOPPING'"#,
        project_uuid,
        pipeline_uuid,
    )
    .execute(&state.pool)
    .await?;

    Ok(())
}

pub async fn get(
    state: &AppState,
    project_uuid: Uuid,
    pipeline_uuid: Uuid,
) -> Result<InteractiveSession, ApiError> {
    let row = sqlx::query_as!(
        SessionRow,
        r#"
        SELECT project_uuid, pipeline_uuid, status AS "status: SessionStatus",
               jupyter_server_ip, notebook_server_info
        FROM interactive_sessions WHERE project_uuid = $1 AND pipeline_uuid = $2
        "#,
        project_uuid,
        pipeline_uuid,
    )
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::NotFound("no interactive session for that pipeline".into()))?;

    Ok(row.into())
}

pub async fn list(state: &AppState) -> Result<Vec<InteractiveSession>, ApiError> {
    let rows = sqlx::query_as!(
        SessionRow,
        r#"
        SELECT project_uuid, pipeline_uuid, status AS "status: SessionStatus",
               jupyter_server_ip, notebook_server_info
        FROM interactive_sessions
        "#,
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

struct SessionRow {
    project_uuid: Uuid,
    pipeline_uuid: Uuid,
    status: SessionStatus,
    jupyter_server_ip: Option<String>,
    notebook_server_info: Option<serde_json::Value>,
}

impl From<SessionRow> for InteractiveSession {
    fn from(row: SessionRow) -> Self {
        Self {
            project_uuid: row.project_uuid,
            pipeline_uuid: row.pipeline_uuid,
            status: row.status,
            jupyter_server_ip: row.jupyter_server_ip,
            notebook_server_info: row.notebook_server_info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_states_match_i2() {
        assert!(SessionStatus::Launching.is_blocking());
        assert!(SessionStatus::Running.is_blocking());
        assert!(SessionStatus::Stopping.is_blocking());
        assert!(!SessionStatus::Stopped.is_blocking());
    }
}
