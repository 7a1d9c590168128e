//! PipelineRun lifecycle controller (§4.2.4).

use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::audit::{AuditEntry, write_audit};
use crate::error::ApiError;
use crate::locker;
use crate::models::{PipelineRun, PipelineRunStep, RunKind};
use crate::pipeline_def::PipelineDefinition;
use crate::status::{Status, StatusUpdate, update_status_db};
use crate::store::AppState;

#[derive(Debug, Clone)]
pub struct RunSpec {
    pub project_uuid: Uuid,
    pub pipeline_uuid: Uuid,
    pub kind: RunKind,
    pub job_uuid: Option<Uuid>,
    pub job_schedule_number: Option<i32>,
    pub pipeline_definition: serde_json::Value,
    pub pipeline_parameters: serde_json::Value,
}

/// §4.2.4 `create`: inserts the run row plus one `PipelineRunStep` per
/// step, then locks each referenced environment's current image id via
/// the Resource Locker. The run row must exist before the lock can write
/// its `pipeline_run_image_mappings` rows (`run_uuid` is a foreign key
/// into `pipeline_runs`), matching the original's commit-then-lock order
/// against an already-flushed run. If locking fails, the run can never
/// start, so it's moved straight to `FAILURE` rather than left `PENDING`.
#[tracing::instrument(skip(state, spec))]
pub async fn create(state: &AppState, spec: RunSpec) -> Result<PipelineRun, ApiError> {
    let definition = PipelineDefinition::parse(&spec.pipeline_definition)
        .map_err(|err| ApiError::BadRequest(format!("invalid pipeline definition: {err}")))?;
    let env_uuids = definition.referenced_environments();

    let run_uuid = Uuid::new_v4();
    let run = insert_run(&state.pool, run_uuid, &spec, &definition).await?;

    if let Err(err) =
        locker::lock_images(&state.pool, state.cra.as_ref(), spec.project_uuid, run_uuid, &env_uuids)
            .await
    {
        let _ = update_status_db(
            &state.pool,
            "pipeline_runs",
            "uuid",
            run_uuid,
            &StatusUpdate::to(Status::Failure, Utc::now()),
        )
        .await;
        return Err(err);
    }

    write_audit(
        &state.pool,
        &AuditEntry {
            action: "pipeline_run.create",
            resource: "pipeline_run",
            resource_id: Some(run.uuid),
            project_uuid: Some(run.project_uuid),
            detail: None,
        },
    )
    .await;

    tracing::info!(run_uuid = %run.uuid, "pipeline run submitted to dispatcher");

    Ok(run)
}

async fn insert_run(
    pool: &PgPool,
    run_uuid: Uuid,
    spec: &RunSpec,
    definition: &PipelineDefinition,
) -> Result<PipelineRun, ApiError> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query_as!(
        PipelineRunRow,
        r#"
        INSERT INTO pipeline_runs
            (uuid, project_uuid, pipeline_uuid, status, kind, job_uuid, job_schedule_number,
             pipeline_definition, pipeline_parameters)
        VALUES ($1, $2, $3, 'PENDING', $4, $5, $6, $7, $8)
        RETURNING uuid, project_uuid, pipeline_uuid, status AS "status: Status",
                  started_time, finished_time, kind AS "kind: RunKind",
                  job_uuid, job_schedule_number, pipeline_definition, pipeline_parameters
        "#,
        run_uuid,
        spec.project_uuid,
        spec.pipeline_uuid,
        spec.kind,
        spec.job_uuid,
        spec.job_schedule_number,
        spec.pipeline_definition,
        spec.pipeline_parameters,
    )
    .fetch_one(&mut *tx)
    .await?;

    for step_uuid in definition.steps.keys() {
        sqlx::query!(
            r#"
            INSERT INTO pipeline_run_steps (run_uuid, step_uuid, status)
            VALUES ($1, $2, 'PENDING')
            "#,
            run_uuid,
            step_uuid,
        )
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(row.into())
}

/// §4.2.4 `abort`: guarded transition to `ABORTED`, then collateral revokes
/// the task and stops any containers it may have started.
#[tracing::instrument(skip(state))]
pub async fn abort(state: &AppState, run_uuid: Uuid) -> Result<bool, ApiError> {
    let mut tx = state.pool.begin().await?;
    let changed = abort_in_tx(&mut tx, run_uuid).await?;
    tx.commit().await?;

    if changed {
        state.tasks.abort(run_uuid);

        let label = format!("_orchest_pipeline_run_uuid={run_uuid}");
        match state.cra.list_containers_by_label(&label).await {
            Ok(containers) => {
                for container_id in containers {
                    if let Err(err) = state.cra.stop_container(&container_id).await {
                        tracing::warn!(error = %err, %container_id, "failed to stop run container");
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, %run_uuid, "failed to list run containers for abort");
            }
        }

        write_audit(
            &state.pool,
            &AuditEntry {
                action: "pipeline_run.abort",
                resource: "pipeline_run",
                resource_id: Some(run_uuid),
                project_uuid: None,
                detail: None,
            },
        )
        .await;
    }

    Ok(changed)
}

/// Transaction-scoped guarded abort, reused by the session controller when
/// stopping interactive runs alongside the session itself.
pub(super) async fn abort_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    run_uuid: Uuid,
) -> anyhow::Result<bool> {
    let changed = update_status_db(
        &mut **tx,
        "pipeline_runs",
        "uuid",
        run_uuid,
        &StatusUpdate::to(Status::Aborted, Utc::now()),
    )
    .await?;

    sqlx::query!(
        r#"
        UPDATE pipeline_run_steps SET status = 'ABORTED'
        WHERE run_uuid = $1 AND status IN ('PENDING', 'STARTED')
        "#,
        run_uuid,
    )
    .execute(&mut **tx)
    .await?;

    Ok(changed)
}

pub async fn get(state: &AppState, run_uuid: Uuid) -> Result<PipelineRun, ApiError> {
    let row = sqlx::query_as!(
        PipelineRunRow,
        r#"
        SELECT uuid, project_uuid, pipeline_uuid, status AS "status: Status",
               started_time, finished_time, kind AS "kind: RunKind",
               job_uuid, job_schedule_number, pipeline_definition, pipeline_parameters
        FROM pipeline_runs WHERE uuid = $1
        "#,
        run_uuid,
    )
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("pipeline run {run_uuid} not found")))?;

    Ok(row.into())
}

pub async fn list_steps(
    state: &AppState,
    run_uuid: Uuid,
) -> Result<Vec<PipelineRunStep>, ApiError> {
    let rows = sqlx::query_as!(
        PipelineRunStepRow,
        r#"
        SELECT run_uuid, step_uuid, status AS "status: Status", started_time, finished_time
        FROM pipeline_run_steps WHERE run_uuid = $1
        "#,
        run_uuid,
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

struct PipelineRunRow {
    uuid: Uuid,
    project_uuid: Uuid,
    pipeline_uuid: Uuid,
    status: Status,
    started_time: Option<chrono::DateTime<Utc>>,
    finished_time: Option<chrono::DateTime<Utc>>,
    kind: RunKind,
    job_uuid: Option<Uuid>,
    job_schedule_number: Option<i32>,
    pipeline_definition: serde_json::Value,
    pipeline_parameters: serde_json::Value,
}

impl From<PipelineRunRow> for PipelineRun {
    fn from(row: PipelineRunRow) -> Self {
        Self {
            uuid: row.uuid,
            project_uuid: row.project_uuid,
            pipeline_uuid: row.pipeline_uuid,
            status: row.status,
            started_time: row.started_time,
            finished_time: row.finished_time,
            kind: row.kind,
            job_uuid: row.job_uuid,
            job_schedule_number: row.job_schedule_number,
            pipeline_definition: row.pipeline_definition,
            pipeline_parameters: row.pipeline_parameters,
        }
    }
}

struct PipelineRunStepRow {
    run_uuid: Uuid,
    step_uuid: Uuid,
    status: Status,
    started_time: Option<chrono::DateTime<Utc>>,
    finished_time: Option<chrono::DateTime<Utc>>,
}

impl From<PipelineRunStepRow> for PipelineRunStep {
    fn from(row: PipelineRunStepRow) -> Self {
        Self {
            run_uuid: row.run_uuid,
            step_uuid: row.step_uuid,
            status: row.status,
            started_time: row.started_time,
            finished_time: row.finished_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_spec_resolves_referenced_environments_via_pipeline_def() {
        let env = Uuid::new_v4();
        let step = Uuid::new_v4();
        let definition = PipelineDefinition::parse(&json!({
            "steps": { step.to_string(): { "environment": env.to_string() } },
            "services": {},
        }))
        .unwrap();

        assert_eq!(
            definition.referenced_environments(),
            std::collections::BTreeSet::from([env])
        );
    }
}
