//! Job lifecycle controller (§4.2.5): the scheduled-recipe layer on top of
//! [`super::pipeline_run`]. A job owns a cron `schedule` (or `None` for a
//! one-shot) and, once started, periodically instantiates one PipelineRun
//! per entry of the cartesian product of its `job_parameters`.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::audit::{AuditEntry, write_audit};
use crate::error::ApiError;
use crate::models::{Job, RunKind};
use crate::status::JobStatus;
use crate::store::AppState;

use super::pipeline_run;

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub project_uuid: Uuid,
    pub pipeline_uuid: Uuid,
    pub pipeline_definition: serde_json::Value,
    pub pipeline_run_spec: serde_json::Value,
    pub job_parameters: serde_json::Value,
    pub schedule: Option<String>,
}

/// §4.2.5 `create`: begins in `DRAFT`, produces no runs until [`start`].
#[tracing::instrument(skip(state, spec))]
pub async fn create(state: &AppState, spec: JobSpec) -> Result<Job, ApiError> {
    if let Some(schedule) = &spec.schedule {
        Schedule::from_str(&normalize_cron(schedule))
            .map_err(|err| ApiError::BadRequest(format!("invalid cron schedule: {err}")))?;
    }

    let row = sqlx::query_as!(
        JobRow,
        r#"
        INSERT INTO jobs (uuid, project_uuid, pipeline_uuid, pipeline_definition,
                           pipeline_run_spec, job_parameters, schedule, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7, 'DRAFT')
        RETURNING uuid, project_uuid, pipeline_uuid, pipeline_definition, pipeline_run_spec,
                  job_parameters, schedule, next_scheduled_time, total_scheduled_executions,
                  status AS "status: JobStatus"
        "#,
        Uuid::new_v4(),
        spec.project_uuid,
        spec.pipeline_uuid,
        spec.pipeline_definition,
        spec.pipeline_run_spec,
        spec.job_parameters,
        spec.schedule,
    )
    .fetch_one(&state.pool)
    .await?;

    write_audit(
        &state.pool,
        &AuditEntry {
            action: "job.create",
            resource: "job",
            resource_id: Some(row.uuid),
            project_uuid: Some(row.project_uuid),
            detail: None,
        },
    )
    .await;

    Ok(row.into())
}

/// §4.2.5 `start`: computes the first `next_scheduled_time` from `schedule`
/// (immediate for a one-shot job) and flips the job to `STARTED`.
#[tracing::instrument(skip(state))]
pub async fn start(state: &AppState, job_uuid: Uuid) -> Result<Job, ApiError> {
    let job = get(state, job_uuid).await?;
    if job.status != JobStatus::Draft {
        return Err(ApiError::Conflict(format!(
            "job {job_uuid} is not in DRAFT (currently {:?})",
            job.status
        )));
    }

    let next = match &job.schedule {
        Some(expr) => next_fire_time(expr, Utc::now())?,
        None => Utc::now(),
    };

    let row = sqlx::query_as!(
        JobRow,
        r#"
        UPDATE jobs SET status = 'STARTED', next_scheduled_time = $1
        WHERE uuid = $2
        RETURNING uuid, project_uuid, pipeline_uuid, pipeline_definition, pipeline_run_spec,
                  job_parameters, schedule, next_scheduled_time, total_scheduled_executions,
                  status AS "status: JobStatus"
        "#,
        next,
        job_uuid,
    )
    .fetch_one(&state.pool)
    .await?;

    write_audit(
        &state.pool,
        &AuditEntry {
            action: "job.start",
            resource: "job",
            resource_id: Some(job_uuid),
            project_uuid: Some(row.project_uuid),
            detail: None,
        },
    )
    .await;

    Ok(row.into())
}

fn next_fire_time(expr: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>, ApiError> {
    let schedule = Schedule::from_str(&normalize_cron(expr))
        .map_err(|err| ApiError::BadRequest(format!("invalid cron schedule: {err}")))?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| ApiError::BadRequest(format!("cron schedule {expr} has no future firing")))
}

/// §4.2.5 specifies a standard five-field cron expression (minute hour
/// day-of-month month day-of-week); the `cron` crate parses the
/// seconds-first six-field form, so a bare five-field expression is
/// widened with a leading `0` seconds field.
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

/// Jobs whose `next_scheduled_time` has arrived; polled by the background
/// scheduler loop (distinct from the two [`crate::scheduler`]-registered
/// singleton jobs, since each Job row carries its own due time).
pub async fn list_due(pool: &PgPool) -> Result<Vec<Uuid>, ApiError> {
    let rows = sqlx::query!(
        r#"
        SELECT uuid FROM jobs
        WHERE status = 'STARTED' AND next_scheduled_time <= now()
        "#
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|row| row.uuid).collect())
}

/// Instantiates one PipelineRun per entry of the cartesian product of
/// `job_parameters`, then either completes (one-shot) or reschedules
/// (recurring) the job.
#[tracing::instrument(skip(state))]
pub async fn instantiate(state: &AppState, job_uuid: Uuid) -> Result<usize, ApiError> {
    let job = get(state, job_uuid).await?;
    if job.status != JobStatus::Started {
        return Ok(0);
    }

    let parameter_sets = cartesian_product(&job.job_parameters);
    let schedule_start = job.total_scheduled_executions;

    let mut created = 0usize;
    for (offset, parameters) in parameter_sets.iter().enumerate() {
        let spec = pipeline_run::RunSpec {
            project_uuid: job.project_uuid,
            pipeline_uuid: job.pipeline_uuid,
            kind: RunKind::NonInteractive,
            job_uuid: Some(job.uuid),
            job_schedule_number: Some(schedule_start + i32::try_from(offset).unwrap_or(i32::MAX)),
            pipeline_definition: job.pipeline_definition.clone(),
            pipeline_parameters: parameters.clone(),
        };
        pipeline_run::create(state, spec).await?;
        created += 1;
    }

    advance_schedule(&state.pool, &job, created).await?;
    Ok(created)
}

async fn advance_schedule(pool: &PgPool, job: &Job, created: usize) -> Result<(), ApiError> {
    let total = job.total_scheduled_executions + i32::try_from(created).unwrap_or(i32::MAX);

    match &job.schedule {
        Some(expr) => {
            let next = next_fire_time(expr, Utc::now())?;
            sqlx::query!(
                r#"UPDATE jobs SET total_scheduled_executions = $1, next_scheduled_time = $2 WHERE uuid = $3"#,
                total,
                next,
                job.uuid,
            )
            .execute(pool)
            .await?;
        }
        None => {
            sqlx::query!(
                r#"UPDATE jobs SET total_scheduled_executions = $1, status = 'SUCCESS', next_scheduled_time = NULL WHERE uuid = $2"#,
                total,
                job.uuid,
            )
            .execute(pool)
            .await?;
        }
    }

    Ok(())
}

/// `job_parameters` is an array of dimensions, each an array of candidate
/// values; the cartesian product assembles one JSON array per combination
/// (one entry per dimension, in order).
fn cartesian_product(job_parameters: &serde_json::Value) -> Vec<serde_json::Value> {
    let dimensions = match job_parameters.as_array() {
        Some(dims) if !dims.is_empty() => dims,
        _ => return vec![serde_json::Value::Array(Vec::new())],
    };

    let mut combinations: Vec<Vec<serde_json::Value>> = vec![Vec::new()];
    for dimension in dimensions {
        let values = dimension.as_array().cloned().unwrap_or_default();
        let mut next = Vec::with_capacity(combinations.len() * values.len().max(1));
        for combo in &combinations {
            for value in &values {
                let mut extended = combo.clone();
                extended.push(value.clone());
                next.push(extended);
            }
        }
        combinations = next;
    }

    combinations
        .into_iter()
        .map(serde_json::Value::Array)
        .collect()
}

/// §4.2.5 `abort`: cancels all non-terminal runs belonging to the job and
/// marks the job `ABORTED`.
#[tracing::instrument(skip(state))]
pub async fn abort(state: &AppState, job_uuid: Uuid) -> Result<bool, ApiError> {
    let mut tx = state.pool.begin().await?;

    let runs = sqlx::query!(
        r#"SELECT uuid FROM pipeline_runs WHERE job_uuid = $1 AND status IN ('PENDING', 'STARTED')"#,
        job_uuid,
    )
    .fetch_all(&mut *tx)
    .await?;

    for run in &runs {
        pipeline_run::abort_in_tx(&mut tx, run.uuid).await?;
    }

    let result = sqlx::query!(
        r#"UPDATE jobs SET status = 'ABORTED' WHERE uuid = $1 AND status NOT IN ('SUCCESS', 'FAILURE', 'ABORTED')"#,
        job_uuid,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    let changed = result.rows_affected() > 0;
    if changed {
        for run in runs {
            state.tasks.abort(run.uuid);
        }

        write_audit(
            &state.pool,
            &AuditEntry {
                action: "job.abort",
                resource: "job",
                resource_id: Some(job_uuid),
                project_uuid: None,
                detail: None,
            },
        )
        .await;
    }

    Ok(changed)
}

pub async fn get(state: &AppState, job_uuid: Uuid) -> Result<Job, ApiError> {
    let row = sqlx::query_as!(
        JobRow,
        r#"
        SELECT uuid, project_uuid, pipeline_uuid, pipeline_definition, pipeline_run_spec,
               job_parameters, schedule, next_scheduled_time, total_scheduled_executions,
               status AS "status: JobStatus"
        FROM jobs WHERE uuid = $1
        "#,
        job_uuid,
    )
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("job {job_uuid} not found")))?;

    Ok(row.into())
}

pub async fn list(state: &AppState) -> Result<Vec<Job>, ApiError> {
    let rows = sqlx::query_as!(
        JobRow,
        r#"
        SELECT uuid, project_uuid, pipeline_uuid, pipeline_definition, pipeline_run_spec,
               job_parameters, schedule, next_scheduled_time, total_scheduled_executions,
               status AS "status: JobStatus"
        FROM jobs
        "#,
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

struct JobRow {
    uuid: Uuid,
    project_uuid: Uuid,
    pipeline_uuid: Uuid,
    pipeline_definition: serde_json::Value,
    pipeline_run_spec: serde_json::Value,
    job_parameters: serde_json::Value,
    schedule: Option<String>,
    next_scheduled_time: Option<DateTime<Utc>>,
    total_scheduled_executions: i32,
    status: JobStatus,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Self {
            uuid: row.uuid,
            project_uuid: row.project_uuid,
            pipeline_uuid: row.pipeline_uuid,
            pipeline_definition: row.pipeline_definition,
            pipeline_run_spec: row.pipeline_run_spec,
            job_parameters: row.job_parameters,
            schedule: row.schedule,
            next_scheduled_time: row.next_scheduled_time,
            total_scheduled_executions: row.total_scheduled_executions,
            status: row.status,
        }
    }
}
