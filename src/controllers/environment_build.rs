//! EnvironmentBuild lifecycle controller (§4.2.1).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::audit::{AuditEntry, write_audit};
use crate::error::ApiError;
use crate::models::EnvironmentBuild;
use crate::status::{Status, StatusUpdate, update_status_db};
use crate::store::AppState;

use super::remove_task_intermediate_images;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BuildRequest {
    pub project_uuid: Uuid,
    pub environment_uuid: Uuid,
    pub project_path: String,
}

#[derive(Debug, Serialize)]
pub struct FailedRequest {
    pub request: BuildRequest,
    pub reason: String,
}

/// §4.2.1 `create`: dedupes the incoming batch by the 3-tuple, then runs
/// one independent TPE per unique request so a failure in one never
/// blocks the others (the 201-full-success / 500-partial-failure HTTP
/// contract is built on top of this in the API layer).
#[tracing::instrument(skip(state, requests))]
pub async fn create(
    state: &AppState,
    requests: Vec<BuildRequest>,
) -> (Vec<EnvironmentBuild>, Vec<FailedRequest>) {
    let mut deduped = Vec::new();
    for request in requests {
        if !deduped.contains(&request) {
            deduped.push(request);
        }
    }

    let mut created = Vec::new();
    let mut failed = Vec::new();

    for request in deduped {
        match create_one(state, request.clone()).await {
            Ok(build) => created.push(build),
            Err(err) => failed.push(FailedRequest {
                request,
                reason: err.to_string(),
            }),
        }
    }

    (created, failed)
}

async fn create_one(state: &AppState, request: BuildRequest) -> anyhow::Result<EnvironmentBuild> {
    let pool = state.pool.clone();
    let (build, collateral_result) = crate::tpe::run_with_revert(
        &pool,
        |tx| {
            let request = request.clone();
            Box::pin(async move { transaction_phase(tx, request).await })
        },
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
            action: "environment_build.create",
            resource: "environment_build",
            resource_id: Some(build.uuid),
            project_uuid: Some(build.project_uuid),
            detail: None,
        },
    )
    .await;

    collateral_result?;
    Ok(build)
}

async fn transaction_phase(
    tx: &mut Transaction<'_, Postgres>,
    request: BuildRequest,
) -> anyhow::Result<EnvironmentBuild> {
    let existing = sqlx::query!(
        r#"
        SELECT uuid FROM environment_builds
        WHERE project_uuid = $1 AND environment_uuid = $2 AND project_path = $3
          AND status IN ('PENDING', 'STARTED')
        "#,
        request.project_uuid,
        request.environment_uuid,
        request.project_path,
    )
    .fetch_all(&mut **tx)
    .await?;

    for row in existing {
        update_status_db(
            &mut **tx,
            "environment_builds",
            "uuid",
            row.uuid,
            &StatusUpdate::to(Status::Aborted, Utc::now()),
        )
        .await?;
    }

    let build = sqlx::query_as!(
        EnvironmentBuildRow,
        r#"
        INSERT INTO environment_builds (uuid, project_uuid, environment_uuid, project_path, status)
        VALUES ($1, $2, $3, $4, 'PENDING')
        RETURNING uuid, project_uuid, environment_uuid, project_path,
                  requested_time, started_time, finished_time, status AS "status: Status"
        "#,
        Uuid::new_v4(),
        request.project_uuid,
        request.environment_uuid,
        request.project_path,
    )
    .fetch_one(&mut **tx)
    .await?;

    Ok(build.into())
}

async fn collateral_phase(
    _cra: &dyn crate::cra::ContainerRuntime,
    build: &EnvironmentBuild,
) -> anyhow::Result<()> {
    // Submission is non-blocking: the row is already PENDING, the
    // background dispatcher claims and runs it. Nothing else to do here.
    tracing::info!(build_uuid = %build.uuid, "environment build submitted to dispatcher");
    Ok(())
}

async fn revert_phase(pool: &PgPool, build_uuid: Uuid) -> anyhow::Result<()> {
    update_status_db(
        pool,
        "environment_builds",
        "uuid",
        build_uuid,
        &StatusUpdate::to(Status::Failure, Utc::now()),
    )
    .await?;
    Ok(())
}

/// §4.2.1 `abort`: flips status to `ABORTED` iff non-terminal, then
/// revokes/aborts the task and cleans up intermediate images.
#[tracing::instrument(skip(state))]
pub async fn abort(state: &AppState, build_uuid: Uuid) -> Result<bool, ApiError> {
    let changed = update_status_db(
        &state.pool,
        "environment_builds",
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
                action: "environment_build.abort",
                resource: "environment_build",
                resource_id: Some(build_uuid),
                project_uuid: None,
                detail: None,
            },
        )
        .await;
    }

    Ok(changed)
}

/// §4.2.1 `delete_for_project` / `delete_for_env`: abort the active head
/// (by `requested_time DESC`) if any, then hard-delete every row
/// matching the filter.
#[tracing::instrument(skip(state))]
pub async fn delete_for_project(state: &AppState, project_uuid: Uuid) -> Result<(), ApiError> {
    delete_matching(state, project_uuid, None).await
}

#[tracing::instrument(skip(state))]
pub async fn delete_for_env(
    state: &AppState,
    project_uuid: Uuid,
    environment_uuid: Uuid,
) -> Result<(), ApiError> {
    delete_matching(state, project_uuid, Some(environment_uuid)).await
}

async fn delete_matching(
    state: &AppState,
    project_uuid: Uuid,
    environment_uuid: Option<Uuid>,
) -> Result<(), ApiError> {
    let rows = sqlx::query!(
        r#"
        SELECT uuid, status AS "status: Status" FROM environment_builds
        WHERE project_uuid = $1 AND ($2::uuid IS NULL OR environment_uuid = $2)
        ORDER BY requested_time DESC
        "#,
        project_uuid,
        environment_uuid,
    )
    .fetch_all(&state.pool)
    .await?;

    if let Some(head) = rows.first() {
        if !head.status.terminal() {
            abort(state, head.uuid).await?;
        }
    }

    sqlx::query!(
        r#"
        DELETE FROM environment_builds
        WHERE project_uuid = $1 AND ($2::uuid IS NULL OR environment_uuid = $2)
        "#,
        project_uuid,
        environment_uuid,
    )
    .execute(&state.pool)
    .await?;

    Ok(())
}

pub async fn get(state: &AppState, build_uuid: Uuid) -> Result<EnvironmentBuild, ApiError> {
    let row = sqlx::query_as!(
        EnvironmentBuildRow,
        r#"
        SELECT uuid, project_uuid, environment_uuid, project_path,
               requested_time, started_time, finished_time, status AS "status: Status"
        FROM environment_builds WHERE uuid = $1
        "#,
        build_uuid,
    )
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::NotFound(format!("environment build {build_uuid} not found")))?;

    Ok(row.into())
}

pub async fn list(state: &AppState) -> Result<Vec<EnvironmentBuild>, ApiError> {
    let rows = sqlx::query_as!(
        EnvironmentBuildRow,
        r#"
        SELECT uuid, project_uuid, environment_uuid, project_path,
               requested_time, started_time, finished_time, status AS "status: Status"
        FROM environment_builds ORDER BY requested_time DESC
        "#,
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

/// Latest build per environment for a project.
pub async fn most_recent_for_project(
    state: &AppState,
    project_uuid: Uuid,
) -> Result<Vec<EnvironmentBuild>, ApiError> {
    let rows = sqlx::query_as!(
        EnvironmentBuildRow,
        r#"
        SELECT DISTINCT ON (environment_uuid)
               uuid, project_uuid, environment_uuid, project_path,
               requested_time, started_time, finished_time, status AS "status: Status"
        FROM environment_builds
        WHERE project_uuid = $1
        ORDER BY environment_uuid, requested_time DESC
        "#,
        project_uuid,
    )
    .fetch_all(&state.pool)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn most_recent_for_env(
    state: &AppState,
    project_uuid: Uuid,
    environment_uuid: Uuid,
) -> Result<EnvironmentBuild, ApiError> {
    let row = sqlx::query_as!(
        EnvironmentBuildRow,
        r#"
        SELECT uuid, project_uuid, environment_uuid, project_path,
               requested_time, started_time, finished_time, status AS "status: Status"
        FROM environment_builds
        WHERE project_uuid = $1 AND environment_uuid = $2
        ORDER BY requested_time DESC
        LIMIT 1
        "#,
        project_uuid,
        environment_uuid,
    )
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::NotFound("no builds for that environment".into()))?;

    Ok(row.into())
}

struct EnvironmentBuildRow {
    uuid: Uuid,
    project_uuid: Uuid,
    environment_uuid: Uuid,
    project_path: String,
    requested_time: chrono::DateTime<Utc>,
    started_time: Option<chrono::DateTime<Utc>>,
    finished_time: Option<chrono::DateTime<Utc>>,
    status: Status,
}

impl From<EnvironmentBuildRow> for EnvironmentBuild {
    fn from(row: EnvironmentBuildRow) -> Self {
        Self {
            uuid: row.uuid,
            project_uuid: row.project_uuid,
            environment_uuid: row.environment_uuid,
            project_path: row.project_path,
            requested_time: row.requested_time,
            started_time: row.started_time,
            finished_time: row.finished_time,
            status: row.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_dedupes_identical_requests_in_a_batch() {
        let request = BuildRequest {
            project_uuid: Uuid::nil(),
            environment_uuid: Uuid::nil(),
            project_path: "a".into(),
        };
        let batch = vec![request.clone(), request.clone(), request];
        let mut deduped = Vec::new();
        for r in batch {
            if !deduped.contains(&r) {
                deduped.push(r);
            }
        }
        assert_eq!(deduped.len(), 1);
    }
}
