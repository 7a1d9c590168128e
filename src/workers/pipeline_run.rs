//! Worker for a claimed `PipelineRun`: walks the pipeline DAG in
//! topological order, running each step's container against the image id
//! locked by the Resource Locker (§4.4), and updates both the per-step and
//! the run-level status as it goes.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cra::ContainerSpec;
use crate::pipeline_def::PipelineDefinition;
use crate::status::{Status, StatusUpdate, update_status_db, update_status_db_composite};
use crate::store::AppState;

pub(crate) struct ClaimedRun {
    pub uuid: Uuid,
    pub project_uuid: Uuid,
    pub pipeline_definition: serde_json::Value,
}

pub(crate) async fn claim_pending(pool: &PgPool) -> anyhow::Result<Option<ClaimedRun>> {
    let mut tx = pool.begin().await?;

    let candidate = sqlx::query!(
        r#"
        SELECT uuid, project_uuid, pipeline_definition
        FROM pipeline_runs
        WHERE status = 'PENDING'
        ORDER BY started_time NULLS FIRST
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
        "pipeline_runs",
        "uuid",
        candidate.uuid,
        &StatusUpdate::to(Status::Started, Utc::now()),
    )
    .await?;

    tx.commit().await?;

    Ok(Some(ClaimedRun {
        uuid: candidate.uuid,
        project_uuid: candidate.project_uuid,
        pipeline_definition: candidate.pipeline_definition,
    }))
}

pub(crate) async fn run(state: &AppState, run: ClaimedRun, token: CancellationToken) {
    let outcome = execute(state, &run, &token).await;

    if !token.is_cancelled() {
        let status = match outcome {
            Ok(()) => Status::Success,
            Err(err) => {
                tracing::warn!(run_uuid = %run.uuid, error = %err, "pipeline run failed");
                Status::Failure
            }
        };

        if let Err(err) = update_status_db(
            &state.pool,
            "pipeline_runs",
            "uuid",
            run.uuid,
            &StatusUpdate::to(status, Utc::now()),
        )
        .await
        {
            tracing::error!(run_uuid = %run.uuid, error = %err, "failed to record run outcome");
        }
    }

    state.tasks.unregister(run.uuid);
}

async fn execute(
    state: &AppState,
    run: &ClaimedRun,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    let definition = PipelineDefinition::parse(&run.pipeline_definition)?;
    let order = topological_order(&definition)?;

    let mappings = sqlx::query!(
        r#"SELECT orchest_environment_uuid, docker_img_id FROM pipeline_run_image_mappings WHERE run_uuid = $1"#,
        run.uuid,
    )
    .fetch_all(&state.pool)
    .await?;
    let image_by_env: HashMap<Uuid, String> = mappings
        .into_iter()
        .map(|row| (row.orchest_environment_uuid, row.docker_img_id))
        .collect();

    for step_uuid in order {
        if token.is_cancelled() {
            anyhow::bail!("run aborted before step {step_uuid} started");
        }

        let step = &definition.steps[&step_uuid];
        let image_id = image_by_env
            .get(&step.environment)
            .ok_or_else(|| anyhow::anyhow!("no locked image for environment {}", step.environment))?;

        run_step(state, run, step_uuid, image_id, token).await?;
    }

    Ok(())
}

async fn run_step(
    state: &AppState,
    run: &ClaimedRun,
    step_uuid: Uuid,
    image_id: &str,
    token: &CancellationToken,
) -> anyhow::Result<()> {
    update_status_db_composite(
        &state.pool,
        "pipeline_run_steps",
        ["run_uuid", "step_uuid"],
        (run.uuid, step_uuid),
        &StatusUpdate::to(Status::Started, Utc::now()),
    )
    .await?;

    let mut labels = HashMap::new();
    labels.insert("_orchest_pipeline_run_uuid".to_string(), run.uuid.to_string());
    labels.insert("_orchest_project_uuid".to_string(), run.project_uuid.to_string());
    labels.insert("_orchest_step_uuid".to_string(), step_uuid.to_string());

    let spec = ContainerSpec {
        name: format!("orchest-step-{}-{step_uuid}", run.uuid),
        image: image_id.to_string(),
        command: Vec::new(),
        env: Vec::new(),
        labels,
    };

    if token.is_cancelled() {
        anyhow::bail!("run aborted before step {step_uuid} container started");
    }

    let container_id = crate::cra::with_retry(
        state.config.cra_call_timeout,
        state.config.cra_retries,
        || state.cra.run_container(&spec),
    )
    .await?;

    let exit_code = crate::cra::with_retry(
        state.config.cra_call_timeout,
        state.config.cra_retries,
        || state.cra.wait_container(&container_id),
    )
    .await?;

    let _ = state.cra.remove_container(&container_id).await;

    let step_status = if exit_code == 0 { Status::Success } else { Status::Failure };
    update_status_db_composite(
        &state.pool,
        "pipeline_run_steps",
        ["run_uuid", "step_uuid"],
        (run.uuid, step_uuid),
        &StatusUpdate::to(step_status, Utc::now()),
    )
    .await?;

    if step_status == Status::Failure {
        anyhow::bail!("step {step_uuid} exited with code {exit_code}");
    }

    Ok(())
}

/// Kahn's algorithm over `incoming_connections`; any cycle is rejected —
/// pipelines are DAGs by construction (§1 Non-goals).
fn topological_order(definition: &PipelineDefinition) -> anyhow::Result<Vec<Uuid>> {
    let mut indegree: HashMap<Uuid, usize> = HashMap::with_capacity(definition.steps.len());
    for (uuid, step) in &definition.steps {
        let count = step
            .incoming_connections
            .iter()
            .filter(|parent| definition.steps.contains_key(*parent))
            .count();
        indegree.insert(*uuid, count);
    }

    let mut queue: VecDeque<Uuid> = indegree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(uuid, _)| *uuid)
        .collect();

    let mut children: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (uuid, step) in &definition.steps {
        for parent in &step.incoming_connections {
            children.entry(*parent).or_default().push(*uuid);
        }
    }

    let mut order = Vec::with_capacity(definition.steps.len());
    let mut visited = HashSet::new();
    while let Some(uuid) = queue.pop_front() {
        if !visited.insert(uuid) {
            continue;
        }
        order.push(uuid);
        for child in children.get(&uuid).into_iter().flatten() {
            if let Some(count) = indegree.get_mut(child) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    queue.push_back(*child);
                }
            }
        }
    }

    if order.len() != definition.steps.len() {
        anyhow::bail!("pipeline definition contains a cycle");
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topological_order_respects_incoming_connections() {
        let a = Uuid::from_bytes([1; 16]);
        let b = Uuid::from_bytes([2; 16]);
        let definition = PipelineDefinition::parse(&json!({
            "steps": {
                a.to_string(): { "environment": Uuid::nil().to_string(), "incoming_connections": [] },
                b.to_string(): { "environment": Uuid::nil().to_string(), "incoming_connections": [a.to_string()] },
            },
            "services": {},
        }))
        .unwrap();

        let order = topological_order(&definition).unwrap();
        assert_eq!(order, vec![a, b]);
    }

    #[test]
    fn topological_order_rejects_a_cycle() {
        let a = Uuid::from_bytes([1; 16]);
        let b = Uuid::from_bytes([2; 16]);
        let definition = PipelineDefinition::parse(&json!({
            "steps": {
                a.to_string(): { "environment": Uuid::nil().to_string(), "incoming_connections": [b.to_string()] },
                b.to_string(): { "environment": Uuid::nil().to_string(), "incoming_connections": [a.to_string()] },
            },
            "services": {},
        }))
        .unwrap();

        assert!(topological_order(&definition).is_err());
    }
}
