//! Resource Locker: pins a pipeline run to specific image ids across its
//! whole duration, converging against concurrent builds that rename the
//! same environment's image out from under it (§4.4).

use std::collections::{BTreeSet, HashMap};

use sqlx::PgPool;
use uuid::Uuid;

use crate::cra::{ContainerRuntime, environment_image_name};
use crate::error::ApiError;

/// Resolves the current image id for each environment, failing the
/// whole call if any environment has no materialized image yet.
async fn resolve_images(
    cra: &dyn ContainerRuntime,
    project_uuid: Uuid,
    env_uuids: &BTreeSet<Uuid>,
) -> Result<HashMap<Uuid, String>, ApiError> {
    let mut resolved = HashMap::with_capacity(env_uuids.len());
    for &env_uuid in env_uuids {
        let name = environment_image_name(&project_uuid, &env_uuid);
        let image_id = cra
            .inspect_image_by_name(&name)
            .await?
            .ok_or_else(|| ApiError::ImageNotFound(env_uuid.to_string()))?;
        resolved.insert(env_uuid, image_id);
    }
    Ok(resolved)
}

async fn upsert_mappings(
    pool: &PgPool,
    run_uuid: Uuid,
    mapping: &HashMap<Uuid, String>,
) -> Result<(), sqlx::Error> {
    for (env_uuid, image_id) in mapping {
        sqlx::query!(
            r#"
            INSERT INTO pipeline_run_image_mappings (run_uuid, orchest_environment_uuid, docker_img_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (run_uuid, orchest_environment_uuid)
            DO UPDATE SET docker_img_id = EXCLUDED.docker_img_id
            "#,
            run_uuid,
            env_uuid,
            image_id,
        )
        .execute(pool)
        .await?;
    }
    Ok(())
}

fn same_image_set(a: &HashMap<Uuid, String>, b: &HashMap<Uuid, String>) -> bool {
    let a_values: BTreeSet<&String> = a.values().collect();
    let b_values: BTreeSet<&String> = b.values().collect();
    a_values == b_values
}

/// Implements the four-step protocol of §4.4: resolve, commit, re-resolve,
/// converge. Bounded to `max_iterations` re-resolve rounds as a defensive
/// backstop against a pathologically fast rebuild loop; under the
/// invariant argued in §4.4 this never fires in practice.
pub async fn lock_images(
    pool: &PgPool,
    cra: &dyn ContainerRuntime,
    project_uuid: Uuid,
    run_uuid: Uuid,
    env_uuids: &BTreeSet<Uuid>,
) -> Result<HashMap<Uuid, String>, ApiError> {
    if env_uuids.is_empty() {
        return Ok(HashMap::new());
    }

    let mut current = resolve_images(cra, project_uuid, env_uuids).await?;
    upsert_mappings(pool, run_uuid, &current).await?;

    const MAX_ITERATIONS: u32 = 50;
    for _ in 0..MAX_ITERATIONS {
        let resolved = resolve_images(cra, project_uuid, env_uuids).await?;
        if same_image_set(&current, &resolved) {
            return Ok(current);
        }
        upsert_mappings(pool, run_uuid, &resolved).await?;
        tracing::info!(%run_uuid, "lock_images re-converged after an image rename");
        current = resolved;
    }

    Err(ApiError::Internal(anyhow::anyhow!(
        "lock_images did not converge for run {run_uuid} after {MAX_ITERATIONS} iterations"
    )))
}
