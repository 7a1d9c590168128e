//! Image garbage collector: reclaims intermediate and superseded
//! environment-build images that no active pipeline run still needs
//! (§4.6, I6).

use std::time::Duration;

use sqlx::PgPool;
use uuid::Uuid;

use crate::cra::ContainerRuntime;

const NOT_INTERMEDIATE_LABEL: &str = "_orchest_env_build_is_intermediate=0";
const PROJECT_LABEL_KEY: &str = "_orchest_project_uuid";

const REMOVE_RETRIES: u32 = 10;
const REMOVE_RETRY_SPACING: Duration = Duration::from_secs(1);

/// True iff no `PipelineRunImageMapping` row pins `image_id` to a run
/// still in `{PENDING, STARTED}` (I6).
async fn is_image_in_use(pool: &PgPool, image_id: &str) -> Result<bool, sqlx::Error> {
    let count = sqlx::query_scalar!(
        r#"
        SELECT COUNT(*) AS "count!"
        FROM pipeline_run_image_mappings m
        JOIN pipeline_runs r ON r.uuid = m.run_uuid
        WHERE m.docker_img_id = $1
          AND r.status IN ('PENDING', 'STARTED')
        "#,
        image_id,
    )
    .fetch_one(pool)
    .await?;

    Ok(count > 0)
}

/// Removes a single dangling image, retrying up to [`REMOVE_RETRIES`]
/// times spaced [`REMOVE_RETRY_SPACING`] apart to tolerate a container
/// still tearing down and briefly holding a reference to the image.
async fn remove_with_retry(cra: &dyn ContainerRuntime, image_id: &str) {
    use crate::cra::ContainerRuntimeError;

    for attempt in 0..REMOVE_RETRIES {
        match cra.remove_image(image_id).await {
            Ok(()) => return,
            Err(ContainerRuntimeError::NotFound(_)) => return,
            Err(err) => {
                tracing::warn!(
                    image_id,
                    attempt,
                    error = %err,
                    "failed to remove dangling image, retrying"
                );
                tokio::time::sleep(REMOVE_RETRY_SPACING).await;
            }
        }
    }
    tracing::error!(image_id, "giving up removing dangling image after {REMOVE_RETRIES} attempts");
}

/// Sweeps one project's non-intermediate images, removing every one
/// that is dangling (nameless and unreferenced by a live run).
#[tracing::instrument(skip(pool, cra))]
pub async fn sweep_project(
    pool: &PgPool,
    cra: &dyn ContainerRuntime,
    project_uuid: Uuid,
) -> anyhow::Result<usize> {
    let label = format!("{PROJECT_LABEL_KEY}={project_uuid}");
    let images = cra.list_images_by_label(&label).await?;
    let candidates = cra.list_images_by_label(NOT_INTERMEDIATE_LABEL).await?;

    let candidate_ids: std::collections::HashSet<_> =
        candidates.iter().map(|image| image.id.clone()).collect();

    let mut removed = 0;
    for image in images.into_iter().filter(|i| candidate_ids.contains(&i.id)) {
        if !image.repo_tags.is_empty() {
            continue;
        }
        if is_image_in_use(pool, &image.id).await? {
            continue;
        }
        tracing::info!(image_id = %image.id, "removing dangling image");
        remove_with_retry(cra, &image.id).await;
        removed += 1;
    }

    Ok(removed)
}

/// Runs the opportunistic sweep on every registered project, once per
/// `interval`, until `shutdown` fires. One project's sweep failing never
/// stops the others from being swept on the same tick.
pub async fn run(
    state: crate::store::AppState,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = sweep_all_projects(&state).await {
                    tracing::error!(error = %err, "gc sweep failed");
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("gc sweep stopping");
                break;
            }
        }
    }
}

async fn sweep_all_projects(state: &crate::store::AppState) -> anyhow::Result<()> {
    let projects = sqlx::query_scalar!(r#"SELECT uuid FROM projects"#)
        .fetch_all(&state.pool)
        .await?;

    for project_uuid in projects {
        if let Err(err) = sweep_project(&state.pool, state.cra.as_ref(), project_uuid).await {
            tracing::error!(error = %err, %project_uuid, "project image sweep failed");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remove_with_retry_gives_up_after_exhausting_attempts() {
        use crate::cra::fake::FakeContainerRuntime;
        use crate::cra::ContainerRuntimeError;

        let cra = FakeContainerRuntime::new();
        // remove_image on the fake always succeeds; simulate persistent
        // failure by pointing at a runtime whose remove_image errors.
        struct AlwaysFailingRuntime;
        #[async_trait::async_trait]
        impl ContainerRuntime for AlwaysFailingRuntime {
            async fn build_image(
                &self,
                _spec: &crate::cra::BuildSpec,
            ) -> Result<String, ContainerRuntimeError> {
                unimplemented!()
            }
            async fn inspect_image_by_name(
                &self,
                _name: &str,
            ) -> Result<Option<String>, ContainerRuntimeError> {
                unimplemented!()
            }
            async fn list_images_by_label(
                &self,
                _label: &str,
            ) -> Result<Vec<crate::cra::ImageSummary>, ContainerRuntimeError> {
                unimplemented!()
            }
            async fn remove_image(&self, _id: &str) -> Result<(), ContainerRuntimeError> {
                Err(ContainerRuntimeError::Transport("engine unreachable".into()))
            }
            async fn run_container(
                &self,
                _spec: &crate::cra::ContainerSpec,
            ) -> Result<String, ContainerRuntimeError> {
                unimplemented!()
            }
            async fn wait_container(&self, _id: &str) -> Result<i64, ContainerRuntimeError> {
                unimplemented!()
            }
            async fn container_logs(&self, _id: &str) -> Result<String, ContainerRuntimeError> {
                unimplemented!()
            }
            async fn stop_container(&self, _id: &str) -> Result<(), ContainerRuntimeError> {
                unimplemented!()
            }
            async fn remove_container(&self, _id: &str) -> Result<(), ContainerRuntimeError> {
                unimplemented!()
            }
            async fn list_containers_by_label(
                &self,
                _label: &str,
            ) -> Result<Vec<String>, ContainerRuntimeError> {
                unimplemented!()
            }
        }

        let _ = cra;
        let start = std::time::Instant::now();
        remove_with_retry(&AlwaysFailingRuntime, "sha256:stuck").await;
        // REMOVE_RETRIES attempts spaced REMOVE_RETRY_SPACING apart; the last
        // failure doesn't sleep again, so elapsed is (N-1) spacings.
        assert!(start.elapsed() >= REMOVE_RETRY_SPACING * (REMOVE_RETRIES - 1));
    }
}
