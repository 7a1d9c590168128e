pub mod environment_build;
pub mod job;
pub mod jupyter_build;
pub mod pipeline_run;
pub mod session;

pub(crate) const ENV_BUILD_TASK_LABEL: &str = "_orchest_env_build_task_uuid";
pub(crate) const ENV_BUILD_INTERMEDIATE_LABEL: &str = "_orchest_env_build_is_intermediate";
pub(crate) const PROJECT_LABEL: &str = "_orchest_project_uuid";
pub(crate) const ENVIRONMENT_LABEL: &str = "_orchest_environment_uuid";

/// Removes any intermediate images a build task may have published,
/// matched by the task-uuid label (§4.2.1 abort collateral).
async fn remove_task_intermediate_images(
    cra: &dyn crate::cra::ContainerRuntime,
    task_uuid: uuid::Uuid,
) {
    let label = format!("{ENV_BUILD_TASK_LABEL}={task_uuid}");
    match cra.list_images_by_label(&label).await {
        Ok(images) => {
            for image in images {
                if let Err(err) = cra.remove_image(&image.id).await {
                    tracing::warn!(error = %err, image_id = %image.id, "failed to remove intermediate build image");
                }
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, %task_uuid, "failed to list intermediate build images for removal");
        }
    }
}
