//! Container Runtime Adapter (CRA): the narrow interface the rest of the
//! control plane uses to ask the container engine to build, list, remove,
//! and run things. Nothing upstream of this module talks to `bollard`
//! directly — the engine is an external collaborator, we only specify
//! what we ask of it.

pub mod docker;
pub mod fake;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;

/// An image found by a label query, as reported by the engine.
#[derive(Debug, Clone)]
pub struct ImageSummary {
    pub id: String,
    /// Empty iff the image is nameless and tag-less (a GC candidate).
    pub repo_tags: Vec<String>,
    pub labels: HashMap<String, String>,
}

/// What to build: a Dockerfile-style build context tagged with a name and
/// labelled for later discovery (e.g. `_orchest_env_build_task_uuid`).
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub context_path: PathBuf,
    pub dockerfile: String,
    pub tag: String,
    pub labels: HashMap<String, String>,
}

/// What to run: a single container invocation (an environment-build
/// worker, a pipeline step, a session's gateway/notebook server).
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerRuntimeError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("{0}")]
    Other(String),
}

impl ContainerRuntimeError {
    /// Transient, transport-classified errors are the only ones that get
    /// retried with backoff; "not found" never is (§5).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// The narrow interface onto the container engine: build, list by label,
/// remove, run, inspect, stop — and nothing else.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn build_image(&self, spec: &BuildSpec) -> Result<String, ContainerRuntimeError>;

    /// Resolve the current docker id of an image by its canonical name.
    /// `Ok(None)` if no such image is materialized.
    async fn inspect_image_by_name(&self, name: &str)
    -> Result<Option<String>, ContainerRuntimeError>;

    async fn list_images_by_label(
        &self,
        label: &str,
    ) -> Result<Vec<ImageSummary>, ContainerRuntimeError>;

    async fn remove_image(&self, id: &str) -> Result<(), ContainerRuntimeError>;

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, ContainerRuntimeError>;

    /// Block until the container reaches a terminal state, returning its
    /// exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, ContainerRuntimeError>;

    async fn container_logs(&self, id: &str) -> Result<String, ContainerRuntimeError>;

    async fn stop_container(&self, id: &str) -> Result<(), ContainerRuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), ContainerRuntimeError>;

    async fn list_containers_by_label(
        &self,
        label: &str,
    ) -> Result<Vec<String>, ContainerRuntimeError>;
}

/// Canonical image name for an environment, per §6.
pub fn environment_image_name(project_uuid: &uuid::Uuid, environment_uuid: &uuid::Uuid) -> String {
    format!("orchest-env-{project_uuid}-{environment_uuid}")
}

/// Run a CRA call with the per-call timeout and retry policy from §5:
/// up to `retries` attempts with exponential backoff, only for
/// transport-classified errors, never for "not found".
pub async fn with_retry<F, Fut, T>(
    timeout: std::time::Duration,
    retries: u32,
    mut call: F,
) -> Result<T, ContainerRuntimeError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ContainerRuntimeError>>,
{
    let mut attempt = 0;
    loop {
        let outcome = tokio::time::timeout(timeout, call())
            .await
            .unwrap_or(Err(ContainerRuntimeError::Timeout(timeout)));

        match outcome {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transport() && attempt < retries => {
                let backoff = std::time::Duration::from_millis(100 * 2u64.pow(attempt));
                tracing::warn!(error = %err, attempt, "CRA call failed, retrying");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
