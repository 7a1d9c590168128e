//! In-memory `ContainerRuntime` double for controller and worker tests.
//! Records every call so tests can assert on what was asked of the
//! engine, not just the resulting status rows.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{BuildSpec, ContainerRuntime, ContainerRuntimeError, ContainerSpec, ImageSummary};

#[derive(Debug, Clone)]
pub enum RuntimeCall {
    BuildImage { tag: String },
    InspectImageByName { name: String },
    ListImagesByLabel { label: String },
    RemoveImage { id: String },
    RunContainer { name: String, image: String },
    WaitContainer { id: String },
    ContainerLogs { id: String },
    StopContainer { id: String },
    RemoveContainer { id: String },
    ListContainersByLabel { label: String },
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<RuntimeCall>,
    images_by_name: HashMap<String, String>,
    images: HashMap<String, ImageSummary>,
    containers: HashMap<String, i64>,
    logs: HashMap<String, String>,
    next_id: u64,
    fail_build: Option<ContainerRuntimeError>,
}

/// Fake docker engine: images and containers are just in-memory rows.
/// Tests seed state with [`FakeContainerRuntime::seed_image`] /
/// [`FakeContainerRuntime::set_exit_code`] and assert on [`calls`].
#[derive(Clone)]
pub struct FakeContainerRuntime {
    inner: std::sync::Arc<Mutex<FakeState>>,
}

impl Default for FakeContainerRuntime {
    fn default() -> Self {
        Self {
            inner: std::sync::Arc::new(Mutex::new(FakeState::default())),
        }
    }
}

impl FakeContainerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn seed_image(&self, name: &str, docker_id: &str) {
        let mut state = self.inner.lock().unwrap();
        state
            .images_by_name
            .insert(name.to_string(), docker_id.to_string());
        state.images.insert(
            docker_id.to_string(),
            ImageSummary {
                id: docker_id.to_string(),
                repo_tags: vec![name.to_string()],
                labels: HashMap::new(),
            },
        );
    }

    pub fn seed_dangling_image(&self, docker_id: &str, labels: HashMap<String, String>) {
        let mut state = self.inner.lock().unwrap();
        state.images.insert(
            docker_id.to_string(),
            ImageSummary {
                id: docker_id.to_string(),
                repo_tags: Vec::new(),
                labels,
            },
        );
    }

    pub fn set_exit_code(&self, container_id: &str, code: i64) {
        self.inner
            .lock()
            .unwrap()
            .containers
            .insert(container_id.to_string(), code);
    }

    pub fn set_logs(&self, container_id: &str, logs: &str) {
        self.inner
            .lock()
            .unwrap()
            .logs
            .insert(container_id.to_string(), logs.to_string());
    }

    pub fn fail_next_build(&self, err: ContainerRuntimeError) {
        self.inner.lock().unwrap().fail_build = Some(err);
    }
}

#[async_trait]
impl ContainerRuntime for FakeContainerRuntime {
    async fn build_image(&self, spec: &BuildSpec) -> Result<String, ContainerRuntimeError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(RuntimeCall::BuildImage {
            tag: spec.tag.clone(),
        });
        if let Some(err) = state.fail_build.take() {
            return Err(err);
        }
        state.next_id += 1;
        let id = format!("sha256:fake{}", state.next_id);
        state.images_by_name.insert(spec.tag.clone(), id.clone());
        state.images.insert(
            id.clone(),
            ImageSummary {
                id: id.clone(),
                repo_tags: vec![spec.tag.clone()],
                labels: spec.labels.clone(),
            },
        );
        Ok(id)
    }

    async fn inspect_image_by_name(
        &self,
        name: &str,
    ) -> Result<Option<String>, ContainerRuntimeError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(RuntimeCall::InspectImageByName {
            name: name.to_string(),
        });
        Ok(state.images_by_name.get(name).cloned())
    }

    async fn list_images_by_label(
        &self,
        label: &str,
    ) -> Result<Vec<ImageSummary>, ContainerRuntimeError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(RuntimeCall::ListImagesByLabel {
            label: label.to_string(),
        });
        let (key, _) = label.split_once('=').unwrap_or((label, ""));
        Ok(state
            .images
            .values()
            .filter(|image| image.labels.contains_key(key))
            .cloned()
            .collect())
    }

    async fn remove_image(&self, id: &str) -> Result<(), ContainerRuntimeError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(RuntimeCall::RemoveImage { id: id.to_string() });
        state.images.remove(id);
        state.images_by_name.retain(|_, v| v != id);
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, ContainerRuntimeError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(RuntimeCall::RunContainer {
            name: spec.name.clone(),
            image: spec.image.clone(),
        });
        state.next_id += 1;
        let id = format!("container-fake-{}", state.next_id);
        state.containers.insert(id.clone(), 0);
        Ok(id)
    }

    async fn wait_container(&self, id: &str) -> Result<i64, ContainerRuntimeError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(RuntimeCall::WaitContainer { id: id.to_string() });
        state
            .containers
            .get(id)
            .copied()
            .ok_or_else(|| ContainerRuntimeError::NotFound(id.to_string()))
    }

    async fn container_logs(&self, id: &str) -> Result<String, ContainerRuntimeError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(RuntimeCall::ContainerLogs { id: id.to_string() });
        Ok(state.logs.get(id).cloned().unwrap_or_default())
    }

    async fn stop_container(&self, id: &str) -> Result<(), ContainerRuntimeError> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push(RuntimeCall::StopContainer { id: id.to_string() });
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), ContainerRuntimeError> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(RuntimeCall::RemoveContainer { id: id.to_string() });
        state.containers.remove(id);
        Ok(())
    }

    async fn list_containers_by_label(
        &self,
        label: &str,
    ) -> Result<Vec<String>, ContainerRuntimeError> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push(RuntimeCall::ListContainersByLabel {
                label: label.to_string(),
            });
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn build_then_inspect_resolves_the_same_id() {
        let cra = FakeContainerRuntime::new();
        let spec = BuildSpec {
            context_path: "/tmp".into(),
            dockerfile: "Dockerfile".into(),
            tag: "orchest-env-test".into(),
            labels: HashMap::new(),
        };

        let built_id = cra.build_image(&spec).await.unwrap();
        let resolved = cra
            .inspect_image_by_name("orchest-env-test")
            .await
            .unwrap();

        assert_eq!(resolved, Some(built_id));
    }

    #[tokio::test]
    async fn inspecting_an_unknown_name_returns_none() {
        let cra = FakeContainerRuntime::new();
        assert_eq!(cra.inspect_image_by_name("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_images_by_label_filters_on_label_key() {
        let cra = FakeContainerRuntime::new();
        let mut labels = HashMap::new();
        labels.insert("_orchest_env_build_task_uuid".to_string(), "t1".to_string());
        cra.seed_dangling_image("sha256:dangling", labels);

        let found = cra
            .list_images_by_label("_orchest_env_build_task_uuid=t1")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "sha256:dangling");
    }

    #[tokio::test]
    async fn build_failure_is_surfaced_and_not_retained() {
        let cra = FakeContainerRuntime::new();
        cra.fail_next_build(ContainerRuntimeError::Other("disk full".into()));
        let spec = BuildSpec {
            context_path: "/tmp".into(),
            dockerfile: "Dockerfile".into(),
            tag: "orchest-env-test".into(),
            labels: HashMap::new(),
        };

        assert!(cra.build_image(&spec).await.is_err());
        // second attempt succeeds since the one-shot failure was consumed
        assert!(cra.build_image(&spec).await.is_ok());
    }
}
