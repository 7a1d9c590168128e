//! Docker Engine backed `ContainerRuntime`, implemented with `bollard`.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use bollard::query_parameters::{
    BuildImageOptions, ListContainersOptions, ListImagesOptions, LogsOptions,
    RemoveContainerOptions, RemoveImageOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::secret::{HostConfig, PortBinding};
use futures_util::stream::StreamExt;

use super::{BuildSpec, ContainerRuntime, ContainerRuntimeError, ContainerSpec, ImageSummary};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, ContainerRuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|err| ContainerRuntimeError::Transport(err.to_string()))?;
        Ok(Self { docker })
    }
}

impl From<bollard::errors::Error> for ContainerRuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        match &err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            } => Self::NotFound(err.to_string()),
            _ => Self::Transport(err.to_string()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(&self, spec: &BuildSpec) -> Result<String, ContainerRuntimeError> {
        let tar = tokio::task::spawn_blocking({
            let context_path = spec.context_path.clone();
            move || tar_directory(&context_path)
        })
        .await
        .map_err(|err| ContainerRuntimeError::Other(err.to_string()))?
        .map_err(|err| ContainerRuntimeError::Other(err.to_string()))?;

        let options = BuildImageOptions {
            dockerfile: spec.dockerfile.clone(),
            t: Some(spec.tag.clone()),
            labels: Some(spec.labels.clone()),
            rm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(tar.into()));
        let mut last_error = None;
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(info) => {
                    if let Some(err) = info.error {
                        last_error = Some(err);
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
        if let Some(err) = last_error {
            return Err(ContainerRuntimeError::Other(err));
        }

        self.inspect_image_by_name(&spec.tag)
            .await?
            .ok_or_else(|| ContainerRuntimeError::NotFound(spec.tag.clone()))
    }

    async fn inspect_image_by_name(
        &self,
        name: &str,
    ) -> Result<Option<String>, ContainerRuntimeError> {
        match self.docker.inspect_image(name).await {
            Ok(image) => Ok(image.id),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_images_by_label(
        &self,
        label: &str,
    ) -> Result<Vec<ImageSummary>, ContainerRuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);
        let options = ListImagesOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let images = self.docker.list_images(Some(options)).await?;
        Ok(images
            .into_iter()
            .map(|image| ImageSummary {
                id: image.id,
                repo_tags: image
                    .repo_tags
                    .into_iter()
                    .filter(|tag| tag != "<none>:<none>")
                    .collect(),
                labels: image.labels,
            })
            .collect())
    }

    async fn remove_image(&self, id: &str) -> Result<(), ContainerRuntimeError> {
        let options = RemoveImageOptions {
            force: true,
            noprune: false,
        };
        match self.docker.remove_image(id, Some(options), None).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, ContainerRuntimeError> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let config = bollard::models::ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                port_bindings: Some(HashMap::<String, Option<Vec<PortBinding>>>::new()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = bollard::query_parameters::CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), config)
            .await?;

        self.docker
            .start_container(&created.id, None::<bollard::query_parameters::StartContainerOptions>)
            .await?;

        Ok(created.id)
    }

    async fn wait_container(&self, id: &str) -> Result<i64, ContainerRuntimeError> {
        let options = WaitContainerOptions {
            condition: "not-running".to_string(),
        };
        let mut stream = self.docker.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(err)) => Err(err.into()),
            None => Err(ContainerRuntimeError::Other(
                "wait stream ended without a status".into(),
            )),
        }
    }

    async fn container_logs(&self, id: &str) -> Result<String, ContainerRuntimeError> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(log) => out.push_str(&log.to_string()),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(out)
    }

    async fn stop_container(&self, id: &str) -> Result<(), ContainerRuntimeError> {
        let options = StopContainerOptions {
            t: Some(10),
            ..Default::default()
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 304,
                ..
            }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), ContainerRuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_containers_by_label(
        &self,
        label: &str,
    ) -> Result<Vec<String>, ContainerRuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);
        let options = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

fn tar_directory(path: &std::path::Path) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", path)?;
    builder.into_inner()
}
