use super::{
    ContainerEngine, ContainerSpec, EngineError, ImageInfo, ImageReference, LogChunk, LogStream,
    MountSource,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::{CreateImageOptions, PushImageOptions};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures_util::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

pub const DOCKER_SOCKET_PATH: &str = "/var/run/docker.sock";

const STOP_TIMEOUT_SECS: i64 = 10;
const MANAGED_LABEL: &str = "io.cnbpack.managed";

/// Container engine backed by a local Docker-compatible daemon
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects using `DOCKER_HOST` or the platform default socket
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Checks that the daemon answers, returning its API version
    pub async fn check_available(&self) -> Result<String, EngineError> {
        if std::env::var("DOCKER_HOST").is_err() && !Path::new(DOCKER_SOCKET_PATH).exists() {
            return Err(EngineError::Unavailable(format!(
                "Docker socket not found at {}",
                DOCKER_SOCKET_PATH
            )));
        }

        let version = self
            .docker
            .version()
            .await
            .map_err(|e| EngineError::Unavailable(e.to_string()))?;
        let api_version = version.api_version.unwrap_or_else(|| "0.0".to_string());
        debug!("Docker API version: {}", api_version);
        Ok(api_version)
    }
}

fn map_error(operation: &str, err: DockerError) -> EngineError {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => EngineError::Api {
            operation: operation.to_string(),
            status: Some(status_code),
            message,
        },
        DockerError::IOError { err } => EngineError::Unavailable(err.to_string()),
        other => EngineError::api(operation, other.to_string()),
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn to_mount(spec: &super::MountSpec) -> Mount {
    let (typ, source) = match &spec.source {
        MountSource::Volume(name) => (MountTypeEnum::VOLUME, name.clone()),
        MountSource::Bind(path) => (MountTypeEnum::BIND, path.display().to_string()),
    };
    Mount {
        target: Some(spec.target.clone()),
        source: Some(source),
        typ: Some(typ),
        read_only: Some(spec.read_only),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn pull_image(&self, reference: &str) -> Result<(), EngineError> {
        let parsed = ImageReference::parse(reference)
            .map_err(|e| EngineError::api("pull", e.to_string()))?;
        let options = CreateImageOptions {
            from_image: parsed.repository.clone(),
            tag: parsed.pull_tag(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(|e| map_error("pull", e))?;
            if let Some(status) = info.status {
                debug!(image = %reference, "{}", status);
            }
        }
        Ok(())
    }

    async fn push_image(&self, reference: &str) -> Result<(), EngineError> {
        let parsed = ImageReference::parse(reference)
            .map_err(|e| EngineError::api("push", e.to_string()))?;
        let options = PushImageOptions {
            tag: parsed.pull_tag(),
        };

        let mut stream = self
            .docker
            .push_image(&parsed.repository, Some(options), None);
        while let Some(progress) = stream.next().await {
            let info = progress.map_err(|e| map_error("push", e))?;
            if let Some(error) = info.error {
                return Err(EngineError::api("push", error));
            }
            if let Some(status) = info.status {
                debug!(image = %reference, "{}", status);
            }
        }
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> Result<Option<ImageInfo>, EngineError> {
        match self.docker.inspect_image(reference).await {
            Ok(inspect) => Ok(Some(ImageInfo {
                id: inspect.id.unwrap_or_default(),
                labels: inspect
                    .config
                    .and_then(|config| config.labels)
                    .unwrap_or_default(),
            })),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(map_error("inspect image", e)),
        }
    }

    async fn create_volume(&self, name: &str) -> Result<(), EngineError> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            labels: HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())]),
            ..Default::default()
        };
        self.docker
            .create_volume(options)
            .await
            .map_err(|e| map_error("create volume", e))?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), EngineError> {
        match self
            .docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(map_error("remove volume", e)),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let host_config = HostConfig {
            mounts: Some(spec.mounts.iter().map(to_mount).collect()),
            network_mode: Some(spec.network.as_engine_value().to_string()),
            ..Default::default()
        };

        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let config = Config {
            image: Some(spec.image.clone()),
            entrypoint: Some(spec.entrypoint.clone()),
            cmd: Some(spec.args.clone()),
            env: Some(
                spec.env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            user: spec.user.clone(),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });

        let response = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| map_error("create container", e))?;
        for warning in response.warnings {
            debug!(container = %response.id, "Engine warning: {}", warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_error("start container", e))
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports non-zero exits as an error carrying the code
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(map_error("wait container", e)),
            None => Err(EngineError::api(
                "wait container",
                "wait stream ended without an exit status",
            )),
        }
    }

    fn logs(&self, id: &str) -> BoxStream<'_, Result<LogChunk, EngineError>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        self.docker
            .logs(id, Some(options))
            .map(|item| match item {
                Ok(LogOutput::StdErr { message }) => Ok(LogChunk {
                    stream: LogStream::Stderr,
                    text: String::from_utf8_lossy(&message).into_owned(),
                }),
                Ok(output) => Ok(LogChunk {
                    stream: LogStream::Stdout,
                    text: output.to_string(),
                }),
                Err(e) => Err(map_error("logs", e)),
            })
            .boxed()
    }

    async fn stop_container(&self, id: &str) -> Result<(), EngineError> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            // 304: already stopped
            Err(DockerError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_error("stop container", e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(map_error("remove container", e)),
        }
    }

    fn name(&self) -> &str {
        "docker"
    }
}
