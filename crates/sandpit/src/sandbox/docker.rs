//! Docker backend for the container runtime
//!
//! Talks to the Docker Engine API through bollard. Sandboxes are plain
//! containers: created stopped, started once per run, and reused between
//! runs until their pool destroys them.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, LogsOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder, UploadToContainerOptionsBuilder,
    WaitContainerOptionsBuilder,
};
use bollard::{API_DEFAULT_VERSION, Docker};
use futures_util::{StreamExt, TryStreamExt};
use tracing::debug;

use crate::sandbox::runtime::{ContainerRuntime, CreateRequest, RuntimeError, SandboxId};
use crate::types::ExitStatus;

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Container runtime backed by a Docker daemon
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform default socket
    pub fn connect_local() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|source| api_error("connect", source))?;
        Ok(Self { docker })
    }

    /// Connect to a daemon listening on a unix socket
    pub fn connect_socket(path: &Path) -> Result<Self, RuntimeError> {
        let socket = path.to_string_lossy();
        let docker = Docker::connect_with_socket(&socket, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|source| api_error("connect", source))?;
        Ok(Self { docker })
    }

    /// Connect to the configured socket, or the local defaults
    pub fn connect(socket: Option<&Path>) -> Result<Self, RuntimeError> {
        match socket {
            Some(path) => Self::connect_socket(path),
            None => Self::connect_local(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, request: &CreateRequest) -> Result<SandboxId, RuntimeError> {
        let limits = &request.limits;
        let body = ContainerCreateBody {
            image: Some(request.image.clone()),
            cmd: Some(request.command.clone()),
            working_dir: Some(request.workdir.clone()),
            tty: Some(false),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                cap_drop: Some(vec!["ALL".to_string()]),
                cap_add: Some(Vec::new()),
                binds: None,
                memory: Some(limits.memory_bytes()),
                cpu_quota: Some(limits.cpu_quota),
                cpu_period: Some(limits.cpu_period),
                pids_limit: limits.pids_limit,
                network_mode: Some("none".to_string()),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        let response = self
            .docker
            .create_container(None::<CreateContainerOptions>, body)
            .await
            .map_err(|source| api_error("create_container", source))?;

        for warning in &response.warnings {
            debug!(%warning, "container created with warning");
        }

        Ok(SandboxId::new(response.id))
    }

    async fn copy_files_in(&self, id: &SandboxId, archive: Vec<u8>) -> Result<(), RuntimeError> {
        let options = UploadToContainerOptionsBuilder::new().path("/").build();
        self.docker
            .upload_to_container(id.as_str(), Some(options), bollard::body_full(archive.into()))
            .await
            .map_err(|source| api_error("upload_to_container", source))
    }

    async fn start(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions>)
            .await
            .map_err(|source| api_error("start_container", source))
    }

    async fn wait_until_not_running(&self, id: &SandboxId) -> Result<ExitStatus, RuntimeError> {
        let options = WaitContainerOptionsBuilder::new()
            .condition("not-running")
            .build();
        let mut stream = self.docker.wait_container(id.as_str(), Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(ExitStatus {
                code: response.status_code,
                error: response.error.and_then(|error| error.message),
            }),
            // bollard reports a non-zero exit code as an error; for a
            // submission that is a regular outcome.
            Some(Err(BollardError::DockerContainerWaitError { error, code })) => Ok(ExitStatus {
                code,
                error: (!error.is_empty()).then_some(error),
            }),
            Some(Err(source)) => Err(api_error("wait_container", source)),
            None => Err(RuntimeError::StreamEnded {
                operation: "wait_container",
            }),
        }
    }

    async fn logs_since(&self, id: &SandboxId, since: i64) -> Result<Vec<u8>, RuntimeError> {
        let options = LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .since(i32::try_from(since).unwrap_or(i32::MAX))
            .build();

        self.docker
            .logs(id.as_str(), Some(options))
            .map_err(|source| api_error("logs", source))
            .try_fold(Vec::new(), |mut output, chunk| async move {
                output.extend_from_slice(&chunk.into_bytes());
                Ok(output)
            })
            .await
    }

    async fn stop(&self, id: &SandboxId, grace: Duration) -> Result<(), RuntimeError> {
        let grace = i32::try_from(grace.as_secs()).unwrap_or(i32::MAX);
        let options = StopContainerOptionsBuilder::new().t(grace).build();
        match self.docker.stop_container(id.as_str(), Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped: sandboxes sit stopped between runs.
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(source) => Err(api_error("stop_container", source)),
        }
    }

    async fn remove(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptionsBuilder::new()
            .force(true)
            .v(true)
            .build();
        self.docker
            .remove_container(id.as_str(), Some(options))
            .await
            .map_err(|source| api_error("remove_container", source))
    }
}

fn api_error(operation: &'static str, error: BollardError) -> RuntimeError {
    match error {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        other => RuntimeError::Api {
            operation,
            message: other.to_string(),
        },
    }
}
