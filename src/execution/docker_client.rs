//! Docker API wrapper using the bollard crate.
//!
//! Thin async layer over the container lifecycle calls the step dispatcher
//! needs: create, start, wait, stop, remove and image pulls.

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;

use crate::error::DispatchError;
use crate::runner::command::ContainerCommand;

/// Configuration for creating a new container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique container name.
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: Option<String>,
    /// Bind mounts (host:container format).
    pub binds: Vec<String>,
    /// Network mode (e.g., "none", "bridge", "host").
    pub network_mode: Option<String>,
}

impl ContainerSpec {
    /// Creates a spec with the given name and image.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            binds: Vec::new(),
            network_mode: Some("bridge".to_string()),
        }
    }

    /// Spec for a step command.
    pub fn from_command(command: &ContainerCommand) -> Self {
        Self::new(&command.name, &command.image)
            .with_cmd(command.commands.clone())
            .with_env(command.env.clone())
            .with_working_dir(&command.workdir)
            .with_binds(command.binds.clone())
    }

    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_binds(mut self, binds: Vec<String>) -> Self {
        self.binds = binds;
        self
    }
}

/// Status of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatusInfo {
    Created,
    Running,
    Paused,
    Restarting,
    Exited { exit_code: i64 },
    Removing,
    Dead,
    Unknown(String),
}

/// Docker client wrapper for container operations.
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Creates a new Docker client connecting to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::DaemonUnavailable` if the Docker daemon is not accessible.
    pub fn new() -> Result<Self, DispatchError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DispatchError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Creates a new Docker client from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    /// Creates a container and returns its ID.
    pub async fn create_container(&self, spec: ContainerSpec) -> Result<String, DispatchError> {
        let host_config = HostConfig {
            network_mode: spec.network_mode.clone(),
            binds: if spec.binds.is_empty() {
                None
            } else {
                Some(spec.binds.clone())
            },
            ..Default::default()
        };

        let container_config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            env: if spec.env.is_empty() {
                None
            } else {
                Some(spec.env.clone())
            },
            working_dir: spec.working_dir.clone(),
            host_config: Some(host_config),
            tty: Some(false),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| DispatchError::RunFailed(format!("Failed to create container: {e}")))?;

        Ok(response.id)
    }

    /// Starts a container by ID.
    pub async fn start_container(&self, id: &str) -> Result<(), DispatchError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| DispatchError::RunFailed(format!("Failed to start container: {e}")))?;

        Ok(())
    }

    /// Stops a container by ID.
    ///
    /// Sends SIGTERM and waits up to 10 seconds before sending SIGKILL. A
    /// container that already stopped is left alone.
    pub async fn stop_container(&self, id: &str) -> Result<(), DispatchError> {
        let options = StopContainerOptions { t: 10 };

        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_lookup_error(id, e, "Failed to stop container")),
        }
    }

    /// Removes a container by ID.
    ///
    /// # Arguments
    ///
    /// * `id` - Container ID
    /// * `force` - Force removal even if running
    pub async fn remove_container(&self, id: &str, force: bool) -> Result<(), DispatchError> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_lookup_error(id, e, "Failed to remove container"))
    }

    /// Gets the status of a container.
    pub async fn container_status(&self, id: &str) -> Result<ContainerStatusInfo, DispatchError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_lookup_error(id, e, "Failed to inspect container"))?;

        let state = info
            .state
            .ok_or_else(|| DispatchError::RunFailed("Container has no state".to_string()))?;

        let status = state.status.map(|s| s.to_string()).unwrap_or_default();

        match status.as_str() {
            "created" => Ok(ContainerStatusInfo::Created),
            "running" => Ok(ContainerStatusInfo::Running),
            "paused" => Ok(ContainerStatusInfo::Paused),
            "restarting" => Ok(ContainerStatusInfo::Restarting),
            "removing" => Ok(ContainerStatusInfo::Removing),
            "exited" => Ok(ContainerStatusInfo::Exited {
                exit_code: state.exit_code.unwrap_or(-1),
            }),
            "dead" => Ok(ContainerStatusInfo::Dead),
            other => Ok(ContainerStatusInfo::Unknown(other.to_string())),
        }
    }

    /// Pulls a Docker image from a registry.
    ///
    /// # Arguments
    ///
    /// * `image` - Image name with optional tag (e.g., "cloudiac/ct-worker:latest")
    pub async fn pull_image(&self, image: &str) -> Result<(), DispatchError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            result.map_err(|e| DispatchError::RunFailed(format!("Failed to pull image: {e}")))?;
        }

        Ok(())
    }

    /// Checks if an image exists locally.
    pub async fn image_exists(&self, image: &str) -> bool {
        self.docker.inspect_image(image).await.is_ok()
    }

    /// Waits for a container to finish executing.
    ///
    /// # Returns
    ///
    /// The exit code of the container.
    pub async fn wait_container(&self, id: &str) -> Result<i64, DispatchError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => return Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => return Ok(code),
            Some(Err(e)) => return Err(map_lookup_error(id, e, "Error waiting for container")),
            None => {}
        }

        match self.container_status(id).await? {
            ContainerStatusInfo::Exited { exit_code } => Ok(exit_code),
            other => Err(DispatchError::RunFailed(format!(
                "Container did not exit normally: {other:?}"
            ))),
        }
    }
}

fn map_lookup_error(id: &str, e: BollardError, context: &str) -> DispatchError {
    match e {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => DispatchError::ContainerNotFound { id: id.to_string() },
        other => DispatchError::RunFailed(format!("{context}: {other}")),
    }
}
