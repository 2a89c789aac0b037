//! Boundary between the runner and the container runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::DispatchError;
use crate::execution::docker_client::{ContainerSpec, DockerClient};
use crate::runner::command::ContainerCommand;

/// Reference to a started container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
}

impl ContainerHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            started_at: Utc::now(),
        }
    }
}

/// Runs step commands in isolated containers.
#[async_trait]
pub trait ExecutionDispatcher: Send + Sync {
    /// Starts the command and returns without waiting for it.
    async fn start(&self, command: &ContainerCommand) -> Result<ContainerHandle, DispatchError>;

    /// Waits for the container to exit and returns its exit code. The
    /// container's name is free for reuse once this returns.
    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, DispatchError>;

    /// Stops the container and frees its name. Stopping an exited container
    /// is not an error.
    async fn stop(&self, handle: &ContainerHandle) -> Result<(), DispatchError>;
}

/// Dispatcher backed by the local Docker daemon.
pub struct DockerDispatcher {
    client: DockerClient,
    /// Pull missing images before creating containers.
    pull_missing: bool,
}

impl DockerDispatcher {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    /// Returns `DispatchError::DaemonUnavailable` if the daemon cannot be reached.
    pub fn connect() -> Result<Self, DispatchError> {
        Ok(Self::from_client(DockerClient::new()?))
    }

    pub fn from_client(client: DockerClient) -> Self {
        Self {
            client,
            pull_missing: true,
        }
    }

    pub fn without_pull(mut self) -> Self {
        self.pull_missing = false;
        self
    }

    /// Force-removes a container by id or name. A missing container is fine.
    async fn discard(&self, id_or_name: &str) {
        match self.client.remove_container(id_or_name, true).await {
            Ok(()) | Err(DispatchError::ContainerNotFound { .. }) => {}
            Err(e) => warn!(container = %id_or_name, error = %e, "Failed to remove container"),
        }
    }
}

#[async_trait]
impl ExecutionDispatcher for DockerDispatcher {
    async fn start(&self, command: &ContainerCommand) -> Result<ContainerHandle, DispatchError> {
        if self.pull_missing && !self.client.image_exists(&command.image).await {
            info!(image = %command.image, "Pulling worker image");
            self.client.pull_image(&command.image).await?;
        }

        // A step container left behind by a crashed runner holds the name.
        self.discard(&command.name).await;

        let spec = ContainerSpec::from_command(command);
        let id = self.client.create_container(spec).await?;
        if let Err(e) = self.client.start_container(&id).await {
            self.discard(&id).await;
            return Err(e);
        }

        info!(container_id = %id, name = %command.name, "Container started");
        Ok(ContainerHandle::new(id, command.name.clone()))
    }

    async fn wait(&self, handle: &ContainerHandle) -> Result<i64, DispatchError> {
        let exit_code = self.client.wait_container(&handle.id).await;
        self.discard(&handle.id).await;
        exit_code
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<(), DispatchError> {
        let stopped = match self.client.stop_container(&handle.id).await {
            Ok(()) | Err(DispatchError::ContainerNotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        };
        self.discard(&handle.id).await;
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_serializes_camel_case() {
        let handle = ContainerHandle::new("abc123", "iac-t1-step0");
        let json = serde_json::to_value(&handle).expect("serialize");
        assert_eq!(json["id"], "abc123");
        assert!(json.get("startedAt").is_some());
    }
}
