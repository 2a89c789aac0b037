//! Prepares and launches a single task step.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::config::RunnerConfig;
use crate::error::{RunError, SecretError};
use crate::execution::dispatcher::{ContainerHandle, ExecutionDispatcher};
use crate::runner::command::ContainerCommand;
use crate::runner::request::{CommittedTaskStep, RunTaskReq};
use crate::runner::script::{ScriptContext, ScriptGenerator};
use crate::runner::workspace::WorkspaceBuilder;
use crate::variables::resolver::decrypt_map;
use crate::variables::secret::{SealedCipher, SecretCipher};

/// A step whose workspace and script are on disk, ready to dispatch.
#[derive(Debug, Clone)]
pub struct PreparedStep {
    pub workspace: PathBuf,
    pub script_path: PathBuf,
    pub command: ContainerCommand,
}

/// Turns run requests into prepared steps and running containers.
pub struct TaskRunner {
    config: RunnerConfig,
    workspace: WorkspaceBuilder,
    scripts: ScriptGenerator,
    cipher: Arc<dyn SecretCipher>,
}

impl TaskRunner {
    /// Creates a runner with an explicit cipher.
    ///
    /// # Errors
    /// Returns `RunError::Script` if the step templates fail to compile.
    pub fn new(config: RunnerConfig, cipher: Arc<dyn SecretCipher>) -> Result<Self, RunError> {
        Ok(Self {
            workspace: WorkspaceBuilder::from_config(&config),
            scripts: ScriptGenerator::new()?,
            config,
            cipher,
        })
    }

    /// Creates a runner that opens secrets with the configured key.
    pub fn from_config(config: RunnerConfig) -> Result<Self, RunError> {
        let cipher = SealedCipher::new(&config.secret_key)?;
        info!(key = %cipher.fingerprint(), "Secret cipher ready");
        Self::new(config, Arc::new(cipher))
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn workspace(&self) -> &WorkspaceBuilder {
        &self.workspace
    }

    pub fn cipher(&self) -> &dyn SecretCipher {
        self.cipher.as_ref()
    }

    /// Copy of the request with every variable and the private key opened.
    fn open_secrets(&self, req: &RunTaskReq) -> Result<(RunTaskReq, String), SecretError> {
        let cipher = self.cipher.as_ref();
        let mut plain = req.clone();
        plain.env.environment_vars = decrypt_map(&req.env.environment_vars, cipher)?;
        plain.env.terraform_vars = decrypt_map(&req.env.terraform_vars, cipher)?;
        plain.env.ansible_vars = decrypt_map(&req.env.ansible_vars, cipher)?;

        let private_key = cipher
            .decrypt(&req.private_key)
            .map_err(|e| SecretError::PrivateKey(Box::new(e)))?;
        plain.private_key.clear();
        Ok((plain, private_key))
    }

    /// Renders the step script without touching the filesystem.
    pub fn render(&self, req: &RunTaskReq) -> Result<String, RunError> {
        let ctx = ScriptContext::from_request(req, &self.config.assets_dir);
        Ok(self.scripts.render(req.step_type, &ctx)?)
    }

    /// Writes the workspace and step script and builds the container command.
    ///
    /// Everything that can be checked without side effects (secrets, script
    /// inputs, environment names) is checked before the first write.
    ///
    /// # Errors
    /// `Secret` when a value fails to decrypt, `Script`/`Dispatch` for
    /// invalid inputs, `Workspace` for filesystem failures.
    #[instrument(skip(self, req), fields(task_id = %req.task_id, step = req.step, step_type = %req.step_type))]
    pub fn prepare(&self, req: &RunTaskReq) -> Result<PreparedStep, RunError> {
        let (plain, private_key) = self.open_secrets(req)?;
        let script = self.render(&plain)?;
        let command =
            ContainerCommand::build(&plain, &self.workspace.workspace_path(&plain), &self.config)?;

        let workspace = self.workspace.build(&plain, &private_key)?;
        let script_path = self
            .workspace
            .write_step_script(&workspace, plain.step, &script)?;

        info!(
            workspace = %workspace.display(),
            container = %command.name,
            "Step prepared"
        );
        Ok(PreparedStep {
            workspace,
            script_path,
            command,
        })
    }

    /// Starts a prepared step and records its container in `step-info.json`.
    pub async fn start(
        &self,
        req: &RunTaskReq,
        prepared: &PreparedStep,
        dispatcher: &dyn ExecutionDispatcher,
    ) -> Result<ContainerHandle, RunError> {
        let handle = dispatcher.start(&prepared.command).await?;

        let committed = CommittedTaskStep {
            env_id: req.env.id.clone(),
            task_id: req.task_id.clone(),
            step: req.step,
            container_id: handle.id.clone(),
        };
        if let Err(e) = self.workspace.write_step_info(&prepared.workspace, &committed) {
            warn!(container_id = %handle.id, error = %e, "Failed to record step info");
        }
        Ok(handle)
    }

    /// Prepares and starts a step.
    pub async fn run(
        &self,
        req: &RunTaskReq,
        dispatcher: &dyn ExecutionDispatcher,
    ) -> Result<(PreparedStep, ContainerHandle), RunError> {
        let prepared = self.prepare(req)?;
        let handle = self.start(req, &prepared, dispatcher).await?;
        Ok((prepared, handle))
    }
}
