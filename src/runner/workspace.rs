//! Per-task workspace construction.
//!
//! The first step of a task creates the workspace and writes every file the
//! generated scripts rely on: the private key, the backend configuration, the
//! playbook variables and the policy bundles. Later steps only add their own
//! `step<N>/` directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tera::{Context, Tera};
use tracing::{debug, info, instrument, warn};

use crate::config::RunnerConfig;
use crate::error::WorkspaceError;
use crate::model::step::StepType;
use crate::runner::paths::{
    is_contained, is_single_segment, step_dir, task_workspace, up_to_workspace, CLOUDIAC_PLAY_VARS,
    CLOUDIAC_TF_FILE, POLICIES_DIR, POLICY_META_FILE, POLICY_REGO_FILE, SSH_KEY_FILE,
    TASK_STEP_INFO_FILE_NAME, TASK_STEP_SCRIPT_NAME,
};
use crate::runner::request::{CommittedTaskStep, RunTaskReq};

const BACKEND_TEMPLATE: &str = r#"terraform {
  backend "{{ backend }}" {
    address = "{{ address }}"
    scheme  = "{{ scheme }}"
    path    = "{{ path }}"
    lock    = true
    gzip    = false
  }
}

locals {
  cloudiac_ssh_user    = "root"
  cloudiac_private_key = "{{ private_key_path }}"
}
"#;

/// Builds and resets task workspaces under a storage root.
#[derive(Debug, Clone)]
pub struct WorkspaceBuilder {
    storage_path: PathBuf,
    default_state_address: String,
}

impl WorkspaceBuilder {
    pub fn new(storage_path: impl Into<PathBuf>, default_state_address: impl Into<String>) -> Self {
        Self {
            storage_path: storage_path.into(),
            default_state_address: default_state_address.into(),
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(&config.storage_path, &config.default_state_address)
    }

    /// Host path of the workspace for a request.
    pub fn workspace_path(&self, req: &RunTaskReq) -> PathBuf {
        self.task_path(&req.env.id, &req.task_id)
    }

    /// Host path of a task's workspace.
    pub fn task_path(&self, env_id: &str, task_id: &str) -> PathBuf {
        task_workspace(&self.storage_path, env_id, task_id)
    }

    /// Ensures the workspace for the request's step exists.
    ///
    /// The working directory and policy ids are checked before anything is
    /// written. On step 0 the workspace is created and populated; an `init`
    /// step refuses to run over an existing workspace.
    ///
    /// # Arguments
    /// * `req` - Run request with decrypted variables
    /// * `private_key` - Decrypted private key, may be empty
    ///
    /// # Errors
    /// `InvalidWorkdir`/`InvalidPolicyId` for unsafe paths, `AlreadyExists`
    /// on a double init, `Io` or serialization errors while writing.
    #[instrument(skip(self, req, private_key), fields(task_id = %req.task_id, step = req.step))]
    pub fn build(&self, req: &RunTaskReq, private_key: &str) -> Result<PathBuf, WorkspaceError> {
        if !is_contained(&req.env.workdir) {
            return Err(WorkspaceError::InvalidWorkdir(req.env.workdir.clone()));
        }
        if let Some(policy) = req.policies.iter().find(|p| !is_single_segment(&p.policy_id)) {
            return Err(WorkspaceError::InvalidPolicyId(policy.policy_id.clone()));
        }

        let workspace = self.workspace_path(req);
        if !req.is_first_step() {
            debug!(workspace = %workspace.display(), "Reusing workspace");
            return Ok(workspace);
        }

        if workspace.exists() && req.step_type == StepType::Init {
            return Err(WorkspaceError::AlreadyExists(
                workspace.display().to_string(),
            ));
        }

        info!(workspace = %workspace.display(), "Creating workspace");
        fs::create_dir_all(&workspace).map_err(|e| WorkspaceError::io(&workspace, e))?;

        write_private_key(&workspace.join(SSH_KEY_FILE), private_key)?;
        self.write_backend_config(&workspace, req)?;
        write_play_vars(&workspace, req)?;
        write_policies(&workspace, req)?;

        Ok(workspace)
    }

    /// Clears what a failed attempt left behind so the step can run again.
    ///
    /// Step 0 removes the whole workspace, later steps only their own
    /// `step<N>/` directory.
    pub fn reset_for_retry(
        &self,
        env_id: &str,
        task_id: &str,
        index: u32,
    ) -> Result<(), WorkspaceError> {
        let workspace = self.task_path(env_id, task_id);
        let target = if index == 0 {
            workspace
        } else {
            step_dir(&workspace, index)
        };

        if target.exists() {
            warn!(path = %target.display(), "Removing previous attempt");
            fs::remove_dir_all(&target).map_err(|e| WorkspaceError::io(&target, e))?;
        }
        Ok(())
    }

    /// Writes `step<N>/script.sh`, creating the step directory.
    pub fn write_step_script(
        &self,
        workspace: &Path,
        index: u32,
        script: &str,
    ) -> Result<PathBuf, WorkspaceError> {
        let dir = step_dir(workspace, index);
        fs::create_dir_all(&dir).map_err(|e| WorkspaceError::io(&dir, e))?;

        let path = dir.join(TASK_STEP_SCRIPT_NAME);
        fs::write(&path, script).map_err(|e| WorkspaceError::io(&path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .map_err(|e| WorkspaceError::io(&path, e))?;
        }
        Ok(path)
    }

    /// Records which container runs a step.
    pub fn write_step_info(
        &self,
        workspace: &Path,
        info: &CommittedTaskStep,
    ) -> Result<PathBuf, WorkspaceError> {
        let path = step_dir(workspace, info.step).join(TASK_STEP_INFO_FILE_NAME);
        let json = serde_json::to_vec(info)?;
        fs::write(&path, json).map_err(|e| WorkspaceError::io(&path, e))?;
        Ok(path)
    }

    fn write_backend_config(&self, workspace: &Path, req: &RunTaskReq) -> Result<(), WorkspaceError> {
        let state = &req.state_store;
        let address = if state.address.is_empty() {
            &self.default_state_address
        } else {
            &state.address
        };

        let mut context = Context::new();
        context.insert("backend", &hcl_escape(&state.backend));
        context.insert("address", &hcl_escape(address));
        context.insert("scheme", &hcl_escape(&state.scheme));
        context.insert("path", &hcl_escape(&state.path));
        context.insert(
            "private_key_path",
            &up_to_workspace(&req.env.workdir, SSH_KEY_FILE),
        );

        let rendered = Tera::one_off(BACKEND_TEMPLATE, &context, false)?;
        let path = workspace.join(CLOUDIAC_TF_FILE);
        fs::write(&path, rendered).map_err(|e| WorkspaceError::io(&path, e))
    }
}

fn write_private_key(path: &Path, key: &str) -> Result<(), WorkspaceError> {
    let content = format!("{}\n", key.trim());

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(|e| WorkspaceError::io(path, e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| WorkspaceError::io(path, e))
}

fn write_play_vars(workspace: &Path, req: &RunTaskReq) -> Result<(), WorkspaceError> {
    let yaml = serde_yaml::to_string(&req.env.ansible_vars)?;
    let path = workspace.join(CLOUDIAC_PLAY_VARS);
    fs::write(&path, yaml).map_err(|e| WorkspaceError::io(&path, e))
}

fn write_policies(workspace: &Path, req: &RunTaskReq) -> Result<(), WorkspaceError> {
    let root = workspace.join(POLICIES_DIR);
    fs::create_dir_all(&root).map_err(|e| WorkspaceError::io(&root, e))?;

    for policy in &req.policies {
        let dir = root.join(&policy.policy_id);
        fs::create_dir_all(&dir).map_err(|e| WorkspaceError::io(&dir, e))?;

        let meta = serde_json::to_vec(&policy.meta)?;
        let meta_path = dir.join(POLICY_META_FILE);
        fs::write(&meta_path, meta).map_err(|e| WorkspaceError::io(&meta_path, e))?;

        let rego_path = dir.join(POLICY_REGO_FILE);
        fs::write(&rego_path, &policy.rego).map_err(|e| WorkspaceError::io(&rego_path, e))?;
    }
    debug!(count = req.policies.len(), "Wrote policy bundles");
    Ok(())
}

/// Escapes a value for a double-quoted HCL string.
fn hcl_escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace("${", "$${")
}
