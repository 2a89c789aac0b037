//! Container command construction for a step run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

use crate::config::RunnerConfig;
use crate::error::DispatchError;
use crate::runner::paths::{step_dir_name, TASK_STEP_LOG_NAME, TASK_STEP_SCRIPT_NAME};
use crate::runner::request::RunTaskReq;

const PLUGIN_CACHE_ENV: &str = "TF_PLUGIN_CACHE_DIR";
const TF_VAR_PREFIX: &str = "TF_VAR_";

fn env_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

/// Whether `name` can be exported as an environment variable.
pub fn is_valid_env_name(name: &str) -> bool {
    env_name_pattern().is_some_and(|re| re.is_match(name))
}

/// Everything the container runtime needs to run one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerCommand {
    /// Container name, unique per task step.
    pub name: String,
    pub image: String,
    /// `KEY=VALUE` pairs sorted by key.
    pub env: Vec<String>,
    pub commands: Vec<String>,
    pub timeout: Duration,
    /// Working directory inside the container.
    pub workdir: String,
    /// Workspace on the host, mounted at `workdir`.
    pub host_workdir: PathBuf,
    /// Bind mounts in `host:container[:ro]` form.
    pub binds: Vec<String>,
}

impl ContainerCommand {
    /// Builds the command for a prepared step.
    ///
    /// The image falls back to the runner default, `TF_PLUGIN_CACHE_DIR`
    /// is set unless the caller provided one, and terraform variables are
    /// exported as `TF_VAR_<name>`.
    ///
    /// # Errors
    /// Returns `DispatchError::InvalidEnvName` for names a shell cannot export.
    pub fn build(
        req: &RunTaskReq,
        workspace: &Path,
        config: &RunnerConfig,
    ) -> Result<Self, DispatchError> {
        let image = if req.docker_image.is_empty() {
            config.default_image.clone()
        } else {
            req.docker_image.clone()
        };

        let mut env: BTreeMap<String, &str> = BTreeMap::new();
        for (name, value) in &req.env.environment_vars {
            if !is_valid_env_name(name) {
                return Err(DispatchError::InvalidEnvName(name.clone()));
            }
            env.insert(name.clone(), value.as_str());
        }
        env.entry(PLUGIN_CACHE_ENV.to_string())
            .or_insert(config.plugin_cache_path.as_str());
        for (name, value) in &req.env.terraform_vars {
            let key = format!("{TF_VAR_PREFIX}{name}");
            if !is_valid_env_name(&key) {
                return Err(DispatchError::InvalidEnvName(key));
            }
            env.insert(key, value.as_str());
        }

        let shell = if req.debug_enabled() { "sh -x" } else { "sh" };
        let step_dir = step_dir_name(req.step);
        let shell_command = format!(
            "{shell} {step_dir}/{TASK_STEP_SCRIPT_NAME} >>{step_dir}/{TASK_STEP_LOG_NAME} 2>&1"
        );

        let timeout = if req.timeout == 0 {
            config.default_step_timeout
        } else {
            Duration::from_secs(req.timeout)
        };

        let mut binds = vec![format!(
            "{}:{}",
            workspace.display(),
            config.container_workspace
        )];
        if let Some(cache) = &config.host_plugin_cache_path {
            binds.push(format!("{}:{}", cache.display(), config.plugin_cache_path));
        }

        Ok(Self {
            name: format!("iac-{}-{}", req.task_id, step_dir),
            image,
            env: env
                .into_iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect(),
            commands: vec!["sh".to_string(), "-c".to_string(), shell_command],
            timeout,
            workdir: config.container_workspace.clone(),
            host_workdir: workspace.to_path_buf(),
            binds,
        })
    }

    /// Value of an environment entry, if set.
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == name)
                .map(|(_, v)| v)
        })
    }
}
