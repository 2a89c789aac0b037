//! Run request handed to the runner for one step.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::model::step::{Step, StepType};
use crate::model::task::Task;
use crate::variables::ResolvedVars;

/// Environment descriptor of a run request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnv {
    pub id: String,
    /// Working directory relative to the repository root.
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub environment_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub terraform_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub ansible_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub tf_vars_file: String,
    #[serde(default)]
    pub play_vars_file: String,
    #[serde(default)]
    pub playbook: String,
}

/// Terraform state backend descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateStore {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    pub path: String,
}

fn default_backend() -> String {
    "consul".to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

impl StateStore {
    /// Consul backend at the runner's default address.
    pub fn consul(path: impl Into<String>) -> Self {
        Self {
            backend: default_backend(),
            address: String::new(),
            scheme: default_scheme(),
            path: path.into(),
        }
    }
}

/// Policy bundle materialized into the workspace for scan steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPolicy {
    pub policy_id: String,
    #[serde(default)]
    pub meta: serde_json::Value,
    #[serde(default)]
    pub rego: String,
}

/// Everything needed to run one step of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskReq {
    pub env: TaskEnv,
    pub task_id: String,
    /// Zero-based step index.
    #[serde(default)]
    pub step: u32,
    pub step_type: StepType,
    #[serde(default)]
    pub step_args: Vec<String>,
    /// Overrides the runner's default image when set.
    #[serde(default)]
    pub docker_image: String,
    pub state_store: StateStore,
    pub repo_address: String,
    pub repo_revision: String,
    /// Step timeout in seconds; zero means the runner default.
    #[serde(default)]
    pub timeout: u64,
    /// Possibly sealed private key.
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub policies: Vec<TaskPolicy>,
    #[serde(default)]
    pub stop_on_violation: bool,
}

impl RunTaskReq {
    /// Builds the request for one planned step of a task.
    pub fn for_step(task: &Task, step: &Step, vars: ResolvedVars) -> Self {
        Self {
            env: TaskEnv {
                id: task.env_id.clone(),
                workdir: task.workdir.clone(),
                environment_vars: vars.environment,
                terraform_vars: vars.terraform,
                ansible_vars: vars.ansible,
                tf_vars_file: task.tf_vars_file.clone(),
                play_vars_file: task.play_vars_file.clone(),
                playbook: task.playbook.clone(),
            },
            task_id: task.id.clone(),
            step: step.index,
            step_type: step.step_type(),
            step_args: step.body.args.clone(),
            docker_image: String::new(),
            state_store: StateStore::consul(task.state_path.clone()),
            repo_address: task.repo_addr.clone(),
            repo_revision: task.revision.clone(),
            timeout: task.step_timeout,
            private_key: String::new(),
            policies: Vec::new(),
            stop_on_violation: task.stop_on_violation,
        }
    }

    pub fn with_private_key(mut self, key: impl Into<String>) -> Self {
        self.private_key = key.into();
        self
    }

    pub fn with_policies(mut self, policies: Vec<TaskPolicy>) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_docker_image(mut self, image: impl Into<String>) -> Self {
        self.docker_image = image.into();
        self
    }

    /// Parses a YAML (or JSON) request.
    pub fn from_yaml_str(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Loads a request file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse request {}", path.display()))
    }

    /// Whether the `CLOUDIAC_DEBUG` environment variable is truthy.
    pub fn debug_enabled(&self) -> bool {
        self.env
            .environment_vars
            .get("CLOUDIAC_DEBUG")
            .is_some_and(|v| {
                matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                )
            })
    }

    /// The first step builds the workspace; later ones reuse it.
    pub fn is_first_step(&self) -> bool {
        self.step == 0
    }
}

/// Record written to `step<N>/step-info.json` once a container started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedTaskStep {
    pub env_id: String,
    pub task_id: String,
    pub step: u32,
    pub container_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = r#"
env:
  id: env-1
  workdir: infra
  terraformVars:
    region: eu-west-1
  environmentVars:
    CLOUDIAC_DEBUG: "true"
taskId: task-1
step: 1
stepType: plan
stepArgs: ["-target=aws_instance.web"]
stateStore:
  path: org/project/env-1.tfstate
repoAddress: https://example.com/repo.git
repoRevision: main
"#;

    #[test]
    fn test_parse_yaml_request() {
        let req = RunTaskReq::from_yaml_str(REQUEST).expect("parse");
        assert_eq!(req.env.workdir, "infra");
        assert_eq!(req.step_type, StepType::Plan);
        assert_eq!(req.state_store.backend, "consul");
        assert_eq!(req.state_store.scheme, "http");
        assert!(req.state_store.address.is_empty());
        assert_eq!(req.timeout, 0);
        assert!(req.debug_enabled());
        assert!(!req.is_first_step());
    }

    #[test]
    fn test_unknown_step_type_is_rejected() {
        let bad = REQUEST.replace("stepType: plan", "stepType: deploy");
        assert!(RunTaskReq::from_yaml_str(&bad).is_err());
    }

    #[test]
    fn test_step_info_shape() {
        let info = CommittedTaskStep {
            env_id: "e".to_string(),
            task_id: "t".to_string(),
            step: 2,
            container_id: "c".to_string(),
        };
        let json = serde_json::to_value(&info).expect("serialize");
        assert_eq!(json["envId"], "e");
        assert_eq!(json["containerId"], "c");
    }
}
