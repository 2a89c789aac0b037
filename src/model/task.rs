//! Task records: one automation run.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::model::variable::VariableBody;
use crate::runner::paths::{
    TERRASCAN_PARSE_FILE, TERRASCAN_RESULT_FILE, TF_PLAN_JSON_FILE, TF_PROVIDER_SCHEMA_FILE,
    TF_STATE_JSON_FILE,
};

/// Default per-step timeout in seconds.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 3600;

/// What a task run does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Plan,
    Apply,
    Destroy,
    Scan,
    Parse,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Plan => "plan",
            TaskType::Apply => "apply",
            TaskType::Destroy => "destroy",
            TaskType::Scan => "scan",
            TaskType::Parse => "parse",
        }
    }

    /// Human readable task name.
    pub fn display_name(&self) -> &'static str {
        match self {
            TaskType::Plan => "Plan",
            TaskType::Apply => "Deploy",
            TaskType::Destroy => "Destroy",
            TaskType::Scan => "Policy scan",
            TaskType::Parse => "Policy parse",
        }
    }

    /// Whether tasks of this type mutate real infrastructure.
    pub fn is_effectful(&self) -> bool {
        matches!(self, TaskType::Apply | TaskType::Destroy)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(TaskType::Plan),
            "apply" => Ok(TaskType::Apply),
            "destroy" => Ok(TaskType::Destroy),
            "scan" => Ok(TaskType::Scan),
            "parse" => Ok(TaskType::Parse),
            other => Err(ModelError::UnknownValue {
                kind: "task type",
                value: other.to_string(),
            }),
        }
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Approving,
    Rejected,
    Failed,
    Complete,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Approving,
        TaskStatus::Rejected,
        TaskStatus::Failed,
        TaskStatus::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Approving => "approving",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Failed => "failed",
            TaskStatus::Complete => "complete",
        }
    }

    /// Approving tasks count as started.
    pub fn is_started(&self) -> bool {
        *self != TaskStatus::Pending
    }

    pub fn is_exited(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Rejected | TaskStatus::Complete
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ModelError::UnknownValue {
                kind: "task status",
                value: s.to_string(),
            })
    }
}

/// Outcome summary of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// `None` means no resource change data, which differs from zero.
    pub res_added: Option<u64>,
    pub res_changed: Option<u64>,
    pub res_destroyed: Option<u64>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
}

/// Extra metadata recorded on a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExtra {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub transition_id: String,
}

/// Automatic step retry settings of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries allowed per step.
    pub max_retries: u32,
    /// Seconds between a failure and the next attempt.
    pub delay_secs: u64,
    pub enabled: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay_secs: u64) -> Self {
        Self {
            max_retries,
            delay_secs,
            enabled: max_retries > 0,
        }
    }

    /// Retry budget handed to each step.
    pub fn step_budget(&self) -> u32 {
        if self.enabled {
            self.max_retries
        } else {
            0
        }
    }
}

/// Common capabilities of runnable task records.
pub trait Tasker {
    fn id(&self) -> &str;
    fn runner_id(&self) -> &str;
    fn step_timeout(&self) -> u64;
    fn status(&self) -> TaskStatus;
    fn task_type(&self) -> TaskType;

    fn is_exited(&self) -> bool {
        self.status().is_exited()
    }

    fn is_started(&self) -> bool {
        self.status().is_started()
    }

    fn is_effectful(&self) -> bool {
        self.task_type().is_effectful()
    }
}

/// A deployment task against an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub org_id: String,
    pub project_id: String,
    pub tpl_id: String,
    pub env_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub creator_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub runner_id: String,
    #[serde(default = "default_step_timeout")]
    pub step_timeout: u64,

    pub repo_addr: String,
    pub revision: String,
    /// Commit the revision pointed to when the task was created.
    #[serde(default)]
    pub commit_id: String,

    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub playbook: String,
    #[serde(default)]
    pub tf_vars_file: String,
    #[serde(default)]
    pub tf_version: String,
    #[serde(default)]
    pub play_vars_file: String,
    /// Terraform `-target` values.
    #[serde(default)]
    pub targets: Vec<String>,

    /// Effective variables after inheritance, snapshotted at creation.
    #[serde(default)]
    pub variables: Vec<VariableBody>,

    #[serde(default)]
    pub state_path: String,
    #[serde(default)]
    pub extra: TaskExtra,
    #[serde(default)]
    pub key_id: String,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub stop_on_violation: bool,

    #[serde(default)]
    pub result: TaskResult,
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

fn default_step_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

impl Task {
    /// Creates a pending task.
    pub fn new(
        id: impl Into<String>,
        task_type: TaskType,
        repo_addr: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            org_id: String::new(),
            project_id: String::new(),
            tpl_id: String::new(),
            env_id: String::new(),
            name: task_type.display_name().to_string(),
            creator_id: String::new(),
            task_type,
            status: TaskStatus::Pending,
            message: String::new(),
            runner_id: String::new(),
            step_timeout: DEFAULT_STEP_TIMEOUT_SECS,
            repo_addr: repo_addr.into(),
            revision: revision.into(),
            commit_id: String::new(),
            workdir: String::new(),
            playbook: String::new(),
            tf_vars_file: String::new(),
            tf_version: String::new(),
            play_vars_file: String::new(),
            targets: Vec::new(),
            variables: Vec::new(),
            state_path: String::new(),
            extra: TaskExtra::default(),
            key_id: String::new(),
            auto_approve: false,
            stop_on_violation: false,
            result: TaskResult::default(),
            retry: RetryPolicy::default(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Sets the owning org/project/template/environment.
    pub fn with_scope(
        mut self,
        org_id: impl Into<String>,
        project_id: impl Into<String>,
        tpl_id: impl Into<String>,
        env_id: impl Into<String>,
    ) -> Self {
        self.org_id = org_id.into();
        self.project_id = project_id.into();
        self.tpl_id = tpl_id.into();
        self.env_id = env_id.into();
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_variables(mut self, variables: Vec<VariableBody>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_step_timeout(mut self, seconds: u64) -> Self {
        self.step_timeout = seconds;
        self
    }

    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    pub fn with_playbook(mut self, playbook: impl Into<String>) -> Self {
        self.playbook = playbook.into();
        self
    }

    fn artifact_path(&self, name: &str) -> String {
        format!("{}/{}/{}/{}", self.project_id, self.env_id, self.id, name)
    }

    pub fn state_json_path(&self) -> String {
        self.artifact_path(TF_STATE_JSON_FILE)
    }

    pub fn provider_schema_json_path(&self) -> String {
        self.artifact_path(TF_PROVIDER_SCHEMA_FILE)
    }

    pub fn plan_json_path(&self) -> String {
        self.artifact_path(TF_PLAN_JSON_FILE)
    }

    pub fn tf_parse_json_path(&self) -> String {
        self.artifact_path(TERRASCAN_PARSE_FILE)
    }

    pub fn tf_result_json_path(&self) -> String {
        self.artifact_path(TERRASCAN_RESULT_FILE)
    }

    /// Blanks sensitive variable values in place.
    pub fn hide_sensitive_variables(&mut self) {
        for v in self.variables.iter_mut().filter(|v| v.sensitive) {
            v.value.clear();
        }
    }

    /// Copy safe to expose outside the runner.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.hide_sensitive_variables();
        copy
    }
}

impl Tasker for Task {
    fn id(&self) -> &str {
        &self.id
    }

    fn runner_id(&self) -> &str {
        &self.runner_id
    }

    fn step_timeout(&self) -> u64 {
        self.step_timeout
    }

    fn status(&self) -> TaskStatus {
        self.status
    }

    fn task_type(&self) -> TaskType {
        self.task_type
    }
}

/// A policy scan of a template, run without an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanTask {
    pub id: String,
    pub org_id: String,
    pub tpl_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[serde(default)]
    pub runner_id: String,
    #[serde(default = "default_step_timeout")]
    pub step_timeout: u64,
    pub repo_addr: String,
    pub revision: String,
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub policy_ids: Vec<String>,
}

impl Tasker for ScanTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn runner_id(&self) -> &str {
        &self.runner_id
    }

    fn step_timeout(&self) -> u64 {
        self.step_timeout
    }

    fn status(&self) -> TaskStatus {
        self.status
    }

    fn task_type(&self) -> TaskType {
        self.task_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::variable::{VariableScope, VariableType};

    #[test]
    fn test_exited_and_started_for_every_status() {
        for status in TaskStatus::ALL {
            let exited = matches!(
                status,
                TaskStatus::Failed | TaskStatus::Rejected | TaskStatus::Complete
            );
            assert_eq!(status.is_exited(), exited, "{status}");
            assert_eq!(status.is_started(), status != TaskStatus::Pending, "{status}");
        }
    }

    #[test]
    fn test_effectful() {
        let mut apply = Task::new("t1", TaskType::Apply, "https://example.com/repo.git", "main");
        apply.status = TaskStatus::Complete;
        assert!(apply.is_exited());
        assert!(apply.is_effectful());

        let mut plan = Task::new("t2", TaskType::Plan, "https://example.com/repo.git", "main");
        plan.status = TaskStatus::Complete;
        assert!(plan.is_exited());
        assert!(!plan.is_effectful());

        assert!(TaskType::Destroy.is_effectful());
        assert!(!TaskType::Scan.is_effectful());
    }

    #[test]
    fn test_unknown_task_type_is_an_error() {
        assert_eq!("destroy".parse::<TaskType>(), Ok(TaskType::Destroy));
        assert!(matches!(
            "deploy".parse::<TaskType>(),
            Err(ModelError::UnknownValue { kind: "task type", .. })
        ));
    }

    #[test]
    fn test_artifact_paths() {
        let task = Task::new("t1", TaskType::Plan, "r", "main").with_scope("o", "p", "tpl", "e");
        assert_eq!(task.plan_json_path(), "p/e/t1/tfplan.json");
        assert_eq!(task.state_json_path(), "p/e/t1/tfstate.json");
        assert_eq!(task.tf_result_json_path(), "p/e/t1/tfscan_result.json");
    }

    #[test]
    fn test_redacted_keeps_original() {
        let task = Task::new("t1", TaskType::Apply, "r", "main").with_variables(vec![
            VariableBody::new(VariableScope::Env, VariableType::Environment, "TOKEN", "abc")
                .mark_sensitive(),
            VariableBody::new(VariableScope::Env, VariableType::Terraform, "region", "eu"),
        ]);

        let exposed = task.redacted();
        assert_eq!(exposed.variables[0].value, "");
        assert_eq!(exposed.variables[1].value, "eu");
        assert_eq!(task.variables[0].value, "abc");
    }

    #[test]
    fn test_scan_task_is_tasker() {
        let scan = ScanTask {
            id: "s1".to_string(),
            org_id: "o".to_string(),
            tpl_id: "tpl".to_string(),
            task_type: TaskType::Scan,
            status: TaskStatus::Approving,
            runner_id: "runner-1".to_string(),
            step_timeout: 600,
            repo_addr: "r".to_string(),
            revision: "main".to_string(),
            workdir: String::new(),
            policy_ids: vec!["po-1".to_string()],
        };
        let tasker: &dyn Tasker = &scan;
        assert!(tasker.is_started());
        assert!(!tasker.is_exited());
        assert!(!tasker.is_effectful());
        assert_eq!(tasker.runner_id(), "runner-1");
        assert_eq!(tasker.step_timeout(), 600);
    }

    #[test]
    fn test_retry_budget() {
        assert_eq!(RetryPolicy::new(3, 10).step_budget(), 3);
        let disabled = RetryPolicy {
            max_retries: 3,
            delay_secs: 10,
            enabled: false,
        };
        assert_eq!(disabled.step_budget(), 0);
    }
}
