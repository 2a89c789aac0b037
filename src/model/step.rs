//! Step records: one executable unit of a task.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::runner::paths::{step_dir_name, TASK_STEP_LOG_NAME};

/// Kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Init,
    Plan,
    Apply,
    Destroy,
    /// Configuration-management playbook run.
    #[serde(alias = "play")]
    Configure,
    Command,
    /// Best-effort state snapshot.
    Collect,
    #[serde(alias = "tfparse")]
    Parse,
    #[serde(alias = "tfscan")]
    Scan,
    #[serde(rename = "scan-init", alias = "scaninit")]
    ScanInit,
}

impl StepType {
    pub const ALL: [StepType; 10] = [
        StepType::Init,
        StepType::Plan,
        StepType::Apply,
        StepType::Destroy,
        StepType::Configure,
        StepType::Command,
        StepType::Collect,
        StepType::Parse,
        StepType::Scan,
        StepType::ScanInit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Init => "init",
            StepType::Plan => "plan",
            StepType::Apply => "apply",
            StepType::Destroy => "destroy",
            StepType::Configure => "configure",
            StepType::Command => "command",
            StepType::Collect => "collect",
            StepType::Parse => "parse",
            StepType::Scan => "scan",
            StepType::ScanInit => "scan-init",
        }
    }

    /// Only steps that change real infrastructure wait for a human.
    pub fn requires_approval(&self) -> bool {
        matches!(self, StepType::Apply | StepType::Destroy)
    }

    /// Failures of best-effort steps never fail the task.
    pub fn is_best_effort(&self) -> bool {
        matches!(self, StepType::Collect)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(StepType::Init),
            "plan" => Ok(StepType::Plan),
            "apply" => Ok(StepType::Apply),
            "destroy" => Ok(StepType::Destroy),
            "configure" | "play" => Ok(StepType::Configure),
            "command" => Ok(StepType::Command),
            "collect" => Ok(StepType::Collect),
            "parse" | "tfparse" => Ok(StepType::Parse),
            "scan" | "tfscan" => Ok(StepType::Scan),
            "scan-init" | "scaninit" => Ok(StepType::ScanInit),
            other => Err(ModelError::UnknownValue {
                kind: "step type",
                value: other.to_string(),
            }),
        }
    }
}

/// Status of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Approving,
    Rejected,
    Running,
    Failed,
    Complete,
    Timeout,
}

impl StepStatus {
    pub const ALL: [StepStatus; 7] = [
        StepStatus::Pending,
        StepStatus::Approving,
        StepStatus::Rejected,
        StepStatus::Running,
        StepStatus::Failed,
        StepStatus::Complete,
        StepStatus::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Approving => "approving",
            StepStatus::Rejected => "rejected",
            StepStatus::Running => "running",
            StepStatus::Failed => "failed",
            StepStatus::Complete => "complete",
            StepStatus::Timeout => "timeout",
        }
    }

    pub fn is_started(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Approving)
    }

    pub fn is_exited(&self) -> bool {
        matches!(
            self,
            StepStatus::Rejected | StepStatus::Complete | StepStatus::Failed | StepStatus::Timeout
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ModelError::UnknownValue {
                kind: "step status",
                value: s.to_string(),
            })
    }
}

/// Type, display name and arguments of a planned step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepBody {
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl StepBody {
    pub fn new(step_type: StepType) -> Self {
        Self {
            step_type,
            name: step_type.as_str().to_string(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// A step of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub task_id: String,
    pub org_id: String,
    pub project_id: String,
    pub env_id: String,
    /// Zero-based position within the task.
    pub index: u32,
    /// Id of the following step, if any.
    #[serde(default)]
    pub next_step: Option<String>,
    #[serde(flatten)]
    pub body: StepBody,
    pub status: StepStatus,
    /// Meaningful only when `status` is `Failed`.
    #[serde(default)]
    pub exit_code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub log_path: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub approver_id: Option<String>,
    #[serde(default)]
    pub current_retry_count: u32,
    #[serde(default)]
    pub next_retry_time: Option<DateTime<Utc>>,
    /// Total retries this step may consume.
    #[serde(default)]
    pub max_retry_count: u32,
}

impl Step {
    pub fn step_type(&self) -> StepType {
        self.body.step_type
    }

    pub fn is_started(&self) -> bool {
        self.status.is_started()
    }

    pub fn is_exited(&self) -> bool {
        self.status.is_exited()
    }

    pub fn is_rejected(&self) -> bool {
        self.status == StepStatus::Rejected
    }

    /// A rejected step is never approved; apply/destroy steps additionally
    /// need a recorded approver.
    pub fn is_approved(&self) -> bool {
        if self.is_rejected() {
            return false;
        }
        if self.step_type().requires_approval() {
            return self
                .approver_id
                .as_deref()
                .is_some_and(|approver| !approver.is_empty());
        }
        true
    }

    /// Log path relative to the artifact store.
    pub fn gen_log_path(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.project_id,
            self.env_id,
            self.task_id,
            step_dir_name(self.index),
            TASK_STEP_LOG_NAME
        )
    }
}

/// Checks that step indices run 0, 1, 2, ... with no gaps or duplicates.
pub fn validate_indices(steps: &[Step]) -> Result<(), ModelError> {
    for (expected, step) in steps.iter().enumerate() {
        let expected = expected as u32;
        if step.index != expected {
            return Err(ModelError::NonContiguousIndex {
                expected,
                found: step.index,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn step(index: u32, step_type: StepType) -> Step {
        Step {
            id: format!("step-{index}"),
            task_id: "t1".to_string(),
            org_id: "o1".to_string(),
            project_id: "p1".to_string(),
            env_id: "e1".to_string(),
            index,
            next_step: None,
            body: StepBody::new(step_type),
            status: StepStatus::Pending,
            exit_code: 0,
            message: String::new(),
            log_path: String::new(),
            started_at: None,
            ended_at: None,
            approver_id: None,
            current_retry_count: 0,
            next_retry_time: None,
            max_retry_count: 0,
        }
    }

    #[test]
    fn test_started_and_exited_sets() {
        for status in StepStatus::ALL {
            let started = !matches!(status, StepStatus::Pending | StepStatus::Approving);
            let exited = matches!(
                status,
                StepStatus::Rejected
                    | StepStatus::Complete
                    | StepStatus::Failed
                    | StepStatus::Timeout
            );
            assert_eq!(status.is_started(), started, "{status}");
            assert_eq!(status.is_exited(), exited, "{status}");
        }
    }

    #[test]
    fn test_apply_without_approver_is_not_approved() {
        let mut s = step(2, StepType::Apply);
        s.status = StepStatus::Approving;
        assert!(!s.is_approved());

        s.approver_id = Some(String::new());
        assert!(!s.is_approved());

        s.approver_id = Some("u-1".to_string());
        assert!(s.is_approved());

        s.status = StepStatus::Rejected;
        assert!(!s.is_approved());
    }

    #[test]
    fn test_non_gated_steps_are_approved_unless_rejected() {
        for step_type in StepType::ALL {
            if step_type.requires_approval() {
                continue;
            }
            let mut s = step(0, step_type);
            assert!(s.is_approved());
            s.status = StepStatus::Rejected;
            assert!(!s.is_approved());
        }
    }

    #[test]
    fn test_step_type_aliases() {
        assert_eq!("play".parse::<StepType>(), Ok(StepType::Configure));
        assert_eq!("tfscan".parse::<StepType>(), Ok(StepType::Scan));
        assert_eq!("scaninit".parse::<StepType>(), Ok(StepType::ScanInit));
        assert!("deploy".parse::<StepType>().is_err());

        let parsed: StepType = serde_json::from_str("\"tfparse\"").expect("alias");
        assert_eq!(parsed, StepType::Parse);
        assert_eq!(
            serde_json::to_string(&StepType::ScanInit).expect("serialize"),
            "\"scan-init\""
        );
    }

    #[test]
    fn test_log_path() {
        let s = step(3, StepType::Plan);
        assert_eq!(s.gen_log_path(), "p1/e1/t1/step3/step.log");
    }

    #[test]
    fn test_validate_indices() {
        let steps = vec![step(0, StepType::Init), step(1, StepType::Plan)];
        assert!(validate_indices(&steps).is_ok());

        let gap = vec![step(0, StepType::Init), step(2, StepType::Plan)];
        assert_eq!(
            validate_indices(&gap),
            Err(ModelError::NonContiguousIndex {
                expected: 1,
                found: 2
            })
        );
    }
}
