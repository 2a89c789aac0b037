//! Task-level sequencing and status aggregation.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;

use crate::error::TransitionError;
use crate::model::step::{Step, StepBody, StepStatus, StepType};
use crate::model::task::{Task, TaskResult, TaskStatus, TaskType};
use crate::runner::paths::step_dir_name;

/// Approver recorded on steps of auto-approved tasks.
pub const AUTO_APPROVER: &str = "auto";

/// Sequences steps and keeps a task's status consistent with them.
pub struct TaskOrchestrator {
    valid_transitions: HashMap<TaskStatus, Vec<TaskStatus>>,
}

impl TaskOrchestrator {
    /// Create an orchestrator with the standard task transition rules.
    ///
    /// Valid transitions:
    /// - Pending -> Running | Failed
    /// - Running -> Approving | Complete | Failed
    /// - Approving -> Running | Rejected | Failed
    pub fn new() -> Self {
        let mut valid_transitions = HashMap::new();

        valid_transitions.insert(
            TaskStatus::Pending,
            vec![TaskStatus::Running, TaskStatus::Failed],
        );
        valid_transitions.insert(
            TaskStatus::Running,
            vec![TaskStatus::Approving, TaskStatus::Complete, TaskStatus::Failed],
        );
        valid_transitions.insert(
            TaskStatus::Approving,
            vec![TaskStatus::Running, TaskStatus::Rejected, TaskStatus::Failed],
        );
        valid_transitions.insert(TaskStatus::Rejected, vec![]);
        valid_transitions.insert(TaskStatus::Failed, vec![]);
        valid_transitions.insert(TaskStatus::Complete, vec![]);

        Self { valid_transitions }
    }

    /// Check if a transition between two statuses is allowed.
    pub fn can_transition(&self, from: TaskStatus, to: TaskStatus) -> bool {
        self.valid_transitions
            .get(&from)
            .is_some_and(|targets| targets.contains(&to))
    }

    /// Creates the ordered steps of a task.
    ///
    /// A destroy task plans with `-destroy` and then applies that plan, so
    /// the approved plan is exactly what runs. Every step gets the task's
    /// retry budget; gated steps of an auto-approve task are pre-approved.
    pub fn plan_steps(&self, task: &Task) -> Vec<Step> {
        let target_args: Vec<String> = task
            .targets
            .iter()
            .map(|t| format!("-target={t}"))
            .collect();
        let plan = StepBody::new(StepType::Plan).with_args(target_args.iter().cloned());

        let mut bodies = match task.task_type {
            TaskType::Plan => vec![StepBody::new(StepType::Init), plan],
            TaskType::Apply => vec![
                StepBody::new(StepType::Init),
                plan,
                StepBody::new(StepType::Apply),
            ],
            TaskType::Destroy => vec![
                StepBody::new(StepType::Init),
                plan.with_args(["-destroy"]),
                StepBody::new(StepType::Destroy),
            ],
            TaskType::Scan => vec![
                StepBody::new(StepType::ScanInit),
                StepBody::new(StepType::Scan),
            ],
            TaskType::Parse => vec![
                StepBody::new(StepType::ScanInit),
                StepBody::new(StepType::Parse),
            ],
        };
        if task.task_type.is_effectful() {
            if !task.playbook.is_empty() {
                bodies.push(StepBody::new(StepType::Configure));
            }
            bodies.push(StepBody::new(StepType::Collect));
        }

        let ids: Vec<String> = (0..bodies.len() as u32)
            .map(|index| format!("{}-{}", task.id, step_dir_name(index)))
            .collect();

        bodies
            .into_iter()
            .enumerate()
            .map(|(i, body)| {
                let index = i as u32;
                let approver_id = (task.auto_approve && body.step_type.requires_approval())
                    .then(|| AUTO_APPROVER.to_string());
                let mut step = Step {
                    id: ids[i].clone(),
                    task_id: task.id.clone(),
                    org_id: task.org_id.clone(),
                    project_id: task.project_id.clone(),
                    env_id: task.env_id.clone(),
                    index,
                    next_step: ids.get(i + 1).cloned(),
                    body,
                    status: StepStatus::Pending,
                    exit_code: 0,
                    message: String::new(),
                    log_path: String::new(),
                    started_at: None,
                    ended_at: None,
                    approver_id,
                    current_retry_count: 0,
                    next_retry_time: None,
                    max_retry_count: task.retry.step_budget(),
                };
                step.log_path = step.gen_log_path();
                step
            })
            .collect()
    }

    /// Task status implied by its steps.
    ///
    /// Checked in order: any rejected step, any non-best-effort step failed or
    /// timed out with no retry left, any step approving, every step done
    /// (a failed best-effort step counts as done), anything started.
    pub fn aggregate_status(&self, steps: &[Step]) -> TaskStatus {
        if steps.iter().any(Step::is_rejected) {
            return TaskStatus::Rejected;
        }

        let hard_failure = steps.iter().any(|s| {
            !s.step_type().is_best_effort()
                && matches!(s.status, StepStatus::Failed | StepStatus::Timeout)
                && s.current_retry_count >= s.max_retry_count
        });
        if hard_failure {
            return TaskStatus::Failed;
        }

        if steps.iter().any(|s| s.status == StepStatus::Approving) {
            return TaskStatus::Approving;
        }

        let done = |s: &Step| {
            s.status == StepStatus::Complete || (s.step_type().is_best_effort() && s.is_exited())
        };
        if !steps.is_empty() && steps.iter().all(done) {
            return TaskStatus::Complete;
        }

        if steps.iter().any(Step::is_started) {
            TaskStatus::Running
        } else {
            TaskStatus::Pending
        }
    }

    /// Moves a task to a new status.
    ///
    /// # Errors
    /// `TaskExited` once the task has exited, `Illegal` for transitions
    /// outside the table.
    pub fn transition_task(
        &self,
        task: &mut Task,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if task.status.is_exited() {
            return Err(TransitionError::TaskExited(task.id.clone()));
        }
        if !self.can_transition(task.status, to) {
            return Err(TransitionError::Illegal {
                entity: "task",
                from: task.status.to_string(),
                to: to.to_string(),
            });
        }

        info!(task_id = %task.id, from = %task.status, to = %to, "Task transition");
        if task.started_at.is_none() && to.is_started() {
            task.started_at = Some(now);
        }
        if to.is_exited() {
            task.ended_at = Some(now);
        }
        task.status = to;
        Ok(())
    }

    /// Brings the task status in line with its steps.
    ///
    /// A pending task passes through `running` when the steps imply a later
    /// status. Returns the resulting status.
    pub fn sync_task(
        &self,
        task: &mut Task,
        steps: &[Step],
        now: DateTime<Utc>,
    ) -> Result<TaskStatus, TransitionError> {
        let target = self.aggregate_status(steps);
        if target == task.status || target == TaskStatus::Pending {
            return Ok(task.status);
        }
        if task.status == TaskStatus::Pending && target != TaskStatus::Failed {
            self.transition_task(task, TaskStatus::Running, now)?;
            if target == TaskStatus::Running {
                return Ok(task.status);
            }
        }
        self.transition_task(task, target, now)?;
        Ok(task.status)
    }
}

impl Default for TaskOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the result summary from the plan and state JSON artifacts.
///
/// Resource counts come from the plan's `resource_changes`; a replacement
/// counts as one add and one destroy. Outputs come from the state's
/// `values.outputs`. A missing plan leaves the counts unset.
pub fn summarize(plan_json: Option<&Value>, state_json: Option<&Value>) -> TaskResult {
    let mut result = TaskResult::default();

    if let Some(plan) = plan_json {
        let (mut added, mut changed, mut destroyed) = (0u64, 0u64, 0u64);
        let changes = plan
            .get("resource_changes")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        for change in changes {
            let actions: Vec<&str> = change
                .pointer("/change/actions")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();

            let creates = actions.contains(&"create");
            let deletes = actions.contains(&"delete");
            if creates {
                added += 1;
            }
            if deletes {
                destroyed += 1;
            }
            if actions.contains(&"update") && !creates && !deletes {
                changed += 1;
            }
        }

        result.res_added = Some(added);
        result.res_changed = Some(changed);
        result.res_destroyed = Some(destroyed);
    }

    if let Some(outputs) = state_json
        .and_then(|s| s.pointer("/values/outputs"))
        .and_then(Value::as_object)
    {
        result.outputs = outputs
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<BTreeMap<_, _>>();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::task::RetryPolicy;
    use serde_json::json;

    fn task(task_type: TaskType) -> Task {
        Task::new("t1", task_type, "https://example.com/repo.git", "main")
            .with_scope("o1", "p1", "tpl1", "e1")
    }

    fn types(steps: &[Step]) -> Vec<StepType> {
        steps.iter().map(Step::step_type).collect()
    }

    #[test]
    fn test_plan_steps_per_task_type() {
        let orch = TaskOrchestrator::new();
        assert_eq!(
            types(&orch.plan_steps(&task(TaskType::Plan))),
            vec![StepType::Init, StepType::Plan]
        );
        assert_eq!(
            types(&orch.plan_steps(&task(TaskType::Apply))),
            vec![StepType::Init, StepType::Plan, StepType::Apply, StepType::Collect]
        );
        assert_eq!(
            types(&orch.plan_steps(&task(TaskType::Apply).with_playbook("site.yml"))),
            vec![
                StepType::Init,
                StepType::Plan,
                StepType::Apply,
                StepType::Configure,
                StepType::Collect
            ]
        );
        assert_eq!(
            types(&orch.plan_steps(&task(TaskType::Scan))),
            vec![StepType::ScanInit, StepType::Scan]
        );
        assert_eq!(
            types(&orch.plan_steps(&task(TaskType::Parse))),
            vec![StepType::ScanInit, StepType::Parse]
        );
    }

    #[test]
    fn test_destroy_plans_with_destroy_flag() {
        let orch = TaskOrchestrator::new();
        let mut t = task(TaskType::Destroy);
        t.targets = vec!["aws_instance.web".to_string()];
        let steps = orch.plan_steps(&t);

        assert_eq!(
            types(&steps),
            vec![StepType::Init, StepType::Plan, StepType::Destroy, StepType::Collect]
        );
        assert_eq!(steps[1].body.args, vec!["-target=aws_instance.web", "-destroy"]);
        assert!(steps[2].approver_id.is_none());
    }

    #[test]
    fn test_planned_steps_are_linked_and_contiguous() {
        let orch = TaskOrchestrator::new();
        let steps = orch.plan_steps(&task(TaskType::Apply).with_retry(RetryPolicy::new(2, 5)));

        crate::model::step::validate_indices(&steps).expect("contiguous");
        for pair in steps.windows(2) {
            assert_eq!(pair[0].next_step.as_deref(), Some(pair[1].id.as_str()));
        }
        assert!(steps.last().and_then(|s| s.next_step.as_ref()).is_none());
        assert!(steps.iter().all(|s| s.max_retry_count == 2));
        assert_eq!(steps[1].log_path, "p1/e1/t1/step1/step.log");
    }

    #[test]
    fn test_auto_approve_preapproves_gated_steps() {
        let orch = TaskOrchestrator::new();
        let steps = orch.plan_steps(&task(TaskType::Apply).with_auto_approve(true));
        let apply = &steps[2];
        assert_eq!(apply.approver_id.as_deref(), Some(AUTO_APPROVER));
        assert!(apply.is_approved());
        assert!(steps[0].approver_id.is_none());
    }

    fn with_statuses(task_type: TaskType, statuses: &[StepStatus]) -> Vec<Step> {
        let orch = TaskOrchestrator::new();
        let mut steps = orch.plan_steps(&task(task_type));
        for (s, status) in steps.iter_mut().zip(statuses) {
            s.status = *status;
        }
        steps
    }

    #[test]
    fn test_aggregate_status() {
        use StepStatus::*;
        let orch = TaskOrchestrator::new();

        assert_eq!(
            orch.aggregate_status(&with_statuses(TaskType::Plan, &[Pending, Pending])),
            TaskStatus::Pending
        );
        assert_eq!(
            orch.aggregate_status(&with_statuses(TaskType::Plan, &[Complete, Running])),
            TaskStatus::Running
        );
        assert_eq!(
            orch.aggregate_status(&with_statuses(TaskType::Plan, &[Complete, Complete])),
            TaskStatus::Complete
        );
        assert_eq!(
            orch.aggregate_status(&with_statuses(
                TaskType::Apply,
                &[Complete, Complete, Approving, Pending]
            )),
            TaskStatus::Approving
        );
        assert_eq!(
            orch.aggregate_status(&with_statuses(
                TaskType::Apply,
                &[Complete, Complete, Rejected, Pending]
            )),
            TaskStatus::Rejected
        );
        assert_eq!(
            orch.aggregate_status(&with_statuses(TaskType::Plan, &[Complete, Timeout])),
            TaskStatus::Failed
        );
    }

    #[test]
    fn test_failed_collect_does_not_fail_task() {
        use StepStatus::*;
        let orch = TaskOrchestrator::new();
        let steps = with_statuses(TaskType::Apply, &[Complete, Complete, Complete, Failed]);
        assert_eq!(orch.aggregate_status(&steps), TaskStatus::Complete);
    }

    #[test]
    fn test_failure_with_retry_budget_keeps_running() {
        let orch = TaskOrchestrator::new();
        let mut steps = with_statuses(TaskType::Plan, &[StepStatus::Complete, StepStatus::Failed]);
        steps[1].max_retry_count = 1;
        assert_eq!(orch.aggregate_status(&steps), TaskStatus::Running);

        steps[1].current_retry_count = 1;
        assert_eq!(orch.aggregate_status(&steps), TaskStatus::Failed);
    }

    #[test]
    fn test_exited_task_is_immutable() {
        let orch = TaskOrchestrator::new();
        let mut t = task(TaskType::Plan);
        let now = Utc::now();

        assert!(matches!(
            orch.transition_task(&mut t, TaskStatus::Complete, now),
            Err(TransitionError::Illegal { entity: "task", .. })
        ));
        orch.transition_task(&mut t, TaskStatus::Running, now).expect("run");
        assert_eq!(t.started_at, Some(now));
        orch.transition_task(&mut t, TaskStatus::Complete, now).expect("complete");
        assert_eq!(t.ended_at, Some(now));

        assert_eq!(
            orch.transition_task(&mut t, TaskStatus::Running, now),
            Err(TransitionError::TaskExited("t1".to_string()))
        );
    }

    #[test]
    fn test_sync_task_passes_through_running() {
        let orch = TaskOrchestrator::new();
        let mut t = task(TaskType::Apply);
        let steps = with_statuses(
            TaskType::Apply,
            &[
                StepStatus::Complete,
                StepStatus::Complete,
                StepStatus::Approving,
                StepStatus::Pending,
            ],
        );
        let status = orch.sync_task(&mut t, &steps, Utc::now()).expect("sync");
        assert_eq!(status, TaskStatus::Approving);
        assert!(t.started_at.is_some());
    }

    #[test]
    fn test_summarize() {
        let plan = json!({
            "resource_changes": [
                {"change": {"actions": ["create"]}},
                {"change": {"actions": ["update"]}},
                {"change": {"actions": ["delete", "create"]}},
                {"change": {"actions": ["delete"]}},
                {"change": {"actions": ["no-op"]}}
            ]
        });
        let state = json!({
            "values": {"outputs": {"ip": {"value": "10.0.0.1", "sensitive": false}}}
        });

        let result = summarize(Some(&plan), Some(&state));
        assert_eq!(result.res_added, Some(2));
        assert_eq!(result.res_changed, Some(1));
        assert_eq!(result.res_destroyed, Some(2));
        assert_eq!(result.outputs["ip"]["value"], "10.0.0.1");
    }

    #[test]
    fn test_summarize_without_plan_leaves_counts_unset() {
        let result = summarize(None, None);
        assert_eq!(result.res_added, None);
        assert!(result.outputs.is_empty());

        let empty = summarize(Some(&json!({})), None);
        assert_eq!(empty.res_added, Some(0));
    }
}
