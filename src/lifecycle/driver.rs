//! Runs the steps of a task to completion.
//!
//! Steps run strictly in order. A gated step parks the task in `approving`
//! until a [`StepDecision`] arrives; a failed step is re-run from a clean
//! step directory while it has retry budget left.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use crate::error::RunError;
use crate::execution::dispatcher::ExecutionDispatcher;
use crate::lifecycle::orchestrator::{summarize, TaskOrchestrator};
use crate::lifecycle::step_machine::StepStateMachine;
use crate::model::step::{validate_indices, Step, StepStatus};
use crate::model::task::{Task, TaskStatus};
use crate::runner::paths::{TF_PLAN_JSON_FILE, TF_STATE_JSON_FILE};
use crate::runner::request::{RunTaskReq, TaskPolicy};
use crate::runner::task_runner::TaskRunner;
use crate::variables::resolver::split_by_type;

/// A human decision on a step waiting for approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDecision {
    Approve { approver: String },
    Reject { approver: String },
}

/// Per-task inputs that are not part of the task record.
#[derive(Debug, Clone, Default)]
pub struct StepInputs {
    /// Possibly sealed private key for repository and host access.
    pub private_key: String,
    pub policies: Vec<TaskPolicy>,
    /// Worker image override.
    pub docker_image: String,
}

/// Drives a task through its steps against a dispatcher.
pub struct TaskDriver {
    runner: TaskRunner,
    dispatcher: Arc<dyn ExecutionDispatcher>,
    machine: StepStateMachine,
    orchestrator: TaskOrchestrator,
}

impl TaskDriver {
    pub fn new(runner: TaskRunner, dispatcher: Arc<dyn ExecutionDispatcher>) -> Self {
        Self {
            runner,
            dispatcher,
            machine: StepStateMachine::new(),
            orchestrator: TaskOrchestrator::new(),
        }
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn orchestrator(&self) -> &TaskOrchestrator {
        &self.orchestrator
    }

    /// Runs every step of `task` that has not completed yet.
    ///
    /// Returns the final task status. Completed steps are skipped, so a
    /// driver can resume a partially run task.
    ///
    /// # Arguments
    /// * `task` - The task, updated in place
    /// * `steps` - Planned steps, updated in place
    /// * `inputs` - Private key, policies and image override
    /// * `decisions` - Approvals for gated steps; a closed channel fails the task
    ///
    /// # Errors
    /// Errors that no retry can fix (invalid input, secrets, illegal
    /// transitions) fail the task and are returned.
    #[instrument(skip_all, fields(task_id = %task.id, task_type = %task.task_type))]
    pub async fn drive(
        &self,
        task: &mut Task,
        steps: &mut [Step],
        inputs: &StepInputs,
        decisions: &mut mpsc::Receiver<StepDecision>,
    ) -> Result<TaskStatus, RunError> {
        validate_indices(steps)?;
        if task.status == TaskStatus::Pending {
            self.orchestrator
                .transition_task(task, TaskStatus::Running, Utc::now())?;
        }

        for index in 0..steps.len() {
            match self.run_step(task, steps, index, inputs, decisions).await {
                Ok(TaskStatus::Running) => {}
                Ok(status) => return Ok(status),
                Err(e) => {
                    error!(step = index, error = %e, "Task failed");
                    task.message = e.to_string();
                    if !task.status.is_exited() {
                        self.orchestrator
                            .transition_task(task, TaskStatus::Failed, Utc::now())?;
                    }
                    return Err(e);
                }
            }
        }

        let status = self.orchestrator.sync_task(task, steps, Utc::now())?;
        if status == TaskStatus::Complete {
            let workspace = self.runner.workspace().task_path(&task.env_id, &task.id);
            task.result = summarize(
                read_json(&workspace.join(TF_PLAN_JSON_FILE)).as_ref(),
                read_json(&workspace.join(TF_STATE_JSON_FILE)).as_ref(),
            );
        }
        info!(status = %status, "Task finished");
        Ok(status)
    }

    /// Runs one step, retrying as allowed. Returns `Running` when the task
    /// may continue with the next step.
    async fn run_step(
        &self,
        task: &mut Task,
        steps: &mut [Step],
        index: usize,
        inputs: &StepInputs,
        decisions: &mut mpsc::Receiver<StepDecision>,
    ) -> Result<TaskStatus, RunError> {
        loop {
            if steps[index].status == StepStatus::Complete {
                return Ok(TaskStatus::Running);
            }

            if self.machine.requires_approval(&steps[index]) {
                if let Some(status) = self.await_approval(task, steps, index, decisions).await? {
                    return Ok(status);
                }
            }

            let outcome = self.attempt(task, &mut steps[index], inputs).await;
            let step = &mut steps[index];
            let best_effort = step.step_type().is_best_effort();
            match outcome {
                Ok(StepStatus::Complete) => return Ok(TaskStatus::Running),
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    warn!(step = step.index, error = %e, "Step attempt failed");
                }
                // Only a step the machine already marked failed may be skipped.
                Err(e) if best_effort && step.status == StepStatus::Failed => {
                    warn!(step = step.index, error = %e, "Step attempt failed");
                }
                Err(e) => return Err(e),
            }

            if best_effort {
                warn!(step = step.index, step_type = %step.step_type(), "Ignoring failed best-effort step");
                return Ok(TaskStatus::Running);
            }

            if !self.machine.can_retry(step) {
                task.message = step.message.clone();
                let status = self.orchestrator.sync_task(task, steps, Utc::now())?;
                return Ok(status);
            }

            self.runner
                .workspace()
                .reset_for_retry(&task.env_id, &task.id, step.index)?;
            let delay = Duration::from_secs(task.retry.delay_secs);
            let next = self.machine.schedule_retry(step, Utc::now(), delay)?;
            info!(
                step = step.index,
                retry = step.current_retry_count,
                max = step.max_retry_count,
                next = %next,
                "Retrying step"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Parks the task until the gated step is decided. Returns the final
    /// task status when the task ends here.
    async fn await_approval(
        &self,
        task: &mut Task,
        steps: &mut [Step],
        index: usize,
        decisions: &mut mpsc::Receiver<StepDecision>,
    ) -> Result<Option<TaskStatus>, RunError> {
        if steps[index].status != StepStatus::Approving {
            self.machine.request_approval(&mut steps[index])?;
        }
        self.orchestrator.sync_task(task, steps, Utc::now())?;
        info!(step = index, "Waiting for approval");

        match decisions.recv().await {
            Some(StepDecision::Approve { approver }) => {
                self.machine.approve(&mut steps[index], &approver)?;
                self.orchestrator
                    .transition_task(task, TaskStatus::Running, Utc::now())?;
                info!(step = index, approver = %approver, "Step approved");
                Ok(None)
            }
            Some(StepDecision::Reject { approver }) => {
                self.machine.reject(&mut steps[index], &approver, Utc::now())?;
                info!(step = index, approver = %approver, "Step rejected");
                Ok(Some(self.orchestrator.sync_task(task, steps, Utc::now())?))
            }
            None => {
                warn!(step = index, "Approval channel closed");
                task.message = "approval channel closed".to_string();
                self.orchestrator
                    .transition_task(task, TaskStatus::Failed, Utc::now())?;
                Ok(Some(TaskStatus::Failed))
            }
        }
    }

    /// One attempt of a step: prepare, start, wait with the step timeout.
    async fn attempt(
        &self,
        task: &Task,
        step: &mut Step,
        inputs: &StepInputs,
    ) -> Result<StepStatus, RunError> {
        let req = RunTaskReq::for_step(task, step, split_by_type(&task.variables))
            .with_private_key(inputs.private_key.clone())
            .with_policies(inputs.policies.clone())
            .with_docker_image(inputs.docker_image.clone());

        self.machine.start(step, Utc::now())?;
        let prepared = match self.runner.prepare(&req) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.machine.fail(step, e.to_string(), Utc::now())?;
                return Err(e);
            }
        };

        let handle = match self
            .runner
            .start(&req, &prepared, self.dispatcher.as_ref())
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.machine.fail(step, e.to_string(), Utc::now())?;
                return Err(e);
            }
        };

        let limit = prepared.command.timeout;
        match tokio::time::timeout(limit, self.dispatcher.wait(&handle)).await {
            Ok(Ok(exit_code)) => {
                let status =
                    self.machine
                        .finish(step, exit_code, req.stop_on_violation, Utc::now())?;
                info!(step = step.index, exit_code, status = %status, "Step exited");
                Ok(status)
            }
            Ok(Err(e)) => {
                self.machine.fail(step, e.to_string(), Utc::now())?;
                Err(e.into())
            }
            Err(_) => {
                warn!(step = step.index, timeout_secs = limit.as_secs(), "Step timed out");
                if let Err(e) = self.dispatcher.stop(&handle).await {
                    warn!(container_id = %handle.id, error = %e, "Failed to stop container");
                }
                self.machine.mark_timeout(step, Utc::now())?;
                Ok(StepStatus::Timeout)
            }
        }
    }
}

fn read_json(path: &Path) -> Option<Value> {
    let bytes = std::fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}
