use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::debug;

use crate::error::TransitionError;
use crate::model::step::{Step, StepStatus, StepType};
use crate::runner::paths::SCAN_VIOLATION_EXIT_CODE;

/// Exit code after step-type specific remapping.
///
/// A scan reporting violations counts as success unless violations are
/// configured to stop the task.
pub fn effective_exit_code(step_type: StepType, exit_code: i64, stop_on_violation: bool) -> i64 {
    if step_type == StepType::Scan && !stop_on_violation && exit_code == SCAN_VIOLATION_EXIT_CODE {
        0
    } else {
        exit_code
    }
}

/// Enforces legal status transitions of a single step.
pub struct StepStateMachine {
    valid_transitions: HashMap<StepStatus, Vec<StepStatus>>,
}

impl StepStateMachine {
    /// Create a state machine with the standard transition rules.
    ///
    /// Valid transitions:
    /// - Pending -> Approving (gated step waits for a human)
    /// - Pending -> Running
    /// - Pending -> Failed (could not be prepared)
    /// - Approving -> Running | Rejected
    /// - Running -> Complete | Failed | Timeout
    /// - Failed -> Pending, Timeout -> Pending (retry only)
    pub fn new() -> Self {
        let mut valid_transitions = HashMap::new();

        valid_transitions.insert(
            StepStatus::Pending,
            vec![StepStatus::Approving, StepStatus::Running, StepStatus::Failed],
        );
        valid_transitions.insert(
            StepStatus::Approving,
            vec![StepStatus::Running, StepStatus::Rejected],
        );
        valid_transitions.insert(
            StepStatus::Running,
            vec![StepStatus::Complete, StepStatus::Failed, StepStatus::Timeout],
        );
        valid_transitions.insert(StepStatus::Failed, vec![StepStatus::Pending]);
        valid_transitions.insert(StepStatus::Timeout, vec![StepStatus::Pending]);
        valid_transitions.insert(StepStatus::Rejected, vec![]);
        valid_transitions.insert(StepStatus::Complete, vec![]);

        Self { valid_transitions }
    }

    /// Check if a transition between two statuses is allowed.
    pub fn can_transition(&self, from: StepStatus, to: StepStatus) -> bool {
        self.valid_transitions
            .get(&from)
            .is_some_and(|targets| targets.contains(&to))
    }

    fn transition(&self, step: &mut Step, to: StepStatus) -> Result<(), TransitionError> {
        if !self.can_transition(step.status, to) {
            return Err(TransitionError::Illegal {
                entity: "step",
                from: step.status.to_string(),
                to: to.to_string(),
            });
        }
        debug!(step = step.index, from = %step.status, to = %to, "Step transition");
        step.status = to;
        Ok(())
    }

    /// Whether the step still has to wait for an approver.
    pub fn requires_approval(&self, step: &Step) -> bool {
        step.step_type().requires_approval()
            && step.approver_id.as_deref().map_or(true, str::is_empty)
    }

    /// Moves a gated step into `approving`.
    pub fn request_approval(&self, step: &mut Step) -> Result<(), TransitionError> {
        if !self.requires_approval(step) {
            return Err(TransitionError::ApprovalNotRequired(step.index));
        }
        self.transition(step, StepStatus::Approving)
    }

    /// Records the approver. The step starts with the next [`start`](Self::start).
    pub fn approve(&self, step: &mut Step, approver: &str) -> Result<(), TransitionError> {
        if approver.is_empty() {
            return Err(TransitionError::EmptyApprover);
        }
        if !step.step_type().requires_approval() {
            return Err(TransitionError::ApprovalNotRequired(step.index));
        }
        if step.status != StepStatus::Approving {
            return Err(TransitionError::Illegal {
                entity: "step",
                from: step.status.to_string(),
                to: "approved".to_string(),
            });
        }
        step.approver_id = Some(approver.to_string());
        Ok(())
    }

    /// Rejects a step waiting for approval. Rejection is terminal.
    pub fn reject(
        &self,
        step: &mut Step,
        approver: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if approver.is_empty() {
            return Err(TransitionError::EmptyApprover);
        }
        self.transition(step, StepStatus::Rejected)?;
        step.approver_id = Some(approver.to_string());
        step.ended_at = Some(now);
        Ok(())
    }

    /// Marks the step running.
    ///
    /// # Errors
    /// `ApprovalRequired` if an apply/destroy step has no approver yet.
    pub fn start(&self, step: &mut Step, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.requires_approval(step) {
            return Err(TransitionError::ApprovalRequired(step.index));
        }
        self.transition(step, StepStatus::Running)?;
        step.started_at = Some(now);
        step.ended_at = None;
        step.log_path = step.gen_log_path();
        Ok(())
    }

    /// Records the container's exit code.
    ///
    /// Returns the resulting status: `Complete` for an effective exit code of
    /// zero, `Failed` otherwise.
    pub fn finish(
        &self,
        step: &mut Step,
        exit_code: i64,
        stop_on_violation: bool,
        now: DateTime<Utc>,
    ) -> Result<StepStatus, TransitionError> {
        let code = effective_exit_code(step.step_type(), exit_code, stop_on_violation);
        let to = if code == 0 {
            StepStatus::Complete
        } else {
            StepStatus::Failed
        };
        self.transition(step, to)?;
        step.exit_code = code;
        step.ended_at = Some(now);
        if to == StepStatus::Failed {
            step.message = format!("exit code {code}");
        }
        Ok(to)
    }

    /// The step exceeded its time budget.
    pub fn mark_timeout(&self, step: &mut Step, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(step, StepStatus::Timeout)?;
        step.ended_at = Some(now);
        step.message = "step timed out".to_string();
        Ok(())
    }

    /// Fails a step that could not be prepared or dispatched.
    pub fn fail(
        &self,
        step: &mut Step,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(step, StepStatus::Failed)?;
        step.message = message.into();
        step.ended_at = Some(now);
        Ok(())
    }

    /// Whether a failed or timed-out step has retry budget left.
    pub fn can_retry(&self, step: &Step) -> bool {
        matches!(step.status, StepStatus::Failed | StepStatus::Timeout)
            && step.current_retry_count < step.max_retry_count
    }

    /// Puts a failed or timed-out step back to `pending` for another attempt.
    ///
    /// The step keeps its index, id and approver. Returns the time the next
    /// attempt may start.
    pub fn schedule_retry(
        &self,
        step: &mut Step,
        now: DateTime<Utc>,
        delay: std::time::Duration,
    ) -> Result<DateTime<Utc>, TransitionError> {
        if !self.can_retry(step) {
            let reason = if step.is_exited() && step.status != StepStatus::Rejected {
                format!(
                    "retry budget exhausted ({}/{})",
                    step.current_retry_count, step.max_retry_count
                )
            } else {
                format!("status is {}", step.status)
            };
            return Err(TransitionError::RetryNotAllowed {
                index: step.index,
                reason,
            });
        }

        self.transition(step, StepStatus::Pending)?;
        let next = now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::zero());
        step.current_retry_count += 1;
        step.next_retry_time = Some(next);
        step.exit_code = 0;
        step.started_at = None;
        step.ended_at = None;
        Ok(next)
    }
}

impl Default for StepStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
