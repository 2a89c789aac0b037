//! Task and step lifecycle.
//!
//! - [`StepStateMachine`]: legal step transitions, approval and retry rules
//! - [`TaskOrchestrator`]: step planning and task status aggregation
//! - [`TaskDriver`]: runs a task's steps against an [`ExecutionDispatcher`]
//!
//! [`ExecutionDispatcher`]: crate::execution::ExecutionDispatcher

pub mod driver;
pub mod orchestrator;
pub mod step_machine;

pub use driver::{StepDecision, StepInputs, TaskDriver};
pub use orchestrator::{summarize, TaskOrchestrator, AUTO_APPROVER};
pub use step_machine::{effective_exit_code, StepStateMachine};
