//! Task, step and variable records.
//!
//! These are the entities the runner reads from and reports to the
//! persistence layer. Status and type fields are closed enums; parsing an
//! unknown value yields `ModelError::UnknownValue`.

pub mod step;
pub mod task;
pub mod variable;

pub use step::{validate_indices, Step, StepBody, StepStatus, StepType};
pub use task::{RetryPolicy, ScanTask, Task, TaskExtra, TaskResult, TaskStatus, TaskType, Tasker};
pub use variable::{validate_unique, Variable, VariableBody, VariableScope, VariableType};
