//! Step runner.
//!
//! Turns a run request into files on disk and a container command.
//!
//! # Workspace layout
//!
//! ```text
//! <storage>/<env_id>/<task_id>/
//!     ssh_key                  private key (0600)
//!     cloudiac.tf              state backend configuration
//!     cloudiac_play_vars.yml   ansible variables
//!     policies/<id>/           policy bundles
//!     code/                    repository checkout
//!     step<N>/script.sh        generated step script
//!     step<N>/step.log         step output
//!     step<N>/step-info.json   container that ran the step
//! ```
//!
//! # Example
//!
//! ```ignore
//! use iac_runner::runner::{RunTaskReq, TaskRunner};
//!
//! let runner = TaskRunner::from_config(RunnerConfig::from_env()?)?;
//! let req = RunTaskReq::from_file(Path::new("step.yaml"))?;
//! let prepared = runner.prepare(&req)?;
//! println!("{}", prepared.script_path.display());
//! ```

pub mod command;
pub mod paths;
pub mod request;
pub mod script;
pub mod task_runner;
pub mod workspace;

pub use command::ContainerCommand;
pub use request::{CommittedTaskStep, RunTaskReq, StateStore, TaskEnv, TaskPolicy};
pub use script::{ScriptContext, ScriptGenerator};
pub use task_runner::{PreparedStep, TaskRunner};
pub use workspace::WorkspaceBuilder;
