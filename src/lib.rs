//! iac-runner: infrastructure-as-code task runner.
//!
//! This library turns task records (plan, apply, destroy, scan, parse) into
//! ordered steps, prepares a workspace and shell script for each step, and
//! runs the scripts in worker containers while keeping task and step status
//! consistent.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod lifecycle;
pub mod model;
pub mod runner;
pub mod variables;

// Re-export commonly used types
pub use config::{ConfigError, RunnerConfig};
pub use error::{
    DispatchError, ErrorCategory, ModelError, RunError, ScriptError, SecretError,
    TransitionError, WorkspaceError,
};
