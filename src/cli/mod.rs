//! Command-line interface for iac-runner.
//!
//! Provides commands to render, prepare and run single steps, seal secrets,
//! and plan or drive whole tasks.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
