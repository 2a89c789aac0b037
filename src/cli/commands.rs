//! CLI command definitions for iac-runner.
//!
//! Requests and tasks are read from YAML (or JSON) files. Runner settings
//! come from `IAC_*` environment variables, see [`RunnerConfig::from_env`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::RunnerConfig;
use crate::error::RunError;
use crate::execution::{DockerDispatcher, ExecutionDispatcher};
use crate::lifecycle::{StepDecision, StepInputs, TaskDriver, TaskOrchestrator};
use crate::model::task::Task;
use crate::runner::{RunTaskReq, ScriptContext, ScriptGenerator, TaskPolicy, TaskRunner};
use crate::variables::{SealedCipher, SecretCipher};

/// Default assets directory inside the worker container.
const DEFAULT_ASSETS_DIR: &str = "/cloudiac/assets";

/// Runs infrastructure-as-code task steps in worker containers.
#[derive(Parser)]
#[command(name = "iac-runner")]
#[command(about = "Run terraform/ansible task steps in isolated containers")]
#[command(version)]
#[command(
    long_about = "iac-runner prepares task workspaces, renders step scripts and runs them in worker containers.\n\nExample usage:\n  iac-runner render --request step.yaml\n  iac-runner run --request step.yaml\n  iac-runner drive --task task.yaml"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Print the script a request would run, without touching the filesystem.
    Render(RenderArgs),

    /// Build the workspace and step script for a request.
    Prepare(RequestArgs),

    /// Prepare a request, run it in a container and wait for it.
    Run(RunArgs),

    /// Seal a value with the runner secret key.
    #[command(alias = "seal")]
    Encrypt(EncryptArgs),

    /// Print the steps a task would run.
    PlanSteps(TaskArgs),

    /// Run every step of a task. Approvals are read from stdin as
    /// `approve <user>` or `reject <user>`.
    Drive(DriveArgs),
}

#[derive(Parser, Debug)]
pub struct RenderArgs {
    /// Run request file.
    #[arg(short = 'r', long)]
    pub request: PathBuf,

    /// Assets directory inside the container.
    #[arg(long, env = "IAC_ASSETS_DIR", default_value = DEFAULT_ASSETS_DIR)]
    pub assets_dir: String,
}

#[derive(Parser, Debug)]
pub struct RequestArgs {
    /// Run request file.
    #[arg(short = 'r', long)]
    pub request: PathBuf,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Run request file.
    #[arg(short = 'r', long)]
    pub request: PathBuf,

    /// Do not pull missing images.
    #[arg(long)]
    pub no_pull: bool,
}

#[derive(Parser, Debug)]
pub struct EncryptArgs {
    /// Value to seal.
    pub value: String,

    /// Secret key.
    #[arg(long, env = "IAC_SECRET_KEY", hide_env_values = true)]
    pub secret_key: String,
}

#[derive(Parser, Debug)]
pub struct TaskArgs {
    /// Task file.
    #[arg(short = 't', long)]
    pub task: PathBuf,
}

#[derive(Parser, Debug)]
pub struct DriveArgs {
    /// Task file.
    #[arg(short = 't', long)]
    pub task: PathBuf,

    /// File holding the (possibly sealed) private key.
    #[arg(long)]
    pub private_key_file: Option<PathBuf>,

    /// YAML (or JSON) list of policy bundles for scan steps.
    #[arg(long)]
    pub policies: Option<PathBuf>,

    /// Worker image override.
    #[arg(long)]
    pub image: Option<String>,

    /// Do not pull missing images.
    #[arg(long)]
    pub no_pull: bool,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Render(args) => run_render_command(args),
        Commands::Prepare(args) => run_prepare_command(args),
        Commands::Run(args) => run_run_command(args).await,
        Commands::Encrypt(args) => run_encrypt_command(args),
        Commands::PlanSteps(args) => run_plan_steps_command(args),
        Commands::Drive(args) => run_drive_command(args).await,
    }
}

// ============================================================================
// Step commands
// ============================================================================

fn run_render_command(args: RenderArgs) -> anyhow::Result<()> {
    let req = RunTaskReq::from_file(&args.request)?;
    let scripts = ScriptGenerator::new()?;
    let ctx = ScriptContext::from_request(&req, args.assets_dir);
    let script = scripts.render(req.step_type, &ctx)?;
    print!("{script}");
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrepareOutput {
    workspace: PathBuf,
    script_path: PathBuf,
    container: String,
    image: String,
    commands: Vec<String>,
    timeout_secs: u64,
}

fn run_prepare_command(args: RequestArgs) -> anyhow::Result<()> {
    let req = RunTaskReq::from_file(&args.request)?;
    let runner = TaskRunner::from_config(RunnerConfig::from_env()?)?;
    let prepared = runner.prepare(&req)?;

    let output = PrepareOutput {
        workspace: prepared.workspace,
        script_path: prepared.script_path,
        container: prepared.command.name,
        image: prepared.command.image,
        commands: prepared.command.commands,
        timeout_secs: prepared.command.timeout.as_secs(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_run_command(args: RunArgs) -> anyhow::Result<()> {
    let req = RunTaskReq::from_file(&args.request)?;
    let runner = TaskRunner::from_config(RunnerConfig::from_env()?)?;
    let dispatcher = docker_dispatcher(args.no_pull)?;

    let (prepared, handle) = runner.run(&req, &dispatcher).await?;
    info!(container_id = %handle.id, "Waiting for step");

    let limit = prepared.command.timeout;
    let exit_code = match tokio::time::timeout(limit, dispatcher.wait(&handle)).await {
        Ok(result) => result?,
        Err(_) => {
            if let Err(e) = dispatcher.stop(&handle).await {
                warn!(container_id = %handle.id, error = %e, "Failed to stop container");
            }
            return Err(RunError::StepTimeout {
                index: req.step,
                seconds: limit.as_secs(),
            }
            .into());
        }
    };

    println!("{exit_code}");
    if exit_code != 0 {
        anyhow::bail!("Step {} exited with code {exit_code}", req.step);
    }
    Ok(())
}

fn run_encrypt_command(args: EncryptArgs) -> anyhow::Result<()> {
    let cipher = SealedCipher::new(&args.secret_key)?;
    println!("{}", cipher.encrypt(&args.value)?);
    Ok(())
}

// ============================================================================
// Task commands
// ============================================================================

fn load_task(path: &Path) -> anyhow::Result<Task> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read task {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse task {}", path.display()))
}

fn load_policies(path: &Path) -> anyhow::Result<Vec<TaskPolicy>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policies {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse policies {}", path.display()))
}

fn run_plan_steps_command(args: TaskArgs) -> anyhow::Result<()> {
    let task = load_task(&args.task)?;
    let steps = TaskOrchestrator::new().plan_steps(&task);
    println!("{}", serde_json::to_string_pretty(&steps)?);
    Ok(())
}

async fn run_drive_command(args: DriveArgs) -> anyhow::Result<()> {
    let mut task = load_task(&args.task)?;
    let runner = TaskRunner::from_config(RunnerConfig::from_env()?)?;
    let dispatcher: Arc<dyn ExecutionDispatcher> = Arc::new(docker_dispatcher(args.no_pull)?);
    let driver = TaskDriver::new(runner, dispatcher);

    let private_key = match &args.private_key_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read private key {}", path.display()))?,
        None => String::new(),
    };
    let policies = match &args.policies {
        Some(path) => load_policies(path)?,
        None => Vec::new(),
    };
    let inputs = StepInputs {
        private_key,
        policies,
        docker_image: args.image.unwrap_or_default(),
    };

    let (tx, mut rx) = mpsc::channel(1);
    tokio::spawn(read_decisions(tx));

    let mut steps = driver.orchestrator().plan_steps(&task);
    let status = driver.drive(&mut task, &mut steps, &inputs, &mut rx).await?;

    #[derive(Serialize)]
    struct DriveOutput<'a> {
        task: &'a Task,
        steps: &'a [crate::model::step::Step],
    }
    let redacted = task.redacted();
    println!(
        "{}",
        serde_json::to_string_pretty(&DriveOutput {
            task: &redacted,
            steps: &steps,
        })?
    );
    info!(status = %status, "Task finished");
    Ok(())
}

/// Forwards `approve <user>` / `reject <user>` lines from stdin.
async fn read_decisions(tx: mpsc::Sender<StepDecision>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Some(decision) = parse_decision(&line) else {
            warn!(input = %line.trim(), "Expected 'approve <user>' or 'reject <user>'");
            continue;
        };
        if tx.send(decision).await.is_err() {
            break;
        }
    }
}

fn parse_decision(line: &str) -> Option<StepDecision> {
    let mut words = line.split_whitespace();
    let verb = words.next()?;
    let approver = words.next()?.to_string();
    match verb {
        "approve" => Some(StepDecision::Approve { approver }),
        "reject" => Some(StepDecision::Reject { approver }),
        _ => None,
    }
}

fn docker_dispatcher(no_pull: bool) -> anyhow::Result<DockerDispatcher> {
    let dispatcher = DockerDispatcher::connect()?;
    Ok(if no_pull {
        dispatcher.without_pull()
    } else {
        dispatcher
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_decision() {
        assert_eq!(
            parse_decision("approve alice"),
            Some(StepDecision::Approve {
                approver: "alice".to_string()
            })
        );
        assert_eq!(
            parse_decision("  reject bob  "),
            Some(StepDecision::Reject {
                approver: "bob".to_string()
            })
        );
        assert_eq!(parse_decision("approve"), None);
        assert_eq!(parse_decision("maybe carol"), None);
    }

    #[test]
    fn test_parse_drive_policies() {
        let cli = Cli::try_parse_from([
            "iac-runner",
            "drive",
            "--task",
            "task.yaml",
            "--policies",
            "policies.yaml",
        ])
        .expect("parse");
        match cli.command {
            Commands::Drive(args) => {
                assert_eq!(args.policies, Some(PathBuf::from("policies.yaml")))
            }
            _ => panic!("expected drive"),
        }
    }

    #[test]
    fn test_load_policies() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("policies.yaml");
        std::fs::write(
            &path,
            "- policyId: p1\n  meta:\n    severity: HIGH\n  rego: |\n    package p1\n- policyId: p2\n",
        )
        .expect("write");

        let policies = load_policies(&path).expect("load");
        assert_eq!(policies.len(), 2);
        assert_eq!(policies[0].policy_id, "p1");
        assert_eq!(policies[0].meta["severity"], "HIGH");
        assert!(policies[0].rego.starts_with("package p1"));
        assert!(policies[1].rego.is_empty());

        assert!(load_policies(&dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_parse_render_args() {
        let cli = Cli::try_parse_from(["iac-runner", "render", "--request", "step.yaml"])
            .expect("parse");
        match cli.command {
            Commands::Render(args) => assert_eq!(args.request, PathBuf::from("step.yaml")),
            _ => panic!("expected render"),
        }
        assert_eq!(cli.log_level, "info");
    }
}
