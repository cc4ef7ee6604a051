//! `dmo`: run a human-approved migration from the terminal
//!
//! - `dmo run --config dmo.toml` drives one workflow to its terminal stage,
//!   stopping at the approval gate for an operator decision
//! - `dmo report --state-dir DIR` prints the last persisted session

mod config;
mod render;

use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use config::CliConfig;
use dmo_advisory::HttpAdvisoryConnector;
use dmo_core::prelude::*;
use dmo_core::{FileSessionStore, SessionStore};
use dmo_kernel::engine::ExecutionOutcome;
use dmo_sqlite::SqliteConnector;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// Operator decision taken at the approval gate
#[derive(Debug, Clone, PartialEq, Eq)]
enum Decision {
    Approve,
    Deny(Option<String>),
}

fn cli() -> Command {
    Command::new("dmo")
        .version(dmo_core::VERSION)
        .about("Human-approved, dependency-ordered database migration")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("run")
                .about("Discover, validate and plan, then copy once approved")
                .arg(
                    Arg::new("config")
                        .long("config")
                        .short('c')
                        .required(true)
                        .value_name("FILE")
                        .value_parser(value_parser!(PathBuf))
                        .help("TOML file with descriptors and settings"),
                )
                .arg(
                    Arg::new("approve")
                        .long("approve")
                        .action(ArgAction::SetTrue)
                        .conflicts_with("deny")
                        .help("Approve the plan without prompting"),
                )
                .arg(
                    Arg::new("deny")
                        .long("deny")
                        .value_name("REASON")
                        .help("Deny the plan without prompting"),
                ),
        )
        .subcommand(
            Command::new("report")
                .about("Print the last persisted session")
                .arg(
                    Arg::new("state-dir")
                        .long("state-dir")
                        .required(true)
                        .value_name("DIR")
                        .value_parser(value_parser!(PathBuf))
                        .help("Directory sessions were persisted to"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: cannot start runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    let result = runtime.block_on(async {
        match matches.subcommand() {
            Some(("run", args)) => command_run(args).await,
            Some(("report", args)) => command_report(args),
            _ => Ok(ExitCode::FAILURE),
        }
    });
    // An abandoned prompt leaves a blocking stdin read behind
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn preset_decision(args: &ArgMatches) -> Option<Decision> {
    if args.get_flag("approve") {
        return Some(Decision::Approve);
    }
    args.get_one::<String>("deny")
        .map(|reason| Decision::Deny(Some(reason.clone()).filter(|r| !r.is_empty())))
}

async fn command_run(args: &ArgMatches) -> anyhow::Result<ExitCode> {
    let Some(path) = args.get_one::<PathBuf>("config") else {
        bail!("--config is required");
    };
    let config = CliConfig::load(path)?;
    let preset = preset_decision(args);

    let mut builder = WorkflowController::builder(
        Arc::new(SqliteConnector::new()),
        Arc::new(HttpAdvisoryConnector::new()),
    )
    .with_settings(config.settings.clone());
    if let Some(dir) = &config.state_dir {
        let store = FileSessionStore::open(dir)
            .with_context(|| format!("cannot open state directory {}", dir.display()))?;
        builder = builder.with_store(Arc::new(store));
    }
    let controller = builder.build()?;

    let id = controller.configure(config.descriptors()).await?;
    tracing::info!("Session {} configured", id);
    controller.start()?;

    let interrupt = tokio::spawn(cancel_on_interrupt(controller.clone()));

    let mut stage = controller.wait_until_settled().await;
    if stage == WorkflowStage::AwaitingApproval {
        print_gate(&controller);
        stage = decide(&controller, preset).await?;
    }
    if stage.is_live() {
        stage = controller.wait_until_settled().await;
    }
    interrupt.abort();

    Ok(finish(&controller, stage))
}

/// Forward Ctrl-C to `cancel` for as long as the run lasts
async fn cancel_on_interrupt(controller: WorkflowController) {
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        match controller.cancel() {
            Ok(()) => eprintln!("cancellation requested, waiting for the current stage to stop"),
            Err(err) => eprintln!("cannot cancel: {err}"),
        }
    }
}

fn print_gate(controller: &WorkflowController) {
    let validation = match controller.report(StageKind::Validation) {
        Some(StageReport::Validation(record)) => record.output().cloned(),
        _ => None,
    };
    if let Some(StageReport::Generation(record)) = controller.report(StageKind::Generation) {
        if let Some(generation) = record.output() {
            print!("{}", render::approval_gate(generation, validation.as_ref()));
        }
    }
}

/// Apply the preset decision or ask the operator. Returns the stage after
/// the decision; an approval timeout that fires first wins.
async fn decide(
    controller: &WorkflowController,
    preset: Option<Decision>,
) -> anyhow::Result<WorkflowStage> {
    let decision = match preset {
        Some(decision) => decision,
        None => {
            tokio::select! {
                decision = prompt() => decision?,
                stage = controller.wait_for(|s| s != WorkflowStage::AwaitingApproval) => {
                    println!();
                    return Ok(stage);
                }
            }
        }
    };

    let applied = match decision {
        Decision::Approve => controller.approve(),
        Decision::Deny(reason) => controller.deny(reason),
    };
    if let Err(err) = applied {
        // The gate may have closed while the operator was typing
        if controller.stage() == WorkflowStage::AwaitingApproval {
            return Err(err.into());
        }
        eprintln!("decision not applied: {err}");
    }
    Ok(controller.stage())
}

async fn prompt() -> anyhow::Result<Decision> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout.write_all(b"Approve this migration? [y/N] ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            return Ok(Decision::Deny(Some("no operator input".to_string())));
        };
        match line.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => return Ok(Decision::Approve),
            "" | "n" | "no" => break,
            _ => continue,
        }
    }

    stdout.write_all(b"Reason (optional): ").await?;
    stdout.flush().await?;
    let reason = lines
        .next_line()
        .await?
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    Ok(Decision::Deny(reason))
}

fn finish(controller: &WorkflowController, stage: WorkflowStage) -> ExitCode {
    let session = controller.session();
    let execution = session
        .as_ref()
        .and_then(|s| s.reports.execution())
        .cloned();

    if let Some(report) = &execution {
        print!("{}", render::execution_summary(report));
    }
    if let Some(text) = session.as_ref().and_then(|s| s.final_report.as_deref()) {
        print!("{}", render::final_report(text));
    }
    if let Some(failure) = session.as_ref().and_then(|s| s.failure.as_ref()) {
        println!("Workflow failed: {failure}");
    }
    if let Some(session) = &session {
        println!("Session {} finished as {}", session.id, stage);
    }

    let completed = stage == WorkflowStage::Completed
        && execution.is_some_and(|r| r.outcome == ExecutionOutcome::Completed);
    if completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn command_report(args: &ArgMatches) -> anyhow::Result<ExitCode> {
    let Some(dir) = args.get_one::<PathBuf>("state-dir") else {
        bail!("--state-dir is required");
    };
    if !dir.is_dir() {
        bail!("state directory {} does not exist", dir.display());
    }
    let store = FileSessionStore::open(dir)?;
    let Some(record) = store.load_latest()? else {
        println!("No session recorded in {}", dir.display());
        return Ok(ExitCode::FAILURE);
    };

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print!("{}", render::session_record(&record));
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(argv: &[&str]) -> ArgMatches {
        let matches = cli().try_get_matches_from(argv).unwrap();
        let (name, args) = matches.subcommand().unwrap();
        assert_eq!(name, "run");
        args.clone()
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn test_preset_decisions() {
        assert_eq!(preset_decision(&run_args(&["dmo", "run", "-c", "dmo.toml"])), None);
        assert_eq!(
            preset_decision(&run_args(&["dmo", "run", "-c", "dmo.toml", "--approve"])),
            Some(Decision::Approve)
        );
        assert_eq!(
            preset_decision(&run_args(&["dmo", "run", "-c", "dmo.toml", "--deny", "too risky"])),
            Some(Decision::Deny(Some("too risky".to_string())))
        );
        assert!(cli()
            .try_get_matches_from(["dmo", "run", "-c", "x", "--approve", "--deny", "no"])
            .is_err());
        assert!(cli().try_get_matches_from(["dmo", "run"]).is_err());
    }
}
