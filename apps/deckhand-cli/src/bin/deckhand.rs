use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use deckhand_cli_core::deploy::{self, RunOptions};
use deckhand_cli_core::report::{self, OutputFormat};
use deckhand_cli_core::CliError;
use deckhand_executor::log_stream::{self, LogKind, LogStreamReceiver};
use deckhand_planner::PlanKind;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "deckhand")]
#[command(about = "Idempotent deployments of Node.js apps over SSH", long_about = None)]
struct DeckhandCli {
    /// Debug logging and live command output.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: DeckhandCommand,
}

#[derive(Subcommand)]
enum DeckhandCommand {
    /// Execute a plan against a target.
    Run(RunCommand),
    /// Print the steps of a plan without connecting anywhere.
    Plan(PlanCommand),
    /// List the available plans.
    Plans,
    /// Open a session to a target and close it again.
    CheckTarget(CheckTargetCommand),
}

#[derive(Args)]
struct RunCommand {
    plan: String,
    #[arg(long)]
    target: String,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    dry_run: bool,
    /// Write the untruncated result as JSON to this file.
    #[arg(long)]
    report: Option<PathBuf>,
    #[arg(long, default_value = "text")]
    format: OutputFormat,
}

#[derive(Args)]
struct PlanCommand {
    plan: String,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "text")]
    format: OutputFormat,
}

#[derive(Args)]
struct CheckTargetCommand {
    #[arg(long)]
    target: String,
}

fn main() {
    let cli = DeckhandCli::parse();
    init_tracing(cli.verbose);
    match handle_command(cli.command, cli.verbose) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn handle_command(command: DeckhandCommand, verbose: bool) -> Result<i32, CliError> {
    match command {
        DeckhandCommand::Run(cmd) => handle_run(cmd, verbose),
        DeckhandCommand::Plan(cmd) => handle_plan(cmd).map(|_| 0),
        DeckhandCommand::Plans => {
            for kind in PlanKind::ALL {
                println!("{kind}");
            }
            Ok(0)
        }
        DeckhandCommand::CheckTarget(cmd) => {
            println!("{}", deploy::check_target(&cmd.target)?);
            Ok(0)
        }
    }
}

fn handle_run(cmd: RunCommand, verbose: bool) -> Result<i32, CliError> {
    let kind: PlanKind = cmd.plan.parse()?;

    // Progress goes to stderr so JSON output on stdout stays clean.
    let (sender, receiver) = log_stream::create_log_stream();
    let printer = spawn_log_stream_thread(receiver, verbose);
    let options = RunOptions {
        dry_run: cmd.dry_run,
        log_stream: Some(sender),
        command_timeout: None,
    };
    let outcome = deploy::run_plan(kind, &cmd.target, cmd.config.as_deref(), &options);
    drop(options);
    let _ = printer.join();
    let result = outcome?;

    if let Some(path) = &cmd.report {
        report::write_report(path, &result)?;
    }
    let rendered = match cmd.format {
        OutputFormat::Text => report::render_text(&result),
        OutputFormat::Json => report::render_json_lines(&result)?,
    };
    let mut stdout = io::stdout().lock();
    stdout.write_all(rendered.as_bytes())?;
    stdout.flush()?;
    Ok(result.status.exit_code())
}

fn handle_plan(cmd: PlanCommand) -> Result<(), CliError> {
    let kind: PlanKind = cmd.plan.parse()?;
    let (_, plan) = deploy::load_plan(kind, cmd.config.as_deref())?;
    match cmd.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
        OutputFormat::Text => {
            println!("plan {} ({} steps)", plan.name, plan.steps.len());
            for (index, step) in plan.steps.iter().enumerate() {
                println!(
                    "{:>3}. {:<28} {:<10} timeout={}s  {}",
                    index + 1,
                    step.id,
                    step.on_failure.to_string(),
                    step.timeout_secs,
                    step.description
                );
                println!("       pre:    {}", step.precondition.description);
                for command in &step.action {
                    println!("       action: {}", first_line(command));
                }
                println!("       post:   {}", step.postcondition.description);
            }
        }
    }
    Ok(())
}

fn first_line(command: &str) -> String {
    let mut lines = command.lines();
    let first = lines.next().unwrap_or_default().trim();
    if lines.next().is_some() {
        format!("{first} ...")
    } else {
        first.to_string()
    }
}

fn spawn_log_stream_thread(receiver: LogStreamReceiver, verbose: bool) -> thread::JoinHandle<()> {
    thread::spawn(move || loop {
        match receiver.recv_timeout(Duration::from_millis(200)) {
            Ok(msg) => match msg.kind {
                LogKind::Status => {
                    eprintln!("[{}][{}] {}", msg.step_id, msg.level.as_str(), msg.message)
                }
                LogKind::Stdout | LogKind::Stderr if verbose => {
                    eprintln!("[{}] | {}", msg.step_id, msg.message)
                }
                _ => {}
            },
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(_) => break,
        }
    })
}
