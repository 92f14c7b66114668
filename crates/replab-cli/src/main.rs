use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use replab_core::REPLAB_DEFAULT_MODEL;
use replab_runner::{load_harness_config, Coordinator, HarnessConfig, RunRequest, RunSummary};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "replab", version, about = "Replicated agent experiment runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run `num_exp` attempts of one task on every replica.
    Run {
        #[arg(long = "task_path")]
        task_path: PathBuf,
        #[arg(long = "task_id")]
        task_id: String,
        #[arg(long = "num_exp", default_value_t = 5)]
        num_exp: usize,
        /// 0 runs against the template server and project directly.
        #[arg(long = "num_parallel", default_value_t = 0)]
        num_parallel: usize,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long = "num_agents", value_parser = clap::value_parser!(u8).range(1..=3))]
        num_agents: Option<u8>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        fresh: bool,
        #[arg(long)]
        json: bool,
    },
    /// Kill every session a run with `num_parallel` replicas would use.
    Stop {
        #[arg(long = "num_parallel", default_value_t = 1)]
        num_parallel: usize,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Remove replica trees created by a run with `num_parallel` replicas.
    Clean {
        #[arg(long = "num_parallel")]
        num_parallel: usize,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Outcome { payload, failed }) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            if failed {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

struct Outcome {
    payload: Option<Value>,
    failed: bool,
}

fn run_command(command: Commands) -> Result<Outcome> {
    match command {
        Commands::Run {
            task_path,
            task_id,
            num_exp,
            num_parallel,
            config,
            num_agents,
            model,
            fresh,
            json,
        } => {
            let mut harness = harness_config(config.as_deref())?;
            apply_roster_flags(&mut harness, num_agents.map(usize::from), model.as_deref())?;
            let coordinator = Arc::new(Coordinator::with_tmux(harness));
            install_interrupt_handler(coordinator.clone(), num_parallel)?;

            let request = RunRequest {
                task_path,
                task_id,
                num_exp,
                num_parallel,
                fresh,
            };
            let summary = coordinator.run(&request)?;
            let report_dir = coordinator.config().report_dir.clone();
            let failed = summary.all_failed();
            if json {
                return Ok(Outcome {
                    payload: Some(json!({
                        "ok": !failed,
                        "command": "run",
                        "task_id": request.task_id,
                        "num_exp": request.num_exp,
                        "num_parallel": request.num_parallel,
                        "summary": summary_to_json(&summary, &report_dir),
                    })),
                    failed,
                });
            }
            print_summary(&summary, &report_dir);
            Ok(Outcome {
                payload: None,
                failed,
            })
        }
        Commands::Stop {
            num_parallel,
            config,
            json,
        } => {
            let coordinator = Coordinator::with_tmux(harness_config(config.as_deref())?);
            coordinator.stop_sessions(num_parallel)?;
            let sessions = coordinator.session_names(num_parallel);
            if json {
                return Ok(Outcome {
                    payload: Some(json!({ "ok": true, "command": "stop", "sessions": sessions })),
                    failed: false,
                });
            }
            for session in sessions {
                println!("stopped: {}", session);
            }
            Ok(Outcome {
                payload: None,
                failed: false,
            })
        }
        Commands::Clean {
            num_parallel,
            config,
            json,
        } => {
            let coordinator = Coordinator::with_tmux(harness_config(config.as_deref())?);
            let removed = coordinator.clean(num_parallel)?;
            let work_root = coordinator.config().work_root.display().to_string();
            if json {
                return Ok(Outcome {
                    payload: Some(json!({
                        "ok": true,
                        "command": "clean",
                        "work_root": work_root,
                        "removed": removed,
                    })),
                    failed: false,
                });
            }
            println!("work_root: {}", work_root);
            println!("removed: {}", removed);
            Ok(Outcome {
                payload: None,
                failed: false,
            })
        }
    }
}

fn harness_config(path: Option<&Path>) -> Result<HarnessConfig> {
    let mut config = load_harness_config(path)?;
    let cwd = std::env::current_dir().context("failed resolving working directory")?;
    config.resolve_paths(&cwd);
    Ok(config)
}

/// `--num_agents` picks a stock roster; `--model` alone re-models the
/// configured roster.
fn apply_roster_flags(
    config: &mut HarnessConfig,
    num_agents: Option<usize>,
    model: Option<&str>,
) -> Result<()> {
    match (num_agents, model) {
        (Some(n), model) => config.set_roster(n, model.unwrap_or(REPLAB_DEFAULT_MODEL)),
        (None, Some(model)) => {
            config.models = vec![model.to_string(); config.agents.len()];
            Ok(())
        }
        (None, None) => Ok(()),
    }
}

/// Ctrl-C kills the run's task runners and sessions through the same
/// supervisor the workers use.
fn install_interrupt_handler(coordinator: Arc<Coordinator>, num_parallel: usize) -> Result<()> {
    ctrlc::set_handler(move || {
        warn!("interrupted; stopping sessions");
        if let Err(err) = coordinator.stop_sessions(num_parallel) {
            warn!(error = %format!("{:#}", err), "failed to stop sessions on interrupt");
        }
        std::process::exit(130);
    })
    .context("failed installing interrupt handler")
}

fn print_summary(summary: &RunSummary, report_dir: &Path) {
    for failure in &summary.provision_failures {
        println!(
            "replica {}: not provisioned ({}): {}",
            failure.index,
            failure.path.display(),
            failure.error
        );
    }
    for outcome in &summary.outcomes {
        match &outcome.result {
            Ok(report) => println!(
                "replica {} (port {}): {}/{} successful, ratio {:.2}, report {}",
                outcome.index,
                outcome.port,
                report.successes(),
                report.total(),
                report.success_ratio(),
                report.text_path(report_dir).display()
            ),
            Err(err) => println!(
                "replica {} (port {}): failed: {}",
                outcome.index, outcome.port, err
            ),
        }
    }
    info!(
        completed = summary.completed(),
        replicas = summary.outcomes.len(),
        "run finished"
    );
}

fn summary_to_json(summary: &RunSummary, report_dir: &Path) -> Value {
    let replicas: Vec<Value> = summary
        .outcomes
        .iter()
        .map(|outcome| match &outcome.result {
            Ok(report) => json!({
                "index": outcome.index,
                "port": outcome.port,
                "session": outcome.session,
                "ok": true,
                "total": report.total(),
                "successes": report.successes(),
                "success_ratio": report.success_ratio(),
                "average_time_secs": report.average_time(),
                "report": report.text_path(report_dir).display().to_string(),
                "report_json": report.json_path(report_dir).display().to_string(),
            }),
            Err(err) => json!({
                "index": outcome.index,
                "port": outcome.port,
                "session": outcome.session,
                "ok": false,
                "error": err,
            }),
        })
        .collect();
    let provision_failures: Vec<Value> = summary
        .provision_failures
        .iter()
        .map(|failure| {
            json!({
                "index": failure.index,
                "path": failure.path.display().to_string(),
                "error": failure.error,
            })
        })
        .collect();
    json!({
        "completed": summary.completed(),
        "replicas": replicas,
        "provision_failures": provision_failures,
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Stop { json, .. } | Commands::Clean { json, .. } => {
            *json
        }
    }
}
