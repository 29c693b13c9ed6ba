mod logging;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::debug;
use wattlab_remote::{EnvCredentials, HostRegistry, RemoteSession, SshTransport};
use wattlab_runner::{
    ExperimentConfig, ExperimentReport, ExperimentSummary, LifecycleController, RunOptions,
    RunResult, ThreadSleeper, Trial, Workload, K6,
};

use crate::logging::LogFormat;

#[derive(Parser)]
#[command(name = "wattlab", version, about = "Remote power-measurement experiment controller")]
struct Cli {
    /// Default filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
    /// Read host credentials from this file instead of ./.env
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every trial of an experiment against the remote hosts.
    Run {
        experiment: PathBuf,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Print the trial plan without touching any host.
    Describe {
        experiment: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Resolve credentials and run `uptime` on every host.
    CheckHosts {
        experiment: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Write a starter experiment file.
    Init {
        #[arg(long, default_value = "experiment.yaml")]
        path: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Print the file tag collectors use for a trial.
    Tag {
        run_id: String,
        workload: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_format);
    load_env(cli.env_file.as_deref())?;

    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            if reports_failure(&payload) {
                std::process::exit(1);
            }
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn load_env(path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => {
            dotenvy::from_path(path)
                .map_err(|e| anyhow!("failed to load env file {}: {}", path.display(), e))?;
        }
        None => {
            if let Ok(path) = dotenvy::dotenv() {
                debug!(path = %path.display(), "loaded environment file");
            }
        }
    }
    Ok(())
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            experiment,
            limit,
            json,
        } => {
            let config = ExperimentConfig::load(&experiment)?;
            let summary = wattlab_runner::describe_experiment(&config)?;
            let mut controller = LifecycleController::new(
                config.clone(),
                HostRegistry::new(EnvCredentials),
                RemoteSession::new(SshTransport::new(config.ssh_options())),
                K6::new(config.load.tool.clone()),
                ThreadSleeper,
            );
            let result = wattlab_runner::run_experiment(
                &config,
                &mut controller,
                &ThreadSleeper,
                &RunOptions { limit },
            )?;
            let stopped = result.report.stopped_early.clone();
            if json {
                return Ok(Some(json!({
                    "ok": stopped.is_none(),
                    "command": "run",
                    "summary": summary,
                    "run": run_result_to_json(&result),
                })));
            }
            print_summary(&summary);
            print_report(&result.report);
            println!("run_id: {}", result.run_id);
            println!("run_dir: {}", result.run_dir.display());
            if let Some(reason) = stopped {
                return Err(anyhow!("batch stopped early: {}", reason));
            }
        }
        Commands::Describe { experiment, json } => {
            let config = ExperimentConfig::load(&experiment)?;
            let summary = wattlab_runner::describe_experiment(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary,
                })));
            }
            print_summary(&summary);
        }
        Commands::CheckHosts { experiment, json } => {
            let config = ExperimentConfig::load(&experiment)?;
            let registry = HostRegistry::new(EnvCredentials);
            let session = RemoteSession::new(SshTransport::new(config.ssh_options()));
            let checks = wattlab_runner::check_hosts(&config, &registry, &session);
            let all_ok = checks.iter().all(|c| c.reachable);
            if json {
                return Ok(Some(json!({
                    "ok": all_ok,
                    "command": "check-hosts",
                    "hosts": checks,
                })));
            }
            for check in &checks {
                let status = if check.reachable { "ok" } else { "FAIL" };
                println!(
                    "{:<4} {} ({}): {}",
                    status,
                    check.host,
                    check.address.as_deref().unwrap_or("-"),
                    check.detail
                );
            }
            if !all_ok {
                return Err(anyhow!("one or more hosts are not usable"));
            }
        }
        Commands::Init { path, force } => {
            if !force && path.exists() {
                return Err(anyhow!(
                    "init file already exists (use --force): {}",
                    path.display()
                ));
            }
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(&path, wattlab_runner::CONFIG_TEMPLATE)?;
            println!("wrote: {}", path.display());
            println!("next: wattlab describe {}", path.display());
        }
        Commands::Tag {
            run_id,
            workload,
            json,
        } => {
            let workload: Workload = workload.parse()?;
            let trial = Trial::new(run_id, workload);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "tag",
                    "run_id": trial.run_id(),
                    "workload": workload,
                    "intensity": workload.intensity(),
                    "file_tag": trial.file_tag(),
                })));
            }
            println!("{}", trial.file_tag());
        }
    }
    Ok(None)
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

/// JSON payloads carry the same verdict the plain output turns into an error.
fn reports_failure(payload: &Value) -> bool {
    payload.get("ok") == Some(&Value::Bool(false))
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::CheckHosts { json, .. }
        | Commands::Tag { json, .. } => *json,
        Commands::Init { .. } => false,
    }
}

fn run_result_to_json(result: &RunResult) -> Value {
    json!({
        "run_id": result.run_id,
        "run_dir": result.run_dir.display().to_string(),
        "report": result.report,
    })
}

fn print_summary(summary: &ExperimentSummary) {
    println!("experiment: {}", summary.name);
    println!("experiment_dir: {}", summary.experiment_dir.display());
    println!("run_log: {}", summary.run_log.display());
    println!("deploy_host: {}", summary.deploy_host);
    println!("hosts: {}", summary.hosts.join(", "));
    println!("collectors: {}", summary.collectors.join(", "));
    println!("run_ids: {}", summary.run_ids);
    let workloads: Vec<&str> = summary.workloads.iter().map(|w| w.label()).collect();
    println!("workloads: {}", workloads.join(", "));
    println!("total_trials: {}", summary.total_trials);
    println!(
        "readiness: >= {} after {:?}s (on exhaustion: {:?})",
        summary.readiness_threshold, summary.readiness_schedule_secs, summary.on_exhaustion
    );
    println!(
        "worst_case_readiness: {}s per trial",
        summary.worst_case_readiness_secs
    );
    println!("script_dir: {}", summary.script_dir.display());
    println!("config_digest: {}", summary.config_digest);
}

fn print_report(report: &ExperimentReport) {
    println!(
        "trials: {} planned, {} attempted, {} completed, {} aborted",
        report.planned,
        report.attempted,
        report.completed,
        report.failures.len()
    );
    for failure in &report.failures {
        println!(
            "  aborted [{}] [{}] during {}: {}",
            failure.run_id, failure.workload, failure.phase, failure.reason
        );
    }
    if let Some(reason) = &report.stopped_early {
        println!("stopped_early: {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn json_flag_is_detected_per_command() {
        let cli = Cli::parse_from(["wattlab", "run", "exp.yaml", "--limit", "3", "--json"]);
        assert!(command_json_mode(&cli.command));
        match cli.command {
            Commands::Run { limit, .. } => assert_eq!(limit, Some(3)),
            _ => panic!("expected run"),
        }
        let cli = Cli::parse_from(["wattlab", "init", "--force"]);
        assert!(!command_json_mode(&cli.command));
    }

    #[test]
    fn global_logging_flags_parse_after_subcommand() {
        let cli = Cli::parse_from([
            "wattlab",
            "describe",
            "exp.yaml",
            "--log-format",
            "json",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn tag_command_prints_file_tag() {
        let payload = run_command(Commands::Tag {
            run_id: "run_7".into(),
            workload: "HIGH".into(),
            json: true,
        })
        .expect("tag")
        .expect("payload");
        assert_eq!(payload["file_tag"], "run_7-HIGH");
        assert_eq!(payload["intensity"], 100);

        let err = run_command(Commands::Tag {
            run_id: "run_7".into(),
            workload: "high".into(),
            json: true,
        })
        .expect_err("lowercase is rejected");
        assert!(err.to_string().contains("unknown workload level"));
    }

    #[test]
    fn failed_json_payloads_exit_non_zero() {
        let stopped = json!({
            "ok": false,
            "command": "run",
            "run": {"report": {"stopped_early": "missing GL6_PASSWORD"}},
        });
        assert!(reports_failure(&stopped));
        assert!(reports_failure(&json_error("command_failed", "boom".into(), json!({}))));
        assert!(!reports_failure(&json!({"ok": true, "command": "run"})));
        assert!(!reports_failure(&json!({"command": "tag"})));
    }

    #[test]
    fn json_error_envelope_shape() {
        let v = json_error("command_failed", "boom".into(), json!({}));
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"]["code"], "command_failed");
        assert_eq!(v["error"]["message"], "boom");
    }
}
