//! Remote experiment lifecycle control.
//!
//! An experiment is a table of trials (run id x workload level). For each
//! trial the [`LifecycleController`] deploys the system under test on a
//! remote host, waits for it to come up, starts the power collectors, drives
//! load from this machine, stops the collectors and tears everything down.
//! [`run_experiment`] wraps a batch with an operation lock and writes the
//! batch artifacts.

pub mod artifacts;
pub mod clock;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod load;
pub mod poller;
pub mod runlog;
pub mod trial;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::info;
use wattlab_remote::{HostRegistry, RemoteSession};

pub use artifacts::{acquire_operation_lock, RunDirectory};
pub use clock::{RecordingSleeper, Sleeper, ThreadSleeper};
pub use config::{ExhaustionPolicy, ExperimentConfig};
pub use controller::{LifecycleController, LifecycleState};
pub use driver::{ExperimentDriver, ExperimentHooks, ExperimentReport, RunRecord};
pub use error::{Aborted, Fault, Phase};
pub use load::{LoadGenerator, K6};
pub use runlog::{RunLog, Verdict};
pub use trial::{Trial, Workload};

use artifacts::RunControlGuard;

/// Starting point written by `wattlab init`.
pub const CONFIG_TEMPLATE: &str = r#"# Credentials are read from the environment (or a .env file):
#   <HOST>_HOST, <HOST>_USER, <HOST>_PASSWORD  for every host named below.
experiment:
  name: smartwatts-eval
  results_dir: experiments
  run_count: 100
  workloads: [HIGH, MEDIUM, LOW]
  time_between_runs_ms: 1000
deployment:
  host: GL6
  session: train
  workdir: ~/smartwatts-evaluation/train-ticketing-system
  command: docker-compose up
readiness:
  threshold: 68
  schedule_secs: [600, 180]
  probe: docker ps | wc -l
  on_exhaustion: reboot
  reboot_cooldown_secs: 300
collectors:
  - name: smartwatts
    host: GL6
    start: ~/smartwatts-evaluation/smartwatts/start_smartwatts.sh
    stop: ~/smartwatts-evaluation/smartwatts/stop_smartwatts.sh
  - name: wattsup
    host: GL3
    start: ~/wattsup/start_wattsup.sh
    stop: ~/wattsup/stop_wattsup.sh
    privileged: true
load:
  tool: k6
  script_dir: ~/k6-test
  duration_secs: 20
teardown:
  prune_volumes: true
  restart_engine: true
  extra: []
"#;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run only the first `limit` trials of the table.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_dir: PathBuf,
    pub run_id: String,
    pub report: ExperimentReport,
}

/// Run the whole trial table through `controller`.
///
/// Fails up front when another batch holds the experiment directory. Trial
/// aborts are reported in the result, not as an error.
pub fn run_experiment(
    config: &ExperimentConfig,
    controller: &mut LifecycleController,
    pacing: &dyn Sleeper,
    options: &RunOptions,
) -> Result<RunResult> {
    let trials = config.trials()?;
    let planned = options
        .limit
        .map_or(trials.len(), |limit| limit.min(trials.len()));
    let experiment_dir = config.experiment_dir();
    let _lock = acquire_operation_lock(&experiment_dir)?;

    let run = RunDirectory::create(&experiment_dir)?;
    let mut guard = RunControlGuard::start(&run)?;
    run.write_manifest(config, planned)?;
    info!(
        experiment = %config.experiment.name,
        run_id = %run.run_id,
        trials = planned,
        run_dir = %run.path.display(),
        "batch starting"
    );

    let report = ExperimentDriver::new(
        pacing,
        Duration::from_millis(config.experiment.time_between_runs_ms),
    )
    .with_limit(options.limit)
    .run(controller, &trials);

    run.write_summary(&report)?;
    let status = if report.stopped_early.is_some() {
        "stopped"
    } else {
        "completed"
    };
    guard.complete(status)?;
    drop(guard);

    Ok(RunResult {
        run_dir: run.path.clone(),
        run_id: run.run_id.clone(),
        report,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSummary {
    pub name: String,
    pub experiment_dir: PathBuf,
    pub run_log: PathBuf,
    pub deploy_host: String,
    pub hosts: Vec<String>,
    pub collectors: Vec<String>,
    pub run_ids: usize,
    pub workloads: Vec<Workload>,
    pub total_trials: usize,
    pub readiness_threshold: u32,
    pub readiness_schedule_secs: Vec<u64>,
    pub on_exhaustion: ExhaustionPolicy,
    pub worst_case_readiness_secs: u64,
    pub script_dir: PathBuf,
    pub config_digest: String,
}

pub fn describe_experiment(config: &ExperimentConfig) -> Result<ExperimentSummary> {
    let workloads = config.workloads()?;
    let run_ids = config.run_ids().len();
    Ok(ExperimentSummary {
        name: config.experiment.name.clone(),
        experiment_dir: config.experiment_dir(),
        run_log: config.run_log_path(),
        deploy_host: config.deployment.host.clone(),
        hosts: config.hosts(),
        collectors: config.collectors.iter().map(|c| c.name.clone()).collect(),
        run_ids,
        total_trials: run_ids * workloads.len(),
        workloads,
        readiness_threshold: config.readiness.threshold,
        readiness_schedule_secs: config.readiness.schedule_secs.clone(),
        on_exhaustion: config.readiness.on_exhaustion,
        worst_case_readiness_secs: config.worst_case_readiness().as_secs(),
        script_dir: config.load.script_dir.clone(),
        config_digest: config.digest()?,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct HostCheck {
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub reachable: bool,
    pub detail: String,
}

/// Resolve every host and run `uptime` on it.
pub fn check_hosts(
    config: &ExperimentConfig,
    registry: &HostRegistry,
    session: &RemoteSession,
) -> Vec<HostCheck> {
    config
        .hosts()
        .into_iter()
        .map(|host| match registry.resolve(&host) {
            Err(err) => HostCheck {
                host,
                address: None,
                reachable: false,
                detail: err.to_string(),
            },
            Ok(creds) => {
                let address = Some(creds.address.clone());
                match session.execute(&creds, "uptime", "host check") {
                    Ok(outcome) => HostCheck {
                        host,
                        address,
                        reachable: true,
                        detail: if outcome.succeeded {
                            outcome.stdout.trim().to_string()
                        } else {
                            outcome.diagnostic
                        },
                    },
                    Err(err) => HostCheck {
                        host,
                        address,
                        reachable: false,
                        detail: err.to_string(),
                    },
                }
            }
        })
        .collect()
}
