//! Experiment description loaded from YAML.
//!
//! Credentials never live here; only logical host names do.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use wattlab_remote::SshOptions;

use crate::dispatcher::session_name;
use crate::trial::{numbered_run_ids, run_table, Trial, Workload};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    pub experiment: ExperimentSection,
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub collectors: Vec<CollectorConfig>,
    pub load: LoadConfig,
    #[serde(default)]
    pub teardown: TeardownConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentSection {
    pub name: String,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Explicit run ids. When absent, `run_count` ids are generated.
    #[serde(default)]
    pub run_ids: Option<Vec<String>>,
    #[serde(default = "default_run_count")]
    pub run_count: usize,
    #[serde(default = "default_run_prefix")]
    pub run_prefix: String,
    #[serde(default = "default_workloads")]
    pub workloads: Vec<String>,
    #[serde(default = "default_time_between_runs_ms")]
    pub time_between_runs_ms: u64,
    /// Relative paths resolve against `<results_dir>/<name>`.
    #[serde(default = "default_run_log")]
    pub run_log: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentConfig {
    pub host: String,
    /// Name of the detached tmux session the system runs in.
    #[serde(default = "default_session")]
    pub session: String,
    pub workdir: String,
    pub command: String,
    #[serde(default = "default_true")]
    pub privileged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Reboot the deployment host, wait the cooldown, abort the trial.
    Reboot,
    Abort,
    /// Log the shortfall and continue to measurement.
    Proceed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadinessConfig {
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    /// Waits before each sample, in seconds.
    #[serde(default = "default_schedule_secs")]
    pub schedule_secs: Vec<u64>,
    /// Command whose stdout is the liveness count.
    #[serde(default = "default_probe")]
    pub probe: String,
    #[serde(default = "default_true")]
    pub probe_privileged: bool,
    #[serde(default = "default_exhaustion")]
    pub on_exhaustion: ExhaustionPolicy,
    #[serde(default = "default_reboot_cooldown_secs")]
    pub reboot_cooldown_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        ReadinessConfig {
            threshold: default_threshold(),
            schedule_secs: default_schedule_secs(),
            probe: default_probe(),
            probe_privileged: true,
            on_exhaustion: default_exhaustion(),
            reboot_cooldown_secs: default_reboot_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    pub name: String,
    pub host: String,
    /// Invoked as `<start> <file_tag> <run_id>`.
    pub start: String,
    /// Invoked as `<stop> <file_tag> <run_id>`.
    pub stop: String,
    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadConfig {
    #[serde(default = "default_load_tool")]
    pub tool: String,
    /// Contains one directory per test, each holding a `script.js`.
    pub script_dir: PathBuf,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TeardownConfig {
    #[serde(default = "default_true")]
    pub prune_volumes: bool,
    #[serde(default = "default_true")]
    pub restart_engine: bool,
    /// Privileged commands run on the deployment host after the fixed steps.
    #[serde(default)]
    pub extra: Vec<String>,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        TeardownConfig {
            prune_volumes: true,
            restart_engine: true,
            extra: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
    #[serde(default = "default_sshpass_binary")]
    pub sshpass_binary: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            port: default_port(),
            connect_timeout_secs: default_connect_timeout_secs(),
            ssh_binary: default_ssh_binary(),
            sshpass_binary: default_sshpass_binary(),
        }
    }
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("experiments")
}
fn default_run_count() -> usize {
    100
}
fn default_run_prefix() -> String {
    "run_".to_string()
}
fn default_workloads() -> Vec<String> {
    vec!["HIGH".into(), "MEDIUM".into(), "LOW".into()]
}
fn default_time_between_runs_ms() -> u64 {
    1000
}
fn default_run_log() -> PathBuf {
    PathBuf::from("run.log")
}
fn default_session() -> String {
    "train".to_string()
}
fn default_true() -> bool {
    true
}
fn default_threshold() -> u32 {
    68
}
fn default_schedule_secs() -> Vec<u64> {
    vec![600, 180]
}
fn default_probe() -> String {
    "docker ps | wc -l".to_string()
}
fn default_exhaustion() -> ExhaustionPolicy {
    ExhaustionPolicy::Reboot
}
fn default_reboot_cooldown_secs() -> u64 {
    300
}
fn default_load_tool() -> String {
    "k6".to_string()
}
fn default_duration_secs() -> u64 {
    20
}
fn default_port() -> u16 {
    22
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_ssh_binary() -> String {
    "ssh".to_string()
}
fn default_sshpass_binary() -> String {
    "sshpass".to_string()
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read experiment file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid experiment file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: ExperimentConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every setting and report all problems at once.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.experiment.name.trim().is_empty() {
            problems.push("experiment.name must not be empty".to_string());
        }
        let run_ids = self.run_ids();
        if run_ids.is_empty() {
            problems.push("experiment has no run ids".to_string());
        }
        let mut seen = BTreeSet::new();
        for id in &run_ids {
            if !is_safe_token(id) {
                problems.push(format!(
                    "run id '{}' must be non-empty and use only [A-Za-z0-9_.-]",
                    id
                ));
            }
            if !seen.insert(id.as_str()) {
                problems.push(format!("duplicate run id '{}'", id));
            }
        }
        problems.extend(session_collisions("run id", &run_ids));
        if self.experiment.workloads.is_empty() {
            problems.push("experiment.workloads must not be empty".to_string());
        }
        for label in &self.experiment.workloads {
            if let Err(err) = label.parse::<Workload>() {
                problems.push(err.to_string());
            }
        }

        if self.deployment.host.trim().is_empty() {
            problems.push("deployment.host must not be empty".to_string());
        }
        if !is_safe_token(&self.deployment.session) {
            problems.push("deployment.session must use only [A-Za-z0-9_.-]".to_string());
        }
        if self.deployment.command.trim().is_empty() {
            problems.push("deployment.command must not be empty".to_string());
        }

        if self.readiness.schedule_secs.is_empty() {
            problems.push("readiness.schedule_secs needs at least one wait".to_string());
        }
        if self.readiness.threshold == 0 {
            problems.push("readiness.threshold must be positive".to_string());
        }

        let mut names = BTreeSet::new();
        for c in &self.collectors {
            if !is_safe_token(&c.name) {
                problems.push(format!(
                    "collector name '{}' must use only [A-Za-z0-9_.-]",
                    c.name
                ));
            }
            if !names.insert(c.name.as_str()) {
                problems.push(format!("duplicate collector name '{}'", c.name));
            }
            if c.host.trim().is_empty() {
                problems.push(format!("collector '{}' has no host", c.name));
            }
        }

        let collector_names: Vec<String> = self.collectors.iter().map(|c| c.name.clone()).collect();
        problems.extend(session_collisions("collector name", &collector_names));

        if self.load.duration_secs == 0 {
            problems.push("load.duration_secs must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("invalid experiment: {}", problems.join("; ")))
        }
    }

    pub fn run_ids(&self) -> Vec<String> {
        match &self.experiment.run_ids {
            Some(ids) => ids.clone(),
            None => numbered_run_ids(&self.experiment.run_prefix, self.experiment.run_count),
        }
    }

    pub fn workloads(&self) -> Result<Vec<Workload>> {
        self.experiment
            .workloads
            .iter()
            .map(|l| l.parse::<Workload>().map_err(anyhow::Error::from))
            .collect()
    }

    /// All trials in execution order.
    pub fn trials(&self) -> Result<Vec<Trial>> {
        Ok(run_table(&self.run_ids(), &self.workloads()?))
    }

    pub fn readiness_schedule(&self) -> Vec<Duration> {
        self.readiness
            .schedule_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }

    /// Every logical host the experiment touches, sorted and deduplicated.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts = BTreeSet::new();
        hosts.insert(self.deployment.host.clone());
        for c in &self.collectors {
            hosts.insert(c.host.clone());
        }
        hosts.into_iter().collect()
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            port: self.transport.port,
            connect_timeout: Duration::from_secs(self.transport.connect_timeout_secs),
            ssh_binary: self.transport.ssh_binary.clone(),
            sshpass_binary: self.transport.sshpass_binary.clone(),
        }
    }

    /// `<results_dir>/<name>`
    pub fn experiment_dir(&self) -> PathBuf {
        self.experiment.results_dir.join(&self.experiment.name)
    }

    pub fn run_log_path(&self) -> PathBuf {
        if self.experiment.run_log.is_absolute() {
            self.experiment.run_log.clone()
        } else {
            self.experiment_dir().join(&self.experiment.run_log)
        }
    }

    /// sha256 over the JSON form of the resolved configuration.
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        Ok(format!("sha256:{}", hex::encode(Sha256::digest(&bytes))))
    }

    /// Upper bound on readiness wall time per trial, reboot included.
    pub fn worst_case_readiness(&self) -> Duration {
        let waits: u64 = self.readiness.schedule_secs.iter().sum();
        let reboot = match self.readiness.on_exhaustion {
            ExhaustionPolicy::Reboot => self.readiness.reboot_cooldown_secs,
            _ => 0,
        };
        Duration::from_secs(waits + reboot)
    }
}

fn is_safe_token(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c))
}

/// Distinct values that map to the same tmux session name.
fn session_collisions(what: &str, values: &[String]) -> Vec<String> {
    let mut by_session: BTreeMap<String, &str> = BTreeMap::new();
    let mut problems = Vec::new();
    for value in values {
        match by_session.entry(session_name(value)) {
            Entry::Occupied(first) if *first.get() != value.as_str() => problems.push(format!(
                "{} '{}' and '{}' share tmux session name '{}'",
                what,
                first.get(),
                value,
                first.key()
            )),
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(value.as_str());
            }
        }
    }
    problems
}
