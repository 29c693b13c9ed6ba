//! On-disk layout of a batch:
//!
//! ```text
//! <results_dir>/<name>/
//!   run.log                       verdict audit log, shared by all batches
//!   runtime/operation.lock        held while a batch is running
//!   runs/run_<YYYYmmdd_HHMMSS>/
//!     resolved_experiment.json
//!     manifest.json
//!     run_control.json
//!     summary.json
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::{json, Value};

use crate::config::ExperimentConfig;
use crate::driver::ExperimentReport;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("failed to create {}", path.display()))
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Exclusive hold on an experiment directory. Released on drop.
#[derive(Debug)]
pub struct OperationLock {
    path: PathBuf,
}

impl OperationLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn acquire_operation_lock(experiment_dir: &Path) -> Result<OperationLock> {
    let lock_path = experiment_dir.join("runtime").join("operation.lock");
    if let Some(parent) = lock_path.parent() {
        ensure_dir(parent)?;
    }
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&lock_path)
    {
        Ok(mut file) => {
            let payload = format!(
                "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                std::process::id(),
                Utc::now().to_rfc3339()
            );
            let _ = file.write_all(payload.as_bytes());
            let _ = file.sync_all();
            Ok(OperationLock { path: lock_path })
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(anyhow!(
            "operation_in_progress: a batch is already running against {} (remove {} if it is stale)",
            experiment_dir.display(),
            lock_path.display()
        )),
        Err(e) => Err(e.into()),
    }
}

/// A freshly created `runs/run_<ts>` directory.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    pub run_id: String,
    pub path: PathBuf,
}

impl RunDirectory {
    pub fn create(experiment_dir: &Path) -> Result<Self> {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let runs = experiment_dir.join("runs");
        let mut run_id = format!("run_{}", stamp);
        let mut n = 1;
        while runs.join(&run_id).exists() {
            n += 1;
            run_id = format!("run_{}_{}", stamp, n);
        }
        let path = runs.join(&run_id);
        ensure_dir(&path)?;
        Ok(RunDirectory { run_id, path })
    }

    pub fn write_manifest(&self, config: &ExperimentConfig, trial_count: usize) -> Result<()> {
        let resolved = serde_json::to_value(config)?;
        atomic_write_json_pretty(&self.path.join("resolved_experiment.json"), &resolved)?;
        let manifest = json!({
            "schema_version": "manifest_v1",
            "run_id": self.run_id,
            "experiment": config.experiment.name,
            "config_digest": config.digest()?,
            "runner_version": concat!("wattlab-", env!("CARGO_PKG_VERSION")),
            "trials": trial_count,
            "created_at": Utc::now().to_rfc3339(),
        });
        atomic_write_json_pretty(&self.path.join("manifest.json"), &manifest)
    }

    pub fn write_summary(&self, report: &ExperimentReport) -> Result<()> {
        let mut summary = serde_json::to_value(report)?;
        if let Value::Object(map) = &mut summary {
            map.insert("schema_version".into(), json!("summary_v1"));
            map.insert("run_id".into(), json!(self.run_id));
        }
        atomic_write_json_pretty(&self.path.join("summary.json"), &summary)
    }

    pub fn write_control(&self, status: &str) -> Result<()> {
        let payload = json!({
            "schema_version": "run_control_v1",
            "run_id": self.run_id,
            "status": status,
            "updated_at": Utc::now().to_rfc3339(),
        });
        atomic_write_json_pretty(&self.path.join("run_control.json"), &payload)
    }
}

/// Marks the batch `failed` in `run_control.json` unless completed.
pub struct RunControlGuard<'a> {
    run: &'a RunDirectory,
    done: bool,
}

impl<'a> RunControlGuard<'a> {
    pub fn start(run: &'a RunDirectory) -> Result<Self> {
        run.write_control("running")?;
        Ok(RunControlGuard { run, done: false })
    }

    pub fn complete(&mut self, status: &str) -> Result<()> {
        self.run.write_control(status)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for RunControlGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.run.write_control("failed");
        }
    }
}
