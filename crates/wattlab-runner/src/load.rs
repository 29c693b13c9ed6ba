//! Local load generation against the deployed system.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Runs one load script to completion.
pub trait LoadGenerator {
    /// `Err` only when the tool could not be launched. A non-zero exit is
    /// reported through `Ok(false)`.
    fn run(&self, script: &Path, concurrency: u32, duration: Duration) -> Result<bool>;
}

/// Drives `k6 run --vus <n> --duration <s>s <script>`.
#[derive(Debug, Clone)]
pub struct K6 {
    binary: String,
}

impl K6 {
    pub fn new(binary: impl Into<String>) -> Self {
        K6 {
            binary: binary.into(),
        }
    }

    pub fn args(script: &Path, concurrency: u32, duration: Duration) -> Vec<String> {
        vec![
            "run".to_string(),
            "--vus".to_string(),
            concurrency.to_string(),
            "--duration".to_string(),
            format!("{}s", duration.as_secs()),
            script.to_string_lossy().to_string(),
        ]
    }
}

impl LoadGenerator for K6 {
    fn run(&self, script: &Path, concurrency: u32, duration: Duration) -> Result<bool> {
        let status = Command::new(&self.binary)
            .args(K6::args(script, concurrency, duration))
            .stdin(Stdio::null())
            .status()
            .map_err(|e| anyhow!("failed to launch {}: {}", self.binary, e))?;
        if !status.success() {
            warn!(
                script = %script.display(),
                status = ?status.code(),
                "load script exited non-zero"
            );
        }
        Ok(status.success())
    }
}

/// `<dir>/*/script.js`, sorted by path. A leading `~/` expands to the home
/// directory.
pub fn discover_scripts(dir: &Path) -> Result<Vec<PathBuf>> {
    let dir = expand_home(dir);
    if !dir.is_dir() {
        return Err(anyhow!("load script directory {} does not exist", dir.display()));
    }
    let mut scripts: Vec<PathBuf> = WalkDir::new(&dir)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == "script.js")
        .map(|e| e.into_path())
        .collect();
    scripts.sort();
    info!(dir = %dir.display(), count = scripts.len(), "discovered load scripts");
    Ok(scripts)
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}
