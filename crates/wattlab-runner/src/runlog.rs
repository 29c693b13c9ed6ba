//! Append-only audit log of trial verdicts.
//!
//! One line per verdict: `<rfc3339> [<run_id>] [<WORKLOAD>] <VERDICT>`,
//! optionally followed by ` - <detail>`. Lines are only ever appended.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use crate::trial::Trial;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    /// Readiness threshold met.
    Ready,
    /// Readiness schedule exhausted.
    Failed,
    Completed,
    Aborted,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Ready => "READY",
            Verdict::Failed => "FAILED",
            Verdict::Completed => "COMPLETED",
            Verdict::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        RunLog { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, trial: &Trial, verdict: Verdict, detail: Option<&str>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut line = format!("{} {} {}", Utc::now().to_rfc3339(), trial, verdict);
        if let Some(detail) = detail {
            line.push_str(" - ");
            line.push_str(&detail.replace('\n', " "));
        }
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open run log {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::Workload;

    #[test]
    fn appends_one_line_per_verdict() {
        let root = std::env::temp_dir().join(format!(
            "wattlab_runlog_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let log = RunLog::new(root.join("nested").join("run.log"));
        let ok = Trial::new("run_7", Workload::High);
        let bad = Trial::new("run_8", Workload::Low);
        log.append(&ok, Verdict::Ready, None).expect("append");
        log.append(&bad, Verdict::Failed, Some("40/68\ncontainers"))
            .expect("append");

        let text = fs::read_to_string(log.path()).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[run_7] [HIGH] READY"), "{}", lines[0]);
        assert!(
            lines[1].ends_with("[run_8] [LOW] FAILED - 40/68 containers"),
            "{}",
            lines[1]
        );
        let stamp = lines[0].split(' ').next().expect("timestamp");
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());

        // A second handle keeps appending.
        RunLog::new(log.path())
            .append(&ok, Verdict::Completed, None)
            .expect("append");
        assert_eq!(fs::read_to_string(log.path()).unwrap().lines().count(), 3);
        let _ = fs::remove_dir_all(root);
    }
}
