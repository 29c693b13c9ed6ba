use std::fmt;

use serde::Serialize;
use thiserror::Error;
use wattlab_remote::RemoteError;

use crate::trial::{Trial, Workload};

/// Lifecycle phase a failure was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Deploy,
    Readiness,
    StartMeasurement,
    Interact,
    StopMeasurement,
    Teardown,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Deploy => "deploy",
            Phase::Readiness => "readiness",
            Phase::StartMeasurement => "start_measurement",
            Phase::Interact => "interact",
            Phase::StopMeasurement => "stop_measurement",
            Phase::Teardown => "teardown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Missing credential material or an invalid experiment setting.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    /// The command ran but wrote diagnostics to stderr.
    #[error("command '{command}' failed on {host}: {diagnostic}")]
    CommandFailure {
        host: String,
        command: String,
        diagnostic: String,
    },

    #[error("readiness threshold {threshold} not reached on {host} after {samples} samples")]
    ReadinessTimeout {
        host: String,
        threshold: u32,
        samples: usize,
    },

    #[error("load generator failed: {0}")]
    LoadGeneration(String),

    #[error("{operation} called while the controller is {state}")]
    Sequence {
        operation: &'static str,
        state: String,
    },
}

impl From<RemoteError> for Fault {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Configuration { .. } => Fault::Configuration(err.to_string()),
            RemoteError::Connection { host, reason } => Fault::Connection { host, reason },
        }
    }
}

/// Raised by a lifecycle operation when the trial had to be abandoned.
///
/// Cleanup has already been attempted by the time this is returned; data
/// collected for the trial must be discarded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("trial [{run_id}] [{workload}] aborted during {phase}: {fault}")]
pub struct Aborted {
    pub run_id: String,
    pub workload: Workload,
    pub phase: Phase,
    #[source]
    pub fault: Fault,
}

impl Aborted {
    pub fn new(trial: &Trial, phase: Phase, fault: Fault) -> Self {
        Aborted {
            run_id: trial.run_id().to_string(),
            workload: trial.workload(),
            phase,
            fault,
        }
    }

    /// Configuration and sequencing faults will recur on every later trial.
    pub fn is_fatal(&self) -> bool {
        matches!(self.fault, Fault::Configuration(_) | Fault::Sequence { .. })
    }
}
