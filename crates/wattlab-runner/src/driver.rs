//! Batch driver: walks the run table and invokes the lifecycle callbacks in
//! order for every trial.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::clock::Sleeper;
use crate::error::{Aborted, Phase};
use crate::runlog::Verdict;
use crate::trial::{Trial, Workload};

/// Per-trial row for downstream analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub workload: Workload,
    pub intensity: u32,
    pub file_tag: String,
    pub verdict: Verdict,
    pub readiness_samples: Vec<Option<u32>>,
    pub teardown_failures: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
}

/// Callbacks invoked by [`ExperimentDriver`]. The lifecycle callbacks return
/// `Err` when the trial was abandoned; the driver skips to the next trial.
pub trait ExperimentHooks {
    fn before_experiment(&mut self) {}
    fn before_run(&mut self, _trial: &Trial) {}
    fn start_run(&mut self, trial: &Trial) -> Result<(), Aborted>;
    fn start_measurement(&mut self, trial: &Trial) -> Result<(), Aborted>;
    fn interact(&mut self, trial: &Trial) -> Result<(), Aborted>;
    fn stop_measurement(&mut self, trial: &Trial) -> Result<(), Aborted>;
    fn stop_run(&mut self, trial: &Trial) -> Result<(), Aborted>;
    fn populate_run_data(&mut self, trial: &Trial) -> Option<RunRecord>;
    fn after_experiment(&mut self) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrialFailure {
    pub run_id: String,
    pub workload: Workload,
    pub phase: Phase,
    pub reason: String,
    pub fatal: bool,
}

impl From<&Aborted> for TrialFailure {
    fn from(err: &Aborted) -> Self {
        TrialFailure {
            run_id: err.run_id.clone(),
            workload: err.workload,
            phase: err.phase,
            reason: err.fault.to_string(),
            fatal: err.is_fatal(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub planned: usize,
    pub attempted: usize,
    pub completed: usize,
    pub records: Vec<RunRecord>,
    pub failures: Vec<TrialFailure>,
    /// Set when a fatal abort ended the batch early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_early: Option<String>,
}

pub struct ExperimentDriver<'a> {
    sleeper: &'a dyn Sleeper,
    time_between_runs: Duration,
    limit: Option<usize>,
}

impl<'a> ExperimentDriver<'a> {
    pub fn new(sleeper: &'a dyn Sleeper, time_between_runs: Duration) -> Self {
        ExperimentDriver {
            sleeper,
            time_between_runs,
            limit: None,
        }
    }

    /// Run at most `limit` trials from the front of the table.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn run<H: ExperimentHooks>(&self, hooks: &mut H, trials: &[Trial]) -> ExperimentReport {
        let started_at = Utc::now();
        let selected = match self.limit {
            Some(limit) => &trials[..limit.min(trials.len())],
            None => trials,
        };
        let mut records = Vec::new();
        let mut failures = Vec::new();
        let mut stopped_early = None;
        let mut attempted = 0;

        hooks.before_experiment();
        for (idx, trial) in selected.iter().enumerate() {
            if idx > 0 && !self.time_between_runs.is_zero() {
                self.sleeper.sleep(self.time_between_runs);
            }
            attempted += 1;
            info!(
                run_id = trial.run_id(),
                workload = %trial.workload(),
                trial = idx + 1,
                of = selected.len(),
                "trial starting"
            );
            hooks.before_run(trial);
            let outcome = run_trial(hooks, trial);
            if let Some(record) = hooks.populate_run_data(trial) {
                records.push(record);
            }
            if let Err(err) = outcome {
                error!(run_id = trial.run_id(), error = %err, "trial aborted");
                failures.push(TrialFailure::from(&err));
                if err.is_fatal() {
                    stopped_early = Some(err.to_string());
                    break;
                }
            }
        }
        hooks.after_experiment();

        let completed = records
            .iter()
            .filter(|r| r.verdict == Verdict::Completed)
            .count();
        info!(
            planned = selected.len(),
            attempted,
            completed,
            failed = failures.len(),
            "experiment batch finished"
        );
        ExperimentReport {
            started_at,
            finished_at: Utc::now(),
            planned: selected.len(),
            attempted,
            completed,
            records,
            failures,
            stopped_early,
        }
    }
}

fn run_trial<H: ExperimentHooks>(hooks: &mut H, trial: &Trial) -> Result<(), Aborted> {
    hooks.start_run(trial)?;
    hooks.start_measurement(trial)?;
    hooks.interact(trial)?;
    hooks.stop_measurement(trial)?;
    hooks.stop_run(trial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RecordingSleeper;
    use crate::error::Fault;
    use crate::trial::run_table;

    /// Scripted hooks: fails `start_run` for the listed run ids.
    #[derive(Default)]
    struct Script {
        calls: Vec<String>,
        fail_start: Vec<(String, Fault)>,
    }

    impl Script {
        fn log(&mut self, what: &str, trial: &Trial) {
            self.calls.push(format!("{} {}", what, trial.file_tag()));
        }
    }

    impl ExperimentHooks for Script {
        fn before_experiment(&mut self) {
            self.calls.push("before_experiment".into());
        }

        fn start_run(&mut self, trial: &Trial) -> Result<(), Aborted> {
            self.log("start_run", trial);
            if let Some((_, fault)) = self.fail_start.iter().find(|(id, _)| id == trial.run_id()) {
                return Err(Aborted::new(trial, Phase::Readiness, fault.clone()));
            }
            Ok(())
        }

        fn start_measurement(&mut self, trial: &Trial) -> Result<(), Aborted> {
            self.log("start_measurement", trial);
            Ok(())
        }

        fn interact(&mut self, trial: &Trial) -> Result<(), Aborted> {
            self.log("interact", trial);
            Ok(())
        }

        fn stop_measurement(&mut self, trial: &Trial) -> Result<(), Aborted> {
            self.log("stop_measurement", trial);
            Ok(())
        }

        fn stop_run(&mut self, trial: &Trial) -> Result<(), Aborted> {
            self.log("stop_run", trial);
            Ok(())
        }

        fn populate_run_data(&mut self, trial: &Trial) -> Option<RunRecord> {
            let failed = self.fail_start.iter().any(|(id, _)| id == trial.run_id());
            Some(RunRecord {
                run_id: trial.run_id().to_string(),
                workload: trial.workload(),
                intensity: trial.workload().intensity(),
                file_tag: trial.file_tag(),
                verdict: if failed {
                    Verdict::Aborted
                } else {
                    Verdict::Completed
                },
                readiness_samples: vec![],
                teardown_failures: vec![],
                abort_reason: None,
            })
        }

        fn after_experiment(&mut self) {
            self.calls.push("after_experiment".into());
        }
    }

    fn timeout() -> Fault {
        Fault::ReadinessTimeout {
            host: "GL6".into(),
            threshold: 68,
            samples: 2,
        }
    }

    #[test]
    fn callbacks_run_in_lifecycle_order() {
        let trials = run_table(&["run_0".to_string()], &[Workload::High]);
        let sleeper = RecordingSleeper::new();
        let mut hooks = Script::default();
        let report =
            ExperimentDriver::new(&sleeper, Duration::from_millis(1000)).run(&mut hooks, &trials);
        assert_eq!(
            hooks.calls,
            vec![
                "before_experiment",
                "start_run run_0-HIGH",
                "start_measurement run_0-HIGH",
                "interact run_0-HIGH",
                "stop_measurement run_0-HIGH",
                "stop_run run_0-HIGH",
                "after_experiment",
            ]
        );
        assert_eq!(report.completed, 1);
        assert!(sleeper.waits().is_empty(), "no cooldown before the first trial");
    }

    #[test]
    fn aborted_trial_is_skipped_and_batch_continues() {
        let ids: Vec<String> = vec!["run_7".into(), "run_8".into(), "run_9".into()];
        let trials = run_table(&ids, &[Workload::Low]);
        let sleeper = RecordingSleeper::new();
        let mut hooks = Script {
            fail_start: vec![("run_8".into(), timeout())],
            ..Script::default()
        };
        let report =
            ExperimentDriver::new(&sleeper, Duration::from_millis(1000)).run(&mut hooks, &trials);

        assert!(!hooks.calls.contains(&"start_measurement run_8-LOW".to_string()));
        assert!(hooks.calls.contains(&"stop_run run_9-LOW".to_string()));
        assert_eq!(report.attempted, 3);
        assert_eq!(report.completed, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].phase, Phase::Readiness);
        assert!(!report.failures[0].fatal);
        assert!(report.stopped_early.is_none());
        assert_eq!(sleeper.waits(), vec![Duration::from_millis(1000); 2]);
    }

    #[test]
    fn fatal_abort_stops_the_batch() {
        let ids: Vec<String> = vec!["run_0".into(), "run_1".into()];
        let trials = run_table(&ids, &[Workload::High, Workload::Low]);
        let sleeper = RecordingSleeper::new();
        let mut hooks = Script {
            fail_start: vec![(
                "run_0".into(),
                Fault::Configuration("missing GL6_PASSWORD".into()),
            )],
            ..Script::default()
        };
        let report = ExperimentDriver::new(&sleeper, Duration::ZERO).run(&mut hooks, &trials);
        assert_eq!(report.attempted, 1);
        assert_eq!(report.planned, 4);
        assert!(report
            .stopped_early
            .as_deref()
            .unwrap_or_default()
            .contains("GL6_PASSWORD"));
        assert_eq!(hooks.calls.last().map(String::as_str), Some("after_experiment"));
    }

    #[test]
    fn limit_truncates_the_table() {
        let trials = run_table(&["run_0".to_string(), "run_1".to_string()], &Workload::ALL);
        let sleeper = RecordingSleeper::new();
        let mut hooks = Script::default();
        let report = ExperimentDriver::new(&sleeper, Duration::ZERO)
            .with_limit(Some(2))
            .run(&mut hooks, &trials);
        assert_eq!(report.planned, 2);
        assert_eq!(report.records.len(), 2);
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["records"][0]["verdict"], "COMPLETED");
        assert!(json.get("stopped_early").is_none());
    }
}
