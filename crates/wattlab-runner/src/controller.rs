//! Per-trial lifecycle state machine.
//!
//! `Idle -> Deploying -> AwaitingReadiness -> Measuring -> Interacting ->
//! StoppingMeasurement -> TearingDown -> Completed`, with `Aborted` reachable
//! from every non-terminal state through [`LifecycleController::abort`].
//!
//! Teardown runs exactly once per trial on every exit path. Abort stops the
//! collectors, tears down, and records the verdict; calling it again for the
//! same trial returns the first result without touching any host.

use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};
use wattlab_remote::{HostCredentials, HostRegistry, RemoteSession};

use crate::clock::Sleeper;
use crate::config::{ExhaustionPolicy, ExperimentConfig};
use crate::dispatcher::{CommandDispatcher, RemoteCommand};
use crate::driver::{ExperimentHooks, RunRecord};
use crate::error::{Aborted, Fault, Phase};
use crate::load::{discover_scripts, LoadGenerator};
use crate::poller::ReadinessPoller;
use crate::runlog::{RunLog, Verdict};
use crate::trial::Trial;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Deploying,
    AwaitingReadiness,
    Measuring,
    Interacting,
    StoppingMeasurement,
    TearingDown,
    Completed,
    Aborted,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Completed | LifecycleState::Aborted)
    }

    fn phase(self) -> Phase {
        match self {
            LifecycleState::Idle | LifecycleState::Deploying => Phase::Deploy,
            LifecycleState::AwaitingReadiness => Phase::Readiness,
            LifecycleState::Measuring => Phase::StartMeasurement,
            LifecycleState::Interacting => Phase::Interact,
            LifecycleState::StoppingMeasurement => Phase::StopMeasurement,
            LifecycleState::TearingDown
            | LifecycleState::Completed
            | LifecycleState::Aborted => Phase::Teardown,
        }
    }
}

/// Bookkeeping for the trial currently occupying the controller.
#[derive(Debug)]
struct ActiveTrial {
    trial: Trial,
    collectors_attempted: Vec<usize>,
    readiness_samples: Vec<Option<u32>>,
    measurement_stopped: bool,
    torn_down: bool,
    teardown_failures: Vec<String>,
    aborted: Option<Aborted>,
}

impl ActiveTrial {
    fn new(trial: &Trial) -> Self {
        ActiveTrial {
            trial: trial.clone(),
            collectors_attempted: Vec::new(),
            readiness_samples: Vec::new(),
            measurement_stopped: false,
            torn_down: false,
            teardown_failures: Vec::new(),
            aborted: None,
        }
    }
}

pub struct LifecycleController {
    config: ExperimentConfig,
    registry: HostRegistry,
    session: RemoteSession,
    dispatcher: CommandDispatcher,
    load: Box<dyn LoadGenerator>,
    sleeper: Box<dyn Sleeper>,
    run_log: RunLog,
    state: LifecycleState,
    active: Option<ActiveTrial>,
}

impl LifecycleController {
    pub fn new(
        config: ExperimentConfig,
        registry: HostRegistry,
        session: RemoteSession,
        load: impl LoadGenerator + 'static,
        sleeper: impl Sleeper + 'static,
    ) -> Self {
        let dispatcher = CommandDispatcher::new(&config);
        let run_log = RunLog::new(config.run_log_path());
        LifecycleController {
            config,
            registry,
            session,
            dispatcher,
            load: Box::new(load),
            sleeper: Box::new(sleeper),
            run_log,
            state: LifecycleState::Idle,
            active: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn run_log(&self) -> &RunLog {
        &self.run_log
    }

    /// Deploy the system and wait for it to become ready.
    pub fn start_run(&mut self, trial: &Trial) -> Result<(), Aborted> {
        if self.in_flight() {
            return Err(self.out_of_sequence(trial, "start_run"));
        }
        info!(run_id = trial.run_id(), workload = %trial.workload(), "starting run");
        self.active = Some(ActiveTrial::new(trial));
        self.state = LifecycleState::Deploying;

        let host = match self.resolve(self.dispatcher.deploy_host()) {
            Ok(host) => host,
            Err(fault) => return Err(self.abort_trial(trial, Phase::Deploy, fault, false)),
        };
        let deploy = self.dispatcher.deploy(&host);
        if let Err(fault) = self.dispatch(&deploy, &host) {
            return Err(self.abort_trial(trial, Phase::Deploy, fault, false));
        }

        self.state = LifecycleState::AwaitingReadiness;
        let probe = self.dispatcher.readiness_probe(&host);
        let threshold = self.config.readiness.threshold;
        let schedule = self.config.readiness_schedule();
        let polled = ReadinessPoller::new(&self.session, &*self.sleeper).await_ready(
            &host,
            &probe.command,
            threshold,
            &schedule,
        );
        let report = match polled {
            Ok(report) => report,
            Err(err) => return Err(self.abort_trial(trial, Phase::Readiness, err.into(), false)),
        };
        if let Some(active) = self.active.as_mut() {
            active.readiness_samples = report.samples.clone();
        }

        if report.ready {
            self.record(trial, Verdict::Ready, None);
            info!(run_id = trial.run_id(), "benchmark system is up and running");
            return Ok(());
        }

        let observed = report
            .last_count()
            .map(|n| n.to_string())
            .unwrap_or_else(|| "?".to_string());
        let detail = format!(
            "{}/{} after {} samples",
            observed,
            threshold,
            report.samples.len()
        );
        self.record(trial, Verdict::Failed, Some(&detail));
        let fault = Fault::ReadinessTimeout {
            host: host.name.clone(),
            threshold,
            samples: report.samples.len(),
        };
        match self.config.readiness.on_exhaustion {
            ExhaustionPolicy::Proceed => {
                warn!(
                    run_id = trial.run_id(),
                    observed = %observed,
                    threshold,
                    "readiness threshold not met, proceeding anyway"
                );
                Ok(())
            }
            ExhaustionPolicy::Abort => Err(self.abort_trial(trial, Phase::Readiness, fault, false)),
            ExhaustionPolicy::Reboot => Err(self.abort_trial(trial, Phase::Readiness, fault, true)),
        }
    }

    /// Start every collector, in configuration order. Any failure aborts the
    /// trial before load generation.
    pub fn start_measurement(&mut self, trial: &Trial) -> Result<(), Aborted> {
        if !self.is_active(trial) || self.state != LifecycleState::AwaitingReadiness {
            return Err(self.out_of_sequence(trial, "start_measurement"));
        }
        self.state = LifecycleState::Measuring;

        for idx in 0..self.dispatcher.collectors().len() {
            let host_name = self.dispatcher.collectors()[idx].host.clone();
            let host = match self.resolve(&host_name) {
                Ok(host) => host,
                Err(fault) => {
                    return Err(self.abort_trial(trial, Phase::StartMeasurement, fault, false))
                }
            };
            if let Some(active) = self.active.as_mut() {
                active.collectors_attempted.push(idx);
            }
            let start = self.dispatcher.collector_start(idx, trial, &host);
            if let Err(fault) = self.dispatch(&start, &host) {
                return Err(self.abort_trial(trial, Phase::StartMeasurement, fault, false));
            }
        }
        info!(
            run_id = trial.run_id(),
            collectors = self.dispatcher.collectors().len(),
            "measurement started"
        );
        Ok(())
    }

    /// Run every discovered load script once at the trial's intensity.
    /// Blocks until all scripts have finished.
    pub fn interact(&mut self, trial: &Trial) -> Result<(), Aborted> {
        if !self.is_active(trial) || self.state != LifecycleState::Measuring {
            return Err(self.out_of_sequence(trial, "interact"));
        }
        self.state = LifecycleState::Interacting;

        let scripts = match discover_scripts(&self.config.load.script_dir) {
            Ok(scripts) if !scripts.is_empty() => scripts,
            Ok(_) => {
                let fault = Fault::Configuration(format!(
                    "no load scripts found under {}",
                    self.config.load.script_dir.display()
                ));
                return Err(self.abort_trial(trial, Phase::Interact, fault, false));
            }
            Err(err) => {
                let fault = Fault::Configuration(err.to_string());
                return Err(self.abort_trial(trial, Phase::Interact, fault, false));
            }
        };

        let intensity = trial.workload().intensity();
        let duration = Duration::from_secs(self.config.load.duration_secs);
        info!(
            run_id = trial.run_id(),
            workload = %trial.workload(),
            intensity,
            scripts = scripts.len(),
            "load testing"
        );
        for script in &scripts {
            match self.load.run(script, intensity, duration) {
                Ok(true) => {}
                Ok(false) => warn!(
                    run_id = trial.run_id(),
                    script = %script.display(),
                    "load script did not finish cleanly"
                ),
                Err(err) => {
                    let fault = Fault::LoadGeneration(format!("{:#}", err));
                    return Err(self.abort_trial(trial, Phase::Interact, fault, false));
                }
            }
        }
        info!(run_id = trial.run_id(), "finished load testing");
        Ok(())
    }

    /// Stop every collector that was started. Failures are logged only.
    pub fn stop_measurement(&mut self, trial: &Trial) -> Result<(), Aborted> {
        if !self.is_active(trial) || self.state.is_terminal() {
            return Ok(());
        }
        self.state = LifecycleState::StoppingMeasurement;
        self.stop_collectors();
        Ok(())
    }

    /// Tear the trial down. A no-op once the trial has been torn down.
    pub fn stop_run(&mut self, trial: &Trial) -> Result<(), Aborted> {
        if !self.is_active(trial) || self.state.is_terminal() {
            return Ok(());
        }
        self.state = LifecycleState::TearingDown;
        self.teardown();
        self.state = LifecycleState::Completed;
        self.record(trial, Verdict::Completed, None);
        info!(run_id = trial.run_id(), workload = %trial.workload(), "run completed");
        Ok(())
    }

    /// Abandon the trial: stop collectors, tear down, mark it aborted.
    ///
    /// Naming a trial other than the one in flight is a sequence fault and
    /// leaves the in-flight trial and every host untouched.
    pub fn abort(&mut self, trial: &Trial, fault: Fault) -> Aborted {
        if self.in_flight() && !self.is_active(trial) {
            return self.out_of_sequence(trial, "abort");
        }
        let phase = self.state.phase();
        self.abort_trial(trial, phase, fault, false)
    }

    /// Data row for the trial that last occupied the controller.
    pub fn run_record(&self, trial: &Trial) -> Option<RunRecord> {
        let active = self.active.as_ref().filter(|a| a.trial == *trial)?;
        let verdict = match self.state {
            LifecycleState::Completed => Verdict::Completed,
            LifecycleState::Aborted => Verdict::Aborted,
            _ => return None,
        };
        Some(RunRecord {
            run_id: trial.run_id().to_string(),
            workload: trial.workload(),
            intensity: trial.workload().intensity(),
            file_tag: trial.file_tag(),
            verdict,
            readiness_samples: active.readiness_samples.clone(),
            teardown_failures: active.teardown_failures.clone(),
            abort_reason: active.aborted.as_ref().map(|a| a.fault.to_string()),
        })
    }

    fn abort_trial(&mut self, trial: &Trial, phase: Phase, fault: Fault, reboot: bool) -> Aborted {
        if !self.is_active(trial) {
            self.active = Some(ActiveTrial::new(trial));
            self.state = LifecycleState::Idle;
        }
        if let Some(previous) = self.active.as_ref().and_then(|a| a.aborted.clone()) {
            warn!(run_id = trial.run_id(), "trial already aborted");
            return previous;
        }
        let aborted = Aborted::new(trial, phase, fault);
        if self.state == LifecycleState::Completed {
            warn!(run_id = trial.run_id(), reason = %aborted, "abort after completion ignored");
            return aborted;
        }

        error!(
            run_id = trial.run_id(),
            workload = %trial.workload(),
            phase = %phase,
            reason = %aborted.fault,
            "aborting trial"
        );
        self.stop_collectors();
        self.teardown();
        if reboot {
            self.reboot_deploy_host();
        }

        self.state = LifecycleState::Aborted;
        if let Some(active) = self.active.as_mut() {
            active.aborted = Some(aborted.clone());
        }
        let reason = aborted.fault.to_string();
        self.record(trial, Verdict::Aborted, Some(&reason));
        aborted
    }

    fn stop_collectors(&mut self) {
        let (trial, attempted) = match self.active.as_mut() {
            Some(active) if !active.measurement_stopped => {
                active.measurement_stopped = true;
                (active.trial.clone(), active.collectors_attempted.clone())
            }
            _ => return,
        };
        for idx in attempted {
            let host_name = self.dispatcher.collectors()[idx].host.clone();
            let host = match self.resolve(&host_name) {
                Ok(host) => host,
                Err(fault) => {
                    error!(
                        host = %host_name,
                        phase = "stop_measurement",
                        error = %fault,
                        "cannot stop collector"
                    );
                    continue;
                }
            };
            let stop = self.dispatcher.collector_stop(idx, &trial, &host);
            if let Err(fault) = self.dispatch(&stop, &host) {
                error!(
                    host = %host_name,
                    phase = "stop_measurement",
                    error = %fault,
                    "collector stop failed"
                );
            }
        }
    }

    fn teardown(&mut self) {
        let trial = match self.active.as_mut() {
            Some(active) if !active.torn_down => {
                active.torn_down = true;
                active.trial.clone()
            }
            _ => return,
        };
        let mut failures = Vec::new();
        for step in self.dispatcher.teardown_plan() {
            let outcome = self.resolve(&step.host).and_then(|host| {
                let command = RemoteCommand {
                    host: step.host.clone(),
                    label: step.label.clone(),
                    command: self.dispatcher.teardown_command(&step, &trial, &host),
                };
                self.dispatch(&command, &host)
            });
            if let Err(fault) = outcome {
                error!(
                    host = %step.host,
                    phase = "teardown",
                    step = %step.label,
                    error = %fault,
                    "teardown step failed"
                );
                failures.push(format!("{}: {}", step.label, fault));
            }
        }
        if let Some(active) = self.active.as_mut() {
            active.teardown_failures = failures;
        }
        info!(run_id = trial.run_id(), "teardown attempted");
    }

    /// Best effort: the host may drop the connection while going down.
    fn reboot_deploy_host(&mut self) {
        let host = match self.resolve(self.dispatcher.deploy_host()) {
            Ok(host) => host,
            Err(fault) => {
                error!(phase = "readiness", error = %fault, "cannot reboot deployment host");
                return;
            }
        };
        let reboot = self.dispatcher.reboot(&host);
        if let Err(fault) = self.dispatch(&reboot, &host) {
            warn!(
                host = %host.name,
                phase = "readiness",
                error = %fault,
                "reboot command reported a failure"
            );
        }
        let cooldown = Duration::from_secs(self.config.readiness.reboot_cooldown_secs);
        info!(
            host = %host.name,
            cooldown_secs = cooldown.as_secs(),
            "waiting for host to come back"
        );
        self.sleeper.sleep(cooldown);
    }

    fn resolve(&self, host: &str) -> Result<HostCredentials, Fault> {
        self.registry.resolve(host).map_err(Fault::from)
    }

    /// Run a command and apply the stderr rule.
    fn dispatch(&self, command: &RemoteCommand, host: &HostCredentials) -> Result<(), Fault> {
        let outcome = self.session.execute(host, &command.command, &command.label)?;
        if outcome.succeeded {
            Ok(())
        } else {
            Err(Fault::CommandFailure {
                host: host.name.clone(),
                command: command.label.clone(),
                diagnostic: outcome.diagnostic,
            })
        }
    }

    fn record(&self, trial: &Trial, verdict: Verdict, detail: Option<&str>) {
        if let Err(err) = self.run_log.append(trial, verdict, detail) {
            warn!(
                path = %self.run_log.path().display(),
                error = %err,
                "failed to append to run log"
            );
        }
    }

    /// A trial has started and not yet reached a terminal state.
    fn in_flight(&self) -> bool {
        self.state != LifecycleState::Idle && !self.state.is_terminal()
    }

    fn is_active(&self, trial: &Trial) -> bool {
        self.active.as_ref().map_or(false, |a| a.trial == *trial)
    }

    fn out_of_sequence(&self, trial: &Trial, operation: &'static str) -> Aborted {
        let fault = Fault::Sequence {
            operation,
            state: format!("{:?}", self.state),
        };
        error!(run_id = trial.run_id(), error = %fault, "lifecycle operation out of order");
        Aborted::new(trial, self.state.phase(), fault)
    }
}

impl ExperimentHooks for LifecycleController {
    fn before_experiment(&mut self) {
        info!(
            experiment = %self.config.experiment.name,
            hosts = ?self.config.hosts(),
            "experiment starting"
        );
    }

    fn start_run(&mut self, trial: &Trial) -> Result<(), Aborted> {
        LifecycleController::start_run(self, trial)
    }

    fn start_measurement(&mut self, trial: &Trial) -> Result<(), Aborted> {
        LifecycleController::start_measurement(self, trial)
    }

    fn interact(&mut self, trial: &Trial) -> Result<(), Aborted> {
        LifecycleController::interact(self, trial)
    }

    fn stop_measurement(&mut self, trial: &Trial) -> Result<(), Aborted> {
        LifecycleController::stop_measurement(self, trial)
    }

    fn stop_run(&mut self, trial: &Trial) -> Result<(), Aborted> {
        LifecycleController::stop_run(self, trial)
    }

    fn populate_run_data(&mut self, trial: &Trial) -> Option<RunRecord> {
        self.run_record(trial)
    }

    fn after_experiment(&mut self) {
        info!(experiment = %self.config.experiment.name, "experiment finished");
    }
}
