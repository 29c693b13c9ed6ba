//! Literal command strings for every remote phase.
//!
//! This is the only place secret material is interpolated into a command.
//! Privileged commands are fed the password on stdin through `sudo -S` with
//! an empty prompt, so a successful sudo writes nothing to stderr.

use wattlab_remote::HostCredentials;

use crate::config::{
    CollectorConfig, DeploymentConfig, ExperimentConfig, ReadinessConfig, TeardownConfig,
};
use crate::trial::Trial;

/// A command ready to hand to a remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    /// Logical host name.
    pub host: String,
    /// Short name for logs and the run record.
    pub label: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownAction {
    KillDeploySession,
    KillCollectorSession { collector: usize },
    PruneVolumes,
    RestartEngine,
    Extra(String),
}

/// One teardown step, independent of every other step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownStep {
    pub host: String,
    pub label: String,
    pub action: TeardownAction,
}

#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    deployment: DeploymentConfig,
    readiness: ReadinessConfig,
    collectors: Vec<CollectorConfig>,
    teardown: TeardownConfig,
}

impl CommandDispatcher {
    pub fn new(config: &ExperimentConfig) -> Self {
        CommandDispatcher {
            deployment: config.deployment.clone(),
            readiness: config.readiness.clone(),
            collectors: config.collectors.clone(),
            teardown: config.teardown.clone(),
        }
    }

    pub fn deploy_host(&self) -> &str {
        &self.deployment.host
    }

    pub fn collectors(&self) -> &[CollectorConfig] {
        &self.collectors
    }

    /// Start the system in a detached tmux session so the call returns at once.
    pub fn deploy(&self, host: &HostCredentials) -> RemoteCommand {
        let run = self.maybe_privileged(
            self.deployment.privileged,
            host,
            &self.deployment.command,
        );
        let inner = format!("cd {} && {}", self.deployment.workdir, run);
        RemoteCommand {
            host: self.deployment.host.clone(),
            label: format!("deploy in tmux session '{}'", self.deployment.session),
            command: format!(
                "tmux new -s {} -d {}",
                shell_quote(&self.deployment.session),
                shell_quote(&inner)
            ),
        }
    }

    /// One liveness sample; stdout is the count.
    pub fn readiness_probe(&self, host: &HostCredentials) -> RemoteCommand {
        RemoteCommand {
            host: self.deployment.host.clone(),
            label: "readiness probe".to_string(),
            command: self.maybe_privileged(
                self.readiness.probe_privileged,
                host,
                &self.readiness.probe,
            ),
        }
    }

    pub fn reboot(&self, host: &HostCredentials) -> RemoteCommand {
        RemoteCommand {
            host: self.deployment.host.clone(),
            label: "reboot deployment host".to_string(),
            command: privileged(host, "systemctl reboot"),
        }
    }

    pub fn collector_session(&self, collector: usize, trial: &Trial) -> String {
        session_name(&format!("{}_{}", self.collectors[collector].name, trial.file_tag()))
    }

    pub fn collector_start(
        &self,
        collector: usize,
        trial: &Trial,
        host: &HostCredentials,
    ) -> RemoteCommand {
        let spec = &self.collectors[collector];
        let invocation = format!(
            "{} {} {}",
            spec.start,
            shell_quote(&trial.file_tag()),
            shell_quote(trial.run_id())
        );
        let inner = self.maybe_privileged(spec.privileged, host, &invocation);
        RemoteCommand {
            host: spec.host.clone(),
            label: format!("start collector '{}'", spec.name),
            command: format!(
                "tmux new -s {} -d {}",
                shell_quote(&self.collector_session(collector, trial)),
                shell_quote(&inner)
            ),
        }
    }

    pub fn collector_stop(
        &self,
        collector: usize,
        trial: &Trial,
        host: &HostCredentials,
    ) -> RemoteCommand {
        let spec = &self.collectors[collector];
        let invocation = format!(
            "{} {} {}",
            spec.stop,
            shell_quote(&trial.file_tag()),
            shell_quote(trial.run_id())
        );
        RemoteCommand {
            host: spec.host.clone(),
            label: format!("stop collector '{}'", spec.name),
            command: self.maybe_privileged(spec.privileged, host, &invocation),
        }
    }

    /// Teardown steps in execution order: deployment session, collector
    /// sessions, volume prune, engine restart, extras.
    pub fn teardown_plan(&self) -> Vec<TeardownStep> {
        let mut steps = vec![TeardownStep {
            host: self.deployment.host.clone(),
            label: format!("kill tmux session '{}'", self.deployment.session),
            action: TeardownAction::KillDeploySession,
        }];
        for (idx, c) in self.collectors.iter().enumerate() {
            steps.push(TeardownStep {
                host: c.host.clone(),
                label: format!("kill collector session '{}'", c.name),
                action: TeardownAction::KillCollectorSession { collector: idx },
            });
        }
        if self.teardown.prune_volumes {
            steps.push(TeardownStep {
                host: self.deployment.host.clone(),
                label: "prune volumes".to_string(),
                action: TeardownAction::PruneVolumes,
            });
        }
        if self.teardown.restart_engine {
            steps.push(TeardownStep {
                host: self.deployment.host.clone(),
                label: "restart docker".to_string(),
                action: TeardownAction::RestartEngine,
            });
        }
        for extra in &self.teardown.extra {
            steps.push(TeardownStep {
                host: self.deployment.host.clone(),
                label: format!("run '{}'", extra),
                action: TeardownAction::Extra(extra.clone()),
            });
        }
        steps
    }

    pub fn teardown_command(
        &self,
        step: &TeardownStep,
        trial: &Trial,
        host: &HostCredentials,
    ) -> String {
        match &step.action {
            TeardownAction::KillDeploySession => kill_session(&self.deployment.session),
            TeardownAction::KillCollectorSession { collector } => {
                kill_session(&self.collector_session(*collector, trial))
            }
            TeardownAction::PruneVolumes => privileged(host, "docker volume prune -f"),
            TeardownAction::RestartEngine => privileged(host, "systemctl restart docker.service"),
            TeardownAction::Extra(cmd) => privileged(host, cmd),
        }
    }

    fn maybe_privileged(&self, elevate: bool, host: &HostCredentials, cmd: &str) -> String {
        if elevate {
            privileged(host, cmd)
        } else {
            cmd.to_string()
        }
    }
}

/// tmux rewrites these characters in session names.
pub(crate) fn session_name(raw: &str) -> String {
    raw.replace(['.', ':'], "_")
}

/// Kill a tmux session by exact name. A session that already exited is not
/// an error: start scripts may return before teardown.
fn kill_session(name: &str) -> String {
    let target = shell_quote(&format!("={}", name));
    format!(
        "if tmux has-session -t {t} 2>/dev/null; then tmux kill-session -t {t}; fi",
        t = target
    )
}

fn privileged(host: &HostCredentials, cmd: &str) -> String {
    format!(
        "echo {} | sudo -S -p '' {}",
        shell_quote(host.secret.expose()),
        cmd
    )
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::trial::Workload;
    use wattlab_remote::Secret;

    fn dispatcher() -> CommandDispatcher {
        CommandDispatcher::new(&ExperimentConfig::from_yaml(SAMPLE).expect("config"))
    }

    fn creds(name: &str, secret: &str) -> HostCredentials {
        HostCredentials {
            name: name.into(),
            address: "10.0.0.6".into(),
            username: "ubuntu".into(),
            secret: Secret::new(secret),
        }
    }

    #[test]
    fn deploy_runs_in_named_detached_session() {
        let cmd = dispatcher().deploy(&creds("GL6", "pw"));
        assert_eq!(cmd.host, "GL6");
        assert_eq!(
            cmd.command,
            "tmux new -s train -d 'cd ~/smartwatts-evaluation/train-ticketing-system && echo pw | sudo -S -p '\"'\"''\"'\"' docker-compose up'"
        );
    }

    #[test]
    fn secrets_with_quotes_are_escaped() {
        let cmd = dispatcher().readiness_probe(&creds("GL6", "it's"));
        assert_eq!(
            cmd.command,
            "echo 'it'\"'\"'s' | sudo -S -p '' docker ps | wc -l"
        );
    }

    #[test]
    fn collector_commands_are_namespaced_by_trial() {
        let d = dispatcher();
        let trial = Trial::new("run_7", Workload::High);
        let start = d.collector_start(0, &trial, &creds("GL6", "pw"));
        assert_eq!(start.host, "GL6");
        assert_eq!(
            start.command,
            "tmux new -s smartwatts_run_7-HIGH -d '~/smartwatts-evaluation/smartwatts/start_smartwatts.sh run_7-HIGH run_7'"
        );
        let stop = d.collector_stop(0, &trial, &creds("GL6", "pw"));
        assert_eq!(
            stop.command,
            "~/smartwatts-evaluation/smartwatts/stop_smartwatts.sh run_7-HIGH run_7"
        );

        let privileged_stop = d.collector_stop(1, &trial, &creds("GL3", "pw3"));
        assert_eq!(privileged_stop.host, "GL3");
        assert_eq!(
            privileged_stop.command,
            "echo pw3 | sudo -S -p '' ~/wattsup/stop_wattsup.sh run_7-HIGH run_7"
        );
    }

    #[test]
    fn collector_session_names_avoid_tmux_separators() {
        let d = dispatcher();
        let trial = Trial::new("v1.2", Workload::Low);
        assert_eq!(d.collector_session(1, &trial), "wattsup_v1_2-LOW");
    }

    #[test]
    fn teardown_plan_is_ordered() {
        let d = dispatcher();
        let labels: Vec<TeardownAction> = d.teardown_plan().into_iter().map(|s| s.action).collect();
        assert_eq!(
            labels,
            vec![
                TeardownAction::KillDeploySession,
                TeardownAction::KillCollectorSession { collector: 0 },
                TeardownAction::KillCollectorSession { collector: 1 },
                TeardownAction::PruneVolumes,
                TeardownAction::RestartEngine,
                TeardownAction::Extra("killall netdata".into()),
            ]
        );
    }

    #[test]
    fn teardown_commands_render_per_host() {
        let d = dispatcher();
        let trial = Trial::new("run_1", Workload::Medium);
        let plan = d.teardown_plan();
        let gl6 = creds("GL6", "pw");
        let rendered: Vec<String> = plan
            .iter()
            .map(|step| d.teardown_command(step, &trial, &gl6))
            .collect();
        assert_eq!(
            rendered[0],
            "if tmux has-session -t '=train' 2>/dev/null; then tmux kill-session -t '=train'; fi"
        );
        assert_eq!(
            rendered[1],
            "if tmux has-session -t '=smartwatts_run_1-MEDIUM' 2>/dev/null; \
             then tmux kill-session -t '=smartwatts_run_1-MEDIUM'; fi"
        );
        assert_eq!(rendered[3], "echo pw | sudo -S -p '' docker volume prune -f");
        assert_eq!(
            rendered[4],
            "echo pw | sudo -S -p '' systemctl restart docker.service"
        );
        assert_eq!(rendered[5], "echo pw | sudo -S -p '' killall netdata");
        assert_eq!(plan[2].host, "GL3");
    }

    #[test]
    fn session_kill_targets_exact_name_and_tolerates_exited_sessions() {
        let cmd = kill_session("train");
        // `-t train` alone would prefix-match a session named `training`.
        assert!(!cmd.contains("-t train"));
        assert_eq!(cmd.matches("-t '=train'").count(), 2);
        // has-session noise is discarded so a missing session leaves stderr empty.
        assert!(cmd.starts_with("if tmux has-session -t '=train' 2>/dev/null; then"));
        assert!(cmd.ends_with("; fi"));
    }

    #[test]
    fn shell_quote_passes_safe_tokens_through() {
        assert_eq!(shell_quote("run_7-HIGH"), "run_7-HIGH");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
    }
}
