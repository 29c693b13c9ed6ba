//! Bounded readiness polling.
//!
//! The schedule is a list of waits. After each wait exactly one sample is
//! taken; the first sample at or above the threshold ends polling early. The
//! schedule length is the only bound on how long a stuck deployment is polled.

use std::time::Duration;

use tracing::{info, warn};
use wattlab_remote::{HostCredentials, RemoteError, RemoteSession};

use crate::clock::Sleeper;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessReport {
    pub ready: bool,
    /// One entry per sample taken; `None` when the output was not a count.
    pub samples: Vec<Option<u32>>,
}

impl ReadinessReport {
    pub fn last_count(&self) -> Option<u32> {
        self.samples.iter().rev().flatten().next().copied()
    }
}

pub struct ReadinessPoller<'a> {
    session: &'a RemoteSession,
    sleeper: &'a dyn Sleeper,
}

impl<'a> ReadinessPoller<'a> {
    pub fn new(session: &'a RemoteSession, sleeper: &'a dyn Sleeper) -> Self {
        ReadinessPoller { session, sleeper }
    }

    /// Connection failures while sampling are returned as errors; they are
    /// not counted as a low sample.
    pub fn await_ready(
        &self,
        host: &HostCredentials,
        probe: &str,
        threshold: u32,
        schedule: &[Duration],
    ) -> Result<ReadinessReport, RemoteError> {
        let mut samples = Vec::with_capacity(schedule.len());
        for (idx, wait) in schedule.iter().enumerate() {
            info!(
                host = %host.name,
                wait_secs = wait.as_secs(),
                attempt = idx + 1,
                of = schedule.len(),
                "waiting before readiness sample"
            );
            self.sleeper.sleep(*wait);

            let outcome = self.session.execute(host, probe, "readiness probe")?;
            if !outcome.succeeded {
                warn!(
                    host = %host.name,
                    diagnostic = %outcome.diagnostic,
                    "readiness probe reported diagnostics"
                );
            }
            let count = parse_count(&outcome.stdout);
            samples.push(count);
            match count {
                Some(n) if n >= threshold => {
                    info!(host = %host.name, count = n, threshold, "deployment ready");
                    return Ok(ReadinessReport {
                        ready: true,
                        samples,
                    });
                }
                Some(n) => {
                    info!(host = %host.name, count = n, threshold, "deployment not ready yet");
                }
                None => {
                    warn!(
                        host = %host.name,
                        output = %outcome.stdout.trim(),
                        "readiness probe output is not a count"
                    );
                }
            }
        }
        warn!(
            host = %host.name,
            threshold,
            samples = samples.len(),
            "readiness schedule exhausted"
        );
        Ok(ReadinessReport {
            ready: false,
            samples,
        })
    }
}

fn parse_count(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| l.trim().parse::<u32>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RecordingSleeper;
    use wattlab_remote::mock::{MockReply, MockTransport};
    use wattlab_remote::Secret;

    const PROBE: &str = "docker ps | wc -l";

    fn creds() -> HostCredentials {
        HostCredentials {
            name: "GL6".into(),
            address: "10.0.0.6".into(),
            username: "ubuntu".into(),
            secret: Secret::new("pw"),
        }
    }

    fn schedule() -> Vec<Duration> {
        vec![Duration::from_secs(600), Duration::from_secs(180)]
    }

    #[test]
    fn first_sample_at_threshold_skips_second_wait() {
        let mock = MockTransport::new();
        mock.on(PROBE, MockReply::stdout("68\n"));
        let session = RemoteSession::new(mock.clone());
        let sleeper = RecordingSleeper::new();
        let report = ReadinessPoller::new(&session, &sleeper)
            .await_ready(&creds(), PROBE, 68, &schedule())
            .expect("poll");
        assert!(report.ready);
        assert_eq!(report.samples, vec![Some(68)]);
        assert_eq!(sleeper.waits(), vec![Duration::from_secs(600)]);
        assert_eq!(mock.count(PROBE), 1);
    }

    #[test]
    fn two_low_samples_exhaust_the_schedule() {
        let mock = MockTransport::new();
        mock.on(PROBE, MockReply::stdout("40\n"));
        mock.on(PROBE, MockReply::stdout("40\n"));
        let session = RemoteSession::new(mock.clone());
        let sleeper = RecordingSleeper::new();
        let report = ReadinessPoller::new(&session, &sleeper)
            .await_ready(&creds(), PROBE, 68, &schedule())
            .expect("poll");
        assert!(!report.ready);
        assert_eq!(report.samples, vec![Some(40), Some(40)]);
        assert_eq!(report.last_count(), Some(40));
        assert_eq!(sleeper.waits(), schedule());
        assert_eq!(mock.count(PROBE), 2);
    }

    #[test]
    fn top_up_wait_can_rescue_a_slow_deployment() {
        let mock = MockTransport::new();
        mock.on(PROBE, MockReply::stdout("51"));
        mock.on(PROBE, MockReply::stdout("70"));
        let session = RemoteSession::new(mock);
        let sleeper = RecordingSleeper::new();
        let report = ReadinessPoller::new(&session, &sleeper)
            .await_ready(&creds(), PROBE, 68, &schedule())
            .expect("poll");
        assert!(report.ready);
        assert_eq!(report.samples, vec![Some(51), Some(70)]);
    }

    #[test]
    fn garbage_output_is_a_non_qualifying_sample() {
        let mock = MockTransport::new();
        mock.on(PROBE, MockReply::stdout("Cannot connect to the Docker daemon"));
        mock.on(PROBE, MockReply::stdout(""));
        let session = RemoteSession::new(mock);
        let sleeper = RecordingSleeper::new();
        let report = ReadinessPoller::new(&session, &sleeper)
            .await_ready(&creds(), PROBE, 68, &schedule())
            .expect("poll");
        assert!(!report.ready);
        assert_eq!(report.samples, vec![None, None]);
        assert_eq!(report.last_count(), None);
    }

    #[test]
    fn connection_failure_is_propagated() {
        let mock = MockTransport::new();
        mock.on(PROBE, MockReply::unreachable("no route to host"));
        let session = RemoteSession::new(mock);
        let sleeper = RecordingSleeper::new();
        let err = ReadinessPoller::new(&session, &sleeper)
            .await_ready(&creds(), PROBE, 68, &schedule())
            .expect_err("connection error");
        assert!(matches!(err, RemoteError::Connection { .. }));
        assert_eq!(sleeper.waits().len(), 1);
    }

    #[test]
    fn parse_count_uses_last_non_empty_line() {
        assert_eq!(parse_count("12\n\n"), Some(12));
        assert_eq!(parse_count("header\n 7 \n"), Some(7));
        assert_eq!(parse_count("-3"), None);
    }
}
