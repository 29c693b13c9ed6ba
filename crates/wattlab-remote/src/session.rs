//! Single-command remote sessions.

use tracing::{info, warn};

use crate::error::RemoteError;
use crate::registry::HostCredentials;
use crate::transport::Transport;

/// Result of one command dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// False whenever the command wrote anything to stderr, warnings included.
    pub succeeded: bool,
    /// Captured stderr, trimmed.
    pub diagnostic: String,
    pub stdout: String,
}

/// Runs commands through a [`Transport`] and applies the stderr success rule.
///
/// No retries happen here.
pub struct RemoteSession {
    transport: Box<dyn Transport>,
}

impl RemoteSession {
    pub fn new(transport: impl Transport + 'static) -> Self {
        RemoteSession {
            transport: Box::new(transport),
        }
    }

    /// Execute `command` on `host`. `label` names the command in logs only.
    pub fn execute(
        &self,
        host: &HostCredentials,
        command: &str,
        label: &str,
    ) -> Result<Outcome, RemoteError> {
        info!(host = %host.name, command = label, "dispatching remote command");
        let output = self.transport.exec(host, command).map_err(|err| {
            warn!(host = %host.name, command = label, error = %err, "transport failure");
            err
        })?;

        let outcome = Outcome {
            succeeded: output.stderr.is_empty(),
            diagnostic: output.stderr.trim().to_string(),
            stdout: output.stdout,
        };
        if outcome.succeeded {
            info!(host = %host.name, command = label, "remote command succeeded");
        } else {
            warn!(
                host = %host.name,
                command = label,
                diagnostic = %outcome.diagnostic,
                "remote command reported diagnostics"
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockReply, MockTransport};
    use crate::registry::Secret;

    fn creds() -> HostCredentials {
        HostCredentials {
            name: "GL3".into(),
            address: "10.0.0.3".into(),
            username: "ubuntu".into(),
            secret: Secret::new("pw"),
        }
    }

    #[test]
    fn empty_stderr_is_success() {
        let mock = MockTransport::new();
        mock.on("uptime", MockReply::stdout("up 3 days\n"));
        let session = RemoteSession::new(mock.clone());
        let outcome = session.execute(&creds(), "uptime", "uptime").expect("exec");
        assert!(outcome.succeeded);
        assert_eq!(outcome.stdout, "up 3 days\n");
        assert_eq!(outcome.diagnostic, "");
        assert_eq!(mock.calls().len(), 1);
    }

    #[test]
    fn any_stderr_is_failure_even_warnings() {
        let mock = MockTransport::new();
        mock.on(
            "docker",
            MockReply::stderr("WARNING: version is obsolete\n"),
        );
        let session = RemoteSession::new(mock);
        let outcome = session
            .execute(&creds(), "docker compose up", "deploy")
            .expect("exec");
        assert!(!outcome.succeeded);
        assert_eq!(outcome.diagnostic, "WARNING: version is obsolete");
    }

    #[test]
    fn connection_errors_are_not_coerced_into_outcomes() {
        let mock = MockTransport::new();
        mock.on("uptime", MockReply::unreachable("connection refused"));
        let session = RemoteSession::new(mock);
        let err = session
            .execute(&creds(), "uptime", "uptime")
            .expect_err("must be a connection error");
        assert_eq!(
            err,
            RemoteError::Connection {
                host: "GL3".into(),
                reason: "connection refused".into()
            }
        );
    }
}
