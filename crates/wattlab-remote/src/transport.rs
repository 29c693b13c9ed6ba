//! Command transports.
//!
//! `SshTransport` runs one `ssh` process per command, wrapped in `sshpass` so
//! password authentication works unattended. The password travels through the
//! `SSHPASS` environment variable of the child, never through argv.

use std::process::Command;
use std::time::Duration;

use tracing::debug;

use crate::error::RemoteError;
use crate::registry::HostCredentials;

/// Captured output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes a literal command string on a resolved host.
pub trait Transport {
    fn exec(&self, host: &HostCredentials, command: &str) -> Result<ExecOutput, RemoteError>;
}

/// `ssh` exit status for connection-level failures.
const SSH_CONNECTION_FAILURE: i32 = 255;
/// `sshpass` exit status for a rejected password.
const SSHPASS_BAD_PASSWORD: i32 = 5;
/// `sshpass` exit status for an unknown host key.
const SSHPASS_HOST_KEY_UNKNOWN: i32 = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    pub port: u16,
    pub connect_timeout: Duration,
    pub ssh_binary: String,
    pub sshpass_binary: String,
}

impl Default for SshOptions {
    fn default() -> Self {
        SshOptions {
            port: 22,
            connect_timeout: Duration::from_secs(10),
            ssh_binary: "ssh".to_string(),
            sshpass_binary: "sshpass".to_string(),
        }
    }
}

/// Fresh connection per call, no pooling.
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    options: SshOptions,
}

impl SshTransport {
    pub fn new(options: SshOptions) -> Self {
        SshTransport { options }
    }

    /// Arguments passed to `sshpass`, starting with the `ssh` binary.
    pub fn build_args(&self, host: &HostCredentials, command: &str) -> Vec<String> {
        vec![
            "-e".to_string(),
            self.options.ssh_binary.clone(),
            "-p".to_string(),
            self.options.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            // Client warnings share stderr with the remote command.
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "PubkeyAuthentication=no".to_string(),
            host.user_at_host(),
            // One argument so the remote shell sees pipes and redirects.
            command.to_string(),
        ]
    }
}

impl Transport for SshTransport {
    fn exec(&self, host: &HostCredentials, command: &str) -> Result<ExecOutput, RemoteError> {
        let args = self.build_args(host, command);
        debug!(host = %host.name, address = %host.address, "spawning ssh");
        let output = Command::new(&self.options.sshpass_binary)
            .args(&args)
            .env("SSHPASS", host.secret.expose())
            .output()
            .map_err(|e| RemoteError::Connection {
                host: host.name.clone(),
                reason: format!("failed to launch {}: {}", self.options.sshpass_binary, e),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        match output.status.code() {
            Some(SSH_CONNECTION_FAILURE) | Some(SSHPASS_BAD_PASSWORD)
            | Some(SSHPASS_HOST_KEY_UNKNOWN) => Err(RemoteError::Connection {
                host: host.name.clone(),
                reason: connection_reason(output.status.code(), &stderr),
            }),
            None => Err(RemoteError::Connection {
                host: host.name.clone(),
                reason: "ssh terminated by signal".to_string(),
            }),
            Some(_) => Ok(ExecOutput { stdout, stderr }),
        }
    }
}

fn connection_reason(code: Option<i32>, stderr: &str) -> String {
    let tail = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|s| s.trim().to_string());
    match (code, tail) {
        (Some(SSHPASS_BAD_PASSWORD), _) => "authentication rejected".to_string(),
        (Some(SSHPASS_HOST_KEY_UNKNOWN), _) => "host key verification failed".to_string(),
        (_, Some(line)) => line,
        (code, None) => format!("ssh exited with status {:?}", code),
    }
}
