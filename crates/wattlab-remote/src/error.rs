use thiserror::Error;

/// Failures raised below the command level.
///
/// A command that ran and wrote to stderr is not an error here; that is an
/// [`Outcome`](crate::Outcome) with `succeeded == false`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Credential material for a host is missing or empty. Not retryable.
    #[error("no credentials for host {host}: missing {}", missing.join(", "))]
    Configuration {
        host: String,
        missing: Vec<String>,
    },

    /// The transport could not reach or authenticate against the host.
    #[error("connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },
}

impl RemoteError {
    pub fn host(&self) -> &str {
        match self {
            RemoteError::Configuration { host, .. } | RemoteError::Connection { host, .. } => host,
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, RemoteError::Configuration { .. })
    }
}
