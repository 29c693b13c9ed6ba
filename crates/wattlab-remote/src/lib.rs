//! Remote command execution against named experiment hosts.
//!
//! A logical host name (`GL6`, `collector-a`, ...) is resolved through a
//! [`HostRegistry`] into [`HostCredentials`], and commands are run on it
//! through a [`RemoteSession`] backed by a [`Transport`]. The production
//! transport shells out to `ssh`; [`mock::MockTransport`] scripts replies for
//! tests.

pub mod error;
pub mod mock;
pub mod registry;
pub mod session;
pub mod transport;

pub use error::RemoteError;
pub use registry::{
    CredentialProvider, EnvCredentials, HostCredentials, HostRegistry, MapCredentials, Secret,
};
pub use session::{Outcome, RemoteSession};
pub use transport::{ExecOutput, SshOptions, SshTransport, Transport};
