//! Logical host name resolution.
//!
//! A host named `GL6` resolves through three keys of the injected
//! [`CredentialProvider`]: `GL6_HOST`, `GL6_USER` and `GL6_PASSWORD`. All three
//! must be present and non-empty.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::RemoteError;

/// Source of credential material. Implementations must be synchronous.
pub trait CredentialProvider {
    fn lookup(&self, key: &str) -> Option<String>;
}

/// Reads credential keys from the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn lookup(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// In-memory credential store.
#[derive(Debug, Default, Clone)]
pub struct MapCredentials {
    values: BTreeMap<String, String>,
}

impl MapCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert all three keys for `host`.
    pub fn with_host(mut self, host: &str, address: &str, username: &str, secret: &str) -> Self {
        self.insert(&format!("{}_HOST", host), address);
        self.insert(&format!("{}_USER", host), username);
        self.insert(&format!("{}_PASSWORD", host), secret);
        self
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }
}

impl CredentialProvider for MapCredentials {
    fn lookup(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Password material. `Debug` and `Display` never print the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    /// Raw secret text. Only command construction should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Connection parameters for one logical host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCredentials {
    /// Logical name the credentials were resolved from.
    pub name: String,
    pub address: String,
    pub username: String,
    pub secret: Secret,
}

impl HostCredentials {
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.username, self.address)
    }
}

/// Resolves logical host names through a [`CredentialProvider`].
///
/// There is no cache; every call goes back to the provider.
pub struct HostRegistry {
    provider: Box<dyn CredentialProvider>,
}

impl HostRegistry {
    pub fn new(provider: impl CredentialProvider + 'static) -> Self {
        HostRegistry {
            provider: Box::new(provider),
        }
    }

    pub fn resolve(&self, logical_name: &str) -> Result<HostCredentials, RemoteError> {
        let mut missing = Vec::new();
        let mut fetch = |suffix: &str| {
            let key = format!("{}_{}", logical_name, suffix);
            match self.provider.lookup(&key) {
                Some(v) if !v.trim().is_empty() => Some(v),
                _ => {
                    missing.push(key);
                    None
                }
            }
        };
        let address = fetch("HOST");
        let username = fetch("USER");
        let secret = fetch("PASSWORD");

        match (address, username, secret) {
            (Some(address), Some(username), Some(secret)) => Ok(HostCredentials {
                name: logical_name.to_string(),
                address,
                username,
                secret: Secret::new(secret),
            }),
            _ => Err(RemoteError::Configuration {
                host: logical_name.to_string(),
                missing,
            }),
        }
    }
}
