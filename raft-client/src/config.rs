//! Client runtime configuration.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::Address;

/// Default session timeout hint sent with registration, in milliseconds.
pub const DEFAULT_SESSION_TIMEOUT_HINT: u64 = 5000;
/// Default bound on a graceful close waiting for unregister acknowledgement, in milliseconds.
pub const DEFAULT_CLOSE_TIMEOUT: u64 = 5000;

static CLIENT_ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Errors raised by `Config` validation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// At least one bootstrap member address is required.
    #[error("at least one cluster member address must be configured")]
    NoMembers,
    /// A configured duration was zero.
    #[error("{0} must be greater than zero")]
    InvalidTimeout(&'static str),
}

/// The runtime configuration for a client.
///
/// Use [`Config::build`] to construct an instance through the builder, which
/// validates the configuration before it can be used:
///
/// ```ignore
/// let config = Config::build("test-cluster".into())
///     .members(vec![Address::new("localhost", 5000)])
///     .validate()?;
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// The name of the cluster this client belongs to, used for observability.
    pub cluster_name: String,
    /// The bootstrap list of cluster member addresses.
    pub members: Vec<Address>,
    /// The stable identifier this client registers sessions under.
    pub client_id: String,
    /// The session timeout hint sent with registration, in milliseconds.
    ///
    /// The cluster's granted timeout is authoritative; this value is only a hint.
    pub session_timeout_hint: u64,
    /// The bound on a graceful close waiting for unregister acknowledgement, in milliseconds.
    pub close_timeout: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            members: Vec::new(),
            client_id: None,
            session_timeout_hint: None,
            close_timeout: None,
        }
    }
}

/// A configuration builder to ensure that runtime config is only ever constructed via validation.
#[derive(Debug)]
pub struct ConfigBuilder {
    cluster_name: String,
    members: Vec<Address>,
    client_id: Option<String>,
    session_timeout_hint: Option<u64>,
    close_timeout: Option<u64>,
}

impl ConfigBuilder {
    /// Set the bootstrap list of cluster member addresses.
    pub fn members(mut self, members: Vec<Address>) -> Self {
        self.members = members;
        self
    }

    /// Set the stable client identifier. A process-unique default is generated when omitted.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set the session timeout hint, in milliseconds.
    pub fn session_timeout_hint(mut self, millis: u64) -> Self {
        self.session_timeout_hint = Some(millis);
        self
    }

    /// Set the graceful close bound, in milliseconds.
    pub fn close_timeout(mut self, millis: u64) -> Self {
        self.close_timeout = Some(millis);
        self
    }

    /// Validate the state of this builder, returning a config object for use.
    pub fn validate(self) -> Result<Config, ConfigError> {
        if self.members.is_empty() {
            return Err(ConfigError::NoMembers);
        }
        let session_timeout_hint = self.session_timeout_hint.unwrap_or(DEFAULT_SESSION_TIMEOUT_HINT);
        if session_timeout_hint == 0 {
            return Err(ConfigError::InvalidTimeout("session_timeout_hint"));
        }
        let close_timeout = self.close_timeout.unwrap_or(DEFAULT_CLOSE_TIMEOUT);
        if close_timeout == 0 {
            return Err(ConfigError::InvalidTimeout("close_timeout"));
        }
        let client_id = self
            .client_id
            .unwrap_or_else(|| format!("client-{}", CLIENT_ID_SEQ.fetch_add(1, Ordering::Relaxed)));
        Ok(Config {
            cluster_name: self.cluster_name,
            members: self.members,
            client_id,
            session_timeout_hint,
            close_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members() -> Vec<Address> {
        vec![Address::new("a", 1), Address::new("b", 2)]
    }

    #[test]
    fn validate_rejects_empty_members() {
        let res = Config::build("test".into()).validate();
        assert_eq!(res.unwrap_err(), ConfigError::NoMembers);
    }

    #[test]
    fn validate_rejects_zero_timeouts() {
        let res = Config::build("test".into()).members(members()).session_timeout_hint(0).validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidTimeout("session_timeout_hint"));

        let res = Config::build("test".into()).members(members()).close_timeout(0).validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidTimeout("close_timeout"));
    }

    #[test]
    fn validate_applies_defaults_and_unique_client_ids() {
        let a = Config::build("test".into()).members(members()).validate().unwrap();
        let b = Config::build("test".into()).members(members()).validate().unwrap();
        assert_eq!(a.session_timeout_hint, DEFAULT_SESSION_TIMEOUT_HINT);
        assert_eq!(a.close_timeout, DEFAULT_CLOSE_TIMEOUT);
        assert_ne!(a.client_id, b.client_id);
    }

    #[test]
    fn validate_keeps_explicit_values() {
        let config = Config::build("test".into())
            .members(members())
            .client_id("c1")
            .session_timeout_hint(250)
            .close_timeout(100)
            .validate()
            .unwrap();
        assert_eq!(config.client_id, "c1");
        assert_eq!(config.session_timeout_hint, 250);
        assert_eq!(config.close_timeout, 100);
    }
}
