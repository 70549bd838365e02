//! Provider instance API trait and common types.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tags::{Tag, TagKey};
use crate::template::LaunchSpec;

/// Errors that can occur during provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// HTTP request failed before the provider answered.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider answered with an error document.
    #[error("API error: {status} {code} - {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// Waiter gave up before the target state was observed.
    #[error("Waiter for '{target}' gave up after {attempts} attempts")]
    Timeout {
        target: InstanceState,
        attempts: u32,
    },

    /// Waiter observed a state from which the target is unreachable.
    #[error("Waiter for '{target}' failed: instance {instance_id} is '{observed}'")]
    WaiterFailed {
        target: InstanceState,
        instance_id: String,
        observed: InstanceState,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Response body could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Whether the provider itself rejected the request.
    ///
    /// Only these errors are safe to retry with a different placement: the
    /// request was received and refused, so nothing was created. Transport
    /// failures may hide a successful launch and are never retried.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Api { .. })
    }
}

/// Instance lifecycle state as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Instance is launching or starting.
    Pending,
    /// Instance is running.
    Running,
    /// Instance is stopping.
    Stopping,
    /// Instance is stopped and can be started again.
    Stopped,
    /// Instance is being terminated.
    ShuttingDown,
    /// Instance is gone.
    Terminated,
}

impl InstanceState {
    /// Provider name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown lifecycle state name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown instance state: {0}")]
pub struct ParseStateError(pub String);

impl FromStr for InstanceState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            "shutting-down" => Ok(Self::ShuttingDown),
            "terminated" => Ok(Self::Terminated),
            other => Err(ParseStateError(other.to_string())),
        }
    }
}

/// A provider instance, as observed by the last call that returned it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Provider-assigned instance identifier.
    pub id: String,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Instance type.
    pub instance_type: Option<String>,
    /// Private IPv4 address.
    pub private_ip: Option<String>,
    /// Public IPv4 address.
    pub public_ip: Option<String>,
    /// Tags attached to the instance.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// Attribute filter for instance listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Attribute name (e.g. `instance-state-name`, `tag:Name`).
    pub name: String,
    /// Allowed values; an instance matches if its attribute equals any of them.
    pub values: Vec<String>,
}

impl Filter {
    /// Create a filter on an arbitrary attribute.
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Match instances carrying `key` with one of `values`.
    pub fn tag<I, S>(key: TagKey, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(format!("tag:{}", key.as_str()), values)
    }

    /// Match instances in any of the given lifecycle states.
    #[must_use]
    pub fn states(states: &[InstanceState]) -> Self {
        Self::new("instance-state-name", states.iter().map(|s| s.as_str()))
    }

    /// Match instances by id.
    #[must_use]
    pub fn instance_ids(ids: &[String]) -> Self {
        Self::new("instance-id", ids.iter().cloned())
    }
}

/// Polling cadence for [`InstanceApi::wait_until`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    /// Delay between polls.
    pub delay: Duration,
    /// Number of polls before giving up.
    pub max_attempts: u32,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_attempts: 40,
        }
    }
}

/// The provider's instance-management API.
///
/// Every call is a one-shot request against the provider control plane.
/// Implementations must not retry internally: retry policy belongs to the
/// caller.
#[async_trait]
pub trait InstanceApi: Send + Sync {
    /// List instances matching every filter.
    async fn list_instances(
        &self,
        region: &str,
        filters: &[Filter],
    ) -> Result<Vec<Instance>, ProviderError>;

    /// Launch instances described by `spec`.
    async fn create_instances(
        &self,
        region: &str,
        spec: LaunchSpec,
    ) -> Result<Vec<Instance>, ProviderError>;

    /// Start stopped instances.
    async fn start_instances(&self, region: &str, ids: &[String]) -> Result<(), ProviderError>;

    /// Stop running instances.
    async fn stop_instances(&self, region: &str, ids: &[String]) -> Result<(), ProviderError>;

    /// Terminate instances.
    async fn terminate_instances(&self, region: &str, ids: &[String])
        -> Result<(), ProviderError>;

    /// Attach (or overwrite) tags on instances.
    async fn create_tags(
        &self,
        region: &str,
        ids: &[String],
        tags: &[Tag],
    ) -> Result<(), ProviderError>;

    /// Block until every instance matching `filters` is in `target`.
    async fn wait_until(
        &self,
        region: &str,
        filters: &[Filter],
        target: InstanceState,
        config: WaitConfig,
    ) -> Result<(), ProviderError>;
}
