//! Provisioning errors.

use std::time::Duration;

use thiserror::Error;

use crate::providers::{InstanceState, ProviderError};

/// Errors returned by [`Provisioner`](crate::Provisioner) operations.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// Every launch attempt was rejected by the provider.
    #[error("Failed to launch instances: max attempts ({attempts}) exceeded")]
    ProvisioningExhausted {
        attempts: usize,
        #[source]
        source: ProviderError,
    },

    /// Waiting is only supported for running, stopped and terminated.
    #[error("Unsupported state to wait for: {0}")]
    UnsupportedState(InstanceState),

    /// Node template cannot be used to launch instances.
    #[error("Invalid node template: {0}")]
    InvalidTemplate(String),

    /// A node never served an SSH banner.
    #[error("SSH on {address} not ready after {waited:?}")]
    SshTimeout { address: String, waited: Duration },

    /// Provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}
