//! Cloud provider abstractions.
//!
//! This module defines the instance API trait the provisioner drives and the
//! provider implementations behind it.

pub mod aws;
mod traits;

pub use traits::{
    Filter, Instance, InstanceApi, InstanceState, ParseStateError, ProviderError, WaitConfig,
};

// Re-export provider clients
pub use aws::Ec2;
