//! Cluster instance provisioning for CTO Platform.
//!
//! This crate converges a cluster's compute instances on a cloud provider
//! toward a desired count on behalf of the cluster orchestrator:
//!
//! - **Resume** previously stopped instances of the cluster when allowed
//! - **Create** the shortfall, rotating across candidate subnets (availability
//!   zones) when the provider rejects a launch
//! - **Stop / terminate / wait** for the cluster's instances as a group
//! - **Wait for SSH** on the cluster's nodes before handing them out
//!
//! ## Cluster identity
//!
//! Instances are grouped by the [`TagKey::ClusterName`] tag. The provisioner
//! keeps no local state: every call re-lists the cluster's instances from the
//! provider.
//!
//! ## Providers
//!
//! - **AWS** - EC2, via [`providers::Ec2`]
//!
//! ## Example
//!
//! ```ignore
//! use cto_provision::{Credentials, Ec2, NodeTemplate, Provisioner};
//!
//! let provisioner = Provisioner::new(Ec2::new(Credentials::from_env()?)?);
//! let template = NodeTemplate::from_file("node.yaml")?;
//!
//! let nodes = provisioner
//!     .ensure_count("us-east-1", "c1", &template, &Default::default(), 3, true)
//!     .await?;
//! ```

pub mod error;
pub mod providers;
pub mod provisioner;
pub mod ssh;
pub mod tags;
pub mod template;

pub use error::ProvisionError;
pub use providers::aws::{Credentials, Ec2};
pub use providers::{
    Filter, Instance, InstanceApi, InstanceState, ProviderError, WaitConfig,
};
pub use provisioner::{InstanceAddresses, InstanceMap, Provisioner, ProvisionerConfig};
pub use ssh::{wait_for_ssh, SshWaitConfig, SSH_PORT};
pub use tags::{merge_tag_specs, NodeStatus, Tag, TagKey, TagSpecification};
pub use template::{LaunchSpec, NodeTemplate};
