//! AWS (Amazon Web Services) EC2 provider.
//!
//! Implements the [`InstanceApi`](crate::providers::InstanceApi) trait over the
//! EC2 Query API.
//!
//! ## Instance lifecycle
//!
//! `pending` → `running` → `stopping` → `stopped` → (`pending` on start)
//!
//! Any state → `shutting-down` → `terminated`.
//!
//! Only stopped instances can be started; a stopping instance must be waited on
//! first.
//!
//! ## Placement
//!
//! A launch pins one subnet, and with it one availability zone. Capacity
//! errors (`InsufficientInstanceCapacity`, `Unsupported`) are usually local to
//! a zone, so the provisioner rotates through the candidate subnets. Traffic
//! between zones of one region is billed, which is why the first listed
//! subnet is always tried first.

mod client;
mod credentials;
mod models;
mod signing;

pub use client::Ec2;
pub use credentials::Credentials;
pub use models::*;
