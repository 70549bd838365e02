//! EC2 Query API response models.
//!
//! EC2 answers in XML with camelCase element names; repeated children are
//! wrapped in `<item>` elements inside a `...Set` element.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::providers::traits::{Instance, InstanceState, ProviderError};

/// A `...Set` element holding repeated `<item>` children.
#[derive(Debug, Clone, Deserialize)]
pub struct ItemSet<T> {
    #[serde(rename = "item", default = "Vec::new")]
    pub items: Vec<T>,
}

impl<T> Default for ItemSet<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

/// `DescribeInstances` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescribeInstancesResponse {
    #[serde(default)]
    pub reservation_set: ItemSet<Reservation>,
    /// Present when more pages are available.
    pub next_token: Option<String>,
}

/// A reservation (one launch request) and its instances.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    #[serde(default)]
    pub instances_set: ItemSet<Ec2Instance>,
}

/// `RunInstances` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInstancesResponse {
    #[serde(default)]
    pub instances_set: ItemSet<Ec2Instance>,
}

/// Instance state element.
#[derive(Debug, Clone, Deserialize)]
pub struct Ec2InstanceState {
    /// Numeric state code (16 = running, 80 = stopped, ...).
    pub code: Option<u16>,
    /// State name.
    pub name: String,
}

/// Instance tag.
#[derive(Debug, Clone, Deserialize)]
pub struct Ec2Tag {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// EC2 instance information.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ec2Instance {
    /// Instance ID.
    pub instance_id: String,
    /// Instance state.
    pub instance_state: Ec2InstanceState,
    /// Instance type.
    pub instance_type: Option<String>,
    /// Private IP address.
    pub private_ip_address: Option<String>,
    /// Public IP address.
    pub ip_address: Option<String>,
    /// Tags.
    #[serde(default)]
    pub tag_set: ItemSet<Ec2Tag>,
}

impl Ec2Instance {
    /// Convert into the provider-neutral instance record.
    ///
    /// # Errors
    /// Returns [`ProviderError::Decode`] for an unknown state name.
    pub fn into_instance(self) -> Result<Instance, ProviderError> {
        let state: InstanceState = self
            .instance_state
            .name
            .parse()
            .map_err(|e| ProviderError::Decode(format!("{} for {}", e, self.instance_id)))?;

        Ok(Instance {
            id: self.instance_id,
            state,
            instance_type: self.instance_type,
            private_ip: self.private_ip_address,
            public_ip: self.ip_address,
            tags: self
                .tag_set
                .items
                .into_iter()
                .map(|t| (t.key, t.value))
                .collect::<BTreeMap<_, _>>(),
        })
    }
}

/// Error document returned with a non-2xx status.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "Errors")]
    pub errors: ErrorList,
    #[serde(rename = "RequestID")]
    pub request_id: Option<String>,
}

/// List of errors in an error document.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorList {
    #[serde(rename = "Error", default)]
    pub error: Vec<ErrorDetail>,
}

/// A single error.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Message", default)]
    pub message: String,
}
