//! Node templates and launch specifications.
//!
//! A [`NodeTemplate`] is the caller's description of one node, written with the
//! provider's field names so it can be pasted from an existing cluster config:
//!
//! ```yaml
//! ImageId: ami-0123456789abcdef0
//! InstanceType: m6i.large
//! SubnetIds: [subnet-aaa, subnet-bbb]
//! SecurityGroupIds: [sg-123]
//! TagSpecifications:
//!   - ResourceType: instance
//!     Tags:
//!       - { Key: team, Value: infra }
//! ```
//!
//! `SubnetIds` is consumed by the provisioner and never sent to the provider;
//! each launch attempt pins exactly one subnet through [`LaunchSpec::subnet_id`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;
use crate::tags::TagSpecification;

/// Network interface attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkInterface {
    /// Position of the interface (0 is the primary interface).
    #[serde(default)]
    pub device_index: u32,
    /// Subnet to attach the interface to.
    pub subnet_id: Option<String>,
    /// Security groups for this interface.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Assign a public IPv4 address.
    pub associate_public_ip_address: Option<bool>,
    /// Delete the interface with the instance.
    pub delete_on_termination: Option<bool>,
}

/// EBS volume settings of a block device mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EbsBlockDevice {
    /// Volume size in GiB.
    pub volume_size: Option<u32>,
    /// Volume type (`gp3`, `io2`, ...).
    pub volume_type: Option<String>,
    /// Provisioned IOPS.
    pub iops: Option<u32>,
    /// Delete the volume with the instance.
    pub delete_on_termination: Option<bool>,
    /// Encrypt the volume.
    pub encrypted: Option<bool>,
}

/// Block device mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockDeviceMapping {
    /// Device name (e.g. `/dev/sda1`).
    pub device_name: String,
    /// EBS settings.
    pub ebs: Option<EbsBlockDevice>,
}

/// Instance profile, by ARN or by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IamInstanceProfile {
    pub arn: Option<String>,
    pub name: Option<String>,
}

/// Spot options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SpotOptions {
    /// Maximum hourly price.
    pub max_price: Option<String>,
    /// `one-time` or `persistent`.
    pub spot_instance_type: Option<String>,
    /// `terminate`, `stop` or `hibernate`.
    pub instance_interruption_behavior: Option<String>,
}

/// Market options (spot vs on-demand).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceMarketOptions {
    /// Only `spot` is accepted by the provider.
    pub market_type: String,
    pub spot_options: Option<SpotOptions>,
}

/// Caller-supplied description of how to launch one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct NodeTemplate {
    /// Machine image.
    pub image_id: Option<String>,
    /// Instance type.
    pub instance_type: Option<String>,
    /// SSH key pair name.
    pub key_name: Option<String>,
    /// Candidate subnets, tried in order across launch attempts.
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    /// Security groups (ignored when `NetworkInterfaces` is set).
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    /// Explicit network interface attachments.
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    pub iam_instance_profile: Option<IamInstanceProfile>,
    /// Plain-text user data; encoded before it is sent.
    pub user_data: Option<String>,
    pub instance_market_options: Option<InstanceMarketOptions>,
    /// User tag specifications, merged into the provisioner's own tags.
    #[serde(default)]
    pub tag_specifications: Vec<TagSpecification>,
}

impl NodeTemplate {
    /// Parse a template from YAML (JSON is accepted too, being a YAML subset).
    ///
    /// # Errors
    /// Returns [`ProvisionError::InvalidTemplate`] if the document does not
    /// describe a template.
    pub fn from_yaml(content: &str) -> Result<Self, ProvisionError> {
        serde_yaml::from_str(content)
            .map_err(|e| ProvisionError::InvalidTemplate(format!("failed to parse template: {e}")))
    }

    /// Load a template from a YAML or JSON file.
    ///
    /// # Errors
    /// Returns [`ProvisionError::InvalidTemplate`] if the file cannot be read
    /// or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ProvisionError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProvisionError::InvalidTemplate(format!("failed to read {}: {e}", path.display()))
        })?;

        if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content).map_err(|e| {
                ProvisionError::InvalidTemplate(format!("failed to parse {}: {e}", path.display()))
            })
        } else {
            Self::from_yaml(&content)
        }
    }

    /// Launch specification for this template, without placement or tags.
    ///
    /// Counts are set to 1; the caller fills in counts, subnet and tags.
    #[must_use]
    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            image_id: self.image_id.clone(),
            instance_type: self.instance_type.clone(),
            key_name: self.key_name.clone(),
            min_count: 1,
            max_count: 1,
            subnet_id: None,
            security_group_ids: self.security_group_ids.clone(),
            network_interfaces: self.network_interfaces.clone(),
            block_device_mappings: self.block_device_mappings.clone(),
            iam_instance_profile: self.iam_instance_profile.clone(),
            user_data: self.user_data.clone(),
            instance_market_options: self.instance_market_options.clone(),
            tag_specifications: Vec::new(),
        }
    }
}

/// A single launch request, as sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub image_id: Option<String>,
    pub instance_type: Option<String>,
    pub key_name: Option<String>,
    /// Minimum number of instances to launch.
    pub min_count: usize,
    /// Maximum number of instances to launch.
    pub max_count: usize,
    /// Subnet pinned for this attempt.
    pub subnet_id: Option<String>,
    pub security_group_ids: Vec<String>,
    pub network_interfaces: Vec<NetworkInterface>,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    pub iam_instance_profile: Option<IamInstanceProfile>,
    pub user_data: Option<String>,
    pub instance_market_options: Option<InstanceMarketOptions>,
    pub tag_specifications: Vec<TagSpecification>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r"
ImageId: ami-0123456789abcdef0
InstanceType: m6i.large
SubnetIds: [subnet-a, subnet-b]
SecurityGroupIds: [sg-1]
BlockDeviceMappings:
  - DeviceName: /dev/sda1
    Ebs: { VolumeSize: 256, VolumeType: gp3 }
TagSpecifications:
  - ResourceType: instance
    Tags:
      - { Key: team, Value: infra }
";

    #[test]
    fn test_parse_yaml_template() {
        let template = NodeTemplate::from_yaml(TEMPLATE).unwrap();
        assert_eq!(template.image_id.as_deref(), Some("ami-0123456789abcdef0"));
        assert_eq!(template.subnet_ids, vec!["subnet-a", "subnet-b"]);
        assert_eq!(template.block_device_mappings[0].ebs.as_ref().unwrap().volume_size, Some(256));
        assert_eq!(template.tag_specifications[0].tags[0].key, "team");
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = NodeTemplate::from_yaml("ImageId: ami-1\nSubnetId: subnet-a\n").unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidTemplate(_)));
    }

    #[test]
    fn test_launch_spec_drops_subnet_candidates_and_tags() {
        let template = NodeTemplate::from_yaml(TEMPLATE).unwrap();
        let spec = template.launch_spec();
        assert_eq!(spec.subnet_id, None);
        assert!(spec.tag_specifications.is_empty());
        assert_eq!(spec.security_group_ids, vec!["sg-1"]);
        assert_eq!(spec.instance_type.as_deref(), Some("m6i.large"));
    }
}
