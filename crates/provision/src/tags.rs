//! Tag vocabulary shared with the cluster orchestrator, and tag merging.
//!
//! Every instance belonging to a cluster carries [`TagKey::ClusterName`]; all
//! lookups of "this cluster's instances" are filters on that tag.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Resource type of the tag specification that applies to instances.
pub const RESOURCE_TYPE_INSTANCE: &str = "instance";

/// Tag keys understood by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKey {
    /// Display name shown in the provider console.
    Name,
    /// Uniquely identifies all nodes of a cluster.
    ClusterName,
    /// Name of the node.
    NodeName,
    /// User defined node type (e.g. `m4xl_spot`), for multi node type clusters.
    UserNodeType,
    /// Current state of the node, see [`NodeStatus`].
    NodeStatus,
    /// Hash of the node runtime config, used to decide if updates are needed.
    RuntimeConfig,
    /// Hash of the contents of the file mounts (and synced files on workers).
    FileMountsContents,
}

impl TagKey {
    /// Every key in the vocabulary.
    pub const ALL: [Self; 7] = [
        Self::Name,
        Self::ClusterName,
        Self::NodeName,
        Self::UserNodeType,
        Self::NodeStatus,
        Self::RuntimeConfig,
        Self::FileMountsContents,
    ];

    /// Tag key as sent to the provider.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Name => "Name",
            Self::ClusterName => "ray-cluster-name",
            Self::NodeName => "ray-node-name",
            Self::UserNodeType => "ray-user-node-type",
            Self::NodeStatus => "ray-node-status",
            Self::RuntimeConfig => "ray-runtime-config",
            Self::FileMountsContents => "ray-file-mounts-contents",
        }
    }
}

impl std::fmt::Display for TagKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values of the [`TagKey::NodeStatus`] tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    Uninitialized,
    WaitingForSsh,
    SyncingFiles,
    SettingUp,
    UpdateFailed,
    UpToDate,
}

impl NodeStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::WaitingForSsh => "waiting-for-ssh",
            Self::SyncingFiles => "syncing-files",
            Self::SettingUp => "setting-up",
            Self::UpdateFailed => "update-failed",
            Self::UpToDate => "up-to-date",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown node status.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown node status: {0}")]
pub struct ParseNodeStatusError(pub String);

impl FromStr for NodeStatus {
    type Err = ParseNodeStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninitialized" => Ok(Self::Uninitialized),
            "waiting-for-ssh" => Ok(Self::WaitingForSsh),
            "syncing-files" => Ok(Self::SyncingFiles),
            "setting-up" => Ok(Self::SettingUp),
            "update-failed" => Ok(Self::UpdateFailed),
            "up-to-date" => Ok(Self::UpToDate),
            other => Err(ParseNodeStatusError(other.to_string())),
        }
    }
}

/// A single key/value tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Tags to attach to one kind of resource at creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TagSpecification {
    /// Resource type (`instance`, `volume`, `network-interface`, ...).
    pub resource_type: String,
    /// Tags for that resource type.
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl TagSpecification {
    /// Tag specification for instances.
    #[must_use]
    pub fn instance(tags: Vec<Tag>) -> Self {
        Self {
            resource_type: RESOURCE_TYPE_INSTANCE.to_string(),
            tags,
        }
    }

    fn is_instance(&self) -> bool {
        self.resource_type == RESOURCE_TYPE_INSTANCE
    }
}

/// Convert a tag map into the provider's list form.
#[must_use]
pub fn format_tags(tags: &BTreeMap<String, String>) -> Vec<Tag> {
    tags.iter().map(|(k, v)| Tag::new(k, v)).collect()
}

/// Merge user-provided tag specifications into the base specifications.
///
/// Only the `instance` resource type is merged: user tags overwrite base
/// tags with the same key and new keys are appended. Specifications for any
/// other resource type are appended unchanged. `tag_specs` is modified in
/// place; if it holds no instance entry, one is added first.
pub fn merge_tag_specs(tag_specs: &mut Vec<TagSpecification>, user_tag_specs: &[TagSpecification]) {
    for user_spec in user_tag_specs {
        if !user_spec.is_instance() {
            tag_specs.push(user_spec.clone());
            continue;
        }

        let base = if let Some(idx) = tag_specs.iter().position(TagSpecification::is_instance) {
            &mut tag_specs[idx]
        } else {
            tag_specs.insert(0, TagSpecification::instance(Vec::new()));
            &mut tag_specs[0]
        };

        for user_tag in &user_spec.tags {
            match base.tags.iter_mut().find(|t| t.key == user_tag.key) {
                Some(existing) => existing.value.clone_from(&user_tag.value),
                None => base.tags.push(user_tag.clone()),
            }
        }
    }
}
