use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::{Annotation, LockState, Millis};
use crate::id::ResourceId;

/// A managed compute substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterState {
    CreationRequested,
    CreationInProgress,
    CreationFailed,
    ProvisioningRequested,
    Stable,
    UpgradeRequested,
    UpgradeFailed,
    ResizeRequested,
    ResizeFailed,
    DeletionRequested,
    DeletionInProgress,
    DeletionFailed,
    Deleted,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::CreationRequested => "creation-requested",
            ClusterState::CreationInProgress => "creation-in-progress",
            ClusterState::CreationFailed => "creation-failed",
            ClusterState::ProvisioningRequested => "provisioning-requested",
            ClusterState::Stable => "stable",
            ClusterState::UpgradeRequested => "upgrade-requested",
            ClusterState::UpgradeFailed => "upgrade-failed",
            ClusterState::ResizeRequested => "resize-requested",
            ClusterState::ResizeFailed => "resize-failed",
            ClusterState::DeletionRequested => "deletion-requested",
            ClusterState::DeletionInProgress => "deletion-in-progress",
            ClusterState::DeletionFailed => "deletion-failed",
            ClusterState::Deleted => "deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ClusterState::Stable | ClusterState::Deleted)
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "creation-requested" => ClusterState::CreationRequested,
            "creation-in-progress" => ClusterState::CreationInProgress,
            "creation-failed" => ClusterState::CreationFailed,
            "provisioning-requested" => ClusterState::ProvisioningRequested,
            "stable" => ClusterState::Stable,
            "upgrade-requested" => ClusterState::UpgradeRequested,
            "upgrade-failed" => ClusterState::UpgradeFailed,
            "resize-requested" => ClusterState::ResizeRequested,
            "resize-failed" => ClusterState::ResizeFailed,
            "deletion-requested" => ClusterState::DeletionRequested,
            "deletion-in-progress" => ClusterState::DeletionInProgress,
            "deletion-failed" => ClusterState::DeletionFailed,
            "deleted" => ClusterState::Deleted,
            other => return Err(format!("unknown cluster state: {other}")),
        })
    }
}

/// A pending change to a cluster's provisioner-visible shape (version,
/// sizing, ...), recorded alongside the current provisioner metadata so a
/// retried transition is idempotent with respect to the target.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

/// A utility's desired chart + values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UtilityVersion {
    pub chart: String,
    pub values_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionerMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_size: Option<String>,
    #[serde(default)]
    pub change_request: ChangeRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ResourceId,
    pub provider: String,
    pub size: String,
    pub zones: Vec<String>,
    pub utility_versions: BTreeMap<String, UtilityVersion>,
    pub provisioner_metadata: ProvisionerMetadata,
    pub allow_installations: bool,
    pub annotations: Vec<Annotation>,
    pub state: ClusterState,

    pub create_at: Millis,
    pub update_at: Millis,
    pub delete_at: Millis,

    #[serde(flatten)]
    pub lock: LockState,
}

impl Cluster {
    pub fn is_deleted(&self) -> bool {
        self.delete_at != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClusterRequest {
    pub provider: String,
    #[serde(default = "default_cluster_size")]
    pub size: String,
    pub zones: Vec<String>,
    #[serde(default)]
    pub utility_versions: BTreeMap<String, UtilityVersion>,
    #[serde(default)]
    pub allow_installations: bool,
    #[serde(default)]
    pub annotations: Vec<String>,
}

fn default_cluster_size() -> String {
    "SizeAlef500".to_string()
}
