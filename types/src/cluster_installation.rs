use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::Millis;
use crate::id::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClusterInstallationState {
    CreationRequested,
    CreationInProgress,
    CreationFailed,
    Stable,
    ReconcilingRequested,
    ReconcilingFailed,
    DeletionRequested,
    DeletionInProgress,
    DeletionFailed,
    Deleted,
}

impl ClusterInstallationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterInstallationState::CreationRequested => "creation-requested",
            ClusterInstallationState::CreationInProgress => "creation-in-progress",
            ClusterInstallationState::CreationFailed => "creation-failed",
            ClusterInstallationState::Stable => "stable",
            ClusterInstallationState::ReconcilingRequested => "reconciling-requested",
            ClusterInstallationState::ReconcilingFailed => "reconciling-failed",
            ClusterInstallationState::DeletionRequested => "deletion-requested",
            ClusterInstallationState::DeletionInProgress => "deletion-in-progress",
            ClusterInstallationState::DeletionFailed => "deletion-failed",
            ClusterInstallationState::Deleted => "deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClusterInstallationState::Stable | ClusterInstallationState::Deleted
        )
    }
}

impl fmt::Display for ClusterInstallationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterInstallationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "creation-requested" => ClusterInstallationState::CreationRequested,
            "creation-in-progress" => ClusterInstallationState::CreationInProgress,
            "creation-failed" => ClusterInstallationState::CreationFailed,
            "stable" => ClusterInstallationState::Stable,
            "reconciling-requested" => ClusterInstallationState::ReconcilingRequested,
            "reconciling-failed" => ClusterInstallationState::ReconcilingFailed,
            "deletion-requested" => ClusterInstallationState::DeletionRequested,
            "deletion-in-progress" => ClusterInstallationState::DeletionInProgress,
            "deletion-failed" => ClusterInstallationState::DeletionFailed,
            "deleted" => ClusterInstallationState::Deleted,
            other => return Err(format!("unknown cluster installation state: {other}")),
        })
    }
}

/// Binding of one Installation to one Cluster in a specific namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInstallation {
    pub id: ResourceId,
    pub cluster_id: ResourceId,
    pub installation_id: ResourceId,
    pub namespace: String,
    pub is_active: bool,
    pub api_locked: bool,
    pub state: ClusterInstallationState,

    pub create_at: Millis,
    pub update_at: Millis,
    pub delete_at: Millis,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_acquired_by: Option<String>,
    #[serde(default)]
    pub lock_acquired_at: Millis,
}

impl ClusterInstallation {
    pub fn is_deleted(&self) -> bool {
        self.delete_at != 0
    }

    pub fn is_locked(&self) -> bool {
        self.lock_acquired_at != 0
    }
}

/// Moves every active binding on the source cluster to the target: the
/// first call stamps out inactive copies on the target, the DNS-switch
/// call flips which side is active once the copies are stable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateClusterInstallationsRequest {
    pub source_cluster_id: ResourceId,
    pub target_cluster_id: ResourceId,
    #[serde(default)]
    pub dns_switch: bool,
    #[serde(default)]
    pub lock_installation: bool,
}
