use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::Millis;
use crate::id::ResourceId;

macro_rules! simple_state_enum {
    ($name:ident { $($variant:ident => $str:literal),+ $(,)? } terminal: [$($terminal:ident),* $(,)?]) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "kebab-case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $str),+
                }
            }

            pub fn is_terminal(&self) -> bool {
                matches!(self, $(Self::$terminal)|*)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($str => Ok(Self::$variant)),+,
                    other => Err(format!("unknown {} state: {}", stringify!($name), other)),
                }
            }
        }
    };
}

simple_state_enum!(DbMigrationState {
    Requested => "requested",
    InProgress => "in-progress",
    Succeeded => "succeeded",
    Failed => "failed",
    FailedCommitted => "failed-committed",
    Committed => "committed",
    RollbackRequested => "rollback-requested",
    RollbackInProgress => "rollback-in-progress",
    RollbackSucceeded => "rollback-succeeded",
    RollbackFailed => "rollback-failed",
} terminal: [Succeeded, FailedCommitted, Committed, RollbackSucceeded]);

simple_state_enum!(DbRestorationState {
    Requested => "requested",
    InProgress => "in-progress",
    Succeeded => "succeeded",
    Failed => "failed",
} terminal: [Succeeded]);

simple_state_enum!(BackupState {
    BackupRequested => "backup-requested",
    BackupInProgress => "backup-in-progress",
    BackupSucceeded => "backup-succeeded",
    BackupFailed => "backup-failed",
} terminal: [BackupSucceeded]);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationDbMigrationOperation {
    pub id: ResourceId,
    pub installation_id: ResourceId,
    pub source_cluster_installation_id: Option<ResourceId>,
    pub destination_cluster_installation_id: Option<ResourceId>,
    pub backup_id: Option<ResourceId>,
    pub state: DbMigrationState,

    pub request_at: Millis,
    pub create_at: Millis,
    pub update_at: Millis,
    pub delete_at: Millis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationDbRestorationOperation {
    pub id: ResourceId,
    pub installation_id: ResourceId,
    pub backup_id: ResourceId,
    pub cluster_installation_id: Option<ResourceId>,
    pub state: DbRestorationState,

    pub request_at: Millis,
    pub create_at: Millis,
    pub update_at: Millis,
    pub delete_at: Millis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationBackup {
    pub id: ResourceId,
    pub installation_id: ResourceId,
    pub cluster_installation_id: Option<ResourceId>,
    pub data_residence: Option<String>,
    pub state: BackupState,

    pub request_at: Millis,
    pub start_at: Millis,
    pub delete_at: Millis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDbMigrationRequest {
    pub installation_id: ResourceId,
    #[serde(default)]
    pub destination_database_id: Option<ResourceId>,
    #[serde(default)]
    pub backup_id: Option<ResourceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDbRestorationRequest {
    pub installation_id: ResourceId,
    pub backup_id: ResourceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBackupRequest {
    pub installation_id: ResourceId,
}
