use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::{Annotation, EnvVar, LockState, Millis};
use crate::id::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallationState {
    CreationRequested,
    CreationInProgress,
    CreationFailed,
    Stable,
    UpdateRequested,
    UpdateInProgress,
    UpdateFailed,
    HibernationRequested,
    HibernationInProgress,
    Hibernating,
    WakeUpRequested,
    DbMigrationInProgress,
    DbMigrationRollbackInProgress,
    DbMigrationFailed,
    DbRestorationInProgress,
    DbRestorationFailed,
    DeletionPendingRequested,
    DeletionPending,
    DeletionCancellationRequested,
    DeletionRequested,
    DeletionInProgress,
    DeletionFailed,
    Deleted,
}

impl InstallationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallationState::CreationRequested => "creation-requested",
            InstallationState::CreationInProgress => "creation-in-progress",
            InstallationState::CreationFailed => "creation-failed",
            InstallationState::Stable => "stable",
            InstallationState::UpdateRequested => "update-requested",
            InstallationState::UpdateInProgress => "update-in-progress",
            InstallationState::UpdateFailed => "update-failed",
            InstallationState::HibernationRequested => "hibernation-requested",
            InstallationState::HibernationInProgress => "hibernation-in-progress",
            InstallationState::Hibernating => "hibernating",
            InstallationState::WakeUpRequested => "wake-up-requested",
            InstallationState::DbMigrationInProgress => "db-migration-in-progress",
            InstallationState::DbMigrationRollbackInProgress => {
                "db-migration-rollback-in-progress"
            }
            InstallationState::DbMigrationFailed => "db-migration-failed",
            InstallationState::DbRestorationInProgress => "db-restoration-in-progress",
            InstallationState::DbRestorationFailed => "db-restoration-failed",
            InstallationState::DeletionPendingRequested => "deletion-pending-requested",
            InstallationState::DeletionPending => "deletion-pending",
            InstallationState::DeletionCancellationRequested => "deletion-cancellation-requested",
            InstallationState::DeletionRequested => "deletion-requested",
            InstallationState::DeletionInProgress => "deletion-in-progress",
            InstallationState::DeletionFailed => "deletion-failed",
            InstallationState::Deleted => "deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstallationState::Stable
                | InstallationState::Hibernating
                | InstallationState::Deleted
        )
    }

    /// States in which the installation is mid creation or mid deletion,
    /// where an admitted Delete goes straight to `deletion-requested`
    /// instead of through the soft `deletion-pending` detour.
    pub fn is_creation_or_deletion_in_progress(&self) -> bool {
        matches!(
            self,
            InstallationState::CreationRequested
                | InstallationState::CreationInProgress
                | InstallationState::CreationFailed
                | InstallationState::DeletionRequested
                | InstallationState::DeletionInProgress
                | InstallationState::DeletionFailed
        )
    }
}

impl fmt::Display for InstallationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "creation-requested" => InstallationState::CreationRequested,
            "creation-in-progress" => InstallationState::CreationInProgress,
            "creation-failed" => InstallationState::CreationFailed,
            "stable" => InstallationState::Stable,
            "update-requested" => InstallationState::UpdateRequested,
            "update-in-progress" => InstallationState::UpdateInProgress,
            "update-failed" => InstallationState::UpdateFailed,
            "hibernation-requested" => InstallationState::HibernationRequested,
            "hibernation-in-progress" => InstallationState::HibernationInProgress,
            "hibernating" => InstallationState::Hibernating,
            "wake-up-requested" => InstallationState::WakeUpRequested,
            "db-migration-in-progress" => InstallationState::DbMigrationInProgress,
            "db-migration-rollback-in-progress" => {
                InstallationState::DbMigrationRollbackInProgress
            }
            "db-migration-failed" => InstallationState::DbMigrationFailed,
            "db-restoration-in-progress" => InstallationState::DbRestorationInProgress,
            "db-restoration-failed" => InstallationState::DbRestorationFailed,
            "deletion-pending-requested" => InstallationState::DeletionPendingRequested,
            "deletion-pending" => InstallationState::DeletionPending,
            "deletion-cancellation-requested" => InstallationState::DeletionCancellationRequested,
            "deletion-requested" => InstallationState::DeletionRequested,
            "deletion-in-progress" => InstallationState::DeletionInProgress,
            "deletion-failed" => InstallationState::DeletionFailed,
            "deleted" => InstallationState::Deleted,
            other => return Err(format!("unknown installation state: {other}")),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DnsRecord {
    pub domain_name: String,
    pub primary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Affinity {
    Isolated,
    MultiTenant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseKind {
    SingleTenantRdsPostgres,
    SingleTenantRdsMysql,
    MultiTenantRdsPostgres,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilestoreKind {
    Bifrost,
    AwsS3,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Volume {
    pub volume_type: String,
    pub mount_path: String,
    pub read_only: bool,
    pub backing_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExternalDatabaseConfig {
    pub secret_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SingleTenantDatabaseConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_instance_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DatabaseConfig {
    SingleTenant(SingleTenantDatabaseConfig),
    External(ExternalDatabaseConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Installation {
    pub id: ResourceId,
    pub owner_id: String,
    pub dns_records: Vec<DnsRecord>,
    /// Derived from the primary DNS record; empty until one is set.
    pub name: String,
    pub image: String,
    pub version: String,
    pub license: Option<String>,
    pub size: String,
    pub affinity: Affinity,
    pub database: DatabaseKind,
    pub filestore: FilestoreKind,
    pub mattermost_env: BTreeMap<String, EnvVar>,
    pub priority_env: BTreeMap<String, EnvVar>,
    pub volumes: BTreeMap<String, Volume>,
    pub cr_version: String,
    pub group_id: Option<ResourceId>,
    pub group_sequence: Option<i64>,
    pub database_config: Option<DatabaseConfig>,
    pub annotations: Vec<Annotation>,
    pub deletion_locked: bool,
    pub deletion_pending_expiry: Millis,
    pub state: InstallationState,

    pub create_at: Millis,
    pub update_at: Millis,
    pub delete_at: Millis,

    #[serde(flatten)]
    pub lock: LockState,
}

impl Installation {
    pub fn primary_dns(&self) -> Option<&DnsRecord> {
        self.dns_records.iter().find(|d| d.primary)
    }

    pub fn is_deleted(&self) -> bool {
        self.delete_at != 0
    }

    /// Exactly one primary record among live DNS records.
    pub fn has_single_primary(&self) -> bool {
        self.dns_records.is_empty() || self.dns_records.iter().filter(|d| d.primary).count() == 1
    }

    /// group_id and group_sequence are always set or unset together.
    pub fn group_fields_consistent(&self) -> bool {
        self.group_id.is_some() == self.group_sequence.is_some()
    }

    /// Folds a group's shared config into this installation: version and
    /// image come from the group, group env is layered under the
    /// installation's own env, and PriorityEnv wins over everything.
    pub fn apply_group(&mut self, group: &crate::Group) {
        self.version = group.version.clone();
        self.image = group.image.clone();
        let mut env = group.mattermost_env.clone();
        env.extend(self.mattermost_env.clone());
        env.extend(self.priority_env.clone());
        self.mattermost_env = env;
        self.group_id = Some(group.id.clone());
        self.group_sequence = Some(group.sequence);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstallationRequest {
    pub owner_id: String,
    pub dns: String,
    pub image: String,
    pub version: String,
    #[serde(default)]
    pub license: Option<String>,
    pub size: String,
    pub affinity: Affinity,
    pub database: DatabaseKind,
    pub filestore: FilestoreKind,
    #[serde(default)]
    pub mattermost_env: BTreeMap<String, EnvVar>,
    #[serde(default)]
    pub priority_env: BTreeMap<String, EnvVar>,
    #[serde(default)]
    pub volumes: BTreeMap<String, Volume>,
    #[serde(default)]
    pub group_id: Option<ResourceId>,
    #[serde(default)]
    pub database_config: Option<DatabaseConfig>,
    #[serde(default)]
    pub annotations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeleteInstallationRequest {
    /// Per-request override of the soft-deletion expiry, bounded by a
    /// configurable cap.
    #[serde(default)]
    pub expiry_override_ms: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Group;

    #[test]
    fn apply_group_layers_env_with_priority_on_top() {
        let mut installation = Installation {
            id: ResourceId::new(),
            owner_id: "owner".into(),
            dns_records: vec![],
            name: String::new(),
            image: "old-image".into(),
            version: "1.0.0".into(),
            license: None,
            size: "100users".into(),
            affinity: Affinity::MultiTenant,
            database: DatabaseKind::MultiTenantRdsPostgres,
            filestore: FilestoreKind::Bifrost,
            mattermost_env: BTreeMap::from([
                ("A".to_string(), EnvVar::value("installation")),
                ("B".to_string(), EnvVar::value("installation")),
            ]),
            priority_env: BTreeMap::from([("B".to_string(), EnvVar::value("priority"))]),
            volumes: BTreeMap::new(),
            cr_version: "0".into(),
            group_id: None,
            group_sequence: None,
            database_config: None,
            annotations: vec![],
            deletion_locked: false,
            deletion_pending_expiry: 0,
            state: InstallationState::Stable,
            create_at: 1,
            update_at: 1,
            delete_at: 0,
            lock: Default::default(),
        };
        let group = Group {
            id: ResourceId::new(),
            name: "g".into(),
            version: "2.0.0".into(),
            image: "group-image".into(),
            mattermost_env: BTreeMap::from([
                ("A".to_string(), EnvVar::value("group")),
                ("C".to_string(), EnvVar::value("group")),
            ]),
            max_rolling: 1,
            annotations: vec![],
            sequence: 7,
            create_at: 1,
            update_at: 1,
            delete_at: 0,
        };

        installation.apply_group(&group);

        assert_eq!(installation.version, "2.0.0");
        assert_eq!(installation.image, "group-image");
        assert_eq!(installation.group_sequence, Some(7));
        // installation env beats group env, priority env beats both
        assert_eq!(installation.mattermost_env["A"], EnvVar::value("installation"));
        assert_eq!(installation.mattermost_env["B"], EnvVar::value("priority"));
        assert_eq!(installation.mattermost_env["C"], EnvVar::value("group"));
    }

    #[test]
    fn single_primary_invariant() {
        let installation = Installation {
            id: ResourceId::new(),
            owner_id: "owner".into(),
            dns_records: vec![
                DnsRecord { domain_name: "a.example.com".into(), primary: true },
                DnsRecord { domain_name: "b.example.com".into(), primary: false },
            ],
            name: "a.example.com".into(),
            image: "mattermost".into(),
            version: "1.0.0".into(),
            license: None,
            size: "100users".into(),
            affinity: Affinity::Isolated,
            database: DatabaseKind::SingleTenantRdsPostgres,
            filestore: FilestoreKind::AwsS3,
            mattermost_env: BTreeMap::new(),
            priority_env: BTreeMap::new(),
            volumes: BTreeMap::new(),
            cr_version: "0".into(),
            group_id: None,
            group_sequence: None,
            database_config: None,
            annotations: vec![],
            deletion_locked: false,
            deletion_pending_expiry: 0,
            state: InstallationState::Stable,
            create_at: 1,
            update_at: 1,
            delete_at: 0,
            lock: Default::default(),
        };
        assert!(installation.has_single_primary());
        assert_eq!(
            installation.primary_dns().map(|d| d.domain_name.as_str()),
            Some("a.example.com")
        );
    }
}
