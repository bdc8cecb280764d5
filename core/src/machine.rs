//! The state machines are lookup tables keyed by `(action, from-state)`,
//! not a trait hierarchy: every resource type's legal transitions are data,
//! so adding an action is adding a row rather than a new `impl`.
//!
//! Rows where the target equals the source make re-requesting an already
//! requested transition a no-op success instead of an error.

use orchestrator_types::{
    ClusterInstallationState, ClusterState, DbMigrationState, InstallationState,
};

use crate::error::{Error, Result};

/// An admitted client-facing intent. A handful of actions only apply to
/// one resource type (`AssignGroup`); the registry is shared so the
/// Admission layer has one vocabulary to validate requests against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Retry,
    Update,
    Delete,
    CancelDeletion,
    Provision,
    Upgrade,
    Resize,
    DbMigrate,
    RollbackDbMigration,
    Restore,
    Wakeup,
    Hibernate,
    AddDns,
    SetPrimaryDns,
    DeleteDns,
    JoinGroup,
    LeaveGroup,
    AssignGroup,
    AddAnnotation,
    DeleteAnnotation,
    AddVolume,
    UpdateVolume,
    DeleteVolume,
}

macro_rules! transition_table {
    ($name:ident : $state:ty => [$(($action:expr, $from:expr, $to:expr)),+ $(,)?]) => {
        pub fn $name(action: Action, from: $state) -> Result<$state> {
            $(if action == $action && from == $from {
                return Ok($to);
            })+
            Err(Error::precondition(format!(
                "{:?} is not valid from state {}",
                action, from
            )))
        }
    };
}

transition_table!(cluster_next: ClusterState => [
    (Action::Create, ClusterState::CreationRequested, ClusterState::CreationRequested),
    // retry re-requests whatever phase last failed
    (Action::Retry, ClusterState::CreationRequested, ClusterState::CreationRequested),
    (Action::Retry, ClusterState::CreationFailed, ClusterState::CreationRequested),
    (Action::Retry, ClusterState::UpgradeFailed, ClusterState::UpgradeRequested),
    (Action::Retry, ClusterState::ResizeFailed, ClusterState::ResizeRequested),
    (Action::Retry, ClusterState::DeletionFailed, ClusterState::DeletionRequested),
    // provision may be re-requested from any non-deletion state
    (Action::Provision, ClusterState::CreationRequested, ClusterState::ProvisioningRequested),
    (Action::Provision, ClusterState::CreationInProgress, ClusterState::ProvisioningRequested),
    (Action::Provision, ClusterState::CreationFailed, ClusterState::ProvisioningRequested),
    (Action::Provision, ClusterState::ProvisioningRequested, ClusterState::ProvisioningRequested),
    (Action::Provision, ClusterState::Stable, ClusterState::ProvisioningRequested),
    (Action::Provision, ClusterState::UpgradeRequested, ClusterState::ProvisioningRequested),
    (Action::Provision, ClusterState::UpgradeFailed, ClusterState::ProvisioningRequested),
    (Action::Provision, ClusterState::ResizeRequested, ClusterState::ProvisioningRequested),
    (Action::Provision, ClusterState::ResizeFailed, ClusterState::ProvisioningRequested),
    (Action::Upgrade, ClusterState::Stable, ClusterState::UpgradeRequested),
    (Action::Upgrade, ClusterState::UpgradeRequested, ClusterState::UpgradeRequested),
    (Action::Upgrade, ClusterState::UpgradeFailed, ClusterState::UpgradeRequested),
    (Action::Resize, ClusterState::Stable, ClusterState::ResizeRequested),
    (Action::Resize, ClusterState::ResizeRequested, ClusterState::ResizeRequested),
    (Action::Resize, ClusterState::ResizeFailed, ClusterState::ResizeRequested),
    // delete is allowed from everything except mid-creation and the
    // deletion terminal itself
    (Action::Delete, ClusterState::CreationRequested, ClusterState::DeletionRequested),
    (Action::Delete, ClusterState::CreationFailed, ClusterState::DeletionRequested),
    (Action::Delete, ClusterState::ProvisioningRequested, ClusterState::DeletionRequested),
    (Action::Delete, ClusterState::Stable, ClusterState::DeletionRequested),
    (Action::Delete, ClusterState::UpgradeRequested, ClusterState::DeletionRequested),
    (Action::Delete, ClusterState::UpgradeFailed, ClusterState::DeletionRequested),
    (Action::Delete, ClusterState::ResizeRequested, ClusterState::DeletionRequested),
    (Action::Delete, ClusterState::ResizeFailed, ClusterState::DeletionRequested),
    (Action::Delete, ClusterState::DeletionRequested, ClusterState::DeletionRequested),
    (Action::Delete, ClusterState::DeletionFailed, ClusterState::DeletionRequested),
    (Action::AddAnnotation, ClusterState::Stable, ClusterState::Stable),
    (Action::DeleteAnnotation, ClusterState::Stable, ClusterState::Stable),
]);

transition_table!(installation_next: InstallationState => [
    (Action::Create, InstallationState::CreationRequested, InstallationState::CreationRequested),
    (Action::Retry, InstallationState::CreationRequested, InstallationState::CreationRequested),
    (Action::Retry, InstallationState::CreationFailed, InstallationState::CreationRequested),
    (Action::Retry, InstallationState::UpdateFailed, InstallationState::UpdateRequested),
    (Action::Retry, InstallationState::DeletionFailed, InstallationState::DeletionRequested),
    (Action::Retry, InstallationState::DbMigrationFailed, InstallationState::DbMigrationInProgress),
    (Action::Retry, InstallationState::DbRestorationFailed, InstallationState::DbRestorationInProgress),
    (Action::Update, InstallationState::Stable, InstallationState::UpdateRequested),
    (Action::Update, InstallationState::UpdateRequested, InstallationState::UpdateRequested),
    (Action::Update, InstallationState::UpdateFailed, InstallationState::UpdateRequested),
    (Action::AddDns, InstallationState::Stable, InstallationState::UpdateRequested),
    (Action::AddDns, InstallationState::UpdateRequested, InstallationState::UpdateRequested),
    (Action::SetPrimaryDns, InstallationState::Stable, InstallationState::UpdateRequested),
    (Action::SetPrimaryDns, InstallationState::UpdateRequested, InstallationState::UpdateRequested),
    // deleting a record is compensating; it does not re-enter the update loop
    (Action::DeleteDns, InstallationState::Stable, InstallationState::Stable),
    (Action::DeleteDns, InstallationState::Hibernating, InstallationState::Hibernating),
    (Action::JoinGroup, InstallationState::Stable, InstallationState::UpdateRequested),
    (Action::JoinGroup, InstallationState::UpdateRequested, InstallationState::UpdateRequested),
    (Action::LeaveGroup, InstallationState::Stable, InstallationState::UpdateRequested),
    (Action::LeaveGroup, InstallationState::UpdateRequested, InstallationState::UpdateRequested),
    (Action::AssignGroup, InstallationState::Stable, InstallationState::UpdateRequested),
    (Action::AssignGroup, InstallationState::UpdateRequested, InstallationState::UpdateRequested),
    (Action::AddAnnotation, InstallationState::Stable, InstallationState::Stable),
    (Action::AddAnnotation, InstallationState::Hibernating, InstallationState::Hibernating),
    (Action::DeleteAnnotation, InstallationState::Stable, InstallationState::Stable),
    (Action::DeleteAnnotation, InstallationState::Hibernating, InstallationState::Hibernating),
    (Action::AddVolume, InstallationState::Stable, InstallationState::UpdateRequested),
    (Action::AddVolume, InstallationState::UpdateRequested, InstallationState::UpdateRequested),
    (Action::UpdateVolume, InstallationState::Stable, InstallationState::UpdateRequested),
    (Action::UpdateVolume, InstallationState::UpdateRequested, InstallationState::UpdateRequested),
    (Action::DeleteVolume, InstallationState::Stable, InstallationState::UpdateRequested),
    (Action::DeleteVolume, InstallationState::UpdateRequested, InstallationState::UpdateRequested),
    (Action::Hibernate, InstallationState::Stable, InstallationState::HibernationRequested),
    (Action::Hibernate, InstallationState::HibernationRequested, InstallationState::HibernationRequested),
    (Action::Wakeup, InstallationState::Hibernating, InstallationState::WakeUpRequested),
    (Action::Wakeup, InstallationState::WakeUpRequested, InstallationState::WakeUpRequested),
    // database operations run against a quiesced workload only
    (Action::DbMigrate, InstallationState::Hibernating, InstallationState::DbMigrationInProgress),
    (Action::RollbackDbMigration, InstallationState::Hibernating, InstallationState::DbMigrationRollbackInProgress),
    (Action::RollbackDbMigration, InstallationState::DbMigrationFailed, InstallationState::DbMigrationRollbackInProgress),
    (Action::Restore, InstallationState::Hibernating, InstallationState::DbRestorationInProgress),
    // live installations get the soft-deletion grace period; anything
    // already mid creation/deletion is deleted directly
    (Action::Delete, InstallationState::Stable, InstallationState::DeletionPendingRequested),
    (Action::Delete, InstallationState::Hibernating, InstallationState::DeletionPendingRequested),
    (Action::Delete, InstallationState::UpdateFailed, InstallationState::DeletionPendingRequested),
    (Action::Delete, InstallationState::DeletionPendingRequested, InstallationState::DeletionPendingRequested),
    (Action::Delete, InstallationState::CreationRequested, InstallationState::DeletionRequested),
    (Action::Delete, InstallationState::CreationInProgress, InstallationState::DeletionRequested),
    (Action::Delete, InstallationState::CreationFailed, InstallationState::DeletionRequested),
    (Action::Delete, InstallationState::DeletionRequested, InstallationState::DeletionRequested),
    (Action::Delete, InstallationState::DeletionFailed, InstallationState::DeletionRequested),
    (Action::CancelDeletion, InstallationState::DeletionPending, InstallationState::DeletionCancellationRequested),
    (Action::CancelDeletion, InstallationState::DeletionPendingRequested, InstallationState::DeletionCancellationRequested),
]);

transition_table!(cluster_installation_next: ClusterInstallationState => [
    (Action::Create, ClusterInstallationState::CreationRequested, ClusterInstallationState::CreationRequested),
    (Action::Retry, ClusterInstallationState::CreationRequested, ClusterInstallationState::CreationRequested),
    (Action::Retry, ClusterInstallationState::CreationFailed, ClusterInstallationState::CreationRequested),
    (Action::Retry, ClusterInstallationState::ReconcilingFailed, ClusterInstallationState::ReconcilingRequested),
    (Action::Retry, ClusterInstallationState::DeletionFailed, ClusterInstallationState::DeletionRequested),
    (Action::Update, ClusterInstallationState::Stable, ClusterInstallationState::ReconcilingRequested),
    (Action::Update, ClusterInstallationState::ReconcilingRequested, ClusterInstallationState::ReconcilingRequested),
    (Action::Update, ClusterInstallationState::ReconcilingFailed, ClusterInstallationState::ReconcilingRequested),
    (Action::Delete, ClusterInstallationState::CreationRequested, ClusterInstallationState::DeletionRequested),
    (Action::Delete, ClusterInstallationState::CreationFailed, ClusterInstallationState::DeletionRequested),
    (Action::Delete, ClusterInstallationState::Stable, ClusterInstallationState::DeletionRequested),
    (Action::Delete, ClusterInstallationState::ReconcilingRequested, ClusterInstallationState::DeletionRequested),
    (Action::Delete, ClusterInstallationState::ReconcilingFailed, ClusterInstallationState::DeletionRequested),
    (Action::Delete, ClusterInstallationState::DeletionRequested, ClusterInstallationState::DeletionRequested),
    (Action::Delete, ClusterInstallationState::DeletionFailed, ClusterInstallationState::DeletionRequested),
]);

/// A migration can only be committed once its data movement has finished
/// cleanly. Committing tears down the source database, so there is no way
/// back afterwards.
pub fn db_migration_commit(from: DbMigrationState) -> Result<DbMigrationState> {
    match from {
        DbMigrationState::Succeeded => Ok(DbMigrationState::Committed),
        DbMigrationState::Committed => Ok(DbMigrationState::Committed),
        other => Err(Error::precondition(format!(
            "cannot commit a migration in state {other}"
        ))),
    }
}

/// Rolling back is legal for a finished-but-uncommitted migration and for
/// a failed one.
pub fn db_migration_rollback(from: DbMigrationState) -> Result<DbMigrationState> {
    match from {
        DbMigrationState::Succeeded | DbMigrationState::Failed => {
            Ok(DbMigrationState::RollbackRequested)
        }
        DbMigrationState::RollbackRequested => Ok(DbMigrationState::RollbackRequested),
        other => Err(Error::precondition(format!(
            "cannot roll back a migration in state {other}"
        ))),
    }
}

/// `deletion-pending` installations whose expiry has elapsed are the one
/// transition the Supervisor drives by wall-clock time rather than by an
/// admitted action.
pub fn deletion_pending_expired(
    installation: &orchestrator_types::Installation,
    now_ms: i64,
) -> bool {
    installation.state == InstallationState::DeletionPending
        && installation.deletion_pending_expiry > 0
        && now_ms >= installation.deletion_pending_expiry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_upgrade_only_from_stable_or_its_own_loop() {
        assert_eq!(
            cluster_next(Action::Upgrade, ClusterState::Stable).unwrap(),
            ClusterState::UpgradeRequested
        );
        assert_eq!(
            cluster_next(Action::Upgrade, ClusterState::UpgradeFailed).unwrap(),
            ClusterState::UpgradeRequested
        );
        assert!(cluster_next(Action::Upgrade, ClusterState::CreationRequested).is_err());
    }

    #[test]
    fn cluster_retry_is_allowed_while_still_requested() {
        assert_eq!(
            cluster_next(Action::Retry, ClusterState::CreationRequested).unwrap(),
            ClusterState::CreationRequested
        );
    }

    #[test]
    fn cluster_delete_excluded_mid_creation() {
        assert!(cluster_next(Action::Delete, ClusterState::CreationInProgress).is_err());
        assert!(cluster_next(Action::Delete, ClusterState::Stable).is_ok());
        assert!(cluster_next(Action::Delete, ClusterState::DeletionRequested).is_ok());
    }

    #[test]
    fn installation_delete_from_stable_goes_through_pending() {
        assert_eq!(
            installation_next(Action::Delete, InstallationState::Stable).unwrap(),
            InstallationState::DeletionPendingRequested
        );
    }

    #[test]
    fn installation_delete_mid_creation_skips_pending() {
        assert_eq!(
            installation_next(Action::Delete, InstallationState::CreationFailed).unwrap(),
            InstallationState::DeletionRequested
        );
    }

    #[test]
    fn cancel_deletion_only_while_pending() {
        assert!(installation_next(Action::CancelDeletion, InstallationState::DeletionPending).is_ok());
        assert!(installation_next(Action::CancelDeletion, InstallationState::DeletionRequested).is_err());
    }

    #[test]
    fn db_migration_requires_hibernation() {
        assert_eq!(
            installation_next(Action::DbMigrate, InstallationState::Hibernating).unwrap(),
            InstallationState::DbMigrationInProgress
        );
        assert!(installation_next(Action::DbMigrate, InstallationState::Stable).is_err());
    }

    #[test]
    fn commit_rejects_a_failed_migration() {
        assert!(db_migration_commit(DbMigrationState::Failed).is_err());
        assert_eq!(
            db_migration_commit(DbMigrationState::Succeeded).unwrap(),
            DbMigrationState::Committed
        );
    }

    #[test]
    fn rollback_accepts_failed_and_succeeded_only() {
        assert!(db_migration_rollback(DbMigrationState::Failed).is_ok());
        assert!(db_migration_rollback(DbMigrationState::Succeeded).is_ok());
        assert!(db_migration_rollback(DbMigrationState::Committed).is_err());
        assert!(db_migration_rollback(DbMigrationState::InProgress).is_err());
    }

    #[test]
    fn rerequesting_the_current_target_is_a_noop_success() {
        assert_eq!(
            installation_next(Action::Hibernate, InstallationState::HibernationRequested).unwrap(),
            InstallationState::HibernationRequested
        );
        assert_eq!(
            cluster_next(Action::Resize, ClusterState::ResizeRequested).unwrap(),
            ClusterState::ResizeRequested
        );
    }
}
