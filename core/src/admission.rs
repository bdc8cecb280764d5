//! Single entry point for every state-changing request. Each method here
//! runs the same eight steps regardless of resource type: load, check the
//! API lock, validate the transition against the registry, acquire the
//! work lock, write the new state plus its side effects, emit an event,
//! release the lock, and wake the Supervisor. Resources differ only in
//! what "write the new state" means, which is why the bulk of this module
//! is the handful of `mutate_*` helpers that do steps 1-2-4-5-6-7-8 once
//! and take the resource-specific step 3/5 logic as a closure.

use std::sync::Arc;

use orchestrator_provisioner::DnsProvider;
use orchestrator_store::{ClusterInstallationFilter, InstallationFilter, Store};
use orchestrator_types::{
    BackupState, Cluster, ClusterInstallation, CreateBackupRequest, CreateClusterRequest,
    CreateDbMigrationRequest, CreateDbRestorationRequest, CreateGroupRequest,
    CreateInstallationRequest, DatabaseConfig, DatabaseKind, DbMigrationState,
    DbRestorationState, DeleteInstallationRequest, Group, Installation, InstallationBackup,
    InstallationDbMigrationOperation, InstallationDbRestorationOperation, InstallationState,
    MigrateClusterInstallationsRequest, ResourceId, ResourceKind, StateChangeEventData,
    UpdateGroupRequest, Volume, common::now_ms,
};

use crate::error::{Error, Result};
use crate::events::EventProducer;
use crate::lock::LockManager;
use crate::machine::{
    Action, cluster_installation_next, cluster_next, db_migration_commit, db_migration_rollback,
    installation_next,
};

/// Per-request override of the soft-deletion grace period, bounded by a
/// configurable cap so no request can indefinitely postpone a deletion.
#[derive(Debug, Clone, Copy)]
pub struct DeletionPolicy {
    pub default_expiry_ms: i64,
    pub max_expiry_ms: i64,
}

impl DeletionPolicy {
    fn expiry(&self, now: i64, requested: Option<i64>) -> i64 {
        let grace = requested
            .unwrap_or(self.default_expiry_ms)
            .clamp(0, self.max_expiry_ms);
        now + grace
    }
}

pub struct Admission {
    store: Arc<dyn Store>,
    lock: LockManager,
    events: Arc<EventProducer>,
    dns: Arc<dyn DnsProvider>,
    deletion: DeletionPolicy,
}

impl Admission {
    pub fn new(
        store: Arc<dyn Store>,
        lock: LockManager,
        events: Arc<EventProducer>,
        dns: Arc<dyn DnsProvider>,
        deletion: DeletionPolicy,
    ) -> Self {
        Admission {
            store,
            lock,
            events,
            dns,
            deletion,
        }
    }

    /// Completes admission for a freshly created resource. The registry
    /// has already confirmed Create from the initial state; the creation
    /// event (empty old state) goes out under the new row's work lock so
    /// it serializes with anything racing for the id, same as every
    /// other action.
    async fn emit_created(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        owner_id: &str,
        new_state: &str,
        request_id: Option<String>,
    ) -> Result<()> {
        let guard = self.lock.lock_or_fail(kind, id).await?;
        self.events
            .emit(
                format!("{}.state_changed", kind.as_str()),
                StateChangeEventData {
                    resource_type: kind.as_str().to_string(),
                    resource_id: id.clone(),
                    owner_id: owner_id.to_string(),
                    old_state: String::new(),
                    new_state: new_state.to_string(),
                },
                request_id,
            )
            .await?;
        guard.release().await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Cluster
    // ---------------------------------------------------------------

    pub async fn create_cluster(
        &self,
        req: CreateClusterRequest,
        request_id: Option<String>,
    ) -> Result<Cluster> {
        let cluster = self.store.create_cluster(req).await?;
        let admitted = cluster_next(Action::Create, cluster.state)?;
        self.emit_created(
            ResourceKind::Cluster,
            &cluster.id,
            "system",
            admitted.as_str(),
            request_id,
        )
        .await?;
        Ok(cluster)
    }

    pub async fn retry_cluster(
        &self,
        id: &ResourceId,
        request_id: Option<String>,
    ) -> Result<Cluster> {
        self.mutate_cluster(id, Action::Retry, request_id, |_| Ok(()))
            .await
    }

    pub async fn provision_cluster(
        &self,
        id: &ResourceId,
        request_id: Option<String>,
    ) -> Result<Cluster> {
        self.mutate_cluster(id, Action::Provision, request_id, |_| Ok(()))
            .await
    }

    pub async fn upgrade_cluster(
        &self,
        id: &ResourceId,
        version: Option<String>,
        request_id: Option<String>,
    ) -> Result<Cluster> {
        self.mutate_cluster(id, Action::Upgrade, request_id, |c| {
            c.provisioner_metadata.change_request.version = version;
            Ok(())
        })
        .await
    }

    pub async fn resize_cluster(
        &self,
        id: &ResourceId,
        size: Option<String>,
        request_id: Option<String>,
    ) -> Result<Cluster> {
        self.mutate_cluster(id, Action::Resize, request_id, |c| {
            c.provisioner_metadata.change_request.size = size;
            Ok(())
        })
        .await
    }

    /// A cluster still carrying live bindings cannot be deleted; callers
    /// must delete or migrate its cluster installations first.
    pub async fn delete_cluster(
        &self,
        id: &ResourceId,
        request_id: Option<String>,
    ) -> Result<Cluster> {
        let bound = self
            .store
            .list_cluster_installations(ClusterInstallationFilter {
                cluster_id: Some(id.clone()),
                ..Default::default()
            })
            .await?;
        if bound.total > 0 {
            return Err(Error::precondition(format!(
                "cluster {id} still has {} cluster installations",
                bound.total
            )));
        }
        self.mutate_cluster(id, Action::Delete, request_id, |c| {
            if c.lock.deletion_locked {
                return Err(Error::DeletionLocked);
            }
            Ok(())
        })
        .await
    }

    pub async fn add_cluster_annotation(
        &self,
        id: &ResourceId,
        name: String,
        request_id: Option<String>,
    ) -> Result<Cluster> {
        self.mutate_cluster(id, Action::AddAnnotation, request_id, move |c| {
            if !c.annotations.iter().any(|a| a.name == name) {
                c.annotations.push(orchestrator_types::Annotation { name });
            }
            Ok(())
        })
        .await
    }

    /// Removing an annotation that a live installation on this cluster
    /// still requires would invalidate the placement that put it there.
    pub async fn delete_cluster_annotation(
        &self,
        id: &ResourceId,
        name: &str,
        request_id: Option<String>,
    ) -> Result<Cluster> {
        if self.store.annotation_in_use(id, name).await? {
            return Err(Error::AnnotationInUse);
        }
        let name = name.to_string();
        self.mutate_cluster(id, Action::DeleteAnnotation, request_id, move |c| {
            c.annotations.retain(|a| a.name != name);
            Ok(())
        })
        .await
    }

    /// Runs steps 1-2-3-4-5-6-7-8 for a Cluster transition whose target
    /// state comes straight from the registry; `mutate` only needs to
    /// apply whatever side effect the action carries (e.g. a pending
    /// version bump) before the new state is persisted.
    async fn mutate_cluster(
        &self,
        id: &ResourceId,
        action: Action,
        request_id: Option<String>,
        mutate: impl FnOnce(&mut Cluster) -> Result<()>,
    ) -> Result<Cluster> {
        let mut cluster = self
            .store
            .get_cluster(id, false)
            .await?
            .ok_or_else(|| Error::not_found("cluster", id.to_string()))?;
        if cluster.lock.api_locked {
            return Err(Error::ApiLocked);
        }
        let old_state = cluster.state;
        let new_state = cluster_next(action, old_state)?;

        let guard = self.lock.lock_or_fail(ResourceKind::Cluster, id).await?;
        mutate(&mut cluster)?;
        cluster.state = new_state;
        let updated = self.store.update_cluster(cluster).await?;
        self.events
            .emit(
                "cluster.state_changed",
                StateChangeEventData {
                    resource_type: "cluster".to_string(),
                    resource_id: id.clone(),
                    owner_id: "system".to_string(),
                    old_state: old_state.to_string(),
                    new_state: new_state.to_string(),
                },
                request_id,
            )
            .await?;
        guard.release().await?;
        Ok(updated)
    }

    // ---------------------------------------------------------------
    // Installation
    // ---------------------------------------------------------------

    pub async fn create_installation(
        &self,
        mut req: CreateInstallationRequest,
        request_id: Option<String>,
    ) -> Result<Installation> {
        for (key, var) in req.mattermost_env.iter().chain(req.priority_env.iter()) {
            if !var.is_valid() {
                return Err(Error::InvalidInput(format!(
                    "env var {key} must set exactly one of value or secret_name"
                )));
            }
        }
        if req.database == DatabaseKind::External
            && !matches!(
                &req.database_config,
                Some(DatabaseConfig::External(cfg)) if !cfg.secret_name.is_empty()
            )
        {
            return Err(Error::precondition(
                "an external database requires a connection secret",
            ));
        }
        if let Some(group_id) = &req.group_id
            && self.store.get_group(group_id, false).await?.is_none()
        {
            return Err(Error::not_found("group", group_id.to_string()));
        }
        req.dns = req.dns.to_lowercase();
        if self.store.dns_is_taken(&req.dns, None).await? {
            return Err(Error::dns_conflict(format!("{} is already in use", req.dns)));
        }
        let installation = self.store.create_installation(req).await?;
        let admitted = installation_next(Action::Create, installation.state)?;
        self.emit_created(
            ResourceKind::Installation,
            &installation.id,
            &installation.owner_id,
            admitted.as_str(),
            request_id,
        )
        .await?;
        Ok(installation)
    }

    pub async fn retry_installation(
        &self,
        id: &ResourceId,
        request_id: Option<String>,
    ) -> Result<Installation> {
        self.mutate_installation(id, Action::Retry, request_id, |_| Ok(()))
            .await
    }

    pub async fn update_installation(
        &self,
        id: &ResourceId,
        request_id: Option<String>,
        mutate: impl FnOnce(&mut Installation) -> Result<()>,
    ) -> Result<Installation> {
        self.mutate_installation(id, Action::Update, request_id, mutate)
            .await
    }

    pub async fn hibernate_installation(
        &self,
        id: &ResourceId,
        request_id: Option<String>,
    ) -> Result<Installation> {
        self.mutate_installation(id, Action::Hibernate, request_id, |_| Ok(()))
            .await
    }

    pub async fn wakeup_installation(
        &self,
        id: &ResourceId,
        request_id: Option<String>,
    ) -> Result<Installation> {
        self.mutate_installation(id, Action::Wakeup, request_id, |_| Ok(()))
            .await
    }

    pub async fn cancel_deletion(
        &self,
        id: &ResourceId,
        request_id: Option<String>,
    ) -> Result<Installation> {
        self.mutate_installation(id, Action::CancelDeletion, request_id, |i| {
            i.deletion_pending_expiry = 0;
            Ok(())
        })
        .await
    }

    /// Joins (or moves) an installation into a group, folding the group's
    /// version/image/env into the installation immediately so the update
    /// the Supervisor rolls out matches what the group prescribes.
    pub async fn join_group(
        &self,
        id: &ResourceId,
        group_id: &ResourceId,
        request_id: Option<String>,
    ) -> Result<Installation> {
        let group = self
            .store
            .get_group(group_id, false)
            .await?
            .ok_or_else(|| Error::not_found("group", group_id.to_string()))?;
        let current = self
            .store
            .get_installation(id, false)
            .await?
            .ok_or_else(|| Error::not_found("installation", id.to_string()))?;
        let action = if current.group_id.is_some() {
            Action::AssignGroup
        } else {
            Action::JoinGroup
        };
        self.mutate_installation(id, action, request_id, move |i| {
            i.apply_group(&group);
            Ok(())
        })
        .await
    }

    pub async fn leave_group(
        &self,
        id: &ResourceId,
        request_id: Option<String>,
    ) -> Result<Installation> {
        self.mutate_installation(id, Action::LeaveGroup, request_id, |i| {
            i.group_id = None;
            i.group_sequence = None;
            Ok(())
        })
        .await
    }

    pub async fn add_dns(
        &self,
        id: &ResourceId,
        domain_name: String,
        request_id: Option<String>,
    ) -> Result<Installation> {
        let domain_name = domain_name.to_lowercase();
        if self.store.dns_is_taken(&domain_name, Some(id)).await? {
            return Err(Error::dns_conflict(format!("{domain_name} is already in use")));
        }
        self.mutate_installation(id, Action::AddDns, request_id, move |i| {
            if !i.dns_records.iter().any(|d| d.domain_name == domain_name) {
                i.dns_records.push(orchestrator_types::DnsRecord {
                    domain_name,
                    primary: false,
                });
            }
            Ok(())
        })
        .await
    }

    pub async fn set_primary_dns(
        &self,
        id: &ResourceId,
        domain_name: &str,
        request_id: Option<String>,
    ) -> Result<Installation> {
        let domain_name = domain_name.to_lowercase();
        self.mutate_installation(id, Action::SetPrimaryDns, request_id, move |i| {
            if !i.dns_records.iter().any(|d| d.domain_name == domain_name) {
                return Err(Error::precondition(format!(
                    "{domain_name} is not a known record"
                )));
            }
            for record in &mut i.dns_records {
                record.primary = record.domain_name == domain_name;
            }
            i.name = domain_name;
            Ok(())
        })
        .await
    }

    /// Deleting a DNS record performs the provider call inline rather
    /// than handing off to the Supervisor: removing a record has nothing
    /// further to drive toward, so there is no benefit to deferring it,
    /// and doing it here keeps the DB write and the compensating external
    /// call in the same request.
    pub async fn delete_dns(
        &self,
        id: &ResourceId,
        domain_name: &str,
        request_id: Option<String>,
    ) -> Result<Installation> {
        let domain_name = domain_name.to_lowercase();
        let installation = self
            .store
            .get_installation(id, false)
            .await?
            .ok_or_else(|| Error::not_found("installation", id.to_string()))?;
        if installation
            .primary_dns()
            .is_some_and(|d| d.domain_name == domain_name)
        {
            return Err(Error::precondition(
                "the primary DNS record cannot be deleted; promote another record first",
            ));
        }
        self.dns.delete_records(&installation, &domain_name).await?;
        self.mutate_installation(id, Action::DeleteDns, request_id, move |i| {
            i.dns_records.retain(|d| d.domain_name != domain_name);
            Ok(())
        })
        .await
    }

    pub async fn add_installation_annotation(
        &self,
        id: &ResourceId,
        name: String,
        request_id: Option<String>,
    ) -> Result<Installation> {
        self.mutate_installation(id, Action::AddAnnotation, request_id, move |i| {
            if !i.annotations.iter().any(|a| a.name == name) {
                i.annotations.push(orchestrator_types::Annotation { name });
            }
            Ok(())
        })
        .await
    }

    pub async fn delete_installation_annotation(
        &self,
        id: &ResourceId,
        name: &str,
        request_id: Option<String>,
    ) -> Result<Installation> {
        let name = name.to_string();
        self.mutate_installation(id, Action::DeleteAnnotation, request_id, move |i| {
            i.annotations.retain(|a| a.name != name);
            Ok(())
        })
        .await
    }

    pub async fn add_volume(
        &self,
        id: &ResourceId,
        name: String,
        volume: Volume,
        request_id: Option<String>,
    ) -> Result<Installation> {
        self.mutate_installation(id, Action::AddVolume, request_id, move |i| {
            if i.volumes.contains_key(&name) {
                return Err(Error::precondition(format!("volume {name} already exists")));
            }
            i.volumes.insert(name, volume);
            Ok(())
        })
        .await
    }

    pub async fn update_volume(
        &self,
        id: &ResourceId,
        name: &str,
        volume: Volume,
        request_id: Option<String>,
    ) -> Result<Installation> {
        let name = name.to_string();
        self.mutate_installation(id, Action::UpdateVolume, request_id, move |i| {
            match i.volumes.get_mut(&name) {
                Some(existing) => {
                    *existing = volume;
                    Ok(())
                }
                None => Err(Error::precondition(format!("volume {name} does not exist"))),
            }
        })
        .await
    }

    pub async fn delete_volume(
        &self,
        id: &ResourceId,
        name: &str,
        request_id: Option<String>,
    ) -> Result<Installation> {
        let name = name.to_string();
        self.mutate_installation(id, Action::DeleteVolume, request_id, move |i| {
            if i.volumes.remove(&name).is_none() {
                return Err(Error::precondition(format!("volume {name} does not exist")));
            }
            Ok(())
        })
        .await
    }

    /// Moves a live Installation to `deletion-pending-requested` so the
    /// Supervisor can promote it to `deletion-requested` once the expiry
    /// elapses; an Installation already mid creation/deletion skips the
    /// grace period entirely per the registry.
    pub async fn delete_installation(
        &self,
        id: &ResourceId,
        req: DeleteInstallationRequest,
        request_id: Option<String>,
    ) -> Result<Installation> {
        if self.store.backup_in_progress(id).await? {
            return Err(Error::precondition("a backup is in progress"));
        }
        let expiry = self.deletion.expiry(now_ms(), req.expiry_override_ms);
        self.mutate_installation(id, Action::Delete, request_id, move |i| {
            if i.deletion_locked {
                return Err(Error::DeletionLocked);
            }
            if !i.state.is_creation_or_deletion_in_progress() {
                i.deletion_pending_expiry = expiry;
            }
            Ok(())
        })
        .await
    }

    async fn mutate_installation(
        &self,
        id: &ResourceId,
        action: Action,
        request_id: Option<String>,
        mutate: impl FnOnce(&mut Installation) -> Result<()>,
    ) -> Result<Installation> {
        let mut installation = self
            .store
            .get_installation(id, false)
            .await?
            .ok_or_else(|| Error::not_found("installation", id.to_string()))?;
        if installation.lock.api_locked {
            return Err(Error::ApiLocked);
        }
        let old_state = installation.state;
        let new_state = installation_next(action, old_state)?;

        let guard = self.lock.lock_or_fail(ResourceKind::Installation, id).await?;
        mutate(&mut installation)?;
        installation.state = new_state;
        let updated = self.store.update_installation(installation).await?;
        self.events
            .emit(
                "installation.state_changed",
                StateChangeEventData {
                    resource_type: "installation".to_string(),
                    resource_id: id.clone(),
                    owner_id: updated.owner_id.clone(),
                    old_state: old_state.to_string(),
                    new_state: new_state.to_string(),
                },
                request_id,
            )
            .await?;
        guard.release().await?;
        Ok(updated)
    }

    // ---------------------------------------------------------------
    // Database migration / restoration / backup operations
    // ---------------------------------------------------------------

    /// Opens a migration for a hibernated installation. The installation
    /// enters `db-migration-in-progress` and the operation row is what
    /// the Supervisor drives from `requested` onward.
    pub async fn create_db_migration(
        &self,
        req: CreateDbMigrationRequest,
        request_id: Option<String>,
    ) -> Result<InstallationDbMigrationOperation> {
        if let Some(backup_id) = &req.backup_id {
            let backup = self
                .store
                .get_backup(backup_id)
                .await?
                .ok_or_else(|| Error::not_found("backup", backup_id.to_string()))?;
            if backup.state != BackupState::BackupSucceeded {
                return Err(Error::precondition(format!(
                    "backup {backup_id} is in state {}, not backup-succeeded",
                    backup.state
                )));
            }
        }
        if self
            .store
            .get_unfinished_db_migration_for(&req.installation_id)
            .await?
            .is_some()
        {
            return Err(Error::precondition("a migration is already open"));
        }
        let now = now_ms();
        let op = InstallationDbMigrationOperation {
            id: ResourceId::new(),
            installation_id: req.installation_id.clone(),
            source_cluster_installation_id: None,
            destination_cluster_installation_id: None,
            backup_id: req.backup_id,
            state: DbMigrationState::Requested,
            request_at: now,
            create_at: now,
            update_at: now,
            delete_at: 0,
        };
        let installation = self
            .mutate_installation(&req.installation_id, Action::DbMigrate, request_id.clone(), |_| {
                Ok(())
            })
            .await?;
        let op = self.store.create_db_migration_operation(op).await?;
        self.emit_operation_event(
            "db_migration_operation",
            &op.id,
            &installation.owner_id,
            "",
            op.state.as_str(),
            request_id,
        )
        .await?;
        Ok(op)
    }

    /// Commit makes a finished migration permanent; a failed one cannot
    /// be committed, only rolled back or retried.
    pub async fn commit_db_migration(
        &self,
        op_id: &ResourceId,
        request_id: Option<String>,
    ) -> Result<InstallationDbMigrationOperation> {
        let mut op = self
            .store
            .get_db_migration_operation(op_id)
            .await?
            .ok_or_else(|| Error::not_found("db_migration_operation", op_id.to_string()))?;
        let old_state = op.state;
        let new_state = db_migration_commit(old_state)?;
        if new_state == old_state {
            return Ok(op);
        }
        let installation_id = op.installation_id.clone();
        let guard = self
            .lock
            .lock_or_fail(ResourceKind::Installation, &installation_id)
            .await?;
        op.state = new_state;
        let op = self.store.update_db_migration_operation(op).await?;
        let owner = self.owner_of(&op.installation_id).await?;
        self.emit_operation_event(
            "db_migration_operation",
            &op.id,
            &owner,
            old_state.as_str(),
            new_state.as_str(),
            request_id,
        )
        .await?;
        guard.release().await?;
        Ok(op)
    }

    pub async fn rollback_db_migration(
        &self,
        op_id: &ResourceId,
        request_id: Option<String>,
    ) -> Result<InstallationDbMigrationOperation> {
        let mut op = self
            .store
            .get_db_migration_operation(op_id)
            .await?
            .ok_or_else(|| Error::not_found("db_migration_operation", op_id.to_string()))?;
        let old_state = op.state;
        let new_state = db_migration_rollback(old_state)?;
        let installation_id = op.installation_id.clone();
        let installation = self
            .mutate_installation(
                &installation_id,
                Action::RollbackDbMigration,
                request_id.clone(),
                |_| Ok(()),
            )
            .await?;
        op.state = new_state;
        let op = self.store.update_db_migration_operation(op).await?;
        self.emit_operation_event(
            "db_migration_operation",
            &op.id,
            &installation.owner_id,
            old_state.as_str(),
            new_state.as_str(),
            request_id,
        )
        .await?;
        Ok(op)
    }

    /// Opens a restoration from a finished backup; the installation must
    /// be hibernating and the backup must belong to it.
    pub async fn create_db_restoration(
        &self,
        req: CreateDbRestorationRequest,
        request_id: Option<String>,
    ) -> Result<InstallationDbRestorationOperation> {
        let backup = self
            .store
            .get_backup(&req.backup_id)
            .await?
            .ok_or_else(|| Error::not_found("backup", req.backup_id.to_string()))?;
        if backup.installation_id != req.installation_id {
            return Err(Error::precondition(
                "backup belongs to a different installation",
            ));
        }
        if backup.state != BackupState::BackupSucceeded {
            return Err(Error::precondition(format!(
                "backup {} is in state {}, not backup-succeeded",
                backup.id, backup.state
            )));
        }
        if self
            .store
            .get_unfinished_db_restoration_for(&req.installation_id)
            .await?
            .is_some()
        {
            return Err(Error::precondition("a restoration is already open"));
        }
        let now = now_ms();
        let op = InstallationDbRestorationOperation {
            id: ResourceId::new(),
            installation_id: req.installation_id.clone(),
            backup_id: req.backup_id,
            cluster_installation_id: backup.cluster_installation_id,
            state: DbRestorationState::Requested,
            request_at: now,
            create_at: now,
            update_at: now,
            delete_at: 0,
        };
        let installation = self
            .mutate_installation(&req.installation_id, Action::Restore, request_id.clone(), |_| {
                Ok(())
            })
            .await?;
        let op = self.store.create_db_restoration_operation(op).await?;
        self.emit_operation_event(
            "db_restoration_operation",
            &op.id,
            &installation.owner_id,
            "",
            op.state.as_str(),
            request_id,
        )
        .await?;
        Ok(op)
    }

    /// Backups run against a quiesced or steady workload and never change
    /// the installation's own state; the installation's work lock still
    /// serializes the request against concurrent mutation.
    pub async fn create_backup(
        &self,
        req: CreateBackupRequest,
        request_id: Option<String>,
    ) -> Result<InstallationBackup> {
        let installation = self
            .store
            .get_installation(&req.installation_id, false)
            .await?
            .ok_or_else(|| Error::not_found("installation", req.installation_id.to_string()))?;
        if installation.lock.api_locked {
            return Err(Error::ApiLocked);
        }
        if !matches!(
            installation.state,
            InstallationState::Stable | InstallationState::Hibernating
        ) {
            return Err(Error::precondition(format!(
                "cannot back up an installation in state {}",
                installation.state
            )));
        }
        if self.store.backup_in_progress(&req.installation_id).await? {
            return Err(Error::precondition("a backup is already in progress"));
        }
        let guard = self
            .lock
            .lock_or_fail(ResourceKind::Installation, &req.installation_id)
            .await?;
        let backup = InstallationBackup {
            id: ResourceId::new(),
            installation_id: req.installation_id,
            cluster_installation_id: None,
            data_residence: None,
            state: BackupState::BackupRequested,
            request_at: now_ms(),
            start_at: 0,
            delete_at: 0,
        };
        let backup = self.store.create_backup(backup).await?;
        self.emit_operation_event(
            "backup",
            &backup.id,
            &installation.owner_id,
            "",
            backup.state.as_str(),
            request_id,
        )
        .await?;
        guard.release().await?;
        Ok(backup)
    }

    async fn owner_of(&self, installation_id: &ResourceId) -> Result<String> {
        Ok(self
            .store
            .get_installation(installation_id, true)
            .await?
            .map(|i| i.owner_id)
            .unwrap_or_else(|| "system".to_string()))
    }

    async fn emit_operation_event(
        &self,
        resource_type: &str,
        id: &ResourceId,
        owner_id: &str,
        old_state: &str,
        new_state: &str,
        request_id: Option<String>,
    ) -> Result<()> {
        self.events
            .emit(
                format!("{resource_type}.state_changed"),
                StateChangeEventData {
                    resource_type: resource_type.to_string(),
                    resource_id: id.clone(),
                    owner_id: owner_id.to_string(),
                    old_state: old_state.to_string(),
                    new_state: new_state.to_string(),
                },
                request_id,
            )
            .await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // ClusterInstallation
    // ---------------------------------------------------------------

    pub async fn create_cluster_installation(
        &self,
        cluster_id: &ResourceId,
        installation_id: &ResourceId,
        namespace: &str,
        request_id: Option<String>,
    ) -> Result<ClusterInstallation> {
        let cluster = self
            .store
            .get_cluster(cluster_id, false)
            .await?
            .ok_or_else(|| Error::not_found("cluster", cluster_id.to_string()))?;
        if !cluster.allow_installations {
            return Err(Error::precondition(format!(
                "cluster {cluster_id} does not accept installations"
            )));
        }
        if self
            .store
            .get_installation(installation_id, false)
            .await?
            .is_none()
        {
            return Err(Error::not_found("installation", installation_id.to_string()));
        }
        if self.store.namespace_is_taken(cluster_id, namespace).await? {
            return Err(Error::precondition(format!(
                "namespace {namespace} already in use on this cluster"
            )));
        }
        let ci = self
            .store
            .create_cluster_installation(cluster_id, installation_id, namespace, true)
            .await?;
        let admitted = cluster_installation_next(Action::Create, ci.state)?;
        self.emit_created(
            ResourceKind::ClusterInstallation,
            &ci.id,
            "system",
            admitted.as_str(),
            request_id,
        )
        .await?;
        Ok(ci)
    }

    pub async fn retry_cluster_installation(
        &self,
        id: &ResourceId,
        request_id: Option<String>,
    ) -> Result<ClusterInstallation> {
        self.mutate_cluster_installation(id, Action::Retry, request_id, |_| Ok(()))
            .await
    }

    pub async fn update_cluster_installation(
        &self,
        id: &ResourceId,
        request_id: Option<String>,
        mutate: impl FnOnce(&mut ClusterInstallation) -> Result<()>,
    ) -> Result<ClusterInstallation> {
        self.mutate_cluster_installation(id, Action::Update, request_id, mutate)
            .await
    }

    pub async fn delete_cluster_installation(
        &self,
        id: &ResourceId,
        request_id: Option<String>,
    ) -> Result<ClusterInstallation> {
        self.mutate_cluster_installation(id, Action::Delete, request_id, |_| Ok(()))
            .await
    }

    /// First half of a cluster drain: every active binding on the source
    /// cluster gets an inactive twin on the target, created in
    /// `creation-requested` so the Supervisor stands the workloads up.
    /// With `lock_installation` the affected installations stay
    /// work-locked until the DNS switch releases them.
    pub async fn migrate_cluster_installations(
        &self,
        req: &MigrateClusterInstallationsRequest,
    ) -> Result<Vec<ClusterInstallation>> {
        let target = self
            .store
            .get_cluster(&req.target_cluster_id, false)
            .await?
            .ok_or_else(|| Error::not_found("cluster", req.target_cluster_id.to_string()))?;
        self.store
            .get_cluster(&req.source_cluster_id, false)
            .await?
            .ok_or_else(|| Error::not_found("cluster", req.source_cluster_id.to_string()))?;
        if !target.allow_installations {
            return Err(Error::precondition(format!(
                "cluster {} does not accept installations",
                target.id
            )));
        }
        let active = self
            .store
            .list_cluster_installations(ClusterInstallationFilter {
                cluster_id: Some(req.source_cluster_id.clone()),
                is_active: Some(true),
                ..Default::default()
            })
            .await?
            .items;
        let mut created = Vec::new();
        for ci in active {
            // a twin already on the target means this one migrated before
            if self
                .store
                .namespace_is_taken(&target.id, &ci.namespace)
                .await?
            {
                continue;
            }
            if req.lock_installation
                && !self
                    .lock
                    .lock_unguarded(ResourceKind::Installation, &ci.installation_id)
                    .await?
            {
                tracing::warn!(
                    installation = %ci.installation_id,
                    "installation already locked during migration; continuing"
                );
            }
            let twin = self
                .store
                .create_cluster_installation(&target.id, &ci.installation_id, &ci.namespace, false)
                .await?;
            self.emit_created(
                ResourceKind::ClusterInstallation,
                &twin.id,
                "system",
                twin.state.as_str(),
                None,
            )
            .await?;
            created.push(twin);
        }
        if created.is_empty() {
            return Err(Error::not_found(
                "cluster_installation",
                "no active cluster installations eligible for migration".to_string(),
            ));
        }
        Ok(created)
    }

    /// Second half of a cluster drain: flips the active side from source
    /// to target for every pair the first half created, and releases any
    /// installation locks the migration was holding.
    pub async fn switch_cluster_installation_dns(
        &self,
        req: &MigrateClusterInstallationsRequest,
    ) -> Result<Vec<ClusterInstallation>> {
        let inactive_on_target = self
            .store
            .list_cluster_installations(ClusterInstallationFilter {
                cluster_id: Some(req.target_cluster_id.clone()),
                is_active: Some(false),
                ..Default::default()
            })
            .await?
            .items;
        let mut switched = Vec::new();
        for mut twin in inactive_on_target {
            let on_source = self
                .store
                .list_cluster_installations(ClusterInstallationFilter {
                    cluster_id: Some(req.source_cluster_id.clone()),
                    installation_id: Some(twin.installation_id.clone()),
                    is_active: Some(true),
                    ..Default::default()
                })
                .await?
                .items;
            if on_source.is_empty() {
                continue;
            }
            for mut old in on_source {
                old.is_active = false;
                self.store.update_cluster_installation(old).await?;
            }
            twin.is_active = true;
            let twin = self.store.update_cluster_installation(twin).await?;
            self.lock
                .force_unlock(ResourceKind::Installation, &twin.installation_id)
                .await?;
            switched.push(twin);
        }
        if switched.is_empty() {
            return Err(Error::not_found(
                "cluster_installation",
                "nothing eligible for a DNS switch".to_string(),
            ));
        }
        Ok(switched)
    }

    async fn mutate_cluster_installation(
        &self,
        id: &ResourceId,
        action: Action,
        request_id: Option<String>,
        mutate: impl FnOnce(&mut ClusterInstallation) -> Result<()>,
    ) -> Result<ClusterInstallation> {
        let mut ci = self
            .store
            .get_cluster_installation(id, false)
            .await?
            .ok_or_else(|| Error::not_found("cluster_installation", id.to_string()))?;
        if ci.api_locked {
            return Err(Error::ApiLocked);
        }
        let old_state = ci.state;
        let new_state = cluster_installation_next(action, old_state)?;

        let guard = self
            .lock
            .lock_or_fail(ResourceKind::ClusterInstallation, id)
            .await?;
        mutate(&mut ci)?;
        ci.state = new_state;
        let updated = self.store.update_cluster_installation(ci).await?;
        self.events
            .emit(
                "cluster_installation.state_changed",
                StateChangeEventData {
                    resource_type: "cluster_installation".to_string(),
                    resource_id: id.clone(),
                    owner_id: "system".to_string(),
                    old_state: old_state.to_string(),
                    new_state: new_state.to_string(),
                },
                request_id,
            )
            .await?;
        guard.release().await?;
        Ok(updated)
    }

    // ---------------------------------------------------------------
    // Group
    // ---------------------------------------------------------------

    /// Groups carry no state machine or work lock, but their creation is
    /// still an admitted change and still reaches subscribers.
    pub async fn create_group(
        &self,
        req: CreateGroupRequest,
        request_id: Option<String>,
    ) -> Result<Group> {
        let group = self.store.create_group(req).await?;
        self.events
            .emit(
                "group.state_changed",
                StateChangeEventData {
                    resource_type: "group".to_string(),
                    resource_id: group.id.clone(),
                    owner_id: "system".to_string(),
                    old_state: String::new(),
                    new_state: "created".to_string(),
                },
                request_id,
            )
            .await?;
        Ok(group)
    }

    /// Applies a config change and bumps the group sequence, then starts
    /// rolling the change out to at most `max_rolling` stable members.
    /// Members that are locked or mid-transition catch up on later group
    /// updates or joins.
    pub async fn update_group(
        &self,
        id: &ResourceId,
        req: UpdateGroupRequest,
        request_id: Option<String>,
    ) -> Result<Group> {
        let mut group = self
            .store
            .get_group(id, false)
            .await?
            .ok_or_else(|| Error::not_found("group", id.to_string()))?;
        if let Some(name) = req.name {
            group.name = name;
        }
        if let Some(version) = req.version {
            group.version = version;
        }
        if let Some(image) = req.image {
            group.image = image;
        }
        if let Some(env) = req.mattermost_env {
            group.mattermost_env = env;
        }
        if let Some(max_rolling) = req.max_rolling {
            group.max_rolling = max_rolling.max(1);
        }
        group.sequence += 1;
        let group = self.store.update_group(group).await?;

        let members = self
            .store
            .list_installations(InstallationFilter {
                group_id: Some(group.id.clone()),
                state: Some(InstallationState::Stable.as_str().to_string()),
                ..Default::default()
            })
            .await?
            .items;
        let mut rolled = 0;
        for member in members {
            if rolled >= group.max_rolling {
                break;
            }
            if member.group_sequence == Some(group.sequence) {
                continue;
            }
            let group = group.clone();
            match self
                .mutate_installation(&member.id, Action::Update, request_id.clone(), move |i| {
                    i.apply_group(&group);
                    Ok(())
                })
                .await
            {
                Ok(_) => rolled += 1,
                Err(Error::Locked) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(group)
    }

    pub async fn delete_group(&self, id: &ResourceId) -> Result<bool> {
        let members = self
            .store
            .list_installations(InstallationFilter {
                group_id: Some(id.clone()),
                ..Default::default()
            })
            .await?;
        if members.total > 0 {
            return Err(Error::precondition(format!(
                "group {id} still has {} installations",
                members.total
            )));
        }
        Ok(self.store.delete_group(id).await?)
    }

    pub async fn add_group_annotation(&self, id: &ResourceId, name: String) -> Result<Group> {
        let mut group = self
            .store
            .get_group(id, false)
            .await?
            .ok_or_else(|| Error::not_found("group", id.to_string()))?;
        if !group.annotations.iter().any(|a| a.name == name) {
            group.annotations.push(orchestrator_types::Annotation { name });
        }
        Ok(self.store.update_group(group).await?)
    }

    pub async fn delete_group_annotation(&self, id: &ResourceId, name: &str) -> Result<Group> {
        let mut group = self
            .store
            .get_group(id, false)
            .await?
            .ok_or_else(|| Error::not_found("group", id.to_string()))?;
        group.annotations.retain(|a| a.name != name);
        Ok(self.store.update_group(group).await?)
    }

    // ---------------------------------------------------------------
    // Locks
    // ---------------------------------------------------------------

    pub async fn set_api_lock(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        locked: bool,
    ) -> Result<()> {
        self.lock.set_api_lock(kind, id, locked).await
    }

    pub async fn set_deletion_lock(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        locked: bool,
    ) -> Result<()> {
        self.lock.set_deletion_lock(kind, id, locked).await
    }

    /// Operator escape hatch for a lease orphaned by a crashed worker.
    pub async fn force_unlock(&self, kind: ResourceKind, id: &ResourceId) -> Result<()> {
        self.lock.force_unlock(kind, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_provisioner::noop::NoopDnsProvider;
    use orchestrator_store::memory::MemoryStore;
    use orchestrator_types::{Affinity, FilestoreKind};

    fn admission() -> Admission {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let lock = LockManager::new(store.clone());
        let events = Arc::new(EventProducer::new(
            store.clone(),
            Arc::new(tokio::sync::Notify::new()),
        ));
        Admission::new(
            store,
            lock,
            events,
            Arc::new(NoopDnsProvider),
            DeletionPolicy {
                default_expiry_ms: 3_600_000,
                max_expiry_ms: 30 * 24 * 3_600_000,
            },
        )
    }

    fn installation_req(dns: &str) -> CreateInstallationRequest {
        CreateInstallationRequest {
            owner_id: "owner-1".into(),
            dns: dns.into(),
            image: "mattermost".into(),
            version: "9.5.0".into(),
            license: None,
            size: "100users".into(),
            affinity: Affinity::MultiTenant,
            database: DatabaseKind::MultiTenantRdsPostgres,
            filestore: FilestoreKind::Bifrost,
            mattermost_env: Default::default(),
            priority_env: Default::default(),
            volumes: Default::default(),
            group_id: None,
            database_config: None,
            annotations: Vec::new(),
        }
    }

    async fn stable_installation(admission: &Admission, dns: &str) -> Installation {
        let installation = admission
            .create_installation(installation_req(dns), None)
            .await
            .unwrap();
        let mut stable = installation.clone();
        stable.state = InstallationState::Stable;
        admission.store.update_installation(stable).await.unwrap()
    }

    async fn hibernating_installation(admission: &Admission, dns: &str) -> Installation {
        let installation = admission
            .create_installation(installation_req(dns), None)
            .await
            .unwrap();
        let mut hibernating = installation.clone();
        hibernating.state = InstallationState::Hibernating;
        admission.store.update_installation(hibernating).await.unwrap()
    }

    #[tokio::test]
    async fn creating_a_resource_emits_a_creation_event() {
        let admission = admission();
        let cluster = admission
            .create_cluster(
                CreateClusterRequest {
                    provider: "aws".into(),
                    size: "SizeAlef500".into(),
                    zones: vec!["zone".into()],
                    utility_versions: Default::default(),
                    allow_installations: true,
                    annotations: Vec::new(),
                },
                Some("req-create-1".into()),
            )
            .await
            .unwrap();
        let installation = admission
            .create_installation(installation_req("ev.example.com"), None)
            .await
            .unwrap();

        let events = admission
            .store
            .list_events(orchestrator_store::EventFilter::default())
            .await
            .unwrap();
        let cluster_event = events
            .items
            .iter()
            .find(|e| e.data.resource_id == cluster.id)
            .unwrap();
        assert_eq!(cluster_event.data.old_state, "");
        assert_eq!(cluster_event.data.new_state, "creation-requested");
        assert_eq!(cluster_event.request_id.as_deref(), Some("req-create-1"));
        assert!(
            events
                .items
                .iter()
                .any(|e| e.data.resource_id == installation.id
                    && e.data.new_state == "creation-requested")
        );

        // the creation lock was released on the way out
        let row = admission
            .store
            .get_cluster(&cluster.id, false)
            .await
            .unwrap()
            .unwrap();
        assert!(!row.lock.is_locked());
    }

    #[tokio::test]
    async fn creating_an_installation_with_a_taken_dns_is_rejected() {
        let admission = admission();
        admission
            .create_installation(installation_req("a.example.com"), None)
            .await
            .unwrap();
        let err = admission
            .create_installation(installation_req("A.EXAMPLE.com"), None)
            .await
            .unwrap_err();
        assert!(err.is_dns_conflict());
    }

    #[tokio::test]
    async fn external_database_requires_a_secret() {
        let admission = admission();
        let mut req = installation_req("ext.example.com");
        req.database = DatabaseKind::External;
        let err = admission.create_installation(req, None).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn deleting_a_stable_installation_goes_through_pending() {
        let admission = admission();
        let installation = stable_installation(&admission, "b.example.com").await;

        let deleted = admission
            .delete_installation(&installation.id, DeleteInstallationRequest::default(), None)
            .await
            .unwrap();
        assert_eq!(deleted.state, InstallationState::DeletionPendingRequested);
        assert!(deleted.deletion_pending_expiry > 0);
    }

    #[tokio::test]
    async fn deletion_locked_installation_refuses_delete() {
        let admission = admission();
        let installation = stable_installation(&admission, "c.example.com").await;
        let mut locked = installation.clone();
        locked.deletion_locked = true;
        admission.store.update_installation(locked).await.unwrap();

        let err = admission
            .delete_installation(&installation.id, DeleteInstallationRequest::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeletionLocked));
    }

    #[tokio::test]
    async fn a_locked_work_lock_fails_admission_loudly() {
        let admission = admission();
        let installation = stable_installation(&admission, "d.example.com").await;

        admission
            .store
            .acquire_lock(
                ResourceKind::Installation,
                &installation.id,
                "someone-else",
                now_ms(),
            )
            .await
            .unwrap();

        let err = admission
            .hibernate_installation(&installation.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Locked));
    }

    #[tokio::test]
    async fn concurrent_admission_on_one_row_never_double_applies() {
        let admission = Arc::new(admission());
        let installation = stable_installation(&admission, "race.example.com").await;

        let (a, b) = tokio::join!(
            admission.hibernate_installation(&installation.id, None),
            admission.hibernate_installation(&installation.id, None),
        );
        // each call either won the lock or lost it cleanly; a loser that
        // ran after the winner released sees the idempotent re-request
        for result in [a, b] {
            match result {
                Ok(i) => assert_eq!(i.state, InstallationState::HibernationRequested),
                Err(e) => assert!(matches!(e, Error::Locked)),
            }
        }
        let settled = admission
            .store
            .get_installation(&installation.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.state, InstallationState::HibernationRequested);
        assert!(settled.lock.is_consistent() && !settled.lock.is_locked());
    }

    #[tokio::test]
    async fn api_locked_resource_refuses_user_mutation() {
        let admission = admission();
        let installation = stable_installation(&admission, "al.example.com").await;
        admission
            .set_api_lock(ResourceKind::Installation, &installation.id, true)
            .await
            .unwrap();

        let err = admission
            .hibernate_installation(&installation.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ApiLocked));

        admission
            .set_api_lock(ResourceKind::Installation, &installation.id, false)
            .await
            .unwrap();
        admission
            .hibernate_installation(&installation.id, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn deleting_a_cluster_with_bindings_is_refused() {
        let admission = admission();
        let cluster = admission
            .create_cluster(CreateClusterRequest {
                provider: "aws".into(),
                size: "SizeAlef500".into(),
                zones: vec!["zone".into()],
                utility_versions: Default::default(),
                allow_installations: true,
                annotations: Vec::new(),
            }, None)
            .await
            .unwrap();
        let mut stable = cluster.clone();
        stable.state = orchestrator_types::ClusterState::Stable;
        admission.store.update_cluster(stable).await.unwrap();
        let installation = stable_installation(&admission, "bound.example.com").await;
        admission
            .create_cluster_installation(&cluster.id, &installation.id, "ns-1", None)
            .await
            .unwrap();

        let err = admission.delete_cluster(&cluster.id, None).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));
        let unchanged = admission
            .store
            .get_cluster(&cluster.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.state, orchestrator_types::ClusterState::Stable);
    }

    #[tokio::test]
    async fn migration_requires_hibernation_and_tracks_an_operation() {
        let admission = admission();
        let installation = hibernating_installation(&admission, "m.example.com").await;

        let op = admission
            .create_db_migration(
                CreateDbMigrationRequest {
                    installation_id: installation.id.clone(),
                    destination_database_id: None,
                    backup_id: None,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(op.state, DbMigrationState::Requested);
        let updated = admission
            .store
            .get_installation(&installation.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.state, InstallationState::DbMigrationInProgress);

        // not hibernating any more, so a second migration is refused
        let err = admission
            .create_db_migration(
                CreateDbMigrationRequest {
                    installation_id: installation.id.clone(),
                    destination_database_id: None,
                    backup_id: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn committing_a_failed_migration_is_refused() {
        let admission = admission();
        let installation = hibernating_installation(&admission, "cf.example.com").await;
        let op = admission
            .create_db_migration(
                CreateDbMigrationRequest {
                    installation_id: installation.id.clone(),
                    destination_database_id: None,
                    backup_id: None,
                },
                None,
            )
            .await
            .unwrap();
        let mut failed = op.clone();
        failed.state = DbMigrationState::Failed;
        admission
            .store
            .update_db_migration_operation(failed)
            .await
            .unwrap();

        let err = admission.commit_db_migration(&op.id, None).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn backup_gating_blocks_installation_deletion() {
        let admission = admission();
        let installation = stable_installation(&admission, "bk.example.com").await;
        admission
            .create_backup(
                CreateBackupRequest {
                    installation_id: installation.id.clone(),
                },
                None,
            )
            .await
            .unwrap();

        let err = admission
            .delete_installation(&installation.id, DeleteInstallationRequest::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn migrate_then_switch_moves_the_active_side() {
        let admission = admission();
        let mk_cluster = |zones: &str| CreateClusterRequest {
            provider: "aws".into(),
            size: "SizeAlef500".into(),
            zones: vec![zones.into()],
            utility_versions: Default::default(),
            allow_installations: true,
            annotations: Vec::new(),
        };
        let source = admission.create_cluster(mk_cluster("za"), None).await.unwrap();
        let target = admission.create_cluster(mk_cluster("zb"), None).await.unwrap();
        let installation = stable_installation(&admission, "mv.example.com").await;
        admission
            .create_cluster_installation(&source.id, &installation.id, "ns-mv", None)
            .await
            .unwrap();

        let req = MigrateClusterInstallationsRequest {
            source_cluster_id: source.id.clone(),
            target_cluster_id: target.id.clone(),
            dns_switch: true,
            lock_installation: true,
        };
        let created = admission.migrate_cluster_installations(&req).await.unwrap();
        assert_eq!(created.len(), 1);
        assert!(!created[0].is_active);
        assert_eq!(created[0].state, orchestrator_types::ClusterInstallationState::CreationRequested);

        // nothing else eligible on a second migrate
        let err = admission.migrate_cluster_installations(&req).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(..)));

        let switched = admission.switch_cluster_installation_dns(&req).await.unwrap();
        assert_eq!(switched.len(), 1);
        assert!(switched[0].is_active);
        let on_source = admission
            .store
            .list_cluster_installations(ClusterInstallationFilter {
                cluster_id: Some(source.id.clone()),
                ..Default::default()
            })
            .await
            .unwrap()
            .items;
        assert!(on_source.iter().all(|ci| !ci.is_active));

        // and the second switch finds nothing
        let err = admission.switch_cluster_installation_dns(&req).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(..)));
    }

    #[tokio::test]
    async fn group_update_rolls_members_up_to_max_rolling() {
        let admission = admission();
        let group = admission
            .create_group(CreateGroupRequest {
                name: "g1".into(),
                version: "1.0.0".into(),
                image: "mattermost".into(),
                mattermost_env: Default::default(),
                max_rolling: 1,
            }, None)
            .await
            .unwrap();
        let a = stable_installation(&admission, "g-a.example.com").await;
        let b = stable_installation(&admission, "g-b.example.com").await;
        let joined = admission.join_group(&a.id, &group.id, None).await.unwrap();
        assert!(joined.group_fields_consistent());
        admission.join_group(&b.id, &group.id, None).await.unwrap();
        // settle both members back to stable so the roll-out can pick them
        for id in [&a.id, &b.id] {
            let mut m = admission.store.get_installation(id, false).await.unwrap().unwrap();
            m.state = InstallationState::Stable;
            admission.store.update_installation(m).await.unwrap();
        }

        admission
            .update_group(
                &group.id,
                UpdateGroupRequest {
                    version: Some("2.0.0".into()),
                    ..Default::default()
                },
                None,
            )
            .await
            .unwrap();

        let rolling = admission
            .store
            .list_installations(InstallationFilter {
                group_id: Some(group.id.clone()),
                state: Some(InstallationState::UpdateRequested.as_str().to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rolling.total, 1);
    }

    #[tokio::test]
    async fn cluster_retry_works_until_the_row_is_locked() {
        let admission = admission();
        let cluster = admission
            .create_cluster(CreateClusterRequest {
                provider: "aws".into(),
                size: "SizeAlef500".into(),
                zones: vec!["zone".into()],
                utility_versions: Default::default(),
                allow_installations: true,
                annotations: vec!["my-annotation".into()],
            }, None)
            .await
            .unwrap();
        assert_eq!(cluster.state, orchestrator_types::ClusterState::CreationRequested);

        // retry is allowed while the creation request is still pending
        let retried = admission.retry_cluster(&cluster.id, None).await.unwrap();
        assert_eq!(retried.state, orchestrator_types::ClusterState::CreationRequested);

        admission
            .store
            .acquire_lock(ResourceKind::Cluster, &cluster.id, "a-worker", now_ms())
            .await
            .unwrap();
        let err = admission.retry_cluster(&cluster.id, None).await.unwrap_err();
        assert!(matches!(err, Error::Locked));
    }

    #[tokio::test]
    async fn upgrading_a_stable_cluster_records_the_change_request() {
        let admission = admission();
        let cluster = admission
            .create_cluster(CreateClusterRequest {
                provider: "aws".into(),
                size: "SizeAlef500".into(),
                zones: vec!["zone".into()],
                utility_versions: Default::default(),
                allow_installations: true,
                annotations: Vec::new(),
            }, None)
            .await
            .unwrap();
        let mut stable = cluster.clone();
        stable.state = orchestrator_types::ClusterState::Stable;
        admission.store.update_cluster(stable).await.unwrap();

        let upgraded = admission
            .upgrade_cluster(&cluster.id, Some("1.14.1".into()), None)
            .await
            .unwrap();
        assert_eq!(upgraded.state, orchestrator_types::ClusterState::UpgradeRequested);
        assert_eq!(
            upgraded.provisioner_metadata.change_request.version.as_deref(),
            Some("1.14.1")
        );
    }

    #[tokio::test]
    async fn deleting_the_primary_dns_record_is_refused() {
        let admission = admission();
        let installation = stable_installation(&admission, "p.example.com").await;
        let err = admission
            .delete_dns(&installation.id, "p.example.com", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn add_then_promote_dns_moves_the_primary() {
        let admission = admission();
        let installation = stable_installation(&admission, "one.example.com").await;
        admission
            .add_dns(&installation.id, "two.example.com".into(), None)
            .await
            .unwrap();
        let updated = admission
            .set_primary_dns(&installation.id, "two.example.com", None)
            .await
            .unwrap();
        assert_eq!(
            updated.primary_dns().map(|d| d.domain_name.as_str()),
            Some("two.example.com")
        );
        assert!(updated.has_single_primary());
    }
}
