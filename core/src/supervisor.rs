//! Drives resources toward their target states asynchronously. One
//! [`SupervisorWorker`] runs per resource type, each its own tick loop:
//! wait for the timer or a wake signal, list unlocked pending rows, and
//! for every row that locks successfully, dispatch one reconciliation
//! step to a provisioner and persist whatever state the step landed on.
//! A resource that can't be locked this tick is skipped, not failed —
//! racing with Admission or another Supervisor replica is the expected
//! steady state.
//!
//! Every provisioner call runs under a per-action timeout so a wedged
//! external dependency turns into a `*-failed` transition instead of a
//! stuck worker holding a lock forever.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use orchestrator_provisioner::{
    ClusterInstallationProvisioner, ClusterProvisioner, DatabaseProvisioner, DnsProvider,
};
use orchestrator_store::{ClusterInstallationFilter, Store};
use orchestrator_types::{
    BackupState, Cluster, ClusterInstallation, ClusterInstallationState, ClusterState,
    DbMigrationState, DbRestorationState, Installation, InstallationBackup, InstallationState,
    ResourceId, ResourceKind, StateChangeEventData, common::now_ms,
};
use tokio_util::sync::CancellationToken;

use crate::events::EventProducer;
use crate::lock::LockManager;
use crate::machine::deletion_pending_expired;

/// The result of one reconciliation step: the resource with its state
/// already advanced, plus what to put in the event log. `None` from
/// `step` means there was nothing to report this tick (e.g. a deletion
/// grace period that hasn't expired yet).
pub struct StepOutcome<T> {
    pub resource: T,
    pub resource_type: &'static str,
    pub resource_id: ResourceId,
    pub owner_id: String,
    pub event_type: &'static str,
    pub old_state: String,
    pub new_state: String,
}

#[async_trait]
pub trait Reconciler: Send + Sync {
    type Resource: Send + Sync;

    fn kind(&self) -> ResourceKind;
    /// The row whose work lock serializes this step; usually the resource
    /// itself, but e.g. backups lock their owning installation.
    fn lock_id(&self, resource: &Self::Resource) -> ResourceId;
    async fn list_pending(&self, limit: i64) -> anyhow::Result<Vec<Self::Resource>>;
    async fn step(
        &self,
        resource: Self::Resource,
    ) -> anyhow::Result<Option<StepOutcome<Self::Resource>>>;
    async fn persist(&self, resource: Self::Resource) -> anyhow::Result<()>;
}

/// Caps how long a single provisioner call may run. On expiry the step
/// fails like any other provisioner error and is retried next tick.
async fn bounded<T>(
    timeout: Duration,
    fut: impl Future<Output = anyhow::Result<T>> + Send,
) -> anyhow::Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("provisioner call exceeded {timeout:?}")),
    }
}

pub struct SupervisorWorker<R: Reconciler> {
    reconciler: R,
    lock: LockManager,
    events: Arc<EventProducer>,
    wake: Arc<tokio::sync::Notify>,
    batch_size: i64,
    tick: Duration,
}

impl<R: Reconciler> SupervisorWorker<R> {
    pub fn new(
        reconciler: R,
        lock: LockManager,
        events: Arc<EventProducer>,
        wake: Arc<tokio::sync::Notify>,
        batch_size: i64,
        tick: Duration,
    ) -> Self {
        SupervisorWorker {
            reconciler,
            lock,
            events,
            wake,
            batch_size,
            tick,
        }
    }

    /// Runs until `cancel` fires. Any in-flight step completes before
    /// returning; the work lock it holds is released as part of that step.
    /// The wake signal is a hint only — the timer remains authoritative,
    /// so a missed notification never stalls progress.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(kind = %self.reconciler.kind(), "supervisor worker shutting down");
                    return;
                }
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            if let Err(e) = self.tick_once().await {
                tracing::warn!(kind = %self.reconciler.kind(), %e, "supervisor tick failed");
            }
        }
    }

    pub async fn tick_once(&self) -> anyhow::Result<()> {
        let pending = self.reconciler.list_pending(self.batch_size).await?;
        for resource in pending {
            let lock_id = self.reconciler.lock_id(&resource);
            let Some(guard) = self.lock.try_lock(self.reconciler.kind(), &lock_id).await? else {
                continue;
            };
            match self.reconciler.step(resource).await {
                Ok(Some(outcome)) => {
                    let event = StateChangeEventData {
                        resource_type: outcome.resource_type.to_string(),
                        resource_id: outcome.resource_id.clone(),
                        owner_id: outcome.owner_id,
                        old_state: outcome.old_state,
                        new_state: outcome.new_state,
                    };
                    if let Err(e) = self.reconciler.persist(outcome.resource).await {
                        tracing::warn!(id = %outcome.resource_id, %e, "failed to persist supervisor transition");
                    } else if let Err(e) = self.events.emit(outcome.event_type, event, None).await {
                        tracing::warn!(id = %outcome.resource_id, %e, "failed to emit supervisor event");
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(id = %lock_id, %e, "reconciler step failed"),
            }
            if let Err(e) = guard.release().await {
                tracing::warn!(id = %lock_id, %e, "failed to release work lock after tick");
            }
        }
        Ok(())
    }
}

pub struct ClusterReconciler {
    store: Arc<dyn Store>,
    provisioner: Arc<dyn ClusterProvisioner>,
    action_timeout: Duration,
}

impl ClusterReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        provisioner: Arc<dyn ClusterProvisioner>,
        action_timeout: Duration,
    ) -> Self {
        ClusterReconciler {
            store,
            provisioner,
            action_timeout,
        }
    }
}

#[async_trait]
impl Reconciler for ClusterReconciler {
    type Resource = Cluster;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Cluster
    }

    fn lock_id(&self, resource: &Cluster) -> ResourceId {
        resource.id.clone()
    }

    async fn list_pending(&self, limit: i64) -> anyhow::Result<Vec<Cluster>> {
        self.store.list_unlocked_clusters_pending_work(limit).await
    }

    async fn step(&self, mut cluster: Cluster) -> anyhow::Result<Option<StepOutcome<Cluster>>> {
        let t = self.action_timeout;
        let old_state = cluster.state;
        let new_state = match old_state {
            ClusterState::CreationRequested => {
                match bounded(t, self.provisioner.create(&cluster)).await {
                    Ok(()) => ClusterState::ProvisioningRequested,
                    Err(_) => ClusterState::CreationFailed,
                }
            }
            ClusterState::ProvisioningRequested => {
                match bounded(t, self.provisioner.provision(&cluster)).await {
                    Ok(()) => ClusterState::Stable,
                    Err(_) => ClusterState::CreationFailed,
                }
            }
            ClusterState::UpgradeRequested => {
                match bounded(t, self.provisioner.upgrade(&cluster)).await {
                    Ok(()) => {
                        let version = cluster.provisioner_metadata.change_request.version.take();
                        if version.is_some() {
                            cluster.provisioner_metadata.current_version = version;
                        }
                        ClusterState::Stable
                    }
                    Err(_) => ClusterState::UpgradeFailed,
                }
            }
            ClusterState::ResizeRequested => {
                match bounded(t, self.provisioner.resize(&cluster)).await {
                    Ok(()) => {
                        let size = cluster.provisioner_metadata.change_request.size.take();
                        if let Some(size) = &size {
                            cluster.size = size.clone();
                        }
                        if size.is_some() {
                            cluster.provisioner_metadata.current_size = size;
                        }
                        ClusterState::Stable
                    }
                    Err(_) => ClusterState::ResizeFailed,
                }
            }
            ClusterState::DeletionRequested => {
                match bounded(t, self.provisioner.delete(&cluster)).await {
                    Ok(()) => ClusterState::DeletionInProgress,
                    Err(_) => ClusterState::DeletionFailed,
                }
            }
            ClusterState::DeletionInProgress => ClusterState::Deleted,
            _ => return Ok(None),
        };
        cluster.state = new_state;
        Ok(Some(StepOutcome {
            resource_type: "cluster",
            resource_id: cluster.id.clone(),
            owner_id: "system".to_string(),
            event_type: "cluster.state_changed",
            old_state: old_state.to_string(),
            new_state: new_state.to_string(),
            resource: cluster,
        }))
    }

    async fn persist(&self, cluster: Cluster) -> anyhow::Result<()> {
        if cluster.state == ClusterState::Deleted {
            self.store.delete_cluster(&cluster.id).await?;
        } else {
            self.store.update_cluster(cluster).await?;
        }
        Ok(())
    }
}

pub struct InstallationReconciler {
    store: Arc<dyn Store>,
    database: Arc<dyn DatabaseProvisioner>,
    dns: Arc<dyn DnsProvider>,
    ci_provisioner: Arc<dyn ClusterInstallationProvisioner>,
    events: Arc<EventProducer>,
    action_timeout: Duration,
}

impl InstallationReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        database: Arc<dyn DatabaseProvisioner>,
        dns: Arc<dyn DnsProvider>,
        ci_provisioner: Arc<dyn ClusterInstallationProvisioner>,
        events: Arc<EventProducer>,
        action_timeout: Duration,
    ) -> Self {
        InstallationReconciler {
            store,
            database,
            dns,
            ci_provisioner,
            events,
            action_timeout,
        }
    }

    async fn bindings_of(&self, id: &ResourceId) -> anyhow::Result<Vec<ClusterInstallation>> {
        Ok(self
            .store
            .list_cluster_installations(ClusterInstallationFilter {
                installation_id: Some(id.clone()),
                ..Default::default()
            })
            .await?
            .items)
    }

    /// Places a multi-tenant installation into a logical database with
    /// spare capacity, opening a fresh logical database when every
    /// existing one is at its multitenant cluster's per-database cap.
    /// No-ops when the installation isn't multi-tenant, is already
    /// placed, or no multitenant database is registered at all.
    async fn place_multitenant(&self, installation: &Installation) -> anyhow::Result<()> {
        if installation.database != orchestrator_types::DatabaseKind::MultiTenantRdsPostgres {
            return Ok(());
        }
        if self
            .store
            .get_schema_for_installation(&installation.id)
            .await?
            .is_some()
        {
            return Ok(());
        }
        let fleet = self.store.list_multitenant_databases().await?;
        for db in &fleet {
            for logical in self.store.list_logical_databases(&db.id).await? {
                let used = self
                    .store
                    .count_schemas_in_logical_database(&logical.id)
                    .await?;
                if used < db.max_installations_per_logical_database {
                    self.store
                        .create_database_schema(
                            &logical.id,
                            &installation.id,
                            &format!("id_{}", installation.id),
                        )
                        .await?;
                    return Ok(());
                }
            }
        }
        if let Some(db) = fleet.first() {
            let logical = self
                .store
                .create_logical_database(&db.id, &format!("cloud_{}", installation.id))
                .await?;
            self.store
                .create_database_schema(
                    &logical.id,
                    &installation.id,
                    &format!("id_{}", installation.id),
                )
                .await?;
        }
        Ok(())
    }

    /// Nudges every stable binding back into the reconcile loop so the
    /// cluster-installation worker rolls the installation's new shape out.
    async fn request_binding_reconcile(&self, id: &ResourceId) -> anyhow::Result<()> {
        for mut ci in self.bindings_of(id).await? {
            if ci.state == ClusterInstallationState::Stable {
                ci.state = ClusterInstallationState::ReconcilingRequested;
                self.store.update_cluster_installation(ci).await?;
            }
        }
        Ok(())
    }

    async fn emit_op_event(
        &self,
        resource_type: &'static str,
        id: &ResourceId,
        owner_id: &str,
        old_state: String,
        new_state: String,
    ) -> anyhow::Result<()> {
        self.events
            .emit(
                format!("{resource_type}.state_changed"),
                StateChangeEventData {
                    resource_type: resource_type.to_string(),
                    resource_id: id.clone(),
                    owner_id: owner_id.to_string(),
                    old_state,
                    new_state,
                },
                None,
            )
            .await?;
        Ok(())
    }

    /// Advances the open migration operation one phase, dispatching on
    /// the operation's own state so a retried installation picks the
    /// operation up wherever it stalled. Returns the new installation
    /// state once a phase lands, or `None` while only the operation row
    /// moved.
    async fn step_open_migration(
        &self,
        installation: &Installation,
    ) -> anyhow::Result<Option<InstallationState>> {
        let Some(mut op) = self
            .store
            .get_unfinished_db_migration_for(&installation.id)
            .await?
        else {
            // operation vanished (e.g. force-deleted); unwedge the installation
            return Ok(Some(InstallationState::DbMigrationFailed));
        };
        let old_op_state = op.state;
        let (op_state, installation_state) = match old_op_state {
            DbMigrationState::Requested => (DbMigrationState::InProgress, None),
            DbMigrationState::InProgress => {
                match bounded(self.action_timeout, async {
                    let backup_ref = self.database.snapshot(installation).await?;
                    self.database.provision(installation).await?;
                    Ok(backup_ref)
                })
                .await
                {
                    Ok(_) => (DbMigrationState::Succeeded, Some(InstallationState::Hibernating)),
                    Err(_) => (DbMigrationState::Failed, Some(InstallationState::DbMigrationFailed)),
                }
            }
            // the installation is back in an in-progress state, so a
            // retry was admitted: re-run the stalled phase
            DbMigrationState::Failed => (DbMigrationState::Requested, None),
            DbMigrationState::RollbackFailed => (DbMigrationState::RollbackRequested, None),
            DbMigrationState::RollbackRequested => (DbMigrationState::RollbackInProgress, None),
            DbMigrationState::RollbackInProgress => {
                let backup_ref = op
                    .backup_id
                    .as_ref()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "latest".to_string());
                match bounded(self.action_timeout, self.database.restore(installation, &backup_ref))
                    .await
                {
                    Ok(()) => (
                        DbMigrationState::RollbackSucceeded,
                        Some(InstallationState::Hibernating),
                    ),
                    Err(_) => (
                        DbMigrationState::RollbackFailed,
                        Some(InstallationState::DbMigrationFailed),
                    ),
                }
            }
            _ => return Ok(None),
        };
        op.state = op_state;
        self.store.update_db_migration_operation(op.clone()).await?;
        self.emit_op_event(
            "db_migration_operation",
            &op.id,
            &installation.owner_id,
            old_op_state.as_str().to_string(),
            op_state.as_str().to_string(),
        )
        .await?;
        Ok(installation_state)
    }

    async fn step_restoration(
        &self,
        installation: &Installation,
    ) -> anyhow::Result<Option<InstallationState>> {
        let Some(mut op) = self
            .store
            .get_unfinished_db_restoration_for(&installation.id)
            .await?
        else {
            return Ok(Some(InstallationState::DbRestorationFailed));
        };
        let old_op_state = op.state;
        let (op_state, installation_state) = match old_op_state {
            DbRestorationState::Requested => (DbRestorationState::InProgress, None),
            DbRestorationState::Failed => (DbRestorationState::Requested, None),
            DbRestorationState::InProgress => {
                let backup_ref = self
                    .store
                    .get_backup(&op.backup_id)
                    .await?
                    .and_then(|b| b.data_residence)
                    .unwrap_or_else(|| op.backup_id.to_string());
                match bounded(self.action_timeout, self.database.restore(installation, &backup_ref))
                    .await
                {
                    Ok(()) => (DbRestorationState::Succeeded, Some(InstallationState::Hibernating)),
                    Err(_) => (
                        DbRestorationState::Failed,
                        Some(InstallationState::DbRestorationFailed),
                    ),
                }
            }
            _ => return Ok(None),
        };
        op.state = op_state;
        self.store.update_db_restoration_operation(op.clone()).await?;
        self.emit_op_event(
            "db_restoration_operation",
            &op.id,
            &installation.owner_id,
            old_op_state.as_str().to_string(),
            op_state.as_str().to_string(),
        )
        .await?;
        Ok(installation_state)
    }
}

#[async_trait]
impl Reconciler for InstallationReconciler {
    type Resource = Installation;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Installation
    }

    fn lock_id(&self, resource: &Installation) -> ResourceId {
        resource.id.clone()
    }

    async fn list_pending(&self, limit: i64) -> anyhow::Result<Vec<Installation>> {
        self.store.list_unlocked_installations_pending_work(limit).await
    }

    async fn step(
        &self,
        mut installation: Installation,
    ) -> anyhow::Result<Option<StepOutcome<Installation>>> {
        let t = self.action_timeout;
        let old_state = installation.state;
        let new_state = match old_state {
            InstallationState::CreationRequested => {
                self.place_multitenant(&installation).await?;
                match bounded(t, async {
                    self.database.provision(&installation).await?;
                    for record in &installation.dns_records {
                        self.dns
                            .create_records(&installation, &record.domain_name)
                            .await?;
                    }
                    Ok(())
                })
                .await
                {
                    Ok(()) => InstallationState::Stable,
                    Err(_) => InstallationState::CreationFailed,
                }
            }
            InstallationState::UpdateRequested => {
                match self.request_binding_reconcile(&installation.id).await {
                    Ok(()) => InstallationState::Stable,
                    Err(_) => InstallationState::UpdateFailed,
                }
            }
            InstallationState::HibernationRequested => {
                let bindings = self.bindings_of(&installation.id).await?;
                match bounded(t, async {
                    for ci in &bindings {
                        self.ci_provisioner.hibernate(ci).await?;
                    }
                    Ok(())
                })
                .await
                {
                    Ok(()) => InstallationState::HibernationInProgress,
                    // no dedicated failed state; stay requested and retry
                    Err(e) => return Err(e),
                }
            }
            InstallationState::HibernationInProgress => InstallationState::Hibernating,
            InstallationState::WakeUpRequested => {
                let bindings = self.bindings_of(&installation.id).await?;
                match bounded(t, async {
                    for ci in &bindings {
                        self.ci_provisioner.wakeup(ci).await?;
                    }
                    Ok(())
                })
                .await
                {
                    Ok(()) => InstallationState::Stable,
                    Err(e) => return Err(e),
                }
            }
            InstallationState::DbMigrationInProgress
            | InstallationState::DbMigrationRollbackInProgress => {
                match self.step_open_migration(&installation).await? {
                    Some(state) => state,
                    None => return Ok(None),
                }
            }
            InstallationState::DbRestorationInProgress => {
                match self.step_restoration(&installation).await? {
                    Some(state) => state,
                    None => return Ok(None),
                }
            }
            InstallationState::DeletionPendingRequested => InstallationState::DeletionPending,
            InstallationState::DeletionPending => {
                if !deletion_pending_expired(&installation, now_ms()) {
                    return Ok(None);
                }
                InstallationState::DeletionRequested
            }
            InstallationState::DeletionCancellationRequested => InstallationState::Stable,
            InstallationState::DeletionRequested => {
                match bounded(t, async {
                    for record in &installation.dns_records {
                        self.dns
                            .delete_records(&installation, &record.domain_name)
                            .await?;
                    }
                    self.database.teardown(&installation).await?;
                    Ok(())
                })
                .await
                {
                    Ok(()) => {
                        self.store
                            .delete_database_schema_for_installation(&installation.id)
                            .await?;
                        // bindings go through their own deletion machine
                        for mut ci in self.bindings_of(&installation.id).await? {
                            if ci.state != ClusterInstallationState::DeletionRequested {
                                ci.state = ClusterInstallationState::DeletionRequested;
                                self.store.update_cluster_installation(ci).await?;
                            }
                        }
                        InstallationState::DeletionInProgress
                    }
                    Err(_) => InstallationState::DeletionFailed,
                }
            }
            InstallationState::DeletionInProgress => {
                if self.bindings_of(&installation.id).await?.is_empty() {
                    InstallationState::Deleted
                } else {
                    return Ok(None);
                }
            }
            _ => return Ok(None),
        };
        installation.state = new_state;
        Ok(Some(StepOutcome {
            resource_type: "installation",
            resource_id: installation.id.clone(),
            owner_id: installation.owner_id.clone(),
            event_type: "installation.state_changed",
            old_state: old_state.to_string(),
            new_state: new_state.to_string(),
            resource: installation,
        }))
    }

    async fn persist(&self, installation: Installation) -> anyhow::Result<()> {
        if installation.state == InstallationState::Deleted {
            self.store.delete_installation(&installation.id).await?;
        } else {
            self.store.update_installation(installation).await?;
        }
        Ok(())
    }
}

pub struct ClusterInstallationReconciler {
    store: Arc<dyn Store>,
    provisioner: Arc<dyn ClusterInstallationProvisioner>,
    action_timeout: Duration,
}

impl ClusterInstallationReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        provisioner: Arc<dyn ClusterInstallationProvisioner>,
        action_timeout: Duration,
    ) -> Self {
        ClusterInstallationReconciler {
            store,
            provisioner,
            action_timeout,
        }
    }

    async fn installation_for(&self, ci: &ClusterInstallation) -> anyhow::Result<Installation> {
        self.store
            .get_installation(&ci.installation_id, true)
            .await?
            .ok_or_else(|| {
                anyhow!(
                    "installation {} for cluster installation {} not found",
                    ci.installation_id,
                    ci.id
                )
            })
    }
}

#[async_trait]
impl Reconciler for ClusterInstallationReconciler {
    type Resource = ClusterInstallation;

    fn kind(&self) -> ResourceKind {
        ResourceKind::ClusterInstallation
    }

    fn lock_id(&self, resource: &ClusterInstallation) -> ResourceId {
        resource.id.clone()
    }

    async fn list_pending(&self, limit: i64) -> anyhow::Result<Vec<ClusterInstallation>> {
        self.store
            .list_unlocked_cluster_installations_pending_work(limit)
            .await
    }

    async fn step(
        &self,
        mut ci: ClusterInstallation,
    ) -> anyhow::Result<Option<StepOutcome<ClusterInstallation>>> {
        let t = self.action_timeout;
        let old_state = ci.state;
        let new_state = match old_state {
            ClusterInstallationState::CreationRequested => {
                let installation = self.installation_for(&ci).await?;
                match bounded(t, self.provisioner.create(&ci, &installation)).await {
                    Ok(()) => ClusterInstallationState::Stable,
                    Err(_) => ClusterInstallationState::CreationFailed,
                }
            }
            ClusterInstallationState::ReconcilingRequested => {
                let installation = self.installation_for(&ci).await?;
                match bounded(t, self.provisioner.reconcile(&ci, &installation)).await {
                    Ok(()) => ClusterInstallationState::Stable,
                    Err(_) => ClusterInstallationState::ReconcilingFailed,
                }
            }
            ClusterInstallationState::DeletionRequested => {
                match bounded(t, self.provisioner.delete(&ci)).await {
                    Ok(()) => ClusterInstallationState::DeletionInProgress,
                    Err(_) => ClusterInstallationState::DeletionFailed,
                }
            }
            ClusterInstallationState::DeletionInProgress => ClusterInstallationState::Deleted,
            _ => return Ok(None),
        };
        ci.state = new_state;
        Ok(Some(StepOutcome {
            resource_type: "cluster_installation",
            resource_id: ci.id.clone(),
            owner_id: "system".to_string(),
            event_type: "cluster_installation.state_changed",
            old_state: old_state.to_string(),
            new_state: new_state.to_string(),
            resource: ci,
        }))
    }

    async fn persist(&self, ci: ClusterInstallation) -> anyhow::Result<()> {
        if ci.state == ClusterInstallationState::Deleted {
            self.store.delete_cluster_installation(&ci.id).await?;
        } else {
            self.store.update_cluster_installation(ci).await?;
        }
        Ok(())
    }
}

/// Backups don't carry their own lock columns; each step locks the owning
/// installation instead so a snapshot never races the installation's own
/// transitions.
pub struct BackupReconciler {
    store: Arc<dyn Store>,
    database: Arc<dyn DatabaseProvisioner>,
    action_timeout: Duration,
}

impl BackupReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        database: Arc<dyn DatabaseProvisioner>,
        action_timeout: Duration,
    ) -> Self {
        BackupReconciler {
            store,
            database,
            action_timeout,
        }
    }
}

#[async_trait]
impl Reconciler for BackupReconciler {
    type Resource = InstallationBackup;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Installation
    }

    fn lock_id(&self, resource: &InstallationBackup) -> ResourceId {
        resource.installation_id.clone()
    }

    async fn list_pending(&self, limit: i64) -> anyhow::Result<Vec<InstallationBackup>> {
        self.store.list_backups_pending_work(limit).await
    }

    async fn step(
        &self,
        mut backup: InstallationBackup,
    ) -> anyhow::Result<Option<StepOutcome<InstallationBackup>>> {
        let installation = self
            .store
            .get_installation(&backup.installation_id, true)
            .await?
            .ok_or_else(|| anyhow!("installation {} for backup not found", backup.installation_id))?;
        let old_state = backup.state;
        let new_state = match old_state {
            BackupState::BackupRequested => {
                backup.start_at = now_ms();
                BackupState::BackupInProgress
            }
            BackupState::BackupInProgress => {
                match bounded(self.action_timeout, self.database.snapshot(&installation)).await {
                    Ok(data_residence) => {
                        backup.data_residence = Some(data_residence);
                        BackupState::BackupSucceeded
                    }
                    Err(_) => BackupState::BackupFailed,
                }
            }
            _ => return Ok(None),
        };
        backup.state = new_state;
        Ok(Some(StepOutcome {
            resource_type: "backup",
            resource_id: backup.id.clone(),
            owner_id: installation.owner_id,
            event_type: "backup.state_changed",
            old_state: old_state.to_string(),
            new_state: new_state.to_string(),
            resource: backup,
        }))
    }

    async fn persist(&self, backup: InstallationBackup) -> anyhow::Result<()> {
        self.store.update_backup(backup).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_provisioner::noop::{
        NoopClusterInstallationProvisioner, NoopClusterProvisioner, NoopDatabaseProvisioner,
        NoopDnsProvider,
    };
    use orchestrator_store::memory::MemoryStore;
    use orchestrator_types::{CreateClusterRequest, CreateInstallationRequest};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn events(store: &Arc<dyn Store>) -> Arc<EventProducer> {
        Arc::new(EventProducer::new(
            store.clone(),
            Arc::new(tokio::sync::Notify::new()),
        ))
    }

    fn cluster_req() -> CreateClusterRequest {
        CreateClusterRequest {
            provider: "aws".to_string(),
            size: "SizeAlef500".to_string(),
            zones: vec!["us-east-1a".to_string()],
            utility_versions: Default::default(),
            allow_installations: true,
            annotations: Vec::new(),
        }
    }

    fn installation_req(dns: &str) -> CreateInstallationRequest {
        CreateInstallationRequest {
            owner_id: "owner-1".into(),
            dns: dns.into(),
            image: "mattermost".into(),
            version: "9.5.0".into(),
            license: None,
            size: "100users".into(),
            affinity: orchestrator_types::Affinity::MultiTenant,
            database: orchestrator_types::DatabaseKind::MultiTenantRdsPostgres,
            filestore: orchestrator_types::FilestoreKind::Bifrost,
            mattermost_env: Default::default(),
            priority_env: Default::default(),
            volumes: Default::default(),
            group_id: None,
            database_config: None,
            annotations: Vec::new(),
        }
    }

    fn cluster_worker(store: &Arc<dyn Store>) -> SupervisorWorker<ClusterReconciler> {
        SupervisorWorker::new(
            ClusterReconciler::new(store.clone(), Arc::new(NoopClusterProvisioner), TIMEOUT),
            LockManager::new(store.clone()),
            events(store),
            Arc::new(tokio::sync::Notify::new()),
            10,
            Duration::from_secs(5),
        )
    }

    fn installation_worker(store: &Arc<dyn Store>) -> SupervisorWorker<InstallationReconciler> {
        SupervisorWorker::new(
            InstallationReconciler::new(
                store.clone(),
                Arc::new(NoopDatabaseProvisioner),
                Arc::new(NoopDnsProvider),
                Arc::new(NoopClusterInstallationProvisioner),
                events(store),
                TIMEOUT,
            ),
            LockManager::new(store.clone()),
            events(store),
            Arc::new(tokio::sync::Notify::new()),
            10,
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn cluster_worker_advances_creation_requested_to_provisioning_requested() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let worker = cluster_worker(&store);
        let cluster = store.create_cluster(cluster_req()).await.unwrap();

        worker.tick_once().await.unwrap();

        let updated = store.get_cluster(&cluster.id, false).await.unwrap().unwrap();
        assert_eq!(updated.state, ClusterState::ProvisioningRequested);
    }

    #[tokio::test]
    async fn locked_resource_is_skipped_without_error() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let worker = cluster_worker(&store);
        let cluster = store.create_cluster(cluster_req()).await.unwrap();
        store
            .acquire_lock(ResourceKind::Cluster, &cluster.id, "someone-else", now_ms())
            .await
            .unwrap();

        worker.tick_once().await.unwrap();

        let unchanged = store.get_cluster(&cluster.id, false).await.unwrap().unwrap();
        assert_eq!(unchanged.state, ClusterState::CreationRequested);
    }

    #[tokio::test]
    async fn deletion_pending_promotes_only_after_expiry() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let worker = installation_worker(&store);
        let installation = store
            .create_installation(installation_req("dp.example.com"))
            .await
            .unwrap();
        let mut pending = installation.clone();
        pending.state = InstallationState::DeletionPending;
        pending.deletion_pending_expiry = now_ms() + 3_600_000;
        store.update_installation(pending.clone()).await.unwrap();

        worker.tick_once().await.unwrap();
        let unchanged = store
            .get_installation(&installation.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.state, InstallationState::DeletionPending);

        pending.deletion_pending_expiry = now_ms() - 1;
        store.update_installation(pending).await.unwrap();
        worker.tick_once().await.unwrap();
        let promoted = store
            .get_installation(&installation.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(promoted.state, InstallationState::DeletionRequested);
    }

    #[tokio::test]
    async fn migration_operation_advances_phase_by_phase() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let worker = installation_worker(&store);
        let installation = store
            .create_installation(installation_req("mg.example.com"))
            .await
            .unwrap();
        let mut migrating = installation.clone();
        migrating.state = InstallationState::DbMigrationInProgress;
        store.update_installation(migrating).await.unwrap();
        let now = now_ms();
        store
            .create_db_migration_operation(orchestrator_types::InstallationDbMigrationOperation {
                id: ResourceId::new(),
                installation_id: installation.id.clone(),
                source_cluster_installation_id: None,
                destination_cluster_installation_id: None,
                backup_id: None,
                state: DbMigrationState::Requested,
                request_at: now,
                create_at: now,
                update_at: now,
                delete_at: 0,
            })
            .await
            .unwrap();

        // requested -> in-progress, installation unchanged
        worker.tick_once().await.unwrap();
        let op = store
            .get_unfinished_db_migration_for(&installation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op.state, DbMigrationState::InProgress);

        // in-progress -> succeeded, installation back to hibernating
        worker.tick_once().await.unwrap();
        let done = store
            .get_installation(&installation.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.state, InstallationState::Hibernating);
        assert!(
            store
                .get_unfinished_db_migration_for(&installation.id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn backup_worker_snapshots_under_the_installation_lock() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let installation = store
            .create_installation(installation_req("bw.example.com"))
            .await
            .unwrap();
        let backup = store
            .create_backup(InstallationBackup {
                id: ResourceId::new(),
                installation_id: installation.id.clone(),
                cluster_installation_id: None,
                data_residence: None,
                state: BackupState::BackupRequested,
                request_at: now_ms(),
                start_at: 0,
                delete_at: 0,
            })
            .await
            .unwrap();
        let worker = SupervisorWorker::new(
            BackupReconciler::new(store.clone(), Arc::new(NoopDatabaseProvisioner), TIMEOUT),
            LockManager::new(store.clone()),
            events(&store),
            Arc::new(tokio::sync::Notify::new()),
            10,
            Duration::from_secs(5),
        );

        worker.tick_once().await.unwrap();
        assert_eq!(
            store.get_backup(&backup.id).await.unwrap().unwrap().state,
            BackupState::BackupInProgress
        );
        worker.tick_once().await.unwrap();
        let finished = store.get_backup(&backup.id).await.unwrap().unwrap();
        assert_eq!(finished.state, BackupState::BackupSucceeded);
        assert!(finished.data_residence.is_some());
        // the lock on the installation was released after each step
        let row = store
            .get_installation(&installation.id, false)
            .await
            .unwrap()
            .unwrap();
        assert!(!row.lock.is_locked());
    }

    #[tokio::test]
    async fn multitenant_placement_respects_the_logical_database_cap() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let worker = installation_worker(&store);
        let db = store
            .create_multitenant_database(orchestrator_types::CreateMultitenantDatabaseRequest {
                rds_cluster_id: "rds-shared-1".into(),
                max_installations_per_logical_database: 1,
                vpc_id: None,
            })
            .await
            .unwrap();

        let a = store
            .create_installation(installation_req("cap-a.example.com"))
            .await
            .unwrap();
        let b = store
            .create_installation(installation_req("cap-b.example.com"))
            .await
            .unwrap();
        worker.tick_once().await.unwrap();

        let schema_a = store.get_schema_for_installation(&a.id).await.unwrap().unwrap();
        let schema_b = store.get_schema_for_installation(&b.id).await.unwrap().unwrap();
        // with a cap of one per logical database, the two installations
        // cannot share one
        assert_ne!(schema_a.logical_database_id, schema_b.logical_database_id);
        assert_eq!(store.list_logical_databases(&db.id).await.unwrap().len(), 2);
        assert_eq!(
            store
                .count_schemas_in_logical_database(&schema_a.logical_database_id)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn update_rolls_bindings_back_into_reconcile() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let worker = installation_worker(&store);
        let cluster = store.create_cluster(cluster_req()).await.unwrap();
        let installation = store
            .create_installation(installation_req("rb.example.com"))
            .await
            .unwrap();
        let ci = store
            .create_cluster_installation(&cluster.id, &installation.id, "ns-rb", true)
            .await
            .unwrap();
        let mut stable_ci = ci.clone();
        stable_ci.state = ClusterInstallationState::Stable;
        store.update_cluster_installation(stable_ci).await.unwrap();
        let mut updating = installation.clone();
        updating.state = InstallationState::UpdateRequested;
        store.update_installation(updating).await.unwrap();

        worker.tick_once().await.unwrap();

        let refreshed = store
            .get_cluster_installation(&ci.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.state, ClusterInstallationState::ReconcilingRequested);
        let settled = store
            .get_installation(&installation.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.state, InstallationState::Stable);
    }
}
