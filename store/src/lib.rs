pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use orchestrator_types::{
    Cluster, ClusterInstallation, CreateClusterRequest, CreateGroupRequest,
    CreateInstallationRequest, CreateMultitenantDatabaseRequest, CreateSubscriptionRequest,
    DatabaseSchema, Group, Installation, InstallationBackup, InstallationDbMigrationOperation,
    InstallationDbRestorationOperation, LogicalDatabase, Millis, MultitenantDatabase, Page,
    PageRequest, ResourceId, ResourceKind, StateChangeEvent, Subscription, TriState,
};

#[derive(Debug, Clone, Default)]
pub struct ClusterFilter {
    pub page: PageRequest,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InstallationFilter {
    pub page: PageRequest,
    pub state: Option<String>,
    pub owner_id: Option<String>,
    pub dns: Option<String>,
    pub deletion_locked: TriState,
    pub group_id: Option<ResourceId>,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterInstallationFilter {
    pub page: PageRequest,
    pub cluster_id: Option<ResourceId>,
    pub installation_id: Option<ResourceId>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct GroupFilter {
    pub page: PageRequest,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub page: PageRequest,
    pub owner_id: Option<String>,
}

/// Shared filter for the three async-operation kinds.
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub page: PageRequest,
    pub installation_id: Option<ResourceId>,
    pub state: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub page: PageRequest,
    pub resource_id: Option<ResourceId>,
}

/// A strongly consistent, serializable persistent repository: the only
/// place locks, states, and row versions are serialized. Every mutating
/// method is a single transaction; no partial writes are ever observable.
///
/// Split into per-entity CRUD plus the lock primitives and the Supervisor's
/// pending-work selectors. A single implementor (Postgres in production,
/// an in-memory map for tests) satisfies the whole surface so Admission and
/// Supervisor logic can run against either without change.
#[async_trait]
pub trait Store: Send + Sync {
    // ---- Cluster ----
    async fn create_cluster(&self, req: CreateClusterRequest) -> Result<Cluster>;
    async fn get_cluster(&self, id: &ResourceId, include_deleted: bool) -> Result<Option<Cluster>>;
    async fn list_clusters(&self, filter: ClusterFilter) -> Result<Page<Cluster>>;
    async fn update_cluster(&self, cluster: Cluster) -> Result<Cluster>;
    async fn delete_cluster(&self, id: &ResourceId) -> Result<bool>;
    async fn list_unlocked_clusters_pending_work(&self, limit: i64) -> Result<Vec<Cluster>>;

    // ---- Installation ----
    async fn create_installation(&self, req: CreateInstallationRequest) -> Result<Installation>;
    async fn get_installation(
        &self,
        id: &ResourceId,
        include_deleted: bool,
    ) -> Result<Option<Installation>>;
    async fn list_installations(&self, filter: InstallationFilter) -> Result<Page<Installation>>;
    async fn update_installation(&self, installation: Installation) -> Result<Installation>;
    async fn delete_installation(&self, id: &ResourceId) -> Result<bool>;
    async fn list_unlocked_installations_pending_work(&self, limit: i64)
    -> Result<Vec<Installation>>;
    async fn dns_is_taken(&self, domain_name: &str, exclude: Option<&ResourceId>) -> Result<bool>;

    // ---- ClusterInstallation ----
    async fn create_cluster_installation(
        &self,
        cluster_id: &ResourceId,
        installation_id: &ResourceId,
        namespace: &str,
        is_active: bool,
    ) -> Result<ClusterInstallation>;
    async fn get_cluster_installation(
        &self,
        id: &ResourceId,
        include_deleted: bool,
    ) -> Result<Option<ClusterInstallation>>;
    async fn list_cluster_installations(
        &self,
        filter: ClusterInstallationFilter,
    ) -> Result<Page<ClusterInstallation>>;
    async fn update_cluster_installation(
        &self,
        ci: ClusterInstallation,
    ) -> Result<ClusterInstallation>;
    async fn delete_cluster_installation(&self, id: &ResourceId) -> Result<bool>;
    async fn list_unlocked_cluster_installations_pending_work(
        &self,
        limit: i64,
    ) -> Result<Vec<ClusterInstallation>>;
    async fn namespace_is_taken(&self, cluster_id: &ResourceId, namespace: &str) -> Result<bool>;
    /// True when a live installation with a live binding on `cluster_id`
    /// carries the named annotation, i.e. removing it from the cluster
    /// would break the placement contract.
    async fn annotation_in_use(&self, cluster_id: &ResourceId, name: &str) -> Result<bool>;

    // ---- Group ----
    async fn create_group(&self, req: CreateGroupRequest) -> Result<Group>;
    async fn get_group(&self, id: &ResourceId, include_deleted: bool) -> Result<Option<Group>>;
    async fn list_groups(&self, filter: GroupFilter) -> Result<Page<Group>>;
    async fn update_group(&self, group: Group) -> Result<Group>;
    async fn delete_group(&self, id: &ResourceId) -> Result<bool>;

    // ---- Async operations ----
    async fn create_db_migration_operation(
        &self,
        op: InstallationDbMigrationOperation,
    ) -> Result<InstallationDbMigrationOperation>;
    async fn get_db_migration_operation(
        &self,
        id: &ResourceId,
    ) -> Result<Option<InstallationDbMigrationOperation>>;
    async fn update_db_migration_operation(
        &self,
        op: InstallationDbMigrationOperation,
    ) -> Result<InstallationDbMigrationOperation>;
    async fn list_db_migration_operations(
        &self,
        filter: OperationFilter,
    ) -> Result<Page<InstallationDbMigrationOperation>>;
    /// The single non-terminal migration for an installation, if any; the
    /// Installation state machine guarantees there is at most one.
    async fn get_unfinished_db_migration_for(
        &self,
        installation_id: &ResourceId,
    ) -> Result<Option<InstallationDbMigrationOperation>>;

    async fn create_db_restoration_operation(
        &self,
        op: InstallationDbRestorationOperation,
    ) -> Result<InstallationDbRestorationOperation>;
    async fn get_db_restoration_operation(
        &self,
        id: &ResourceId,
    ) -> Result<Option<InstallationDbRestorationOperation>>;
    async fn update_db_restoration_operation(
        &self,
        op: InstallationDbRestorationOperation,
    ) -> Result<InstallationDbRestorationOperation>;
    async fn list_db_restoration_operations(
        &self,
        filter: OperationFilter,
    ) -> Result<Page<InstallationDbRestorationOperation>>;
    async fn get_unfinished_db_restoration_for(
        &self,
        installation_id: &ResourceId,
    ) -> Result<Option<InstallationDbRestorationOperation>>;

    async fn create_backup(&self, backup: InstallationBackup) -> Result<InstallationBackup>;
    async fn get_backup(&self, id: &ResourceId) -> Result<Option<InstallationBackup>>;
    async fn update_backup(&self, backup: InstallationBackup) -> Result<InstallationBackup>;
    async fn list_backups(&self, filter: OperationFilter) -> Result<Page<InstallationBackup>>;
    async fn list_backups_for_installation(
        &self,
        installation_id: &ResourceId,
    ) -> Result<Vec<InstallationBackup>>;
    async fn list_backups_pending_work(&self, limit: i64) -> Result<Vec<InstallationBackup>>;
    async fn backup_in_progress(&self, installation_id: &ResourceId) -> Result<bool>;

    // ---- Subscription ----
    async fn create_subscription(&self, req: CreateSubscriptionRequest) -> Result<Subscription>;
    async fn get_subscription(&self, id: &ResourceId) -> Result<Option<Subscription>>;
    async fn list_subscriptions(&self, filter: SubscriptionFilter) -> Result<Page<Subscription>>;
    async fn update_subscription(&self, sub: Subscription) -> Result<Subscription>;
    async fn delete_subscription(&self, id: &ResourceId) -> Result<bool>;
    async fn subscriptions_for(
        &self,
        owner_id: &str,
        event_type: &str,
    ) -> Result<Vec<Subscription>>;

    // ---- Events ----
    async fn create_event(&self, event: StateChangeEvent) -> Result<StateChangeEvent>;
    async fn list_events(&self, filter: EventFilter) -> Result<Page<StateChangeEvent>>;
    async fn list_undelivered_events(&self, limit: i64) -> Result<Vec<StateChangeEvent>>;
    async fn mark_event_delivered(&self, id: &ResourceId) -> Result<()>;

    // ---- Databases ----
    async fn create_multitenant_database(
        &self,
        req: CreateMultitenantDatabaseRequest,
    ) -> Result<MultitenantDatabase>;
    async fn list_multitenant_databases(&self) -> Result<Vec<MultitenantDatabase>>;
    async fn create_logical_database(
        &self,
        multitenant_database_id: &ResourceId,
        name: &str,
    ) -> Result<LogicalDatabase>;
    async fn list_logical_databases(
        &self,
        multitenant_database_id: &ResourceId,
    ) -> Result<Vec<LogicalDatabase>>;
    async fn create_database_schema(
        &self,
        logical_database_id: &ResourceId,
        installation_id: &ResourceId,
        name: &str,
    ) -> Result<DatabaseSchema>;
    async fn get_schema_for_installation(
        &self,
        installation_id: &ResourceId,
    ) -> Result<Option<DatabaseSchema>>;
    async fn delete_database_schema_for_installation(
        &self,
        installation_id: &ResourceId,
    ) -> Result<bool>;
    async fn count_schemas_in_logical_database(
        &self,
        logical_database_id: &ResourceId,
    ) -> Result<i64>;

    // ---- Lock Manager primitives ----
    /// Atomically sets the work lock iff currently unlocked. Never blocks.
    async fn acquire_lock(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        holder: &str,
        now: Millis,
    ) -> Result<bool>;
    /// Clears the work lock iff `holder` matches, or unconditionally if `force`.
    async fn release_lock(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        holder: &str,
        force: bool,
    ) -> Result<bool>;
    async fn set_api_lock(&self, kind: ResourceKind, id: &ResourceId, locked: bool) -> Result<()>;
    async fn set_deletion_lock(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        locked: bool,
    ) -> Result<()>;
}
