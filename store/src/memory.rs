//! An in-memory `Store` used by admission/supervisor concurrency tests.
//! Keeps the async, lock-by-row contract of the Postgres implementation
//! without requiring a database, so property tests run fast and
//! deterministically.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use orchestrator_types::{
    Cluster, ClusterInstallation, ClusterInstallationState, ClusterState, CreateClusterRequest,
    CreateGroupRequest, CreateInstallationRequest, CreateMultitenantDatabaseRequest,
    CreateSubscriptionRequest, DatabaseSchema, Group, Installation, InstallationBackup,
    InstallationDbMigrationOperation, InstallationDbRestorationOperation, InstallationState,
    LockState, LogicalDatabase, Millis, MultitenantDatabase, Page, ResourceId, ResourceKind,
    StateChangeEvent, Subscription, common::now_ms,
};

use crate::{
    ClusterFilter, ClusterInstallationFilter, EventFilter, GroupFilter, InstallationFilter,
    OperationFilter, SubscriptionFilter,
};

#[derive(Default)]
struct Tables {
    clusters: HashMap<ResourceId, Cluster>,
    installations: HashMap<ResourceId, Installation>,
    cluster_installations: HashMap<ResourceId, ClusterInstallation>,
    groups: HashMap<ResourceId, Group>,
    db_migrations: HashMap<ResourceId, InstallationDbMigrationOperation>,
    db_restorations: HashMap<ResourceId, InstallationDbRestorationOperation>,
    backups: HashMap<ResourceId, InstallationBackup>,
    subscriptions: HashMap<ResourceId, Subscription>,
    events: HashMap<ResourceId, StateChangeEvent>,
    multitenant_databases: HashMap<ResourceId, MultitenantDatabase>,
    logical_databases: HashMap<ResourceId, LogicalDatabase>,
    database_schemas: HashMap<ResourceId, DatabaseSchema>,
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn paginate<T: Clone>(mut items: Vec<T>, page: i64, per_page: i64) -> Page<T> {
    let total = items.len() as i64;
    let (offset, limit) = if per_page <= 0 {
        (0, None)
    } else {
        (page.max(0) * per_page, Some(per_page))
    };
    if offset > 0 {
        items = items.into_iter().skip(offset as usize).collect();
    }
    if let Some(limit) = limit {
        items.truncate(limit as usize);
    }
    let has_more = offset + (items.len() as i64) < total;
    Page {
        page,
        per_page,
        total,
        has_more,
        items,
    }
}

#[async_trait]
impl crate::Store for MemoryStore {
    async fn create_cluster(&self, req: CreateClusterRequest) -> Result<Cluster> {
        let now = now_ms();
        let cluster = Cluster {
            id: ResourceId::new(),
            provider: req.provider,
            size: req.size,
            zones: req.zones,
            utility_versions: req.utility_versions,
            provisioner_metadata: Default::default(),
            allow_installations: req.allow_installations,
            annotations: req
                .annotations
                .into_iter()
                .map(|name| orchestrator_types::Annotation { name })
                .collect(),
            state: ClusterState::CreationRequested,
            create_at: now,
            update_at: now,
            delete_at: 0,
            lock: LockState::default(),
        };
        self.lock().clusters.insert(cluster.id.clone(), cluster.clone());
        Ok(cluster)
    }

    async fn get_cluster(&self, id: &ResourceId, include_deleted: bool) -> Result<Option<Cluster>> {
        Ok(self
            .lock()
            .clusters
            .get(id)
            .filter(|c| include_deleted || !c.is_deleted())
            .cloned())
    }

    async fn list_clusters(&self, filter: ClusterFilter) -> Result<Page<Cluster>> {
        let mut items: Vec<Cluster> = self
            .lock()
            .clusters
            .values()
            .filter(|c| filter.page.include_deleted || !c.is_deleted())
            .filter(|c| {
                filter
                    .state
                    .as_ref()
                    .is_none_or(|s| c.state.as_str() == s)
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| a.create_at.cmp(&b.create_at).then(a.id.cmp(&b.id)));
        Ok(paginate(items, filter.page.page, filter.page.per_page))
    }

    async fn update_cluster(&self, mut cluster: Cluster) -> Result<Cluster> {
        cluster.update_at = now_ms();
        let mut tables = self.lock();
        if !tables.clusters.contains_key(&cluster.id) {
            return Err(anyhow!("cluster not found"));
        }
        tables.clusters.insert(cluster.id.clone(), cluster.clone());
        Ok(cluster)
    }

    async fn delete_cluster(&self, id: &ResourceId) -> Result<bool> {
        let mut tables = self.lock();
        if let Some(c) = tables.clusters.get_mut(id) {
            let now = now_ms();
            c.delete_at = now;
            c.update_at = now;
            c.lock = LockState::default();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn list_unlocked_clusters_pending_work(&self, limit: i64) -> Result<Vec<Cluster>> {
        let mut items: Vec<Cluster> = self
            .lock()
            .clusters
            .values()
            .filter(|c| !c.is_deleted() && !c.lock.is_locked() && !c.state.is_terminal())
            .cloned()
            .collect();
        items.sort_by(|a, b| a.create_at.cmp(&b.create_at));
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn create_installation(&self, req: CreateInstallationRequest) -> Result<Installation> {
        let now = now_ms();
        let primary_dns = req.dns.to_lowercase();
        let installation = Installation {
            id: ResourceId::new(),
            owner_id: req.owner_id,
            dns_records: vec![orchestrator_types::DnsRecord {
                domain_name: primary_dns.clone(),
                primary: true,
            }],
            name: primary_dns,
            image: req.image,
            version: req.version,
            license: req.license,
            size: req.size,
            affinity: req.affinity,
            database: req.database,
            filestore: req.filestore,
            mattermost_env: req.mattermost_env,
            priority_env: req.priority_env,
            volumes: req.volumes,
            cr_version: "0".to_string(),
            group_sequence: req.group_id.as_ref().map(|_| 0),
            group_id: req.group_id,
            database_config: req.database_config,
            annotations: req
                .annotations
                .into_iter()
                .map(|name| orchestrator_types::Annotation { name })
                .collect(),
            deletion_locked: false,
            deletion_pending_expiry: 0,
            state: InstallationState::CreationRequested,
            create_at: now,
            update_at: now,
            delete_at: 0,
            lock: LockState::default(),
        };
        self.lock()
            .installations
            .insert(installation.id.clone(), installation.clone());
        Ok(installation)
    }

    async fn get_installation(
        &self,
        id: &ResourceId,
        include_deleted: bool,
    ) -> Result<Option<Installation>> {
        Ok(self
            .lock()
            .installations
            .get(id)
            .filter(|i| include_deleted || !i.is_deleted())
            .cloned())
    }

    async fn list_installations(&self, filter: InstallationFilter) -> Result<Page<Installation>> {
        let mut items: Vec<Installation> = self
            .lock()
            .installations
            .values()
            .filter(|i| filter.page.include_deleted || !i.is_deleted())
            .filter(|i| {
                filter
                    .state
                    .as_ref()
                    .is_none_or(|s| i.state.as_str() == s)
            })
            .filter(|i| {
                filter
                    .owner_id
                    .as_ref()
                    .is_none_or(|o| &i.owner_id == o)
            })
            .filter(|i| {
                filter.dns.as_ref().is_none_or(|d| {
                    i.primary_dns().map(|r| r.domain_name.as_str()) == Some(d.as_str())
                })
            })
            .filter(|i| match filter.deletion_locked {
                orchestrator_types::TriState::Any => true,
                orchestrator_types::TriState::OnlyTrue => i.deletion_locked,
                orchestrator_types::TriState::OnlyFalse => !i.deletion_locked,
            })
            .filter(|i| {
                filter
                    .group_id
                    .as_ref()
                    .is_none_or(|g| i.group_id.as_ref() == Some(g))
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| a.create_at.cmp(&b.create_at).then(a.id.cmp(&b.id)));
        Ok(paginate(items, filter.page.page, filter.page.per_page))
    }

    async fn update_installation(&self, mut installation: Installation) -> Result<Installation> {
        installation.update_at = now_ms();
        let mut tables = self.lock();
        if !tables.installations.contains_key(&installation.id) {
            return Err(anyhow!("installation not found"));
        }
        tables
            .installations
            .insert(installation.id.clone(), installation.clone());
        Ok(installation)
    }

    async fn delete_installation(&self, id: &ResourceId) -> Result<bool> {
        let mut tables = self.lock();
        if let Some(i) = tables.installations.get_mut(id) {
            let now = now_ms();
            i.delete_at = now;
            i.update_at = now;
            i.lock = LockState::default();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn list_unlocked_installations_pending_work(
        &self,
        limit: i64,
    ) -> Result<Vec<Installation>> {
        let mut items: Vec<Installation> = self
            .lock()
            .installations
            .values()
            .filter(|i| !i.is_deleted() && !i.lock.is_locked() && !i.state.is_terminal())
            .cloned()
            .collect();
        items.sort_by(|a, b| a.create_at.cmp(&b.create_at));
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn dns_is_taken(&self, domain_name: &str, exclude: Option<&ResourceId>) -> Result<bool> {
        let needle = domain_name.to_lowercase();
        Ok(self.lock().installations.values().any(|i| {
            !i.is_deleted()
                && exclude != Some(&i.id)
                && i.dns_records.iter().any(|d| d.domain_name == needle)
        }))
    }

    async fn create_cluster_installation(
        &self,
        cluster_id: &ResourceId,
        installation_id: &ResourceId,
        namespace: &str,
        is_active: bool,
    ) -> Result<ClusterInstallation> {
        let now = now_ms();
        let ci = ClusterInstallation {
            id: ResourceId::new(),
            cluster_id: cluster_id.clone(),
            installation_id: installation_id.clone(),
            namespace: namespace.to_string(),
            is_active,
            api_locked: false,
            state: ClusterInstallationState::CreationRequested,
            create_at: now,
            update_at: now,
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        };
        self.lock()
            .cluster_installations
            .insert(ci.id.clone(), ci.clone());
        Ok(ci)
    }

    async fn get_cluster_installation(
        &self,
        id: &ResourceId,
        include_deleted: bool,
    ) -> Result<Option<ClusterInstallation>> {
        Ok(self
            .lock()
            .cluster_installations
            .get(id)
            .filter(|ci| include_deleted || !ci.is_deleted())
            .cloned())
    }

    async fn list_cluster_installations(
        &self,
        filter: ClusterInstallationFilter,
    ) -> Result<Page<ClusterInstallation>> {
        let mut items: Vec<ClusterInstallation> = self
            .lock()
            .cluster_installations
            .values()
            .filter(|ci| filter.page.include_deleted || !ci.is_deleted())
            .filter(|ci| {
                filter
                    .cluster_id
                    .as_ref()
                    .is_none_or(|c| &ci.cluster_id == c)
            })
            .filter(|ci| {
                filter
                    .installation_id
                    .as_ref()
                    .is_none_or(|i| &ci.installation_id == i)
            })
            .filter(|ci| filter.is_active.is_none_or(|a| ci.is_active == a))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.create_at.cmp(&b.create_at).then(a.id.cmp(&b.id)));
        Ok(paginate(items, filter.page.page, filter.page.per_page))
    }

    async fn update_cluster_installation(
        &self,
        mut ci: ClusterInstallation,
    ) -> Result<ClusterInstallation> {
        ci.update_at = now_ms();
        let mut tables = self.lock();
        if !tables.cluster_installations.contains_key(&ci.id) {
            return Err(anyhow!("cluster installation not found"));
        }
        tables.cluster_installations.insert(ci.id.clone(), ci.clone());
        Ok(ci)
    }

    async fn delete_cluster_installation(&self, id: &ResourceId) -> Result<bool> {
        let mut tables = self.lock();
        if let Some(ci) = tables.cluster_installations.get_mut(id) {
            let now = now_ms();
            ci.delete_at = now;
            ci.update_at = now;
            ci.lock_acquired_by = None;
            ci.lock_acquired_at = 0;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn list_unlocked_cluster_installations_pending_work(
        &self,
        limit: i64,
    ) -> Result<Vec<ClusterInstallation>> {
        let mut items: Vec<ClusterInstallation> = self
            .lock()
            .cluster_installations
            .values()
            .filter(|ci| !ci.is_deleted() && !ci.is_locked() && !ci.state.is_terminal())
            .cloned()
            .collect();
        items.sort_by(|a, b| a.create_at.cmp(&b.create_at));
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn namespace_is_taken(&self, cluster_id: &ResourceId, namespace: &str) -> Result<bool> {
        Ok(self.lock().cluster_installations.values().any(|ci| {
            !ci.is_deleted() && &ci.cluster_id == cluster_id && ci.namespace == namespace
        }))
    }

    async fn annotation_in_use(&self, cluster_id: &ResourceId, name: &str) -> Result<bool> {
        let tables = self.lock();
        Ok(tables
            .cluster_installations
            .values()
            .filter(|ci| !ci.is_deleted() && &ci.cluster_id == cluster_id)
            .filter_map(|ci| tables.installations.get(&ci.installation_id))
            .any(|i| !i.is_deleted() && i.annotations.iter().any(|a| a.name == name)))
    }

    async fn create_group(&self, req: CreateGroupRequest) -> Result<Group> {
        let now = now_ms();
        let group = Group {
            id: ResourceId::new(),
            name: req.name,
            version: req.version,
            image: req.image,
            mattermost_env: req.mattermost_env,
            max_rolling: req.max_rolling,
            annotations: Vec::new(),
            sequence: 0,
            create_at: now,
            update_at: now,
            delete_at: 0,
        };
        self.lock().groups.insert(group.id.clone(), group.clone());
        Ok(group)
    }

    async fn get_group(&self, id: &ResourceId, include_deleted: bool) -> Result<Option<Group>> {
        Ok(self
            .lock()
            .groups
            .get(id)
            .filter(|g| include_deleted || !g.is_deleted())
            .cloned())
    }

    async fn list_groups(&self, filter: GroupFilter) -> Result<Page<Group>> {
        let mut items: Vec<Group> = self
            .lock()
            .groups
            .values()
            .filter(|g| filter.page.include_deleted || !g.is_deleted())
            .cloned()
            .collect();
        items.sort_by(|a, b| a.create_at.cmp(&b.create_at).then(a.id.cmp(&b.id)));
        Ok(paginate(items, filter.page.page, filter.page.per_page))
    }

    async fn update_group(&self, mut group: Group) -> Result<Group> {
        group.update_at = now_ms();
        let mut tables = self.lock();
        if !tables.groups.contains_key(&group.id) {
            return Err(anyhow!("group not found"));
        }
        tables.groups.insert(group.id.clone(), group.clone());
        Ok(group)
    }

    async fn delete_group(&self, id: &ResourceId) -> Result<bool> {
        let mut tables = self.lock();
        if let Some(g) = tables.groups.get_mut(id) {
            let now = now_ms();
            g.delete_at = now;
            g.update_at = now;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn create_db_migration_operation(
        &self,
        op: InstallationDbMigrationOperation,
    ) -> Result<InstallationDbMigrationOperation> {
        self.lock().db_migrations.insert(op.id.clone(), op.clone());
        Ok(op)
    }

    async fn get_db_migration_operation(
        &self,
        id: &ResourceId,
    ) -> Result<Option<InstallationDbMigrationOperation>> {
        Ok(self.lock().db_migrations.get(id).cloned())
    }

    async fn update_db_migration_operation(
        &self,
        op: InstallationDbMigrationOperation,
    ) -> Result<InstallationDbMigrationOperation> {
        let mut tables = self.lock();
        if !tables.db_migrations.contains_key(&op.id) {
            return Err(anyhow!("db migration operation not found"));
        }
        tables.db_migrations.insert(op.id.clone(), op.clone());
        Ok(op)
    }

    async fn list_db_migration_operations(
        &self,
        filter: OperationFilter,
    ) -> Result<Page<InstallationDbMigrationOperation>> {
        let mut items: Vec<_> = self
            .lock()
            .db_migrations
            .values()
            .filter(|op| {
                filter
                    .installation_id
                    .as_ref()
                    .is_none_or(|id| &op.installation_id == id)
            })
            .filter(|op| filter.state.as_ref().is_none_or(|s| op.state.as_str() == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.create_at.cmp(&b.create_at).then(a.id.cmp(&b.id)));
        Ok(paginate(items, filter.page.page, filter.page.per_page))
    }

    async fn get_unfinished_db_migration_for(
        &self,
        installation_id: &ResourceId,
    ) -> Result<Option<InstallationDbMigrationOperation>> {
        Ok(self
            .lock()
            .db_migrations
            .values()
            .filter(|op| &op.installation_id == installation_id && !op.state.is_terminal())
            .min_by_key(|op| op.create_at)
            .cloned())
    }

    async fn create_db_restoration_operation(
        &self,
        op: InstallationDbRestorationOperation,
    ) -> Result<InstallationDbRestorationOperation> {
        self.lock().db_restorations.insert(op.id.clone(), op.clone());
        Ok(op)
    }

    async fn get_db_restoration_operation(
        &self,
        id: &ResourceId,
    ) -> Result<Option<InstallationDbRestorationOperation>> {
        Ok(self.lock().db_restorations.get(id).cloned())
    }

    async fn update_db_restoration_operation(
        &self,
        op: InstallationDbRestorationOperation,
    ) -> Result<InstallationDbRestorationOperation> {
        let mut tables = self.lock();
        if !tables.db_restorations.contains_key(&op.id) {
            return Err(anyhow!("db restoration operation not found"));
        }
        tables.db_restorations.insert(op.id.clone(), op.clone());
        Ok(op)
    }

    async fn list_db_restoration_operations(
        &self,
        filter: OperationFilter,
    ) -> Result<Page<InstallationDbRestorationOperation>> {
        let mut items: Vec<_> = self
            .lock()
            .db_restorations
            .values()
            .filter(|op| {
                filter
                    .installation_id
                    .as_ref()
                    .is_none_or(|id| &op.installation_id == id)
            })
            .filter(|op| filter.state.as_ref().is_none_or(|s| op.state.as_str() == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.create_at.cmp(&b.create_at).then(a.id.cmp(&b.id)));
        Ok(paginate(items, filter.page.page, filter.page.per_page))
    }

    async fn get_unfinished_db_restoration_for(
        &self,
        installation_id: &ResourceId,
    ) -> Result<Option<InstallationDbRestorationOperation>> {
        Ok(self
            .lock()
            .db_restorations
            .values()
            .filter(|op| &op.installation_id == installation_id && !op.state.is_terminal())
            .min_by_key(|op| op.create_at)
            .cloned())
    }

    async fn create_backup(&self, backup: InstallationBackup) -> Result<InstallationBackup> {
        self.lock().backups.insert(backup.id.clone(), backup.clone());
        Ok(backup)
    }

    async fn get_backup(&self, id: &ResourceId) -> Result<Option<InstallationBackup>> {
        Ok(self.lock().backups.get(id).cloned())
    }

    async fn update_backup(&self, backup: InstallationBackup) -> Result<InstallationBackup> {
        let mut tables = self.lock();
        if !tables.backups.contains_key(&backup.id) {
            return Err(anyhow!("backup not found"));
        }
        tables.backups.insert(backup.id.clone(), backup.clone());
        Ok(backup)
    }

    async fn list_backups(&self, filter: OperationFilter) -> Result<Page<InstallationBackup>> {
        let mut items: Vec<_> = self
            .lock()
            .backups
            .values()
            .filter(|b| {
                filter
                    .installation_id
                    .as_ref()
                    .is_none_or(|id| &b.installation_id == id)
            })
            .filter(|b| filter.state.as_ref().is_none_or(|s| b.state.as_str() == s))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.request_at.cmp(&b.request_at).then(a.id.cmp(&b.id)));
        Ok(paginate(items, filter.page.page, filter.page.per_page))
    }

    async fn list_backups_for_installation(
        &self,
        installation_id: &ResourceId,
    ) -> Result<Vec<InstallationBackup>> {
        Ok(self
            .lock()
            .backups
            .values()
            .filter(|b| &b.installation_id == installation_id)
            .cloned()
            .collect())
    }

    async fn list_backups_pending_work(&self, limit: i64) -> Result<Vec<InstallationBackup>> {
        let mut items: Vec<_> = self
            .lock()
            .backups
            .values()
            .filter(|b| {
                b.delete_at == 0
                    && matches!(
                        b.state,
                        orchestrator_types::BackupState::BackupRequested
                            | orchestrator_types::BackupState::BackupInProgress
                    )
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| a.request_at.cmp(&b.request_at));
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn backup_in_progress(&self, installation_id: &ResourceId) -> Result<bool> {
        Ok(self.lock().backups.values().any(|b| {
            &b.installation_id == installation_id
                && b.delete_at == 0
                && matches!(
                    b.state,
                    orchestrator_types::BackupState::BackupRequested
                        | orchestrator_types::BackupState::BackupInProgress
                )
        }))
    }

    async fn create_subscription(&self, req: CreateSubscriptionRequest) -> Result<Subscription> {
        let now = now_ms();
        let sub = Subscription {
            id: ResourceId::new(),
            owner_id: req.owner_id,
            url: req.url,
            headers: req.headers,
            event_type: req.event_type,
            failure_threshold_ms: req.failure_threshold_ms,
            last_delivery_attempt_at: 0,
            last_delivery_success_at: 0,
            failure_count: 0,
            create_at: now,
            update_at: now,
            delete_at: 0,
        };
        self.lock().subscriptions.insert(sub.id.clone(), sub.clone());
        Ok(sub)
    }

    async fn get_subscription(&self, id: &ResourceId) -> Result<Option<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .get(id)
            .filter(|s| !s.is_deleted())
            .cloned())
    }

    async fn list_subscriptions(&self, filter: SubscriptionFilter) -> Result<Page<Subscription>> {
        let mut items: Vec<Subscription> = self
            .lock()
            .subscriptions
            .values()
            .filter(|s| filter.page.include_deleted || !s.is_deleted())
            .filter(|s| {
                filter
                    .owner_id
                    .as_ref()
                    .is_none_or(|o| &s.owner_id == o)
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| a.create_at.cmp(&b.create_at).then(a.id.cmp(&b.id)));
        Ok(paginate(items, filter.page.page, filter.page.per_page))
    }

    async fn update_subscription(&self, mut sub: Subscription) -> Result<Subscription> {
        sub.update_at = now_ms();
        let mut tables = self.lock();
        if !tables.subscriptions.contains_key(&sub.id) {
            return Err(anyhow!("subscription not found"));
        }
        tables.subscriptions.insert(sub.id.clone(), sub.clone());
        Ok(sub)
    }

    async fn delete_subscription(&self, id: &ResourceId) -> Result<bool> {
        let mut tables = self.lock();
        if let Some(s) = tables.subscriptions.get_mut(id) {
            let now = now_ms();
            s.delete_at = now;
            s.update_at = now;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn subscriptions_for(
        &self,
        owner_id: &str,
        event_type: &str,
    ) -> Result<Vec<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .values()
            .filter(|s| {
                !s.is_deleted()
                    && s.owner_id == owner_id
                    && s.event_type.as_deref().is_none_or(|t| t == event_type)
            })
            .cloned()
            .collect())
    }

    async fn create_event(&self, event: StateChangeEvent) -> Result<StateChangeEvent> {
        self.lock().events.insert(event.id.clone(), event.clone());
        Ok(event)
    }

    async fn list_events(&self, filter: EventFilter) -> Result<Page<StateChangeEvent>> {
        let mut items: Vec<StateChangeEvent> = self
            .lock()
            .events
            .values()
            .filter(|e| {
                filter
                    .resource_id
                    .as_ref()
                    .is_none_or(|id| &e.data.resource_id == id)
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(paginate(items, filter.page.page, filter.page.per_page))
    }

    async fn list_undelivered_events(&self, limit: i64) -> Result<Vec<StateChangeEvent>> {
        let mut items: Vec<StateChangeEvent> = self
            .lock()
            .events
            .values()
            .filter(|e| !e.delivered)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        items.truncate(limit.max(0) as usize);
        Ok(items)
    }

    async fn mark_event_delivered(&self, id: &ResourceId) -> Result<()> {
        if let Some(e) = self.lock().events.get_mut(id) {
            e.delivered = true;
        }
        Ok(())
    }

    async fn create_multitenant_database(
        &self,
        req: CreateMultitenantDatabaseRequest,
    ) -> Result<MultitenantDatabase> {
        let now = now_ms();
        let db = MultitenantDatabase {
            id: ResourceId::new(),
            rds_cluster_id: req.rds_cluster_id,
            max_installations_per_logical_database: req.max_installations_per_logical_database,
            vpc_id: req.vpc_id,
            create_at: now,
            update_at: now,
            delete_at: 0,
        };
        self.lock()
            .multitenant_databases
            .insert(db.id.clone(), db.clone());
        Ok(db)
    }

    async fn list_multitenant_databases(&self) -> Result<Vec<MultitenantDatabase>> {
        let mut items: Vec<_> = self
            .lock()
            .multitenant_databases
            .values()
            .filter(|db| db.delete_at == 0)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.create_at.cmp(&b.create_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn create_logical_database(
        &self,
        multitenant_database_id: &ResourceId,
        name: &str,
    ) -> Result<LogicalDatabase> {
        let now = now_ms();
        let db = LogicalDatabase {
            id: ResourceId::new(),
            multitenant_database_id: multitenant_database_id.clone(),
            name: name.to_string(),
            create_at: now,
            update_at: now,
            delete_at: 0,
        };
        self.lock()
            .logical_databases
            .insert(db.id.clone(), db.clone());
        Ok(db)
    }

    async fn list_logical_databases(
        &self,
        multitenant_database_id: &ResourceId,
    ) -> Result<Vec<LogicalDatabase>> {
        let mut items: Vec<_> = self
            .lock()
            .logical_databases
            .values()
            .filter(|db| {
                db.delete_at == 0 && &db.multitenant_database_id == multitenant_database_id
            })
            .cloned()
            .collect();
        items.sort_by(|a, b| a.create_at.cmp(&b.create_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn create_database_schema(
        &self,
        logical_database_id: &ResourceId,
        installation_id: &ResourceId,
        name: &str,
    ) -> Result<DatabaseSchema> {
        let now = now_ms();
        let schema = DatabaseSchema {
            id: ResourceId::new(),
            logical_database_id: logical_database_id.clone(),
            installation_id: installation_id.clone(),
            name: name.to_string(),
            create_at: now,
            update_at: now,
            delete_at: 0,
        };
        self.lock()
            .database_schemas
            .insert(schema.id.clone(), schema.clone());
        Ok(schema)
    }

    async fn get_schema_for_installation(
        &self,
        installation_id: &ResourceId,
    ) -> Result<Option<DatabaseSchema>> {
        Ok(self
            .lock()
            .database_schemas
            .values()
            .find(|s| s.delete_at == 0 && &s.installation_id == installation_id)
            .cloned())
    }

    async fn delete_database_schema_for_installation(
        &self,
        installation_id: &ResourceId,
    ) -> Result<bool> {
        let now = now_ms();
        let mut deleted = false;
        for schema in self.lock().database_schemas.values_mut() {
            if schema.delete_at == 0 && &schema.installation_id == installation_id {
                schema.delete_at = now;
                schema.update_at = now;
                deleted = true;
            }
        }
        Ok(deleted)
    }

    async fn count_schemas_in_logical_database(
        &self,
        logical_database_id: &ResourceId,
    ) -> Result<i64> {
        Ok(self
            .lock()
            .database_schemas
            .values()
            .filter(|s| s.delete_at == 0 && &s.logical_database_id == logical_database_id)
            .count() as i64)
    }

    async fn acquire_lock(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        holder: &str,
        now: Millis,
    ) -> Result<bool> {
        let mut tables = self.lock();
        let lock_state = match kind {
            ResourceKind::Cluster => tables.clusters.get_mut(id).map(|c| &mut c.lock),
            ResourceKind::Installation => tables.installations.get_mut(id).map(|i| &mut i.lock),
            _ => None,
        };
        if let Some(lock) = lock_state {
            if lock.lock_acquired_at == 0 {
                lock.lock_acquired_by = Some(holder.to_string());
                lock.lock_acquired_at = now;
                return Ok(true);
            }
            return Ok(false);
        }
        if kind == ResourceKind::ClusterInstallation
            && let Some(ci) = tables.cluster_installations.get_mut(id)
        {
            if ci.lock_acquired_at == 0 {
                ci.lock_acquired_by = Some(holder.to_string());
                ci.lock_acquired_at = now;
                return Ok(true);
            }
            return Ok(false);
        }
        Err(anyhow!("resource not found for lock"))
    }

    async fn release_lock(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        holder: &str,
        force: bool,
    ) -> Result<bool> {
        let mut tables = self.lock();
        let lock_state = match kind {
            ResourceKind::Cluster => tables.clusters.get_mut(id).map(|c| &mut c.lock),
            ResourceKind::Installation => tables.installations.get_mut(id).map(|i| &mut i.lock),
            _ => None,
        };
        if let Some(lock) = lock_state {
            if force || lock.lock_acquired_by.as_deref() == Some(holder) {
                lock.lock_acquired_by = None;
                lock.lock_acquired_at = 0;
                return Ok(true);
            }
            return Ok(false);
        }
        if kind == ResourceKind::ClusterInstallation
            && let Some(ci) = tables.cluster_installations.get_mut(id)
        {
            if force || ci.lock_acquired_by.as_deref() == Some(holder) {
                ci.lock_acquired_by = None;
                ci.lock_acquired_at = 0;
                return Ok(true);
            }
            return Ok(false);
        }
        Ok(false)
    }

    async fn set_api_lock(&self, kind: ResourceKind, id: &ResourceId, locked: bool) -> Result<()> {
        let mut tables = self.lock();
        match kind {
            ResourceKind::Cluster => {
                if let Some(c) = tables.clusters.get_mut(id) {
                    c.lock.api_locked = locked;
                }
            }
            ResourceKind::Installation => {
                if let Some(i) = tables.installations.get_mut(id) {
                    i.lock.api_locked = locked;
                }
            }
            ResourceKind::ClusterInstallation => {
                if let Some(ci) = tables.cluster_installations.get_mut(id) {
                    ci.api_locked = locked;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn set_deletion_lock(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        locked: bool,
    ) -> Result<()> {
        let mut tables = self.lock();
        match kind {
            ResourceKind::Cluster => {
                if let Some(c) = tables.clusters.get_mut(id) {
                    c.lock.deletion_locked = locked;
                }
            }
            ResourceKind::Installation => {
                if let Some(i) = tables.installations.get_mut(id) {
                    i.deletion_locked = locked;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    fn req(dns: &str) -> CreateInstallationRequest {
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

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let store = MemoryStore::new();
        let created = store.create_installation(req("a.example.com")).await.unwrap();
        let fetched = store
            .get_installation(&created.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.id, fetched.id);
        assert_eq!(
            fetched.primary_dns().map(|d| d.domain_name.as_str()),
            Some("a.example.com")
        );
    }

    #[tokio::test]
    async fn delete_sets_delete_at() {
        let store = MemoryStore::new();
        let created = store.create_installation(req("b.example.com")).await.unwrap();
        assert!(store.delete_installation(&created.id).await.unwrap());
        let fetched = store
            .get_installation(&created.id, true)
            .await
            .unwrap()
            .unwrap();
        assert!(fetched.delete_at > 0);
        assert!(
            store
                .get_installation(&created.id, false)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn lock_is_exclusive() {
        let store = MemoryStore::new();
        let created = store.create_installation(req("c.example.com")).await.unwrap();
        let now = now_ms();
        assert!(
            store
                .acquire_lock(ResourceKind::Installation, &created.id, "worker-a", now)
                .await
                .unwrap()
        );
        assert!(
            !store
                .acquire_lock(ResourceKind::Installation, &created.id, "worker-b", now)
                .await
                .unwrap()
        );
        assert!(
            !store
                .release_lock(ResourceKind::Installation, &created.id, "worker-b", false)
                .await
                .unwrap()
        );
        assert!(
            store
                .release_lock(ResourceKind::Installation, &created.id, "worker-a", false)
                .await
                .unwrap()
        );
        assert!(
            store
                .acquire_lock(ResourceKind::Installation, &created.id, "worker-b", now)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn dns_conflict_detected() {
        let store = MemoryStore::new();
        store.create_installation(req("dup.example.com")).await.unwrap();
        assert!(store.dns_is_taken("DUP.example.com", None).await.unwrap());
        assert!(!store.dns_is_taken("other.example.com", None).await.unwrap());
    }

    #[tokio::test]
    async fn annotation_in_use_tracks_live_bindings_only() {
        let store = MemoryStore::new();
        let cluster = store
            .create_cluster(CreateClusterRequest {
                provider: "aws".into(),
                size: "SizeAlef500".into(),
                zones: vec!["zone".into()],
                utility_versions: Default::default(),
                allow_installations: true,
                annotations: vec!["multi-tenant".into()],
            })
            .await
            .unwrap();
        let mut request = req("ann.example.com");
        request.annotations = vec!["multi-tenant".into()];
        let installation = store.create_installation(request).await.unwrap();

        assert!(!store.annotation_in_use(&cluster.id, "multi-tenant").await.unwrap());

        let ci = store
            .create_cluster_installation(&cluster.id, &installation.id, "ns-ann", true)
            .await
            .unwrap();
        assert!(store.annotation_in_use(&cluster.id, "multi-tenant").await.unwrap());
        assert!(!store.annotation_in_use(&cluster.id, "other").await.unwrap());

        store.delete_cluster_installation(&ci.id).await.unwrap();
        assert!(!store.annotation_in_use(&cluster.id, "multi-tenant").await.unwrap());
    }

    #[tokio::test]
    async fn paging_covers_full_set_disjointly() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .create_installation(req(&format!("host{i}.example.com")))
                .await
                .unwrap();
        }
        let mut seen = std::collections::HashSet::new();
        for page in 0..3 {
            let p = store
                .list_installations(InstallationFilter {
                    page: orchestrator_types::PageRequest {
                        page,
                        per_page: 2,
                        include_deleted: false,
                    },
                    ..Default::default()
                })
                .await
                .unwrap();
            for item in p.items {
                assert!(seen.insert(item.id));
            }
        }
        assert_eq!(seen.len(), 5);
    }
}
