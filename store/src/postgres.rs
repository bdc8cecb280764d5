//! The production `Store`: one row per resource, a handful of indexed
//! scalar columns for the selectors the Supervisor and Admission actually
//! filter on, and the resource's full JSON representation in a `document`
//! column so adding a field never requires a migration.
//!
//! Schema init follows `CREATE TABLE IF NOT EXISTS` / `ALTER TABLE ADD
//! COLUMN IF NOT EXISTS` so re-running it against a live database is safe.
//! Listing uses `COUNT(*) OVER()` to fetch the page and the total row count
//! in one round trip. The four lock primitives are the one place updates
//! are conditional rather than whole-object: they're compare-and-swap
//! `UPDATE ... WHERE lock_acquired_at = 0 RETURNING` statements so two
//! processes racing to lock the same row never both win.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use deadpool_postgres::Pool;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_postgres::Row;
use tokio_postgres::types::ToSql;

use orchestrator_types::{
    Cluster, ClusterInstallation, CreateClusterRequest, CreateGroupRequest,
    CreateInstallationRequest, CreateMultitenantDatabaseRequest, CreateSubscriptionRequest,
    DatabaseSchema, Group, Installation, InstallationBackup, InstallationDbMigrationOperation,
    InstallationDbRestorationOperation, LogicalDatabase, Millis, MultitenantDatabase, Page,
    ResourceId, ResourceKind, StateChangeEvent, Subscription, TriState, common::now_ms,
};

use crate::{
    ClusterFilter, ClusterInstallationFilter, EventFilter, GroupFilter, InstallationFilter,
    OperationFilter, SubscriptionFilter,
};

pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    pub fn new(pool: Pool) -> Self {
        PostgresStore { pool }
    }
}

fn doc<T: DeserializeOwned>(row: &Row) -> Result<T> {
    let value: serde_json::Value = row.get("document");
    Ok(serde_json::from_value(value)?)
}

fn to_json<T: Serialize>(v: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(v)?)
}

/// Initialize every table this store owns. Safe to call repeatedly.
pub async fn init_schema(pool: &Pool) -> Result<()> {
    let client = pool.get().await.context("failed to get db connection")?;

    client
        .batch_execute(
            r#"
            CREATE TABLE IF NOT EXISTS clusters (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                create_at BIGINT NOT NULL,
                update_at BIGINT NOT NULL,
                delete_at BIGINT NOT NULL DEFAULT 0,
                lock_acquired_by TEXT,
                lock_acquired_at BIGINT NOT NULL DEFAULT 0,
                api_locked BOOLEAN NOT NULL DEFAULT false,
                deletion_locked BOOLEAN NOT NULL DEFAULT false,
                document JSONB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_clusters_pending_work
                ON clusters (create_at) WHERE delete_at = 0 AND lock_acquired_at = 0;

            CREATE TABLE IF NOT EXISTS installations (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                state TEXT NOT NULL,
                primary_dns TEXT NOT NULL DEFAULT '',
                group_id TEXT,
                deletion_locked BOOLEAN NOT NULL DEFAULT false,
                create_at BIGINT NOT NULL,
                update_at BIGINT NOT NULL,
                delete_at BIGINT NOT NULL DEFAULT 0,
                lock_acquired_by TEXT,
                lock_acquired_at BIGINT NOT NULL DEFAULT 0,
                api_locked BOOLEAN NOT NULL DEFAULT false,
                document JSONB NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_installations_dns_live
                ON installations (primary_dns) WHERE delete_at = 0;
            CREATE INDEX IF NOT EXISTS idx_installations_pending_work
                ON installations (create_at) WHERE delete_at = 0 AND lock_acquired_at = 0;

            CREATE TABLE IF NOT EXISTS cluster_installations (
                id TEXT PRIMARY KEY,
                cluster_id TEXT NOT NULL,
                installation_id TEXT NOT NULL,
                namespace TEXT NOT NULL,
                is_active BOOLEAN NOT NULL,
                api_locked BOOLEAN NOT NULL DEFAULT false,
                state TEXT NOT NULL,
                create_at BIGINT NOT NULL,
                update_at BIGINT NOT NULL,
                delete_at BIGINT NOT NULL DEFAULT 0,
                lock_acquired_by TEXT,
                lock_acquired_at BIGINT NOT NULL DEFAULT 0,
                document JSONB NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_ci_namespace_live
                ON cluster_installations (cluster_id, namespace) WHERE delete_at = 0;

            CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                create_at BIGINT NOT NULL,
                update_at BIGINT NOT NULL,
                delete_at BIGINT NOT NULL DEFAULT 0,
                document JSONB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS db_migration_operations (
                id TEXT PRIMARY KEY,
                installation_id TEXT NOT NULL,
                state TEXT NOT NULL,
                request_at BIGINT NOT NULL,
                create_at BIGINT NOT NULL,
                update_at BIGINT NOT NULL,
                delete_at BIGINT NOT NULL DEFAULT 0,
                document JSONB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS db_restoration_operations (
                id TEXT PRIMARY KEY,
                installation_id TEXT NOT NULL,
                state TEXT NOT NULL,
                request_at BIGINT NOT NULL,
                create_at BIGINT NOT NULL,
                update_at BIGINT NOT NULL,
                delete_at BIGINT NOT NULL DEFAULT 0,
                document JSONB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS installation_backups (
                id TEXT PRIMARY KEY,
                installation_id TEXT NOT NULL,
                state TEXT NOT NULL,
                request_at BIGINT NOT NULL,
                start_at BIGINT NOT NULL DEFAULT 0,
                delete_at BIGINT NOT NULL DEFAULT 0,
                document JSONB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS subscriptions (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                event_type TEXT,
                create_at BIGINT NOT NULL,
                update_at BIGINT NOT NULL,
                delete_at BIGINT NOT NULL DEFAULT 0,
                document JSONB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS state_change_events (
                id TEXT PRIMARY KEY,
                resource_id TEXT NOT NULL,
                event_timestamp BIGINT NOT NULL,
                delivered BOOLEAN NOT NULL DEFAULT false,
                document JSONB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_undelivered
                ON state_change_events (event_timestamp) WHERE delivered = false;

            CREATE TABLE IF NOT EXISTS multitenant_databases (
                id TEXT PRIMARY KEY,
                rds_cluster_id TEXT NOT NULL,
                max_installations_per_logical_database BIGINT NOT NULL,
                vpc_id TEXT,
                create_at BIGINT NOT NULL,
                update_at BIGINT NOT NULL,
                delete_at BIGINT NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS logical_databases (
                id TEXT PRIMARY KEY,
                multitenant_database_id TEXT NOT NULL,
                name TEXT NOT NULL,
                create_at BIGINT NOT NULL,
                update_at BIGINT NOT NULL,
                delete_at BIGINT NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS database_schemas (
                id TEXT PRIMARY KEY,
                logical_database_id TEXT NOT NULL,
                installation_id TEXT NOT NULL,
                name TEXT NOT NULL,
                create_at BIGINT NOT NULL,
                update_at BIGINT NOT NULL,
                delete_at BIGINT NOT NULL DEFAULT 0
            );
            "#,
        )
        .await
        .context("failed to initialize schema")?;

    tracing::info!("database schema initialized");
    Ok(())
}

#[async_trait]
impl crate::Store for PostgresStore {
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
            state: orchestrator_types::ClusterState::CreationRequested,
            create_at: now,
            update_at: now,
            delete_at: 0,
            lock: Default::default(),
        };
        let client = self.pool.get().await?;
        let document = to_json(&cluster)?;
        client
            .execute(
                "INSERT INTO clusters (id, state, create_at, update_at, delete_at, document)
                 VALUES ($1, $2, $3, $4, 0, $5)",
                &[
                    &cluster.id.as_str(),
                    &cluster.state.as_str(),
                    &cluster.create_at,
                    &cluster.update_at,
                    &document,
                ],
            )
            .await
            .context("failed to insert cluster")?;
        Ok(cluster)
    }

    async fn get_cluster(&self, id: &ResourceId, include_deleted: bool) -> Result<Option<Cluster>> {
        let client = self.pool.get().await?;
        let row = if include_deleted {
            client
                .query_opt(
                    "SELECT document FROM clusters WHERE id = $1",
                    &[&id.as_str()],
                )
                .await?
        } else {
            client
                .query_opt(
                    "SELECT document FROM clusters WHERE id = $1 AND delete_at = 0",
                    &[&id.as_str()],
                )
                .await?
        };
        row.map(|r| doc(&r)).transpose()
    }

    async fn list_clusters(&self, filter: ClusterFilter) -> Result<Page<Cluster>> {
        let (offset, limit) = filter.page.offset_limit();
        let limit = limit.unwrap_or(i64::MAX);
        let mut clauses = vec!["TRUE".to_string()];
        if !filter.page.include_deleted {
            clauses.push("delete_at = 0".to_string());
        }
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        if let Some(state) = &filter.state {
            clauses.push(format!("state = ${}", params.len() + 1));
            params.push(state);
        }
        params.push(&limit);
        let limit_idx = params.len();
        params.push(&offset);
        let offset_idx = params.len();
        let query = format!(
            "SELECT document, COUNT(*) OVER() AS full_count FROM clusters
             WHERE {} ORDER BY create_at ASC, id ASC LIMIT ${} OFFSET ${}",
            clauses.join(" AND "),
            limit_idx,
            offset_idx
        );
        let client = self.pool.get().await?;
        let rows = client.query(&query, &params).await?;
        let total: i64 = rows.first().map(|r| r.get("full_count")).unwrap_or(0);
        let items = rows.iter().map(doc).collect::<Result<Vec<_>>>()?;
        let has_more = offset + (items.len() as i64) < total;
        Ok(Page {
            page: filter.page.page,
            per_page: filter.page.per_page,
            total,
            has_more,
            items,
        })
    }

    async fn update_cluster(&self, mut cluster: Cluster) -> Result<Cluster> {
        cluster.update_at = now_ms();
        let client = self.pool.get().await?;
        let document = to_json(&cluster)?;
        let rows = client
            .execute(
                "UPDATE clusters SET state = $2, update_at = $3, delete_at = $4,
                 lock_acquired_by = $5, lock_acquired_at = $6, api_locked = $7,
                 deletion_locked = $8, document = $9
                 WHERE id = $1",
                &[
                    &cluster.id.as_str(),
                    &cluster.state.as_str(),
                    &cluster.update_at,
                    &cluster.delete_at,
                    &cluster.lock.lock_acquired_by,
                    &cluster.lock.lock_acquired_at,
                    &cluster.lock.api_locked,
                    &cluster.lock.deletion_locked,
                    &document,
                ],
            )
            .await
            .context("failed to update cluster")?;
        if rows == 0 {
            return Err(anyhow!("cluster not found"));
        }
        Ok(cluster)
    }

    async fn delete_cluster(&self, id: &ResourceId) -> Result<bool> {
        let now = now_ms();
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                "UPDATE clusters SET delete_at = $2, update_at = $2,
                 lock_acquired_by = NULL, lock_acquired_at = 0
                 WHERE id = $1 AND delete_at = 0",
                &[&id.as_str(), &now],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn list_unlocked_clusters_pending_work(&self, limit: i64) -> Result<Vec<Cluster>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT document FROM clusters
                 WHERE delete_at = 0 AND lock_acquired_at = 0
                   AND state NOT IN ('stable', 'deleted')
                 ORDER BY create_at ASC LIMIT $1",
                &[&limit],
            )
            .await?;
        rows.iter().map(doc).collect()
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
            name: primary_dns.clone(),
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
            state: orchestrator_types::InstallationState::CreationRequested,
            create_at: now,
            update_at: now,
            delete_at: 0,
            lock: Default::default(),
        };
        let client = self.pool.get().await?;
        let document = to_json(&installation)?;
        client
            .execute(
                "INSERT INTO installations
                 (id, owner_id, state, primary_dns, group_id, deletion_locked,
                  create_at, update_at, delete_at, document)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9)",
                &[
                    &installation.id.as_str(),
                    &installation.owner_id,
                    &installation.state.as_str(),
                    &primary_dns,
                    &installation.group_id.as_ref().map(|g| g.as_str()),
                    &installation.deletion_locked,
                    &installation.create_at,
                    &installation.update_at,
                    &document,
                ],
            )
            .await
            .context("failed to insert installation")?;
        Ok(installation)
    }

    async fn get_installation(
        &self,
        id: &ResourceId,
        include_deleted: bool,
    ) -> Result<Option<Installation>> {
        let client = self.pool.get().await?;
        let row = if include_deleted {
            client
                .query_opt(
                    "SELECT document FROM installations WHERE id = $1",
                    &[&id.as_str()],
                )
                .await?
        } else {
            client
                .query_opt(
                    "SELECT document FROM installations WHERE id = $1 AND delete_at = 0",
                    &[&id.as_str()],
                )
                .await?
        };
        row.map(|r| doc(&r)).transpose()
    }

    async fn list_installations(&self, filter: InstallationFilter) -> Result<Page<Installation>> {
        let (offset, limit) = filter.page.offset_limit();
        let limit = limit.unwrap_or(i64::MAX);
        let mut clauses = vec!["TRUE".to_string()];
        if !filter.page.include_deleted {
            clauses.push("delete_at = 0".to_string());
        }
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        if let Some(state) = &filter.state {
            clauses.push(format!("state = ${}", params.len() + 1));
            params.push(state);
        }
        if let Some(owner_id) = &filter.owner_id {
            clauses.push(format!("owner_id = ${}", params.len() + 1));
            params.push(owner_id);
        }
        let dns_lower = filter.dns.as_ref().map(|d| d.to_lowercase());
        if let Some(dns) = &dns_lower {
            clauses.push(format!("primary_dns = ${}", params.len() + 1));
            params.push(dns);
        }
        match filter.deletion_locked {
            TriState::Any => {}
            TriState::OnlyTrue => clauses.push("deletion_locked".to_string()),
            TriState::OnlyFalse => clauses.push("NOT deletion_locked".to_string()),
        }
        let group_id_str = filter.group_id.as_ref().map(|g| g.as_str().to_string());
        if let Some(group_id) = &group_id_str {
            clauses.push(format!("group_id = ${}", params.len() + 1));
            params.push(group_id);
        }
        params.push(&limit);
        let limit_idx = params.len();
        params.push(&offset);
        let offset_idx = params.len();
        let query = format!(
            "SELECT document, COUNT(*) OVER() AS full_count FROM installations
             WHERE {} ORDER BY create_at ASC, id ASC LIMIT ${} OFFSET ${}",
            clauses.join(" AND "),
            limit_idx,
            offset_idx
        );
        let client = self.pool.get().await?;
        let rows = client.query(&query, &params).await?;
        let total: i64 = rows.first().map(|r| r.get("full_count")).unwrap_or(0);
        let items = rows.iter().map(doc).collect::<Result<Vec<_>>>()?;
        let has_more = offset + (items.len() as i64) < total;
        Ok(Page {
            page: filter.page.page,
            per_page: filter.page.per_page,
            total,
            has_more,
            items,
        })
    }

    async fn update_installation(&self, mut installation: Installation) -> Result<Installation> {
        installation.update_at = now_ms();
        let primary_dns = installation
            .primary_dns()
            .map(|d| d.domain_name.clone())
            .unwrap_or_default();
        let client = self.pool.get().await?;
        let document = to_json(&installation)?;
        let rows = client
            .execute(
                "UPDATE installations SET owner_id = $2, state = $3, primary_dns = $4,
                 group_id = $5, deletion_locked = $6, update_at = $7, delete_at = $8,
                 lock_acquired_by = $9, lock_acquired_at = $10, api_locked = $11, document = $12
                 WHERE id = $1",
                &[
                    &installation.id.as_str(),
                    &installation.owner_id,
                    &installation.state.as_str(),
                    &primary_dns,
                    &installation.group_id.as_ref().map(|g| g.as_str()),
                    &installation.deletion_locked,
                    &installation.update_at,
                    &installation.delete_at,
                    &installation.lock.lock_acquired_by,
                    &installation.lock.lock_acquired_at,
                    &installation.lock.api_locked,
                    &document,
                ],
            )
            .await
            .context("failed to update installation")?;
        if rows == 0 {
            return Err(anyhow!("installation not found"));
        }
        Ok(installation)
    }

    async fn delete_installation(&self, id: &ResourceId) -> Result<bool> {
        let now = now_ms();
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                "UPDATE installations SET delete_at = $2, update_at = $2,
                 lock_acquired_by = NULL, lock_acquired_at = 0
                 WHERE id = $1 AND delete_at = 0",
                &[&id.as_str(), &now],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn list_unlocked_installations_pending_work(
        &self,
        limit: i64,
    ) -> Result<Vec<Installation>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT document FROM installations
                 WHERE delete_at = 0 AND lock_acquired_at = 0
                   AND state NOT IN ('stable', 'hibernating', 'deleted')
                 ORDER BY create_at ASC LIMIT $1",
                &[&limit],
            )
            .await?;
        rows.iter().map(doc).collect()
    }

    async fn dns_is_taken(&self, domain_name: &str, exclude: Option<&ResourceId>) -> Result<bool> {
        let needle = domain_name.to_lowercase();
        let client = self.pool.get().await?;
        let row = match exclude {
            Some(id) => {
                client
                    .query_opt(
                        "SELECT 1 FROM installations WHERE primary_dns = $1 AND delete_at = 0 AND id <> $2",
                        &[&needle, &id.as_str()],
                    )
                    .await?
            }
            None => {
                client
                    .query_opt(
                        "SELECT 1 FROM installations WHERE primary_dns = $1 AND delete_at = 0",
                        &[&needle],
                    )
                    .await?
            }
        };
        Ok(row.is_some())
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
            state: orchestrator_types::ClusterInstallationState::CreationRequested,
            create_at: now,
            update_at: now,
            delete_at: 0,
            lock_acquired_by: None,
            lock_acquired_at: 0,
        };
        let client = self.pool.get().await?;
        let document = to_json(&ci)?;
        client
            .execute(
                "INSERT INTO cluster_installations
                 (id, cluster_id, installation_id, namespace, is_active, api_locked, state,
                  create_at, update_at, delete_at, document)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10)",
                &[
                    &ci.id.as_str(),
                    &ci.cluster_id.as_str(),
                    &ci.installation_id.as_str(),
                    &ci.namespace,
                    &ci.is_active,
                    &ci.api_locked,
                    &ci.state.as_str(),
                    &ci.create_at,
                    &ci.update_at,
                    &document,
                ],
            )
            .await
            .context("failed to insert cluster installation")?;
        Ok(ci)
    }

    async fn get_cluster_installation(
        &self,
        id: &ResourceId,
        include_deleted: bool,
    ) -> Result<Option<ClusterInstallation>> {
        let client = self.pool.get().await?;
        let row = if include_deleted {
            client
                .query_opt(
                    "SELECT document FROM cluster_installations WHERE id = $1",
                    &[&id.as_str()],
                )
                .await?
        } else {
            client
                .query_opt(
                    "SELECT document FROM cluster_installations WHERE id = $1 AND delete_at = 0",
                    &[&id.as_str()],
                )
                .await?
        };
        row.map(|r| doc(&r)).transpose()
    }

    async fn list_cluster_installations(
        &self,
        filter: ClusterInstallationFilter,
    ) -> Result<Page<ClusterInstallation>> {
        let (offset, limit) = filter.page.offset_limit();
        let limit = limit.unwrap_or(i64::MAX);
        let mut clauses = vec!["TRUE".to_string()];
        if !filter.page.include_deleted {
            clauses.push("delete_at = 0".to_string());
        }
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        let cluster_id_str = filter.cluster_id.as_ref().map(|c| c.as_str().to_string());
        if let Some(cluster_id) = &cluster_id_str {
            clauses.push(format!("cluster_id = ${}", params.len() + 1));
            params.push(cluster_id);
        }
        let installation_id_str = filter
            .installation_id
            .as_ref()
            .map(|i| i.as_str().to_string());
        if let Some(installation_id) = &installation_id_str {
            clauses.push(format!("installation_id = ${}", params.len() + 1));
            params.push(installation_id);
        }
        if let Some(is_active) = &filter.is_active {
            clauses.push(format!("is_active = ${}", params.len() + 1));
            params.push(is_active);
        }
        params.push(&limit);
        let limit_idx = params.len();
        params.push(&offset);
        let offset_idx = params.len();
        let query = format!(
            "SELECT document, COUNT(*) OVER() AS full_count FROM cluster_installations
             WHERE {} ORDER BY create_at ASC, id ASC LIMIT ${} OFFSET ${}",
            clauses.join(" AND "),
            limit_idx,
            offset_idx
        );
        let client = self.pool.get().await?;
        let rows = client.query(&query, &params).await?;
        let total: i64 = rows.first().map(|r| r.get("full_count")).unwrap_or(0);
        let items = rows.iter().map(doc).collect::<Result<Vec<_>>>()?;
        let has_more = offset + (items.len() as i64) < total;
        Ok(Page {
            page: filter.page.page,
            per_page: filter.page.per_page,
            total,
            has_more,
            items,
        })
    }

    async fn update_cluster_installation(
        &self,
        mut ci: ClusterInstallation,
    ) -> Result<ClusterInstallation> {
        ci.update_at = now_ms();
        let client = self.pool.get().await?;
        let document = to_json(&ci)?;
        let rows = client
            .execute(
                "UPDATE cluster_installations SET is_active = $2, api_locked = $3, state = $4,
                 update_at = $5, delete_at = $6, lock_acquired_by = $7, lock_acquired_at = $8, document = $9
                 WHERE id = $1",
                &[
                    &ci.id.as_str(),
                    &ci.is_active,
                    &ci.api_locked,
                    &ci.state.as_str(),
                    &ci.update_at,
                    &ci.delete_at,
                    &ci.lock_acquired_by,
                    &ci.lock_acquired_at,
                    &document,
                ],
            )
            .await
            .context("failed to update cluster installation")?;
        if rows == 0 {
            return Err(anyhow!("cluster installation not found"));
        }
        Ok(ci)
    }

    async fn delete_cluster_installation(&self, id: &ResourceId) -> Result<bool> {
        let now = now_ms();
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                "UPDATE cluster_installations SET delete_at = $2, update_at = $2,
                 lock_acquired_by = NULL, lock_acquired_at = 0
                 WHERE id = $1 AND delete_at = 0",
                &[&id.as_str(), &now],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn list_unlocked_cluster_installations_pending_work(
        &self,
        limit: i64,
    ) -> Result<Vec<ClusterInstallation>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT document FROM cluster_installations
                 WHERE delete_at = 0 AND lock_acquired_at = 0
                   AND state NOT IN ('stable', 'deleted')
                 ORDER BY create_at ASC LIMIT $1",
                &[&limit],
            )
            .await?;
        rows.iter().map(doc).collect()
    }

    async fn namespace_is_taken(&self, cluster_id: &ResourceId, namespace: &str) -> Result<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT 1 FROM cluster_installations
                 WHERE cluster_id = $1 AND namespace = $2 AND delete_at = 0",
                &[&cluster_id.as_str(), &namespace],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn annotation_in_use(&self, cluster_id: &ResourceId, name: &str) -> Result<bool> {
        let needle = serde_json::json!([{ "name": name }]);
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT 1 FROM installations i
                 JOIN cluster_installations ci
                   ON ci.installation_id = i.id AND ci.delete_at = 0
                 WHERE ci.cluster_id = $1 AND i.delete_at = 0
                   AND i.document->'annotations' @> $2
                 LIMIT 1",
                &[&cluster_id.as_str(), &needle],
            )
            .await?;
        Ok(row.is_some())
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
        let client = self.pool.get().await?;
        let document = to_json(&group)?;
        client
            .execute(
                "INSERT INTO groups (id, create_at, update_at, delete_at, document)
                 VALUES ($1, $2, $3, 0, $4)",
                &[
                    &group.id.as_str(),
                    &group.create_at,
                    &group.update_at,
                    &document,
                ],
            )
            .await
            .context("failed to insert group")?;
        Ok(group)
    }

    async fn get_group(&self, id: &ResourceId, include_deleted: bool) -> Result<Option<Group>> {
        let client = self.pool.get().await?;
        let row = if include_deleted {
            client
                .query_opt("SELECT document FROM groups WHERE id = $1", &[&id.as_str()])
                .await?
        } else {
            client
                .query_opt(
                    "SELECT document FROM groups WHERE id = $1 AND delete_at = 0",
                    &[&id.as_str()],
                )
                .await?
        };
        row.map(|r| doc(&r)).transpose()
    }

    async fn list_groups(&self, filter: GroupFilter) -> Result<Page<Group>> {
        let (offset, limit) = filter.page.offset_limit();
        let limit = limit.unwrap_or(i64::MAX);
        let where_clause = if filter.page.include_deleted {
            "TRUE"
        } else {
            "delete_at = 0"
        };
        let query = format!(
            "SELECT document, COUNT(*) OVER() AS full_count FROM groups
             WHERE {where_clause} ORDER BY create_at ASC, id ASC LIMIT $1 OFFSET $2"
        );
        let client = self.pool.get().await?;
        let rows = client.query(&query, &[&limit, &offset]).await?;
        let total: i64 = rows.first().map(|r| r.get("full_count")).unwrap_or(0);
        let items = rows.iter().map(doc).collect::<Result<Vec<_>>>()?;
        let has_more = offset + (items.len() as i64) < total;
        Ok(Page {
            page: filter.page.page,
            per_page: filter.page.per_page,
            total,
            has_more,
            items,
        })
    }

    async fn update_group(&self, mut group: Group) -> Result<Group> {
        group.update_at = now_ms();
        let client = self.pool.get().await?;
        let document = to_json(&group)?;
        let rows = client
            .execute(
                "UPDATE groups SET update_at = $2, delete_at = $3, document = $4 WHERE id = $1",
                &[&group.id.as_str(), &group.update_at, &group.delete_at, &document],
            )
            .await
            .context("failed to update group")?;
        if rows == 0 {
            return Err(anyhow!("group not found"));
        }
        Ok(group)
    }

    async fn delete_group(&self, id: &ResourceId) -> Result<bool> {
        let now = now_ms();
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                "UPDATE groups SET delete_at = $2, update_at = $2 WHERE id = $1 AND delete_at = 0",
                &[&id.as_str(), &now],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn create_db_migration_operation(
        &self,
        op: InstallationDbMigrationOperation,
    ) -> Result<InstallationDbMigrationOperation> {
        let client = self.pool.get().await?;
        let document = to_json(&op)?;
        client
            .execute(
                "INSERT INTO db_migration_operations
                 (id, installation_id, state, request_at, create_at, update_at, delete_at, document)
                 VALUES ($1, $2, $3, $4, $5, $6, 0, $7)",
                &[
                    &op.id.as_str(),
                    &op.installation_id.as_str(),
                    &op.state.as_str(),
                    &op.request_at,
                    &op.create_at,
                    &op.update_at,
                    &document,
                ],
            )
            .await
            .context("failed to insert db migration operation")?;
        Ok(op)
    }

    async fn get_db_migration_operation(
        &self,
        id: &ResourceId,
    ) -> Result<Option<InstallationDbMigrationOperation>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT document FROM db_migration_operations WHERE id = $1",
                &[&id.as_str()],
            )
            .await?;
        row.map(|r| doc(&r)).transpose()
    }

    async fn update_db_migration_operation(
        &self,
        mut op: InstallationDbMigrationOperation,
    ) -> Result<InstallationDbMigrationOperation> {
        op.update_at = now_ms();
        let client = self.pool.get().await?;
        let document = to_json(&op)?;
        let rows = client
            .execute(
                "UPDATE db_migration_operations SET state = $2, update_at = $3, delete_at = $4, document = $5
                 WHERE id = $1",
                &[&op.id.as_str(), &op.state.as_str(), &op.update_at, &op.delete_at, &document],
            )
            .await
            .context("failed to update db migration operation")?;
        if rows == 0 {
            return Err(anyhow!("db migration operation not found"));
        }
        Ok(op)
    }

    async fn list_db_migration_operations(
        &self,
        filter: OperationFilter,
    ) -> Result<Page<InstallationDbMigrationOperation>> {
        operation_page(&self.pool, "db_migration_operations", &filter).await
    }

    async fn get_unfinished_db_migration_for(
        &self,
        installation_id: &ResourceId,
    ) -> Result<Option<InstallationDbMigrationOperation>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT document FROM db_migration_operations
                 WHERE installation_id = $1
                   AND state NOT IN ('succeeded', 'failed-committed', 'committed', 'rollback-succeeded')
                 ORDER BY create_at ASC LIMIT 1",
                &[&installation_id.as_str()],
            )
            .await?;
        row.map(|r| doc(&r)).transpose()
    }

    async fn create_db_restoration_operation(
        &self,
        op: InstallationDbRestorationOperation,
    ) -> Result<InstallationDbRestorationOperation> {
        let client = self.pool.get().await?;
        let document = to_json(&op)?;
        client
            .execute(
                "INSERT INTO db_restoration_operations
                 (id, installation_id, state, request_at, create_at, update_at, delete_at, document)
                 VALUES ($1, $2, $3, $4, $5, $6, 0, $7)",
                &[
                    &op.id.as_str(),
                    &op.installation_id.as_str(),
                    &op.state.as_str(),
                    &op.request_at,
                    &op.create_at,
                    &op.update_at,
                    &document,
                ],
            )
            .await
            .context("failed to insert db restoration operation")?;
        Ok(op)
    }

    async fn get_db_restoration_operation(
        &self,
        id: &ResourceId,
    ) -> Result<Option<InstallationDbRestorationOperation>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT document FROM db_restoration_operations WHERE id = $1",
                &[&id.as_str()],
            )
            .await?;
        row.map(|r| doc(&r)).transpose()
    }

    async fn update_db_restoration_operation(
        &self,
        mut op: InstallationDbRestorationOperation,
    ) -> Result<InstallationDbRestorationOperation> {
        op.update_at = now_ms();
        let client = self.pool.get().await?;
        let document = to_json(&op)?;
        let rows = client
            .execute(
                "UPDATE db_restoration_operations SET state = $2, update_at = $3, delete_at = $4, document = $5
                 WHERE id = $1",
                &[&op.id.as_str(), &op.state.as_str(), &op.update_at, &op.delete_at, &document],
            )
            .await
            .context("failed to update db restoration operation")?;
        if rows == 0 {
            return Err(anyhow!("db restoration operation not found"));
        }
        Ok(op)
    }

    async fn list_db_restoration_operations(
        &self,
        filter: OperationFilter,
    ) -> Result<Page<InstallationDbRestorationOperation>> {
        operation_page(&self.pool, "db_restoration_operations", &filter).await
    }

    async fn get_unfinished_db_restoration_for(
        &self,
        installation_id: &ResourceId,
    ) -> Result<Option<InstallationDbRestorationOperation>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT document FROM db_restoration_operations
                 WHERE installation_id = $1 AND state NOT IN ('succeeded')
                 ORDER BY create_at ASC LIMIT 1",
                &[&installation_id.as_str()],
            )
            .await?;
        row.map(|r| doc(&r)).transpose()
    }

    async fn create_backup(&self, backup: InstallationBackup) -> Result<InstallationBackup> {
        let client = self.pool.get().await?;
        let document = to_json(&backup)?;
        client
            .execute(
                "INSERT INTO installation_backups
                 (id, installation_id, state, request_at, start_at, delete_at, document)
                 VALUES ($1, $2, $3, $4, $5, 0, $6)",
                &[
                    &backup.id.as_str(),
                    &backup.installation_id.as_str(),
                    &backup.state.as_str(),
                    &backup.request_at,
                    &backup.start_at,
                    &document,
                ],
            )
            .await
            .context("failed to insert backup")?;
        Ok(backup)
    }

    async fn get_backup(&self, id: &ResourceId) -> Result<Option<InstallationBackup>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT document FROM installation_backups WHERE id = $1",
                &[&id.as_str()],
            )
            .await?;
        row.map(|r| doc(&r)).transpose()
    }

    async fn update_backup(&self, backup: InstallationBackup) -> Result<InstallationBackup> {
        let client = self.pool.get().await?;
        let document = to_json(&backup)?;
        let rows = client
            .execute(
                "UPDATE installation_backups SET state = $2, start_at = $3, delete_at = $4, document = $5
                 WHERE id = $1",
                &[&backup.id.as_str(), &backup.state.as_str(), &backup.start_at, &backup.delete_at, &document],
            )
            .await
            .context("failed to update backup")?;
        if rows == 0 {
            return Err(anyhow!("backup not found"));
        }
        Ok(backup)
    }

    async fn list_backups(&self, filter: OperationFilter) -> Result<Page<InstallationBackup>> {
        operation_page(&self.pool, "installation_backups", &filter).await
    }

    async fn list_backups_for_installation(
        &self,
        installation_id: &ResourceId,
    ) -> Result<Vec<InstallationBackup>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT document FROM installation_backups
                 WHERE installation_id = $1 ORDER BY request_at ASC",
                &[&installation_id.as_str()],
            )
            .await?;
        rows.iter().map(doc).collect()
    }

    async fn list_backups_pending_work(&self, limit: i64) -> Result<Vec<InstallationBackup>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT document FROM installation_backups
                 WHERE delete_at = 0 AND state IN ('backup-requested', 'backup-in-progress')
                 ORDER BY request_at ASC LIMIT $1",
                &[&limit],
            )
            .await?;
        rows.iter().map(doc).collect()
    }

    async fn backup_in_progress(&self, installation_id: &ResourceId) -> Result<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT 1 FROM installation_backups
                 WHERE installation_id = $1 AND delete_at = 0
                   AND state IN ('backup-requested', 'backup-in-progress')
                 LIMIT 1",
                &[&installation_id.as_str()],
            )
            .await?;
        Ok(row.is_some())
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
        let client = self.pool.get().await?;
        let document = to_json(&sub)?;
        client
            .execute(
                "INSERT INTO subscriptions
                 (id, owner_id, event_type, create_at, update_at, delete_at, document)
                 VALUES ($1, $2, $3, $4, $5, 0, $6)",
                &[
                    &sub.id.as_str(),
                    &sub.owner_id,
                    &sub.event_type,
                    &sub.create_at,
                    &sub.update_at,
                    &document,
                ],
            )
            .await
            .context("failed to insert subscription")?;
        Ok(sub)
    }

    async fn get_subscription(&self, id: &ResourceId) -> Result<Option<Subscription>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT document FROM subscriptions WHERE id = $1 AND delete_at = 0",
                &[&id.as_str()],
            )
            .await?;
        row.map(|r| doc(&r)).transpose()
    }

    async fn list_subscriptions(&self, filter: SubscriptionFilter) -> Result<Page<Subscription>> {
        let (offset, limit) = filter.page.offset_limit();
        let limit = limit.unwrap_or(i64::MAX);
        let mut clauses = vec!["TRUE".to_string()];
        if !filter.page.include_deleted {
            clauses.push("delete_at = 0".to_string());
        }
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        if let Some(owner_id) = &filter.owner_id {
            clauses.push(format!("owner_id = ${}", params.len() + 1));
            params.push(owner_id);
        }
        params.push(&limit);
        let limit_idx = params.len();
        params.push(&offset);
        let offset_idx = params.len();
        let query = format!(
            "SELECT document, COUNT(*) OVER() AS full_count FROM subscriptions
             WHERE {} ORDER BY create_at ASC, id ASC LIMIT ${} OFFSET ${}",
            clauses.join(" AND "),
            limit_idx,
            offset_idx
        );
        let client = self.pool.get().await?;
        let rows = client.query(&query, &params).await?;
        let total: i64 = rows.first().map(|r| r.get("full_count")).unwrap_or(0);
        let items = rows.iter().map(doc).collect::<Result<Vec<_>>>()?;
        let has_more = offset + (items.len() as i64) < total;
        Ok(Page {
            page: filter.page.page,
            per_page: filter.page.per_page,
            total,
            has_more,
            items,
        })
    }

    async fn update_subscription(&self, mut sub: Subscription) -> Result<Subscription> {
        sub.update_at = now_ms();
        let client = self.pool.get().await?;
        let document = to_json(&sub)?;
        let rows = client
            .execute(
                "UPDATE subscriptions SET event_type = $2, update_at = $3, delete_at = $4, document = $5
                 WHERE id = $1",
                &[&sub.id.as_str(), &sub.event_type, &sub.update_at, &sub.delete_at, &document],
            )
            .await
            .context("failed to update subscription")?;
        if rows == 0 {
            return Err(anyhow!("subscription not found"));
        }
        Ok(sub)
    }

    async fn delete_subscription(&self, id: &ResourceId) -> Result<bool> {
        let now = now_ms();
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                "UPDATE subscriptions SET delete_at = $2, update_at = $2 WHERE id = $1 AND delete_at = 0",
                &[&id.as_str(), &now],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn subscriptions_for(
        &self,
        owner_id: &str,
        event_type: &str,
    ) -> Result<Vec<Subscription>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT document FROM subscriptions
                 WHERE owner_id = $1 AND delete_at = 0 AND (event_type IS NULL OR event_type = $2)",
                &[&owner_id, &event_type],
            )
            .await?;
        rows.iter().map(doc).collect()
    }

    async fn create_event(&self, event: StateChangeEvent) -> Result<StateChangeEvent> {
        let client = self.pool.get().await?;
        let document = to_json(&event)?;
        client
            .execute(
                "INSERT INTO state_change_events (id, resource_id, event_timestamp, delivered, document)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &event.id.as_str(),
                    &event.data.resource_id.as_str(),
                    &event.timestamp,
                    &event.delivered,
                    &document,
                ],
            )
            .await
            .context("failed to insert state change event")?;
        Ok(event)
    }

    async fn list_events(&self, filter: EventFilter) -> Result<Page<StateChangeEvent>> {
        let (offset, limit) = filter.page.offset_limit();
        let limit = limit.unwrap_or(i64::MAX);
        let mut clauses = vec!["TRUE".to_string()];
        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
        let resource_id_str = filter.resource_id.as_ref().map(|r| r.as_str().to_string());
        if let Some(resource_id) = &resource_id_str {
            clauses.push(format!("resource_id = ${}", params.len() + 1));
            params.push(resource_id);
        }
        params.push(&limit);
        let limit_idx = params.len();
        params.push(&offset);
        let offset_idx = params.len();
        let query = format!(
            "SELECT document, COUNT(*) OVER() AS full_count FROM state_change_events
             WHERE {} ORDER BY event_timestamp ASC, id ASC LIMIT ${} OFFSET ${}",
            clauses.join(" AND "),
            limit_idx,
            offset_idx
        );
        let client = self.pool.get().await?;
        let rows = client.query(&query, &params).await?;
        let total: i64 = rows.first().map(|r| r.get("full_count")).unwrap_or(0);
        let items = rows.iter().map(doc).collect::<Result<Vec<_>>>()?;
        let has_more = offset + (items.len() as i64) < total;
        Ok(Page {
            page: filter.page.page,
            per_page: filter.page.per_page,
            total,
            has_more,
            items,
        })
    }

    async fn list_undelivered_events(&self, limit: i64) -> Result<Vec<StateChangeEvent>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT document FROM state_change_events
                 WHERE delivered = false ORDER BY event_timestamp ASC LIMIT $1",
                &[&limit],
            )
            .await?;
        rows.iter().map(doc).collect()
    }

    async fn mark_event_delivered(&self, id: &ResourceId) -> Result<()> {
        let client = self.pool.get().await?;
        client
            .execute(
                "UPDATE state_change_events SET delivered = true, document = jsonb_set(document, '{delivered}', 'true')
                 WHERE id = $1",
                &[&id.as_str()],
            )
            .await
            .context("failed to mark event delivered")?;
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
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO multitenant_databases
                 (id, rds_cluster_id, max_installations_per_logical_database, vpc_id,
                  create_at, update_at, delete_at)
                 VALUES ($1, $2, $3, $4, $5, $6, 0)",
                &[
                    &db.id.as_str(),
                    &db.rds_cluster_id,
                    &db.max_installations_per_logical_database,
                    &db.vpc_id,
                    &db.create_at,
                    &db.update_at,
                ],
            )
            .await
            .context("failed to insert multitenant database")?;
        Ok(db)
    }

    async fn list_multitenant_databases(&self) -> Result<Vec<MultitenantDatabase>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, rds_cluster_id, max_installations_per_logical_database, vpc_id,
                        create_at, update_at, delete_at
                 FROM multitenant_databases WHERE delete_at = 0 ORDER BY create_at ASC",
                &[],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| {
                let id: String = r.get("id");
                MultitenantDatabase {
                    id: id.into(),
                    rds_cluster_id: r.get("rds_cluster_id"),
                    max_installations_per_logical_database: r
                        .get("max_installations_per_logical_database"),
                    vpc_id: r.get("vpc_id"),
                    create_at: r.get("create_at"),
                    update_at: r.get("update_at"),
                    delete_at: r.get("delete_at"),
                }
            })
            .collect())
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
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO logical_databases
                 (id, multitenant_database_id, name, create_at, update_at, delete_at)
                 VALUES ($1, $2, $3, $4, $5, 0)",
                &[
                    &db.id.as_str(),
                    &db.multitenant_database_id.as_str(),
                    &db.name,
                    &db.create_at,
                    &db.update_at,
                ],
            )
            .await
            .context("failed to insert logical database")?;
        Ok(db)
    }

    async fn list_logical_databases(
        &self,
        multitenant_database_id: &ResourceId,
    ) -> Result<Vec<LogicalDatabase>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT id, multitenant_database_id, name, create_at, update_at, delete_at
                 FROM logical_databases WHERE multitenant_database_id = $1 AND delete_at = 0",
                &[&multitenant_database_id.as_str()],
            )
            .await?;
        Ok(rows
            .iter()
            .map(|r| {
                let id: String = r.get("id");
                let parent: String = r.get("multitenant_database_id");
                LogicalDatabase {
                    id: id.into(),
                    multitenant_database_id: parent.into(),
                    name: r.get("name"),
                    create_at: r.get("create_at"),
                    update_at: r.get("update_at"),
                    delete_at: r.get("delete_at"),
                }
            })
            .collect())
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
        let client = self.pool.get().await?;
        client
            .execute(
                "INSERT INTO database_schemas
                 (id, logical_database_id, installation_id, name, create_at, update_at, delete_at)
                 VALUES ($1, $2, $3, $4, $5, $6, 0)",
                &[
                    &schema.id.as_str(),
                    &schema.logical_database_id.as_str(),
                    &schema.installation_id.as_str(),
                    &schema.name,
                    &schema.create_at,
                    &schema.update_at,
                ],
            )
            .await
            .context("failed to insert database schema")?;
        Ok(schema)
    }

    async fn get_schema_for_installation(
        &self,
        installation_id: &ResourceId,
    ) -> Result<Option<DatabaseSchema>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT id, logical_database_id, installation_id, name,
                        create_at, update_at, delete_at
                 FROM database_schemas
                 WHERE installation_id = $1 AND delete_at = 0 LIMIT 1",
                &[&installation_id.as_str()],
            )
            .await?;
        Ok(row.map(|r| {
            let id: String = r.get("id");
            let logical: String = r.get("logical_database_id");
            let installation: String = r.get("installation_id");
            DatabaseSchema {
                id: id.into(),
                logical_database_id: logical.into(),
                installation_id: installation.into(),
                name: r.get("name"),
                create_at: r.get("create_at"),
                update_at: r.get("update_at"),
                delete_at: r.get("delete_at"),
            }
        }))
    }

    async fn delete_database_schema_for_installation(
        &self,
        installation_id: &ResourceId,
    ) -> Result<bool> {
        let now = now_ms();
        let client = self.pool.get().await?;
        let rows = client
            .execute(
                "UPDATE database_schemas SET delete_at = $2, update_at = $2
                 WHERE installation_id = $1 AND delete_at = 0",
                &[&installation_id.as_str(), &now],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn count_schemas_in_logical_database(
        &self,
        logical_database_id: &ResourceId,
    ) -> Result<i64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) AS n FROM database_schemas
                 WHERE logical_database_id = $1 AND delete_at = 0",
                &[&logical_database_id.as_str()],
            )
            .await?;
        Ok(row.get("n"))
    }

    async fn acquire_lock(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        holder: &str,
        now: Millis,
    ) -> Result<bool> {
        let table = lock_table(kind)?;
        let query = format!(
            "UPDATE {table} SET lock_acquired_by = $2, lock_acquired_at = $3
             WHERE id = $1 AND lock_acquired_at = 0"
        );
        let client = self.pool.get().await?;
        let rows = client
            .execute(&query, &[&id.as_str(), &holder, &now])
            .await
            .context("failed to acquire lock")?;
        Ok(rows > 0)
    }

    async fn release_lock(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        holder: &str,
        force: bool,
    ) -> Result<bool> {
        let table = lock_table(kind)?;
        let client = self.pool.get().await?;
        let rows = if force {
            let query = format!(
                "UPDATE {table} SET lock_acquired_by = NULL, lock_acquired_at = 0 WHERE id = $1"
            );
            client.execute(&query, &[&id.as_str()]).await
        } else {
            let query = format!(
                "UPDATE {table} SET lock_acquired_by = NULL, lock_acquired_at = 0
                 WHERE id = $1 AND lock_acquired_by = $2"
            );
            client.execute(&query, &[&id.as_str(), &holder]).await
        }
        .context("failed to release lock")?;
        Ok(rows > 0)
    }

    async fn set_api_lock(&self, kind: ResourceKind, id: &ResourceId, locked: bool) -> Result<()> {
        let table = match kind {
            ResourceKind::Cluster => "clusters",
            ResourceKind::Installation => "installations",
            ResourceKind::ClusterInstallation => "cluster_installations",
            _ => return Ok(()),
        };
        let client = self.pool.get().await?;
        let query = format!("UPDATE {table} SET api_locked = $2 WHERE id = $1");
        client
            .execute(&query, &[&id.as_str(), &locked])
            .await
            .context("failed to set api lock")?;
        Ok(())
    }

    async fn set_deletion_lock(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        locked: bool,
    ) -> Result<()> {
        let table = match kind {
            ResourceKind::Cluster => "clusters",
            ResourceKind::Installation => "installations",
            _ => return Ok(()),
        };
        let client = self.pool.get().await?;
        let query = format!("UPDATE {table} SET deletion_locked = $2 WHERE id = $1");
        client
            .execute(&query, &[&id.as_str(), &locked])
            .await
            .context("failed to set deletion lock")?;
        Ok(())
    }
}

/// Shared pagination query for the three operation tables; they carry the
/// same (installation_id, state) scalar columns.
async fn operation_page<T: DeserializeOwned>(
    pool: &Pool,
    table: &str,
    filter: &OperationFilter,
) -> Result<Page<T>> {
    let (offset, limit) = filter.page.offset_limit();
    let limit = limit.unwrap_or(i64::MAX);
    let mut clauses = vec!["TRUE".to_string()];
    if !filter.page.include_deleted {
        clauses.push("delete_at = 0".to_string());
    }
    let mut params: Vec<&(dyn ToSql + Sync)> = Vec::new();
    let installation_id_str = filter
        .installation_id
        .as_ref()
        .map(|i| i.as_str().to_string());
    if let Some(installation_id) = &installation_id_str {
        clauses.push(format!("installation_id = ${}", params.len() + 1));
        params.push(installation_id);
    }
    if let Some(state) = &filter.state {
        clauses.push(format!("state = ${}", params.len() + 1));
        params.push(state);
    }
    params.push(&limit);
    let limit_idx = params.len();
    params.push(&offset);
    let offset_idx = params.len();
    let query = format!(
        "SELECT document, COUNT(*) OVER() AS full_count FROM {table}
         WHERE {} ORDER BY request_at ASC, id ASC LIMIT ${} OFFSET ${}",
        clauses.join(" AND "),
        limit_idx,
        offset_idx
    );
    let client = pool.get().await?;
    let rows = client.query(&query, &params).await?;
    let total: i64 = rows.first().map(|r| r.get("full_count")).unwrap_or(0);
    let items = rows.iter().map(doc).collect::<Result<Vec<_>>>()?;
    let has_more = offset + (items.len() as i64) < total;
    Ok(Page {
        page: filter.page.page,
        per_page: filter.page.per_page,
        total,
        has_more,
        items,
    })
}

fn lock_table(kind: ResourceKind) -> Result<&'static str> {
    Ok(match kind {
        ResourceKind::Cluster => "clusters",
        ResourceKind::Installation => "installations",
        ResourceKind::ClusterInstallation => "cluster_installations",
        other => return Err(anyhow!("{other} has no work lock")),
    })
}
