//! Traits for the external collaborators the Supervisor drives a resource
//! toward: the thing that actually stands up a cluster, binds an
//! installation to it, points DNS somewhere, or moves data between
//! databases. Nothing in `orchestrator-core` calls out to a cloud API
//! directly — it calls one of these traits, so the reconciliation logic
//! is identical whether the backing implementation is a real cloud or a
//! test double.

use async_trait::async_trait;
use orchestrator_types::{Cluster, ClusterInstallation, Installation};

pub type Result<T> = anyhow::Result<T>;

/// Stands up, resizes, upgrades, and tears down the compute substrate
/// itself. One call per Supervisor tick per cluster.
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    async fn create(&self, cluster: &Cluster) -> Result<()>;
    async fn provision(&self, cluster: &Cluster) -> Result<()>;
    async fn upgrade(&self, cluster: &Cluster) -> Result<()>;
    async fn resize(&self, cluster: &Cluster) -> Result<()>;
    async fn delete(&self, cluster: &Cluster) -> Result<()>;
}

/// Binds an Installation onto a Cluster: creates the namespace-scoped
/// workload, reconciles it to the Installation's current desired shape,
/// or tears it down.
#[async_trait]
pub trait ClusterInstallationProvisioner: Send + Sync {
    async fn create(
        &self,
        ci: &ClusterInstallation,
        installation: &Installation,
    ) -> Result<()>;
    async fn reconcile(
        &self,
        ci: &ClusterInstallation,
        installation: &Installation,
    ) -> Result<()>;
    async fn delete(&self, ci: &ClusterInstallation) -> Result<()>;
    async fn hibernate(&self, ci: &ClusterInstallation) -> Result<()>;
    async fn wakeup(&self, ci: &ClusterInstallation) -> Result<()>;
    /// Runs a one-off command inside the workload, e.g. a migration tool
    /// invoked as part of a db-migration or db-restoration operation.
    async fn exec_cli(&self, ci: &ClusterInstallation, args: &[String]) -> Result<String>;
}

/// Creates and removes DNS records pointing at an Installation. Deletion
/// is the one action the Admission layer is allowed to invoke directly
/// (inline, synchronously) rather than deferring to the Supervisor, since
/// removing a record is its own compensating action with nothing further
/// to drive toward.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn create_records(&self, installation: &Installation, domain_name: &str) -> Result<()>;
    async fn delete_records(&self, installation: &Installation, domain_name: &str) -> Result<()>;
}

/// Database placement, snapshot, and restore operations for installations
/// backed by a shared or dedicated RDS-like database.
#[async_trait]
pub trait DatabaseProvisioner: Send + Sync {
    async fn provision(&self, installation: &Installation) -> Result<()>;
    async fn teardown(&self, installation: &Installation) -> Result<()>;
    /// Same as `teardown`, but for a database whose data has already been
    /// migrated elsewhere — skips the data-loss guard the plain teardown
    /// path enforces.
    async fn teardown_migrated(&self, installation: &Installation) -> Result<()>;
    async fn snapshot(&self, installation: &Installation) -> Result<String>;
    async fn restore(&self, installation: &Installation, backup_ref: &str) -> Result<()>;
}

/// Reference implementations that log the call and succeed immediately —
/// useful for the in-memory test harness and for running the HTTP surface
/// against no real infrastructure.
pub mod noop {
    use super::*;

    pub struct NoopClusterProvisioner;

    #[async_trait]
    impl ClusterProvisioner for NoopClusterProvisioner {
        async fn create(&self, cluster: &Cluster) -> Result<()> {
            tracing::info!(id = %cluster.id, "noop: create cluster");
            Ok(())
        }
        async fn provision(&self, cluster: &Cluster) -> Result<()> {
            tracing::info!(id = %cluster.id, "noop: provision cluster");
            Ok(())
        }
        async fn upgrade(&self, cluster: &Cluster) -> Result<()> {
            tracing::info!(id = %cluster.id, "noop: upgrade cluster");
            Ok(())
        }
        async fn resize(&self, cluster: &Cluster) -> Result<()> {
            tracing::info!(id = %cluster.id, "noop: resize cluster");
            Ok(())
        }
        async fn delete(&self, cluster: &Cluster) -> Result<()> {
            tracing::info!(id = %cluster.id, "noop: delete cluster");
            Ok(())
        }
    }

    pub struct NoopClusterInstallationProvisioner;

    #[async_trait]
    impl ClusterInstallationProvisioner for NoopClusterInstallationProvisioner {
        async fn create(&self, ci: &ClusterInstallation, _installation: &Installation) -> Result<()> {
            tracing::info!(id = %ci.id, "noop: create cluster installation");
            Ok(())
        }
        async fn reconcile(
            &self,
            ci: &ClusterInstallation,
            _installation: &Installation,
        ) -> Result<()> {
            tracing::info!(id = %ci.id, "noop: reconcile cluster installation");
            Ok(())
        }
        async fn delete(&self, ci: &ClusterInstallation) -> Result<()> {
            tracing::info!(id = %ci.id, "noop: delete cluster installation");
            Ok(())
        }
        async fn hibernate(&self, ci: &ClusterInstallation) -> Result<()> {
            tracing::info!(id = %ci.id, "noop: hibernate cluster installation");
            Ok(())
        }
        async fn wakeup(&self, ci: &ClusterInstallation) -> Result<()> {
            tracing::info!(id = %ci.id, "noop: wakeup cluster installation");
            Ok(())
        }
        async fn exec_cli(&self, ci: &ClusterInstallation, args: &[String]) -> Result<String> {
            tracing::info!(id = %ci.id, ?args, "noop: exec cli");
            Ok(String::new())
        }
    }

    pub struct NoopDnsProvider;

    #[async_trait]
    impl DnsProvider for NoopDnsProvider {
        async fn create_records(&self, installation: &Installation, domain_name: &str) -> Result<()> {
            tracing::info!(id = %installation.id, domain_name, "noop: create dns records");
            Ok(())
        }
        async fn delete_records(&self, installation: &Installation, domain_name: &str) -> Result<()> {
            tracing::info!(id = %installation.id, domain_name, "noop: delete dns records");
            Ok(())
        }
    }

    pub struct NoopDatabaseProvisioner;

    #[async_trait]
    impl DatabaseProvisioner for NoopDatabaseProvisioner {
        async fn provision(&self, installation: &Installation) -> Result<()> {
            tracing::info!(id = %installation.id, "noop: provision database");
            Ok(())
        }
        async fn teardown(&self, installation: &Installation) -> Result<()> {
            tracing::info!(id = %installation.id, "noop: teardown database");
            Ok(())
        }
        async fn teardown_migrated(&self, installation: &Installation) -> Result<()> {
            tracing::info!(id = %installation.id, "noop: teardown migrated database");
            Ok(())
        }
        async fn snapshot(&self, installation: &Installation) -> Result<String> {
            tracing::info!(id = %installation.id, "noop: snapshot database");
            Ok(format!("noop-snapshot-{}", installation.id))
        }
        async fn restore(&self, installation: &Installation, backup_ref: &str) -> Result<()> {
            tracing::info!(id = %installation.id, backup_ref, "noop: restore database");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::noop::*;
    use super::*;
    use orchestrator_types::{
        Affinity, DatabaseKind, FilestoreKind, Installation, InstallationState,
    };
    use std::collections::BTreeMap;

    fn installation() -> Installation {
        Installation {
            id: "installation1".into(),
            owner_id: "owner1".to_string(),
            dns_records: vec![],
            name: String::new(),
            image: "mattermost/mattermost".to_string(),
            version: "9.0.0".to_string(),
            license: None,
            size: "100users".to_string(),
            affinity: Affinity::MultiTenant,
            database: DatabaseKind::MultiTenantRdsPostgres,
            filestore: FilestoreKind::Bifrost,
            mattermost_env: BTreeMap::new(),
            priority_env: BTreeMap::new(),
            volumes: BTreeMap::new(),
            cr_version: "0".to_string(),
            group_id: None,
            group_sequence: None,
            database_config: None,
            annotations: Vec::new(),
            deletion_locked: false,
            deletion_pending_expiry: 0,
            state: InstallationState::CreationRequested,
            create_at: 1,
            update_at: 1,
            delete_at: 0,
            lock: Default::default(),
        }
    }

    #[tokio::test]
    async fn noop_database_provisioner_returns_a_snapshot_ref() {
        let installation = installation();
        let snap = NoopDatabaseProvisioner.snapshot(&installation).await.unwrap();
        assert!(snap.contains(installation.id.as_str()));
    }

    #[tokio::test]
    async fn noop_dns_provider_succeeds() {
        let installation = installation();
        NoopDnsProvider
            .create_records(&installation, "foo.example.com")
            .await
            .unwrap();
    }
}
