pub mod cluster;
pub mod cluster_installation;
pub mod common;
pub mod database;
pub mod group;
pub mod id;
pub mod installation;
pub mod operations;
pub mod subscription;

pub use cluster::*;
pub use cluster_installation::*;
pub use common::*;
pub use database::*;
pub use group::*;
pub use id::ResourceId;
pub use installation::*;
pub use operations::*;
pub use subscription::*;

/// The resource kinds the Lock Manager and Supervisor operate over
/// generically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cluster,
    Installation,
    ClusterInstallation,
    Group,
    DbMigrationOperation,
    DbRestorationOperation,
    Backup,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cluster => "cluster",
            ResourceKind::Installation => "installation",
            ResourceKind::ClusterInstallation => "cluster_installation",
            ResourceKind::Group => "group",
            ResourceKind::DbMigrationOperation => "db_migration_operation",
            ResourceKind::DbRestorationOperation => "db_restoration_operation",
            ResourceKind::Backup => "backup",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
