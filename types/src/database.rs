use serde::{Deserialize, Serialize};

use crate::common::Millis;
use crate::id::ResourceId;

/// A shared RDS-like cluster used for multi-tenant database placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultitenantDatabase {
    pub id: ResourceId,
    pub rds_cluster_id: String,
    pub max_installations_per_logical_database: i64,
    pub vpc_id: Option<String>,

    pub create_at: Millis,
    pub update_at: Millis,
    pub delete_at: Millis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalDatabase {
    pub id: ResourceId,
    pub multitenant_database_id: ResourceId,
    pub name: String,

    pub create_at: Millis,
    pub update_at: Millis,
    pub delete_at: Millis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSchema {
    pub id: ResourceId,
    pub logical_database_id: ResourceId,
    pub installation_id: ResourceId,
    pub name: String,

    pub create_at: Millis,
    pub update_at: Millis,
    pub delete_at: Millis,
}

/// Registers a shared RDS-like cluster as a placement target for
/// multi-tenant installations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMultitenantDatabaseRequest {
    pub rds_cluster_id: String,
    #[serde(default = "default_max_installations")]
    pub max_installations_per_logical_database: i64,
    #[serde(default)]
    pub vpc_id: Option<String>,
}

fn default_max_installations() -> i64 {
    10
}
