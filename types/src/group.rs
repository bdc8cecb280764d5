use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::{Annotation, EnvVar, Millis};
use crate::id::ResourceId;

/// A template of config/version shared by installations. Installations
/// joined to a group inherit version/image/env, overridable per
/// installation by its own PriorityEnv.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: ResourceId,
    pub name: String,
    pub version: String,
    pub image: String,
    pub mattermost_env: BTreeMap<String, EnvVar>,
    pub max_rolling: i64,
    pub annotations: Vec<Annotation>,
    /// Bumped every time group config changes; installations compare
    /// against their own `group_sequence` to know whether they need a
    /// rolling update.
    pub sequence: i64,

    pub create_at: Millis,
    pub update_at: Millis,
    pub delete_at: Millis,
}

impl Group {
    pub fn is_deleted(&self) -> bool {
        self.delete_at != 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub version: String,
    pub image: String,
    #[serde(default)]
    pub mattermost_env: BTreeMap<String, EnvVar>,
    #[serde(default = "default_max_rolling")]
    pub max_rolling: i64,
}

fn default_max_rolling() -> i64 {
    1
}

/// Partial update; any field left unset keeps its current value. A
/// successful update bumps the group sequence so member installations can
/// tell they are behind.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateGroupRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub mattermost_env: Option<BTreeMap<String, EnvVar>>,
    #[serde(default)]
    pub max_rolling: Option<i64>,
}
