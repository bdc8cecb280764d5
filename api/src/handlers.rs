//! One handler per HTTP operation. Reads go straight to the `Store`;
//! writes go through `Engine::admission` so every mutation gets the
//! lock-check-transition-persist-emit sequence for free. Every handler
//! returns `Result<_, orchestrator_core::Error>` and relies on `Error`'s
//! own `IntoResponse` impl for status mapping — nothing here invents its
//! own error-to-status translation.
//!
//! State-changing endpoints answer 202: the admission write is done but
//! the physical effect is the Supervisor's job.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use orchestrator_common::request_context::RequestContext;
use orchestrator_core::Error;
use orchestrator_store::{
    ClusterFilter, ClusterInstallationFilter, EventFilter, GroupFilter, InstallationFilter,
    OperationFilter, SubscriptionFilter,
};
use orchestrator_types::{
    CreateBackupRequest, CreateClusterRequest, CreateDbMigrationRequest,
    CreateDbRestorationRequest, CreateGroupRequest, CreateInstallationRequest,
    CreateSubscriptionRequest, DeleteInstallationRequest, MigrateClusterInstallationsRequest,
    PageRequest, ResourceId, ResourceKind, UpdateGroupRequest, Volume,
};

use crate::state::AppState;

type Result<T> = std::result::Result<T, Error>;

/// Correlation id for the event a mutation emits; present whenever the
/// request-context middleware ran.
fn request_id(req: &axum::http::Extensions) -> Option<String> {
    req.get::<RequestContext>()
        .map(|ctx| ctx.request_id.to_string())
}

/// Extractor wrapper so mutating handlers can thread the correlation id
/// without caring whether the middleware was installed.
pub struct MaybeRequestId(pub Option<String>);

impl<S: Send + Sync> axum::extract::FromRequestParts<S> for MaybeRequestId {
    type Rejection = std::convert::Infallible;

    fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> impl Future<Output = std::result::Result<Self, Self::Rejection>> + Send {
        let id = request_id(&parts.extensions);
        async move { Ok(MaybeRequestId(id)) }
    }
}

pub async fn health() -> impl IntoResponse {
    "OK"
}

// ---------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ClusterListQuery {
    #[serde(flatten)]
    pub page: PageRequest,
    #[serde(default)]
    pub state: Option<String>,
}

pub async fn create_cluster(
    State(state): State<AppState>,
    MaybeRequestId(rid): MaybeRequestId,
    Json(req): Json<CreateClusterRequest>,
) -> Result<impl IntoResponse> {
    let cluster = state.engine.admission.create_cluster(req, rid).await?;
    Ok((StatusCode::ACCEPTED, Json(cluster)))
}

pub async fn get_cluster(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<impl IntoResponse> {
    let cluster = state
        .engine
        .store
        .get_cluster(&id, false)
        .await
        .map_err(Error::Internal)?
        .ok_or_else(|| Error::not_found("cluster", id.to_string()))?;
    Ok(Json(cluster))
}

pub async fn list_clusters(
    State(state): State<AppState>,
    Query(q): Query<ClusterListQuery>,
) -> Result<impl IntoResponse> {
    let page = state
        .engine
        .store
        .list_clusters(ClusterFilter {
            page: q.page,
            state: q.state,
        })
        .await
        .map_err(Error::Internal)?;
    Ok(Json(page))
}

pub async fn retry_cluster(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    let cluster = state.engine.admission.retry_cluster(&id, rid).await?;
    Ok((StatusCode::ACCEPTED, Json(cluster)))
}

pub async fn provision_cluster(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    let cluster = state.engine.admission.provision_cluster(&id, rid).await?;
    Ok((StatusCode::ACCEPTED, Json(cluster)))
}

pub async fn upgrade_cluster(
    State(state): State<AppState>,
    Path((id, version)): Path<(ResourceId, String)>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    let cluster = state
        .engine
        .admission
        .upgrade_cluster(&id, Some(version), rid)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(cluster)))
}

pub async fn resize_cluster(
    State(state): State<AppState>,
    Path((id, size)): Path<(ResourceId, String)>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    let cluster = state
        .engine
        .admission
        .resize_cluster(&id, Some(size), rid)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(cluster)))
}

pub async fn delete_cluster(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    let cluster = state.engine.admission.delete_cluster(&id, rid).await?;
    Ok((StatusCode::ACCEPTED, Json(cluster)))
}

#[derive(Debug, Deserialize)]
pub struct AnnotationRequest {
    pub name: String,
}

pub async fn add_cluster_annotation(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
    Json(req): Json<AnnotationRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .engine
            .admission
            .add_cluster_annotation(&id, req.name, rid)
            .await?,
    ))
}

pub async fn delete_cluster_annotation(
    State(state): State<AppState>,
    Path((id, name)): Path<(ResourceId, String)>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .engine
            .admission
            .delete_cluster_annotation(&id, &name, rid)
            .await?,
    ))
}

// ---------------------------------------------------------------
// Installation
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct InstallationListQuery {
    #[serde(flatten)]
    pub page: PageRequest,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub dns: Option<String>,
    #[serde(default)]
    pub group_id: Option<ResourceId>,
    #[serde(
        default,
        deserialize_with = "orchestrator_types::common::deserialize_opt_bool_from_string_or_bool"
    )]
    pub deletion_locked: Option<bool>,
}

pub async fn create_installation(
    State(state): State<AppState>,
    MaybeRequestId(rid): MaybeRequestId,
    Json(req): Json<CreateInstallationRequest>,
) -> Result<impl IntoResponse> {
    let installation = state.engine.admission.create_installation(req, rid).await?;
    Ok((StatusCode::ACCEPTED, Json(installation)))
}

pub async fn get_installation(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<impl IntoResponse> {
    let installation = state
        .engine
        .store
        .get_installation(&id, false)
        .await
        .map_err(Error::Internal)?
        .ok_or_else(|| Error::not_found("installation", id.to_string()))?;
    Ok(Json(installation))
}

pub async fn list_installations(
    State(state): State<AppState>,
    Query(q): Query<InstallationListQuery>,
) -> Result<impl IntoResponse> {
    let deletion_locked = match q.deletion_locked {
        None => orchestrator_types::TriState::Any,
        Some(true) => orchestrator_types::TriState::OnlyTrue,
        Some(false) => orchestrator_types::TriState::OnlyFalse,
    };
    let page = state
        .engine
        .store
        .list_installations(InstallationFilter {
            page: q.page,
            state: q.state,
            owner_id: q.owner_id,
            dns: q.dns,
            deletion_locked,
            group_id: q.group_id,
        })
        .await
        .map_err(Error::Internal)?;
    Ok(Json(page))
}

pub async fn retry_installation(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    let installation = state.engine.admission.retry_installation(&id, rid).await?;
    Ok((StatusCode::ACCEPTED, Json(installation)))
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateInstallationRequest {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub license: Option<String>,
}

pub async fn update_installation(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
    Json(req): Json<UpdateInstallationRequest>,
) -> Result<impl IntoResponse> {
    let installation = state
        .engine
        .admission
        .update_installation(&id, rid, move |i| {
            if let Some(image) = req.image {
                i.image = image;
            }
            if let Some(version) = req.version {
                i.version = version;
            }
            if let Some(size) = req.size {
                i.size = size;
            }
            if let Some(license) = req.license {
                i.license = Some(license);
            }
            Ok(())
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(installation)))
}

pub async fn hibernate_installation(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    let installation = state.engine.admission.hibernate_installation(&id, rid).await?;
    Ok((StatusCode::ACCEPTED, Json(installation)))
}

pub async fn wakeup_installation(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    let installation = state.engine.admission.wakeup_installation(&id, rid).await?;
    Ok((StatusCode::ACCEPTED, Json(installation)))
}

pub async fn cancel_installation_deletion(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    let installation = state.engine.admission.cancel_deletion(&id, rid).await?;
    Ok((StatusCode::ACCEPTED, Json(installation)))
}

#[derive(Debug, Deserialize)]
pub struct JoinGroupRequest {
    pub group_id: ResourceId,
}

pub async fn join_group(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
    Json(req): Json<JoinGroupRequest>,
) -> Result<impl IntoResponse> {
    let installation = state
        .engine
        .admission
        .join_group(&id, &req.group_id, rid)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(installation)))
}

pub async fn leave_group(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    let installation = state.engine.admission.leave_group(&id, rid).await?;
    Ok((StatusCode::ACCEPTED, Json(installation)))
}

#[derive(Debug, Deserialize)]
pub struct DnsRequest {
    pub domain_name: String,
}

pub async fn add_dns(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
    Json(req): Json<DnsRequest>,
) -> Result<impl IntoResponse> {
    let installation = state
        .engine
        .admission
        .add_dns(&id, req.domain_name, rid)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(installation)))
}

pub async fn set_primary_dns(
    State(state): State<AppState>,
    Path((id, domain_name)): Path<(ResourceId, String)>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    let installation = state
        .engine
        .admission
        .set_primary_dns(&id, &domain_name, rid)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(installation)))
}

pub async fn delete_dns(
    State(state): State<AppState>,
    Path((id, domain_name)): Path<(ResourceId, String)>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state.engine.admission.delete_dns(&id, &domain_name, rid).await?,
    ))
}

pub async fn add_installation_annotation(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
    Json(req): Json<AnnotationRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .engine
            .admission
            .add_installation_annotation(&id, req.name, rid)
            .await?,
    ))
}

pub async fn delete_installation_annotation(
    State(state): State<AppState>,
    Path((id, name)): Path<(ResourceId, String)>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .engine
            .admission
            .delete_installation_annotation(&id, &name, rid)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct VolumeRequest {
    pub name: String,
    #[serde(flatten)]
    pub volume: Volume,
}

pub async fn add_volume(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
    Json(req): Json<VolumeRequest>,
) -> Result<impl IntoResponse> {
    let installation = state
        .engine
        .admission
        .add_volume(&id, req.name, req.volume, rid)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(installation)))
}

pub async fn update_volume(
    State(state): State<AppState>,
    Path((id, name)): Path<(ResourceId, String)>,
    MaybeRequestId(rid): MaybeRequestId,
    Json(volume): Json<Volume>,
) -> Result<impl IntoResponse> {
    let installation = state
        .engine
        .admission
        .update_volume(&id, &name, volume, rid)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(installation)))
}

pub async fn delete_volume(
    State(state): State<AppState>,
    Path((id, name)): Path<(ResourceId, String)>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    let installation = state.engine.admission.delete_volume(&id, &name, rid).await?;
    Ok((StatusCode::ACCEPTED, Json(installation)))
}

/// The expiry override rides in the query string; DELETE bodies don't
/// survive every proxy.
pub async fn delete_installation(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
    Query(req): Query<DeleteInstallationRequest>,
) -> Result<impl IntoResponse> {
    let installation = state
        .engine
        .admission
        .delete_installation(&id, req, rid)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(installation)))
}

// ---------------------------------------------------------------
// Database migration / restoration / backup operations
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OperationListQuery {
    #[serde(flatten)]
    pub page: PageRequest,
    #[serde(default)]
    pub installation_id: Option<ResourceId>,
    #[serde(default)]
    pub state: Option<String>,
}

impl OperationListQuery {
    fn filter(self) -> OperationFilter {
        OperationFilter {
            page: self.page,
            installation_id: self.installation_id,
            state: self.state,
        }
    }
}

pub async fn create_db_migration(
    State(state): State<AppState>,
    MaybeRequestId(rid): MaybeRequestId,
    Json(req): Json<CreateDbMigrationRequest>,
) -> Result<impl IntoResponse> {
    let op = state.engine.admission.create_db_migration(req, rid).await?;
    Ok((StatusCode::ACCEPTED, Json(op)))
}

pub async fn list_db_migrations(
    State(state): State<AppState>,
    Query(q): Query<OperationListQuery>,
) -> Result<impl IntoResponse> {
    let page = state
        .engine
        .store
        .list_db_migration_operations(q.filter())
        .await
        .map_err(Error::Internal)?;
    Ok(Json(page))
}

pub async fn get_db_migration(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<impl IntoResponse> {
    let op = state
        .engine
        .store
        .get_db_migration_operation(&id)
        .await
        .map_err(Error::Internal)?
        .ok_or_else(|| Error::not_found("db_migration_operation", id.to_string()))?;
    Ok(Json(op))
}

pub async fn commit_db_migration(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    Ok(Json(state.engine.admission.commit_db_migration(&id, rid).await?))
}

pub async fn rollback_db_migration(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    let op = state.engine.admission.rollback_db_migration(&id, rid).await?;
    Ok((StatusCode::ACCEPTED, Json(op)))
}

pub async fn create_db_restoration(
    State(state): State<AppState>,
    MaybeRequestId(rid): MaybeRequestId,
    Json(req): Json<CreateDbRestorationRequest>,
) -> Result<impl IntoResponse> {
    let op = state.engine.admission.create_db_restoration(req, rid).await?;
    Ok((StatusCode::ACCEPTED, Json(op)))
}

pub async fn list_db_restorations(
    State(state): State<AppState>,
    Query(q): Query<OperationListQuery>,
) -> Result<impl IntoResponse> {
    let page = state
        .engine
        .store
        .list_db_restoration_operations(q.filter())
        .await
        .map_err(Error::Internal)?;
    Ok(Json(page))
}

pub async fn get_db_restoration(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<impl IntoResponse> {
    let op = state
        .engine
        .store
        .get_db_restoration_operation(&id)
        .await
        .map_err(Error::Internal)?
        .ok_or_else(|| Error::not_found("db_restoration_operation", id.to_string()))?;
    Ok(Json(op))
}

pub async fn create_backup(
    State(state): State<AppState>,
    MaybeRequestId(rid): MaybeRequestId,
    Json(req): Json<CreateBackupRequest>,
) -> Result<impl IntoResponse> {
    let backup = state.engine.admission.create_backup(req, rid).await?;
    Ok((StatusCode::ACCEPTED, Json(backup)))
}

pub async fn list_backups(
    State(state): State<AppState>,
    Query(q): Query<OperationListQuery>,
) -> Result<impl IntoResponse> {
    let page = state
        .engine
        .store
        .list_backups(q.filter())
        .await
        .map_err(Error::Internal)?;
    Ok(Json(page))
}

pub async fn get_backup(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<impl IntoResponse> {
    let backup = state
        .engine
        .store
        .get_backup(&id)
        .await
        .map_err(Error::Internal)?
        .ok_or_else(|| Error::not_found("backup", id.to_string()))?;
    Ok(Json(backup))
}

// ---------------------------------------------------------------
// ClusterInstallation
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ClusterInstallationListQuery {
    #[serde(flatten)]
    pub page: PageRequest,
    #[serde(default)]
    pub cluster_id: Option<ResourceId>,
    #[serde(default)]
    pub installation_id: Option<ResourceId>,
    #[serde(
        default,
        deserialize_with = "orchestrator_types::common::deserialize_opt_bool_from_string_or_bool"
    )]
    pub is_active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct CreateClusterInstallationRequest {
    pub cluster_id: ResourceId,
    pub installation_id: ResourceId,
    pub namespace: String,
}

pub async fn create_cluster_installation(
    State(state): State<AppState>,
    MaybeRequestId(rid): MaybeRequestId,
    Json(req): Json<CreateClusterInstallationRequest>,
) -> Result<impl IntoResponse> {
    let ci = state
        .engine
        .admission
        .create_cluster_installation(&req.cluster_id, &req.installation_id, &req.namespace, rid)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ci)))
}

pub async fn get_cluster_installation(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<impl IntoResponse> {
    let ci = state
        .engine
        .store
        .get_cluster_installation(&id, false)
        .await
        .map_err(Error::Internal)?
        .ok_or_else(|| Error::not_found("cluster_installation", id.to_string()))?;
    Ok(Json(ci))
}

pub async fn list_cluster_installations(
    State(state): State<AppState>,
    Query(q): Query<ClusterInstallationListQuery>,
) -> Result<impl IntoResponse> {
    let page = state
        .engine
        .store
        .list_cluster_installations(ClusterInstallationFilter {
            page: q.page,
            cluster_id: q.cluster_id,
            installation_id: q.installation_id,
            is_active: q.is_active,
        })
        .await
        .map_err(Error::Internal)?;
    Ok(Json(page))
}

pub async fn retry_cluster_installation(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    let ci = state
        .engine
        .admission
        .retry_cluster_installation(&id, rid)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ci)))
}

pub async fn delete_cluster_installation(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    let ci = state
        .engine
        .admission
        .delete_cluster_installation(&id, rid)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ci)))
}

/// Forces a stable binding back through the reconcile loop, e.g. after an
/// out-of-band change on the cluster side.
pub async fn reconcile_cluster_installation(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
) -> Result<impl IntoResponse> {
    let ci = state
        .engine
        .admission
        .update_cluster_installation(&id, rid, |_| Ok(()))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ci)))
}

pub async fn migrate_cluster_installations(
    State(state): State<AppState>,
    Json(req): Json<MigrateClusterInstallationsRequest>,
) -> Result<impl IntoResponse> {
    let created = state
        .engine
        .admission
        .migrate_cluster_installations(&req)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(created)))
}

pub async fn switch_cluster_installation_dns(
    State(state): State<AppState>,
    Json(req): Json<MigrateClusterInstallationsRequest>,
) -> Result<impl IntoResponse> {
    let switched = state
        .engine
        .admission
        .switch_cluster_installation_dns(&req)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(switched)))
}

// ---------------------------------------------------------------
// Group
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct GroupListQuery {
    #[serde(flatten)]
    pub page: PageRequest,
}

pub async fn create_group(
    State(state): State<AppState>,
    MaybeRequestId(rid): MaybeRequestId,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse> {
    let group = state.engine.admission.create_group(req, rid).await?;
    Ok((StatusCode::CREATED, Json(group)))
}

pub async fn get_group(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<impl IntoResponse> {
    let group = state
        .engine
        .store
        .get_group(&id, false)
        .await
        .map_err(Error::Internal)?
        .ok_or_else(|| Error::not_found("group", id.to_string()))?;
    Ok(Json(group))
}

pub async fn list_groups(
    State(state): State<AppState>,
    Query(q): Query<GroupListQuery>,
) -> Result<impl IntoResponse> {
    let page = state
        .engine
        .store
        .list_groups(GroupFilter { page: q.page })
        .await
        .map_err(Error::Internal)?;
    Ok(Json(page))
}

pub async fn update_group(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    MaybeRequestId(rid): MaybeRequestId,
    Json(req): Json<UpdateGroupRequest>,
) -> Result<impl IntoResponse> {
    let group = state.engine.admission.update_group(&id, req, rid).await?;
    Ok((StatusCode::ACCEPTED, Json(group)))
}

pub async fn delete_group(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<impl IntoResponse> {
    if state.engine.admission.delete_group(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::not_found("group", id.to_string()))
    }
}

pub async fn add_group_annotation(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
    Json(req): Json<AnnotationRequest>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state.engine.admission.add_group_annotation(&id, req.name).await?,
    ))
}

pub async fn delete_group_annotation(
    State(state): State<AppState>,
    Path((id, name)): Path<(ResourceId, String)>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .engine
            .admission
            .delete_group_annotation(&id, &name)
            .await?,
    ))
}

// ---------------------------------------------------------------
// Security locks
// ---------------------------------------------------------------

fn parse_kind(kind: &str) -> Result<ResourceKind> {
    Ok(match kind {
        "cluster" => ResourceKind::Cluster,
        "installation" => ResourceKind::Installation,
        "cluster_installation" => ResourceKind::ClusterInstallation,
        other => {
            return Err(Error::InvalidInput(format!(
                "unknown resource kind: {other}"
            )));
        }
    })
}

pub async fn api_lock(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, ResourceId)>,
) -> Result<impl IntoResponse> {
    state
        .engine
        .admission
        .set_api_lock(parse_kind(&kind)?, &id, true)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn api_unlock(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, ResourceId)>,
) -> Result<impl IntoResponse> {
    state
        .engine
        .admission
        .set_api_lock(parse_kind(&kind)?, &id, false)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn deletion_lock(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, ResourceId)>,
) -> Result<impl IntoResponse> {
    state
        .engine
        .admission
        .set_deletion_lock(parse_kind(&kind)?, &id, true)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn deletion_unlock(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, ResourceId)>,
) -> Result<impl IntoResponse> {
    state
        .engine
        .admission
        .set_deletion_lock(parse_kind(&kind)?, &id, false)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Operator escape hatch: clears a work lock left behind by a crashed
/// worker, regardless of holder.
pub async fn force_unlock(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, ResourceId)>,
) -> Result<impl IntoResponse> {
    state
        .engine
        .admission
        .force_unlock(parse_kind(&kind)?, &id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------
// Databases
// ---------------------------------------------------------------

pub async fn create_multitenant_database(
    State(state): State<AppState>,
    Json(req): Json<orchestrator_types::CreateMultitenantDatabaseRequest>,
) -> Result<impl IntoResponse> {
    if req.max_installations_per_logical_database <= 0 {
        return Err(Error::InvalidInput(
            "max_installations_per_logical_database must be positive".into(),
        ));
    }
    let db = state
        .engine
        .store
        .create_multitenant_database(req)
        .await
        .map_err(Error::Internal)?;
    Ok((StatusCode::CREATED, Json(db)))
}

pub async fn list_multitenant_databases(
    State(state): State<AppState>,
) -> Result<impl IntoResponse> {
    let databases = state
        .engine
        .store
        .list_multitenant_databases()
        .await
        .map_err(Error::Internal)?;
    Ok(Json(databases))
}

// ---------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SubscriptionListQuery {
    #[serde(flatten)]
    pub page: PageRequest,
    #[serde(default)]
    pub owner_id: Option<String>,
}

pub async fn create_subscription(
    State(state): State<AppState>,
    Json(req): Json<CreateSubscriptionRequest>,
) -> Result<impl IntoResponse> {
    for header in &req.headers {
        if !header.value.is_valid() {
            return Err(Error::InvalidInput(format!(
                "header {} must set exactly one of value or secret_name",
                header.key
            )));
        }
    }
    let sub = state
        .engine
        .store
        .create_subscription(req)
        .await
        .map_err(Error::Internal)?;
    Ok((StatusCode::CREATED, Json(sub)))
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<impl IntoResponse> {
    let sub = state
        .engine
        .store
        .get_subscription(&id)
        .await
        .map_err(Error::Internal)?
        .ok_or_else(|| Error::not_found("subscription", id.to_string()))?;
    Ok(Json(sub))
}

pub async fn list_subscriptions(
    State(state): State<AppState>,
    Query(q): Query<SubscriptionListQuery>,
) -> Result<impl IntoResponse> {
    let page = state
        .engine
        .store
        .list_subscriptions(SubscriptionFilter {
            page: q.page,
            owner_id: q.owner_id,
        })
        .await
        .map_err(Error::Internal)?;
    Ok(Json(page))
}

pub async fn delete_subscription(
    State(state): State<AppState>,
    Path(id): Path<ResourceId>,
) -> Result<impl IntoResponse> {
    if state
        .engine
        .store
        .delete_subscription(&id)
        .await
        .map_err(Error::Internal)?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::not_found("subscription", id.to_string()))
    }
}

// ---------------------------------------------------------------
// Events
// ---------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EventListQuery {
    #[serde(flatten)]
    pub page: PageRequest,
    #[serde(default)]
    pub resource_id: Option<ResourceId>,
}

pub async fn list_state_change_events(
    State(state): State<AppState>,
    Query(q): Query<EventListQuery>,
) -> Result<impl IntoResponse> {
    let page = state
        .engine
        .store
        .list_events(EventFilter {
            page: q.page,
            resource_id: q.resource_id,
        })
        .await
        .map_err(Error::Internal)?;
    Ok(Json(page))
}
