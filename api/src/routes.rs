//! Route tables. `public_routes` needs no bearer token at all (health plus
//! read-only listing/lookup of every resource); `protected_routes` carries
//! every state-changing endpoint and is expected to be wrapped with the
//! Keycloak auth layer and [`crate::security::enforce_restricted_client`]
//! by the binary that builds the final router.
//!
//! Collection endpoints are plural (`/api/clusters`), single-resource
//! endpoints singular (`/api/cluster/{id}`).

use axum::Router;
use axum::routing::{delete, get, patch, post, put};

use crate::handlers;
use crate::state::AppState;

pub fn public_routes(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/api/clusters", get(handlers::list_clusters))
        .route("/api/cluster/{id}", get(handlers::get_cluster))
        .route("/api/installations", get(handlers::list_installations))
        .route("/api/installation/{id}", get(handlers::get_installation))
        .route(
            "/api/cluster_installations",
            get(handlers::list_cluster_installations),
        )
        .route(
            "/api/cluster_installation/{id}",
            get(handlers::get_cluster_installation),
        )
        .route("/api/groups", get(handlers::list_groups))
        .route("/api/group/{id}", get(handlers::get_group))
        .route(
            "/api/installations/operations/database/migrations",
            get(handlers::list_db_migrations),
        )
        .route(
            "/api/installations/operations/database/migration/{id}",
            get(handlers::get_db_migration),
        )
        .route(
            "/api/installations/operations/database/restorations",
            get(handlers::list_db_restorations),
        )
        .route(
            "/api/installations/operations/database/restoration/{id}",
            get(handlers::get_db_restoration),
        )
        .route("/api/installations/backups", get(handlers::list_backups))
        .route("/api/installations/backup/{id}", get(handlers::get_backup))
        .route("/api/databases", get(handlers::list_multitenant_databases))
        .route("/api/subscriptions", get(handlers::list_subscriptions))
        .route("/api/subscription/{id}", get(handlers::get_subscription))
        .route(
            "/api/events/state_change",
            get(handlers::list_state_change_events),
        )
        .with_state(state)
}

pub fn protected_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/clusters", post(handlers::create_cluster))
        .route(
            "/api/cluster/{id}",
            post(handlers::retry_cluster).delete(handlers::delete_cluster),
        )
        .route(
            "/api/cluster/{id}/provision",
            post(handlers::provision_cluster),
        )
        .route(
            "/api/cluster/{id}/kubernetes/{version}",
            put(handlers::upgrade_cluster),
        )
        .route("/api/cluster/{id}/size/{size}", put(handlers::resize_cluster))
        .route(
            "/api/cluster/{id}/annotations",
            post(handlers::add_cluster_annotation),
        )
        .route(
            "/api/cluster/{id}/annotation/{name}",
            delete(handlers::delete_cluster_annotation),
        )
        .route("/api/installations", post(handlers::create_installation))
        .route(
            "/api/installation/{id}",
            post(handlers::retry_installation)
                .patch(handlers::update_installation)
                .delete(handlers::delete_installation),
        )
        .route(
            "/api/installation/{id}/hibernate",
            post(handlers::hibernate_installation),
        )
        .route(
            "/api/installation/{id}/wakeup",
            post(handlers::wakeup_installation),
        )
        .route(
            "/api/installation/{id}/deletion/cancel",
            post(handlers::cancel_installation_deletion),
        )
        .route(
            "/api/installation/{id}/group",
            put(handlers::join_group).delete(handlers::leave_group),
        )
        .route("/api/installation/{id}/dns", post(handlers::add_dns))
        .route(
            "/api/installation/{id}/dns/{domain_name}",
            put(handlers::set_primary_dns).delete(handlers::delete_dns),
        )
        .route(
            "/api/installation/{id}/annotations",
            post(handlers::add_installation_annotation),
        )
        .route(
            "/api/installation/{id}/annotation/{name}",
            delete(handlers::delete_installation_annotation),
        )
        .route(
            "/api/installation/{id}/volumes",
            post(handlers::add_volume),
        )
        .route(
            "/api/installation/{id}/volume/{name}",
            put(handlers::update_volume).delete(handlers::delete_volume),
        )
        .route(
            "/api/installations/operations/database/migrations",
            post(handlers::create_db_migration),
        )
        .route(
            "/api/installations/operations/database/migration/{id}/commit",
            post(handlers::commit_db_migration),
        )
        .route(
            "/api/installations/operations/database/migration/{id}/rollback",
            post(handlers::rollback_db_migration),
        )
        .route(
            "/api/installations/operations/database/restorations",
            post(handlers::create_db_restoration),
        )
        .route(
            "/api/installations/backups",
            post(handlers::create_backup),
        )
        .route(
            "/api/cluster_installations",
            post(handlers::create_cluster_installation),
        )
        .route(
            "/api/cluster_installation/{id}",
            post(handlers::retry_cluster_installation)
                .delete(handlers::delete_cluster_installation),
        )
        .route(
            "/api/cluster_installation/{id}/reconcile",
            post(handlers::reconcile_cluster_installation),
        )
        .route(
            "/api/cluster_installations/migrate",
            post(handlers::migrate_cluster_installations),
        )
        .route(
            "/api/cluster_installations/migrate/dns",
            post(handlers::switch_cluster_installation_dns),
        )
        .route("/api/groups", post(handlers::create_group))
        .route(
            "/api/group/{id}",
            patch(handlers::update_group).delete(handlers::delete_group),
        )
        .route(
            "/api/group/{id}/annotations",
            post(handlers::add_group_annotation),
        )
        .route(
            "/api/group/{id}/annotation/{name}",
            delete(handlers::delete_group_annotation),
        )
        .route(
            "/api/security/{kind}/{id}/api",
            post(handlers::api_lock).delete(handlers::api_unlock),
        )
        .route(
            "/api/security/{kind}/{id}/deletion",
            post(handlers::deletion_lock).delete(handlers::deletion_unlock),
        )
        .route(
            "/api/security/{kind}/{id}/lock",
            delete(handlers::force_unlock),
        )
        .route(
            "/api/databases",
            post(handlers::create_multitenant_database),
        )
        .route("/api/subscriptions", post(handlers::create_subscription))
        .route(
            "/api/subscription/{id}",
            delete(handlers::delete_subscription),
        )
        .with_state(state)
}
