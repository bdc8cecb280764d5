use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum_keycloak_auth::{
    PassthroughMode,
    instance::{KeycloakAuthInstance, KeycloakConfig},
    layer::KeycloakAuthLayer,
};
use clap::Parser;
use reqwest::Url;

use orchestrator_common::args::{DeletionArgs, PostgresArgs, SecurityArgs};
use orchestrator_common::{access_log, cors, metrics, request_context, shutdown};
use orchestrator_core::{DeletionPolicy, Engine};
use orchestrator_provisioner::noop::NoopDnsProvider;
use orchestrator_store::Store;
use orchestrator_store::postgres::{PostgresStore, init_schema};

use orchestrator_api::routes::{protected_routes, public_routes};
use orchestrator_api::security::{SecurityPolicy, enforce_restricted_client};
use orchestrator_api::state::AppState;

#[derive(Parser, Debug, Clone)]
#[command(name = "orchestrator-api")]
struct Args {
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Client ids whose access is limited to the allowed patterns.
    #[arg(long, env = "RESTRICTED_CLIENT_IDS", value_delimiter = ',')]
    restricted_client_ids: Vec<String>,

    /// Endpoint patterns restricted clients may call; `^...$` is an exact
    /// path, anything else a prefix.
    #[arg(long, env = "RESTRICTED_CLIENT_ALLOWED_PATTERNS", value_delimiter = ',')]
    restricted_client_allowed_patterns: Vec<String>,

    #[command(flatten)]
    postgres: PostgresArgs,

    #[command(flatten)]
    security: SecurityArgs,

    #[command(flatten)]
    deletion: DeletionArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    orchestrator_common::init();

    let args = Args::parse();

    let pool = orchestrator_common::postgres::create_pool(args.postgres).await;
    init_schema(&pool).await.context("failed to initialize database schema")?;

    let store: Arc<dyn Store> = Arc::new(PostgresStore::new(pool));
    let dns = Arc::new(NoopDnsProvider);
    let deletion = DeletionPolicy {
        default_expiry_ms: args.deletion.default_expiry_ms,
        max_expiry_ms: args.deletion.max_expiry_ms,
    };
    let engine = Arc::new(Engine::new(store, dns, deletion));

    let state = AppState {
        engine,
        security: SecurityPolicy {
            restricted_client_ids: args.restricted_client_ids,
            allowed_patterns: args.restricted_client_allowed_patterns,
        },
    };

    let public = public_routes(state.clone())
        .layer(axum::middleware::from_fn(request_context::middleware::create_context))
        .layer(axum::middleware::from_fn(access_log::public))
        .layer(cors::dev());

    let mut protected = protected_routes(state.clone());
    if let Some(endpoint) = args.security.endpoint.clone() {
        let realm = args
            .security
            .realm
            .clone()
            .context("SECURITY_REALM is required when SECURITY_JWKS_ENDPOINT is set")?;
        let client_id = args
            .security
            .client_id
            .clone()
            .context("SECURITY_CLIENT_ID is required when SECURITY_JWKS_ENDPOINT is set")?;
        let instance = KeycloakAuthInstance::new(
            KeycloakConfig::builder()
                .server(Url::parse(&endpoint).context("invalid SECURITY_JWKS_ENDPOINT")?)
                .realm(realm)
                .build(),
        );
        let keycloak_layer = KeycloakAuthLayer::<String>::builder()
            .instance(instance)
            .passthrough_mode(PassthroughMode::Block)
            .persist_raw_claims(true)
            .expected_audiences(vec![client_id])
            .build();
        protected = protected
            .layer(axum::middleware::from_fn_with_state(
                state.clone(),
                enforce_restricted_client,
            ))
            .layer(keycloak_layer);
    }
    let protected = protected
        .layer(axum::middleware::from_fn(request_context::middleware::extract_context))
        .layer(axum::middleware::from_fn(access_log::internal))
        .layer(cors::dev());

    let app: Router = protected.merge(public);

    metrics::maybe_spawn_metrics_server();

    let addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    tracing::info!(%addr, "starting orchestrator HTTP surface");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    orchestrator_common::signal_ready();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown::shutdown_signal())
        .await?;
    tracing::info!("server stopped gracefully");
    Ok(())
}
