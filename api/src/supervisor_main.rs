use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use orchestrator_common::args::{PostgresArgs, SupervisorArgs};
use orchestrator_common::shutdown;
use orchestrator_core::{DeliveryWorker, EventProducer, SupervisorConfig, SupervisorFleet};
use orchestrator_provisioner::noop::{
    NoopClusterInstallationProvisioner, NoopClusterProvisioner, NoopDatabaseProvisioner,
    NoopDnsProvider,
};
use orchestrator_store::Store;
use orchestrator_store::postgres::{PostgresStore, init_schema};

#[derive(Parser, Debug, Clone)]
#[command(name = "orchestrator-supervisor")]
struct Args {
    #[command(flatten)]
    postgres: PostgresArgs,

    #[command(flatten)]
    supervisor: SupervisorArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    orchestrator_common::init();

    let args = Args::parse();

    let pool = orchestrator_common::postgres::create_pool(args.postgres).await;
    init_schema(&pool).await.context("failed to initialize database schema")?;

    let store: Arc<dyn Store> = Arc::new(PostgresStore::new(pool));
    let wake = Arc::new(tokio::sync::Notify::new());
    let events = Arc::new(EventProducer::new(store.clone(), wake.clone()));

    let fleet = SupervisorFleet::new(
        store.clone(),
        events.clone(),
        wake,
        SupervisorConfig {
            cluster_provisioner: Arc::new(NoopClusterProvisioner),
            ci_provisioner: Arc::new(NoopClusterInstallationProvisioner),
            database: Arc::new(NoopDatabaseProvisioner),
            dns: Arc::new(NoopDnsProvider),
            tick: Duration::from_millis(args.supervisor.tick_ms),
            action_timeout: Duration::from_millis(args.supervisor.action_timeout_ms),
            batch_size: args.supervisor.batch_size,
        },
    );
    let delivery = DeliveryWorker::new(
        store,
        args.supervisor.batch_size,
        Duration::from_millis(args.supervisor.tick_ms),
    );

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown::shutdown_signal().await;
        shutdown_cancel.cancel();
    });

    tracing::info!("starting supervisor fleet");
    orchestrator_common::signal_ready();
    tokio::join!(fleet.run(cancel.clone()), delivery.run(cancel));
    tracing::info!("supervisor stopped gracefully");
    Ok(())
}
