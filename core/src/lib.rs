//! The reconciliation engine: Admission validates and persists client
//! intent, the Supervisor drives resources toward it, and the Event
//! Producer tells the outside world what happened. [`Engine`] wires the
//! three together over one `Store` so the HTTP surface has a single
//! thing to construct and hand to its handlers.

pub mod admission;
pub mod error;
pub mod events;
pub mod lock;
pub mod machine;
pub mod supervisor;

use std::sync::Arc;
use std::time::Duration;

use orchestrator_provisioner::{
    ClusterInstallationProvisioner, ClusterProvisioner, DatabaseProvisioner, DnsProvider,
};
use orchestrator_store::Store;
use tokio_util::sync::CancellationToken;

pub use admission::{Admission, DeletionPolicy};
pub use error::{Error, Result};
pub use events::{DeliveryWorker, EventProducer};
pub use lock::LockManager;
pub use supervisor::{
    BackupReconciler, ClusterInstallationReconciler, ClusterReconciler, InstallationReconciler,
    Reconciler, SupervisorWorker,
};

pub struct Engine {
    pub store: Arc<dyn Store>,
    pub admission: Arc<Admission>,
    pub events: Arc<EventProducer>,
    /// Signaled whenever a new event is persisted, so a Supervisor running
    /// in the same process can shortcut its next tick instead of waiting
    /// out the full poll interval.
    pub notify: Arc<tokio::sync::Notify>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>, dns: Arc<dyn DnsProvider>, deletion: DeletionPolicy) -> Self {
        let notify = Arc::new(tokio::sync::Notify::new());
        let events = Arc::new(EventProducer::new(store.clone(), notify.clone()));
        let lock = LockManager::new(store.clone());
        let admission = Arc::new(Admission::new(store.clone(), lock, events.clone(), dns, deletion));
        Engine {
            store,
            admission,
            events,
            notify,
        }
    }
}

/// Everything the supervisor workers need beyond the store: the external
/// collaborators and the pacing knobs.
pub struct SupervisorConfig {
    pub cluster_provisioner: Arc<dyn ClusterProvisioner>,
    pub ci_provisioner: Arc<dyn ClusterInstallationProvisioner>,
    pub database: Arc<dyn DatabaseProvisioner>,
    pub dns: Arc<dyn DnsProvider>,
    pub tick: Duration,
    pub action_timeout: Duration,
    pub batch_size: i64,
}

/// Builds and runs the per-resource-type Supervisor workers, all sharing
/// `cancel` for coordinated shutdown and `wake` as the admission-side
/// "work available" hint.
pub struct SupervisorFleet {
    store: Arc<dyn Store>,
    events: Arc<EventProducer>,
    wake: Arc<tokio::sync::Notify>,
    config: SupervisorConfig,
}

impl SupervisorFleet {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<EventProducer>,
        wake: Arc<tokio::sync::Notify>,
        config: SupervisorConfig,
    ) -> Self {
        SupervisorFleet {
            store,
            events,
            wake,
            config,
        }
    }

    /// Runs every worker concurrently until `cancel` fires; returns once
    /// all of them have completed their in-flight tick.
    pub async fn run(&self, cancel: CancellationToken) {
        let cfg = &self.config;
        let cluster = SupervisorWorker::new(
            ClusterReconciler::new(
                self.store.clone(),
                cfg.cluster_provisioner.clone(),
                cfg.action_timeout,
            ),
            LockManager::new(self.store.clone()),
            self.events.clone(),
            self.wake.clone(),
            cfg.batch_size,
            cfg.tick,
        );
        let installation = SupervisorWorker::new(
            InstallationReconciler::new(
                self.store.clone(),
                cfg.database.clone(),
                cfg.dns.clone(),
                cfg.ci_provisioner.clone(),
                self.events.clone(),
                cfg.action_timeout,
            ),
            LockManager::new(self.store.clone()),
            self.events.clone(),
            self.wake.clone(),
            cfg.batch_size,
            cfg.tick,
        );
        let cluster_installation = SupervisorWorker::new(
            ClusterInstallationReconciler::new(
                self.store.clone(),
                cfg.ci_provisioner.clone(),
                cfg.action_timeout,
            ),
            LockManager::new(self.store.clone()),
            self.events.clone(),
            self.wake.clone(),
            cfg.batch_size,
            cfg.tick,
        );
        let backup = SupervisorWorker::new(
            BackupReconciler::new(self.store.clone(), cfg.database.clone(), cfg.action_timeout),
            LockManager::new(self.store.clone()),
            self.events.clone(),
            self.wake.clone(),
            cfg.batch_size,
            cfg.tick,
        );
        tokio::join!(
            cluster.run(cancel.clone()),
            installation.run(cancel.clone()),
            cluster_installation.run(cancel.clone()),
            backup.run(cancel.clone()),
        );
    }
}
