//! Cluster and Machine reconcilers
//!
//! Both reconcilers follow the same shape: re-read the object, handle
//! deletion and pause, make sure a phase is recorded, dispatch to the
//! provider registered for the Cluster's type according to phase, then
//! persist whatever the provider changed through the applier.

mod cleanup;
pub mod cluster;
pub mod machine;
mod restore;

use std::sync::Arc;
use std::time::Duration;

use kube::Client;

use keel_common::crd::minor_version;
use keel_node::{ExecutorFactory, SshExecutorFactory};

use crate::provider::ProviderRegistry;
use crate::registry::{ClusterManagerRegistry, KubeconfigConnector};
use crate::store::{ClusterStore, KubeStore};

pub use cluster::{error_policy, reconcile};

/// Minor versions accepted when none are configured
pub const DEFAULT_SUPPORTED_VERSIONS: &[&str] = &["1.30", "1.31", "1.32"];

/// Timing and version policy shared by the reconcilers
#[derive(Clone, Debug)]
pub struct ReconcileConfig {
    /// Accepted `major.minor` versions
    pub supported_versions: Vec<String>,
    /// Requeue delay after a phase transition or an Initializing pass
    pub initializing_requeue: Duration,
    /// Requeue delay while a Machine waits for its Cluster
    pub machine_wait: Duration,
    /// Requeue delay after a retryable error
    pub error_backoff: Duration,
    /// Resync interval for Running objects
    pub resync: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            supported_versions: DEFAULT_SUPPORTED_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            initializing_requeue: Duration::from_secs(3),
            machine_wait: Duration::from_secs(10),
            error_backoff: Duration::from_secs(15),
            resync: Duration::from_secs(60),
        }
    }
}

impl ReconcileConfig {
    /// Whether `version` falls in a supported minor
    pub fn is_supported(&self, version: &str) -> bool {
        minor_version(version).is_some_and(|minor| self.supported_versions.contains(&minor))
    }
}

/// Shared state for both reconcilers
pub struct Context {
    /// Management cluster API access (trait object for testability)
    pub store: Arc<dyn ClusterStore>,
    /// Providers keyed by cluster type
    pub providers: Arc<ProviderRegistry>,
    /// Live handles to Running clusters
    pub managers: Arc<ClusterManagerRegistry>,
    /// Opens sessions to nodes for cleanup
    pub executors: Arc<dyn ExecutorFactory>,
    /// Timing and version policy
    pub config: ReconcileConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Context from explicit parts
    ///
    /// Unit tests use this where a real Kubernetes client is not available;
    /// production code uses [`Context::builder`].
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn ClusterStore>,
        providers: ProviderRegistry,
        executors: Arc<dyn ExecutorFactory>,
    ) -> Self {
        Self {
            store,
            providers: Arc::new(providers),
            managers: Arc::new(ClusterManagerRegistry::new(Arc::new(KubeconfigConnector))),
            executors,
            config: ReconcileConfig::default(),
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// ```text
/// let ctx = Context::builder(client)
///     .providers(providers)
///     .config(config)
///     .build();
/// ```
pub struct ContextBuilder {
    client: Client,
    store: Option<Arc<dyn ClusterStore>>,
    providers: Option<Arc<ProviderRegistry>>,
    managers: Option<Arc<ClusterManagerRegistry>>,
    executors: Option<Arc<dyn ExecutorFactory>>,
    config: ReconcileConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            store: None,
            providers: None,
            managers: None,
            executors: None,
            config: ReconcileConfig::default(),
        }
    }

    /// Override the store (primarily for testing)
    pub fn store(mut self, store: Arc<dyn ClusterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the provider registry
    pub fn providers(mut self, providers: Arc<ProviderRegistry>) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Share an existing manager registry
    pub fn managers(mut self, managers: Arc<ClusterManagerRegistry>) -> Self {
        self.managers = Some(managers);
        self
    }

    /// Override the executor factory used for node cleanup
    pub fn executors(mut self, executors: Arc<dyn ExecutorFactory>) -> Self {
        self.executors = Some(executors);
        self
    }

    /// Set timing and version policy
    pub fn config(mut self, config: ReconcileConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeStore::new(self.client.clone()))),
            providers: self.providers.unwrap_or_default(),
            managers: self.managers.unwrap_or_else(|| {
                Arc::new(ClusterManagerRegistry::new(Arc::new(KubeconfigConnector)))
            }),
            executors: self
                .executors
                .unwrap_or_else(|| Arc::new(SshExecutorFactory::default())),
            config: self.config,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Mocks and capture helpers shared by the reconciler tests

    use std::sync::{Arc, Mutex};

    use keel_common::crd::{
        Cluster, ClusterCredential, ClusterPhase, ClusterStatus, Machine, MachinePhase,
        MachineStatus,
    };

    use crate::store::MockClusterStore;

    /// Records every status written to the store
    #[derive(Clone, Default)]
    pub struct StatusCapture {
        clusters: Arc<Mutex<Vec<ClusterStatus>>>,
        machines: Arc<Mutex<Vec<MachineStatus>>>,
    }

    impl StatusCapture {
        pub fn record_cluster(&self, cluster: &Cluster) {
            self.clusters
                .lock()
                .expect("mutex should not be poisoned")
                .push(cluster.status.clone().unwrap_or_default());
        }

        pub fn record_machine(&self, machine: &Machine) {
            self.machines
                .lock()
                .expect("mutex should not be poisoned")
                .push(machine.status.clone().unwrap_or_default());
        }

        pub fn last_cluster(&self) -> Option<ClusterStatus> {
            self.clusters
                .lock()
                .expect("mutex should not be poisoned")
                .last()
                .cloned()
        }

        pub fn last_cluster_phase(&self) -> Option<ClusterPhase> {
            self.last_cluster().and_then(|s| s.phase)
        }

        pub fn last_machine(&self) -> Option<MachineStatus> {
            self.machines
                .lock()
                .expect("mutex should not be poisoned")
                .last()
                .cloned()
        }

        pub fn last_machine_phase(&self) -> Option<MachinePhase> {
            self.last_machine().and_then(|s| s.phase)
        }

        pub fn cluster_updates(&self) -> usize {
            self.clusters
                .lock()
                .expect("mutex should not be poisoned")
                .len()
        }
    }

    /// Store serving `cluster` and recording status writes
    ///
    /// Status writes also update what later reads return, so a reconcile
    /// that writes then re-reads sees its own write.
    pub fn store_with_cluster(
        cluster: Cluster,
        credential: Option<ClusterCredential>,
        capture: &StatusCapture,
    ) -> MockClusterStore {
        let current = Arc::new(Mutex::new(cluster));
        let mut store = MockClusterStore::new();

        let c = current.clone();
        store
            .expect_get_cluster()
            .returning(move |_| Ok(Some(c.lock().unwrap().clone())));

        let c = current.clone();
        let cap = capture.clone();
        store.expect_replace_cluster_status().returning(move |update| {
            cap.record_cluster(update);
            let mut stored = c.lock().unwrap();
            stored.status = update.status.clone();
            Ok(stored.clone())
        });

        let credential = Arc::new(Mutex::new(credential));
        let cred = credential.clone();
        store
            .expect_get_credential()
            .returning(move |_| Ok(cred.lock().unwrap().clone()));
        let cred = credential.clone();
        store.expect_create_credential().returning(move |created| {
            *cred.lock().unwrap() = Some(created.clone());
            Ok(created.clone())
        });
        store.expect_replace_credential().returning(move |replaced| {
            *credential.lock().unwrap() = Some(replaced.clone());
            Ok(replaced.clone())
        });
        store
    }
}
