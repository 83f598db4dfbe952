//! Live handles to provisioned clusters
//!
//! Once a Cluster is Running the reconciler registers a handle built from its
//! external admin kubeconfig. The handle keeps a reflector of the workload
//! cluster's Nodes for health reporting and is torn down when unregistered.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, Config};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use keel_common::crd::ClusterResource;
use keel_common::{Error, Result};

/// A live connection to a managed cluster
#[async_trait]
pub trait ManagedCluster: Send + Sync {
    /// Name of the Cluster the handle belongs to
    fn name(&self) -> String;

    /// Nodes currently known to the handle's cache
    fn nodes(&self) -> Vec<Node>;

    /// `gitVersion` reported by the API server
    async fn server_version(&self) -> Result<String>;
}

/// Builds handles from kubeconfigs
#[async_trait]
pub trait ManagerConnector: Send + Sync {
    /// Open a handle for `name` using `kubeconfig`
    async fn connect(&self, name: &str, kubeconfig: &str) -> Result<Arc<dyn ManagedCluster>>;
}

/// [`ManagedCluster`] backed by a kube client and a Node reflector
pub struct ClusterManager {
    name: String,
    client: Client,
    nodes: reflector::Store<Node>,
    watch: JoinHandle<()>,
}

impl ClusterManager {
    /// Connect to the cluster described by `kubeconfig` and start watching Nodes
    pub async fn connect(name: &str, kubeconfig: &str) -> Result<Self> {
        let kubeconfig = Kubeconfig::from_yaml(kubeconfig)
            .map_err(|e| Error::registry(name, format!("invalid kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::registry(name, format!("kubeconfig rejected: {e}")))?;
        let client = Client::try_from(config)?;

        let (reader, writer) = reflector::store::<Node>();
        let api: Api<Node> = Api::all(client.clone());
        let cluster = name.to_string();
        let stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .applied_objects();
        let watch = tokio::spawn(async move {
            stream
                .for_each(|event| {
                    if let Err(e) = event {
                        warn!(cluster = %cluster, error = %e, "node watch error");
                    }
                    futures::future::ready(())
                })
                .await;
        });

        info!(cluster = %name, "cluster manager connected");
        Ok(Self {
            name: name.to_string(),
            client,
            nodes: reader,
            watch,
        })
    }
}

impl Drop for ClusterManager {
    fn drop(&mut self) {
        self.watch.abort();
        debug!(cluster = %self.name, "cluster manager stopped");
    }
}

#[async_trait]
impl ManagedCluster for ClusterManager {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn nodes(&self) -> Vec<Node> {
        self.nodes
            .state()
            .iter()
            .map(|node| node.as_ref().clone())
            .collect()
    }

    async fn server_version(&self) -> Result<String> {
        Ok(self.client.apiserver_version().await?.git_version)
    }
}

/// Connects real [`ClusterManager`]s
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeconfigConnector;

#[async_trait]
impl ManagerConnector for KubeconfigConnector {
    async fn connect(&self, name: &str, kubeconfig: &str) -> Result<Arc<dyn ManagedCluster>> {
        Ok(Arc::new(ClusterManager::connect(name, kubeconfig).await?))
    }
}

/// Process-wide map from Cluster name to its handle
///
/// All operations are serialized behind one lock, so a Cluster never gets
/// two handles even when reconciles race.
pub struct ClusterManagerRegistry {
    connector: Arc<dyn ManagerConnector>,
    managers: Mutex<HashMap<String, Arc<dyn ManagedCluster>>>,
}

impl ClusterManagerRegistry {
    /// Create an empty registry
    pub fn new(connector: Arc<dyn ManagerConnector>) -> Self {
        Self {
            connector,
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Register `name`, connecting only if no handle exists yet
    pub async fn register(&self, name: &str, kubeconfig: &str) -> Result<Arc<dyn ManagedCluster>> {
        let mut managers = self.managers.lock().await;
        if let Some(existing) = managers.get(name) {
            return Ok(existing.clone());
        }
        let manager = self.connector.connect(name, kubeconfig).await?;
        managers.insert(name.to_string(), manager.clone());
        info!(cluster = %name, "cluster registered");
        Ok(manager)
    }

    /// Drop the handle for `name`; returns whether one existed
    pub async fn unregister(&self, name: &str) -> bool {
        let removed = self.managers.lock().await.remove(name).is_some();
        if removed {
            info!(cluster = %name, "cluster unregistered");
        }
        removed
    }

    /// Whether `name` has a handle
    pub async fn exists(&self, name: &str) -> bool {
        self.managers.lock().await.contains_key(name)
    }

    /// Handle for `name`, if registered
    pub async fn get(&self, name: &str) -> Option<Arc<dyn ManagedCluster>> {
        self.managers.lock().await.get(name).cloned()
    }
}

/// Totals over a set of Nodes
pub fn summarize_nodes(nodes: &[Node]) -> ClusterResource {
    let mut capacity = BTreeMap::new();
    let mut allocatable = BTreeMap::new();
    let mut ready_nodes = 0;

    for node in nodes {
        let Some(status) = &node.status else {
            continue;
        };
        if let Some(values) = &status.capacity {
            accumulate(&mut capacity, values.iter().map(|(k, q)| (k, q.0.as_str())));
        }
        if let Some(values) = &status.allocatable {
            accumulate(&mut allocatable, values.iter().map(|(k, q)| (k, q.0.as_str())));
        }
        let ready = status
            .conditions
            .as_ref()
            .is_some_and(|c| c.iter().any(|c| c.type_ == "Ready" && c.status == "True"));
        if ready {
            ready_nodes += 1;
        }
    }

    ClusterResource {
        capacity: render(capacity),
        allocatable: render(allocatable),
        node_count: nodes.len() as u32,
        ready_nodes,
    }
}

fn accumulate<'a>(
    totals: &mut BTreeMap<String, u128>,
    values: impl Iterator<Item = (&'a String, &'a str)>,
) {
    for (name, quantity) in values {
        let parsed = if name == "cpu" {
            parse_millis(quantity)
        } else {
            parse_quantity(quantity)
        };
        match parsed {
            Some(v) => *totals.entry(name.clone()).or_default() += v,
            None => debug!(resource = %name, %quantity, "unparsable quantity skipped"),
        }
    }
}

fn render(totals: BTreeMap<String, u128>) -> BTreeMap<String, String> {
    totals
        .into_iter()
        .map(|(name, total)| {
            let value = if name == "cpu" {
                if total % 1000 == 0 {
                    (total / 1000).to_string()
                } else {
                    format!("{total}m")
                }
            } else if total >= 1024 && total % 1024 == 0 && is_byte_resource(&name) {
                format!("{}Ki", total / 1024)
            } else {
                total.to_string()
            };
            (name, value)
        })
        .collect()
}

fn is_byte_resource(name: &str) -> bool {
    name == "memory" || name == "ephemeral-storage" || name.starts_with("hugepages-")
}

/// CPU quantity in millicores
fn parse_millis(quantity: &str) -> Option<u128> {
    if let Some(m) = quantity.strip_suffix('m') {
        return m.parse().ok();
    }
    let cores: f64 = quantity.parse().ok()?;
    (cores >= 0.0).then(|| (cores * 1000.0).round() as u128)
}

/// Plain or suffixed quantity in base units
fn parse_quantity(quantity: &str) -> Option<u128> {
    const SUFFIXES: &[(&str, u128)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("Pi", 1 << 50),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    for (suffix, multiplier) in SUFFIXES {
        if let Some(n) = quantity.strip_suffix(suffix) {
            return n.parse::<u128>().ok().map(|n| n * multiplier);
        }
    }
    quantity.parse().ok()
}
