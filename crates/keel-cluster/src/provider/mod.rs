//! Provider contract and lookup
//!
//! A provider turns a Cluster or Machine into running Kubernetes nodes. The
//! reconcilers hand it a [`ClusterContext`] holding working copies of the
//! Cluster and its credential record; the provider mutates those copies
//! (conditions, phase, addresses, harvested secrets) and the reconciler
//! persists whatever changed once the call returns.
//!
//! Providers are keyed by `spec.clusterType`. Looking up an unregistered type
//! fails immediately with [`Error::UnknownProvider`].

pub mod baremetal;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;

#[cfg(test)]
use mockall::automock;

use keel_common::crd::{Cluster, ClusterCredential, ClusterStatus, Condition, Machine};
use keel_common::{Error, Result};

use crate::registry::ManagedCluster;

pub use baremetal::{BaremetalProvider, BAREMETAL};

/// Working state handed to a provider for one reconcile pass
#[derive(Clone)]
pub struct ClusterContext {
    /// Working copy of the Cluster
    pub cluster: Cluster,
    /// Working copy of the Cluster's credential record
    pub credential: ClusterCredential,
    /// Live handle, once the Cluster is registered
    pub manager: Option<Arc<dyn ManagedCluster>>,
}

impl ClusterContext {
    /// Context without a live handle
    pub fn new(cluster: Cluster, credential: ClusterCredential) -> Self {
        Self {
            cluster,
            credential,
            manager: None,
        }
    }

    /// Cluster name
    pub fn name(&self) -> String {
        self.cluster.name_any()
    }

    /// Cluster status, created empty if missing
    pub fn status_mut(&mut self) -> &mut ClusterStatus {
        self.cluster.status.get_or_insert_with(Default::default)
    }

    /// Last recorded Cluster condition
    pub fn last_condition(&self) -> Option<&Condition> {
        self.cluster
            .status
            .as_ref()
            .and_then(|s| s.conditions.last())
    }
}

/// Provisions and maintains the control plane of a Cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    /// Drive an Initializing Cluster toward Running
    async fn on_create(&self, ctx: &mut ClusterContext) -> Result<()>;

    /// Check and report on a Running Cluster
    async fn on_update(&self, ctx: &mut ClusterContext) -> Result<()>;
}

/// Provisions and maintains worker Machines
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineProvisioner: Send + Sync {
    /// Drive an Initializing Machine toward Running
    async fn on_create(&self, ctx: &mut ClusterContext, machine: &mut Machine) -> Result<()>;

    /// Check and report on a Running Machine
    async fn on_update(&self, ctx: &mut ClusterContext, machine: &mut Machine) -> Result<()>;
}

struct RegisteredProvider {
    cluster: Arc<dyn ClusterProvisioner>,
    machine: Arc<dyn MachineProvisioner>,
}

/// Providers keyed by cluster type
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, RegisteredProvider>,
}

impl ProviderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider implementing both halves of the contract
    pub fn register<P>(&mut self, cluster_type: impl Into<String>, provider: Arc<P>) -> Result<()>
    where
        P: ClusterProvisioner + MachineProvisioner + 'static,
    {
        self.register_parts(cluster_type, provider.clone(), provider)
    }

    /// Register the two halves separately
    pub fn register_parts(
        &mut self,
        cluster_type: impl Into<String>,
        cluster: Arc<dyn ClusterProvisioner>,
        machine: Arc<dyn MachineProvisioner>,
    ) -> Result<()> {
        let cluster_type = cluster_type.into();
        if self.providers.contains_key(&cluster_type) {
            return Err(Error::internal_with_context(
                "provider-registry",
                format!("provider {cluster_type} registered twice"),
            ));
        }
        self.providers
            .insert(cluster_type, RegisteredProvider { cluster, machine });
        Ok(())
    }

    /// Cluster half of the provider for `cluster_type`
    pub fn cluster_provisioner(&self, cluster_type: &str) -> Result<Arc<dyn ClusterProvisioner>> {
        self.providers
            .get(cluster_type)
            .map(|p| p.cluster.clone())
            .ok_or_else(|| Error::unknown_provider(cluster_type))
    }

    /// Machine half of the provider for `cluster_type`
    pub fn machine_provisioner(&self, cluster_type: &str) -> Result<Arc<dyn MachineProvisioner>> {
        self.providers
            .get(cluster_type)
            .map(|p| p.machine.clone())
            .ok_or_else(|| Error::unknown_provider(cluster_type))
    }

    /// Registered cluster types, sorted
    pub fn cluster_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.providers.keys().cloned().collect();
        types.sort();
        types
    }
}
