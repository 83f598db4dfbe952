//! Cluster lifecycle management for keel
//!
//! This crate provides the Kubernetes controllers for the Cluster and Machine
//! CRDs, the provider contract they dispatch to, and the registry of live
//! handles to Running clusters.
//!
//! Related crates:
//! - `keel-common`: CRDs, errors, logging
//! - `keel-node`: remote execution and the node provisioning pipeline

pub mod applier;
pub mod controller;
pub mod provider;
pub mod registry;
pub mod store;

#[cfg(test)]
pub(crate) mod test_fixtures;

// Re-export controller types
pub use controller::{error_policy, reconcile, Context, ContextBuilder, ReconcileConfig};

pub use applier::Applied;
pub use provider::{
    BaremetalProvider, ClusterContext, ClusterProvisioner, MachineProvisioner, ProviderRegistry,
    BAREMETAL,
};
pub use registry::{ClusterManagerRegistry, KubeconfigConnector, ManagedCluster};
pub use store::{ClusterStore, KubeStore};

// Re-export common error types
pub use keel_common::{Error, Result};
