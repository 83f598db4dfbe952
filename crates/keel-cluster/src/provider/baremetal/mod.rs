//! Provider for machines reachable over SSH
//!
//! Every stage of bring-up is a named handler whose outcome is recorded as a
//! Condition on the owning object. A pass starts at the first handler whose
//! Condition is not True and runs the rest in order, so a failed pass resumes
//! where it stopped. The node side of each handler is itself idempotent
//! (sentinels, existing kubeconfigs), so re-running a handler is safe.
//!
//! Node work for all machines of a stage runs concurrently, bounded by a
//! semaphore shared across every Cluster and Machine.

mod cluster;
mod machine;

use std::net::Ipv4Addr;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::warn;

use keel_common::crd::{find_condition, ClusterMachine, ClusterSpec, Condition, MachineAccess};
use keel_common::{Error, Result};
use keel_node::{
    ExecutorFactory, NodeInfo, NodeJob, NodeRole, NodeTarget, Provisioner, RemoteExecutor,
};

use crate::store::ClusterStore;

pub use cluster::ClusterStep;
pub use machine::MachineStep;

/// Cluster type served by [`BaremetalProvider`]
pub const BAREMETAL: &str = "Baremetal";

/// Credential `extraData` key holding the join discovery hash
pub const CA_CERT_HASH_KEY: &str = "caCertHash";

/// Default bound on concurrent node operations
pub const DEFAULT_MAX_PARALLEL_NODES: usize = 10;

/// Reason recorded on a Condition whose handler failed
pub const FAILED_REASON: &str = "Failed";

/// Provisions Clusters and Machines over SSH with kubeadm
pub struct BaremetalProvider {
    executors: Arc<dyn ExecutorFactory>,
    provisioner: Arc<Provisioner>,
    store: Arc<dyn ClusterStore>,
    permits: Semaphore,
}

impl BaremetalProvider {
    /// Create a provider running at most `max_parallel_nodes` node operations at once
    pub fn new(
        executors: Arc<dyn ExecutorFactory>,
        provisioner: Arc<Provisioner>,
        store: Arc<dyn ClusterStore>,
        max_parallel_nodes: usize,
    ) -> Self {
        Self {
            executors,
            provisioner,
            store,
            permits: Semaphore::new(max_parallel_nodes.max(1)),
        }
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.permits
            .acquire()
            .await
            .map_err(|_| Error::internal("provisioning semaphore closed"))
    }

    async fn connect(&self, access: &MachineAccess) -> Result<Arc<dyn RemoteExecutor>> {
        self.executors.connect(&NodeTarget::from_access(access)?).await
    }

    /// Run one pipeline stage on one node
    async fn run_stage(
        &self,
        stage: Stage,
        cluster_name: &str,
        spec: &ClusterSpec,
        access: &MachineAccess,
        role: NodeRole,
        node: NodeInfo,
    ) -> Result<()> {
        let _permit = self.permit().await?;
        let exec = self.connect(access).await?;
        let job = NodeJob::new(exec.as_ref(), cluster_name, spec, role, node);
        match stage {
            Stage::Preflight => self.provisioner.system_info(exec.as_ref()).await.map(|_| ()),
            Stage::SystemPrep => self.provisioner.system_prep(&job).await,
            Stage::ContainerRuntime => self.provisioner.container_runtime(&job).await,
            Stage::KubernetesBinaries => self.provisioner.kubernetes_binaries(&job).await,
            Stage::Addons => self.provisioner.addons(&job).await,
        }
    }

    /// Run one pipeline stage on every control-plane machine
    ///
    /// Every node runs to completion; the first failure is returned.
    async fn run_stage_on_control_plane(
        &self,
        stage: Stage,
        cluster_name: &str,
        spec: &ClusterSpec,
    ) -> Result<()> {
        let results = join_all(spec.machines.iter().enumerate().map(|(i, machine)| {
            self.run_stage(
                stage,
                cluster_name,
                spec,
                &machine.access,
                control_plane_role(i),
                control_plane_node(machine),
            )
        }))
        .await;
        first_error(cluster_name, stage, results)
    }
}

/// Node-side pipeline stage a handler drives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Preflight,
    SystemPrep,
    ContainerRuntime,
    KubernetesBinaries,
    Addons,
}

fn first_error(cluster_name: &str, stage: Stage, results: Vec<Result<()>>) -> Result<()> {
    let mut errors = results.into_iter().filter_map(Result::err);
    let Some(first) = errors.next() else {
        return Ok(());
    };
    for other in errors {
        warn!(cluster = %cluster_name, ?stage, error = %other, "additional node failure");
    }
    Err(first)
}

/// Role of the `index`th control-plane machine
fn control_plane_role(index: usize) -> NodeRole {
    if index == 0 {
        NodeRole::ControlPlaneInit
    } else {
        NodeRole::ControlPlane
    }
}

fn control_plane_node(machine: &ClusterMachine) -> NodeInfo {
    NodeInfo {
        ip: machine.access.ip.clone(),
        hostname: None,
        labels: machine.labels.clone(),
        taints: machine.taints.clone(),
    }
}

/// Index of the first handler whose Condition is not True
fn first_incomplete(types: &[&str], conditions: &[Condition]) -> usize {
    types
        .iter()
        .position(|t| !find_condition(conditions, t).is_some_and(Condition::is_true))
        .unwrap_or(types.len())
}

/// Tenth address of the service CIDR, where cluster DNS is served
pub fn dns_service_ip(service_cidr: &str) -> Option<String> {
    let (base, prefix) = service_cidr.split_once('/')?;
    let base: Ipv4Addr = base.parse().ok()?;
    let prefix: u32 = prefix.parse().ok()?;
    if prefix > 28 {
        return None;
    }
    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    let network = u32::from(base) & mask;
    network
        .checked_add(10)
        .map(|ip| Ipv4Addr::from(ip).to_string())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_service_ip() {
        assert_eq!(dns_service_ip("10.96.0.0/16").as_deref(), Some("10.96.0.10"));
        assert_eq!(dns_service_ip("172.20.0.0/24").as_deref(), Some("172.20.0.10"));
        assert_eq!(dns_service_ip("10.96.0.0/30"), None);
        assert_eq!(dns_service_ip("fd00::/108"), None);
        // host bits in the base are ignored
        assert_eq!(dns_service_ip("10.96.0.5/16").as_deref(), Some("10.96.0.10"));
        assert_eq!(
            dns_service_ip("255.255.255.250/28").as_deref(),
            Some("255.255.255.250")
        );
        assert_eq!(dns_service_ip("0.0.0.0/0").as_deref(), Some("0.0.0.10"));
    }

    #[test]
    fn test_first_incomplete() {
        let types = ["A", "B", "C"];
        assert_eq!(first_incomplete(&types, &[]), 0);

        let conditions = vec![
            Condition::success("A"),
            Condition::failure("B", FAILED_REASON, "boom"),
        ];
        assert_eq!(first_incomplete(&types, &conditions), 1);

        let conditions = vec![
            Condition::success("C"),
            Condition::success("A"),
            Condition::success("B"),
        ];
        assert_eq!(first_incomplete(&types, &conditions), 3);
    }

    #[test]
    fn test_roles() {
        assert_eq!(control_plane_role(0), NodeRole::ControlPlaneInit);
        assert_eq!(control_plane_role(2), NodeRole::ControlPlane);
    }
}
