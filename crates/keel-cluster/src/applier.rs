//! Persist in-memory status and credential changes
//!
//! After every reconcile pass the working copies are diffed against the
//! stored objects and written back only when they differ. The stored
//! `resourceVersion` is carried on the write, so concurrent modification
//! surfaces as a conflict. An object that vanished in the meantime is a soft
//! stop, not an error.

use kube::ResourceExt;
use tracing::debug;

use keel_common::crd::{Cluster, ClusterCredential, ClusterStatus, Machine, MachineStatus};
use keel_common::Result;

use crate::store::ClusterStore;

/// Outcome of one apply
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// Stored object differed and was written
    Updated,
    /// Stored object already matched
    Unchanged,
    /// Stored object no longer exists
    Gone,
}

/// Write a Cluster's status if it differs from the stored one
pub async fn apply_cluster_status(store: &dyn ClusterStore, cluster: &Cluster) -> Result<Applied> {
    let name = cluster.name_any();
    let Some(stored) = store.get_cluster(&name).await? else {
        debug!(cluster = %name, "cluster gone, dropping status update");
        return Ok(Applied::Gone);
    };
    if !cluster_status_differs(stored.status.as_ref(), cluster.status.as_ref()) {
        return Ok(Applied::Unchanged);
    }

    let mut update = stored;
    update.status = cluster.status.clone();
    store.replace_cluster_status(&update).await?;
    debug!(cluster = %name, "cluster status written");
    Ok(Applied::Updated)
}

/// Write a Machine's status if it differs from the stored one
pub async fn apply_machine_status(store: &dyn ClusterStore, machine: &Machine) -> Result<Applied> {
    let name = machine.name_any();
    let Some(stored) = store.get_machine(&name).await? else {
        debug!(machine = %name, "machine gone, dropping status update");
        return Ok(Applied::Gone);
    };
    if !machine_status_differs(stored.status.as_ref(), machine.status.as_ref()) {
        return Ok(Applied::Unchanged);
    }

    let mut update = stored;
    update.status = machine.status.clone();
    store.replace_machine_status(&update).await?;
    debug!(machine = %name, "machine status written");
    Ok(Applied::Updated)
}

/// Write a credential's spec if it differs from the stored one
pub async fn apply_credential(
    store: &dyn ClusterStore,
    credential: &ClusterCredential,
) -> Result<Applied> {
    let name = credential.name_any();
    let Some(stored) = store.get_credential(&name).await? else {
        debug!(credential = %name, "credential gone, dropping update");
        return Ok(Applied::Gone);
    };
    // spec maps are BTreeMaps, so equality is order-insensitive already
    if stored.spec == credential.spec {
        return Ok(Applied::Unchanged);
    }

    let mut update = stored;
    update.spec = credential.spec.clone();
    store.replace_credential(&update).await?;
    debug!(credential = %name, "credential written");
    Ok(Applied::Updated)
}

fn cluster_status_differs(stored: Option<&ClusterStatus>, desired: Option<&ClusterStatus>) -> bool {
    normalized_cluster(stored) != normalized_cluster(desired)
}

fn machine_status_differs(stored: Option<&MachineStatus>, desired: Option<&MachineStatus>) -> bool {
    normalized_machine(stored) != normalized_machine(desired)
}

// Probe times move on every pass and address order carries no meaning.
fn normalized_cluster(status: Option<&ClusterStatus>) -> ClusterStatus {
    let mut status = status.cloned().unwrap_or_default();
    for condition in &mut status.conditions {
        condition.last_probe_time = None;
    }
    status.addresses.sort();
    status
}

fn normalized_machine(status: Option<&MachineStatus>) -> MachineStatus {
    let mut status = status.cloned().unwrap_or_default();
    for condition in &mut status.conditions {
        condition.last_probe_time = None;
    }
    status.addresses.sort();
    status
}
