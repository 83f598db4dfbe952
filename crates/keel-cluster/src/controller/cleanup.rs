//! Cluster deletion
//!
//! Runs while the Cluster carries the cleanup finalizer. Every step is safe to
//! repeat, so a pass that fails part way simply runs again from the top. Node
//! resets run one control-plane machine at a time and the first failure ends
//! the pass with the finalizer still in place.

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use keel_common::crd::{Cluster, ClusterPhase, MachineAccess};
use keel_common::{Error, Result, CLUSTER_FINALIZER};
use keel_node::{reset_node, NodeTarget};

use super::Context;

/// Whether the Cluster carries the cleanup finalizer
pub(crate) fn has_finalizer(cluster: &Cluster) -> bool {
    cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER)
}

/// Tear down everything a Cluster owns, then release its finalizer
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub(crate) async fn handle_deletion(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    let name = cluster.name_any();

    if !has_finalizer(cluster) {
        debug!("no finalizer, allowing deletion");
        return Ok(Action::await_change());
    }

    mark_terminating(cluster, ctx).await?;

    let machines = ctx.store.list_machines(&name).await?;
    for machine in &machines {
        info!(machine = %machine.name_any(), "deleting machine");
        ctx.store.delete_machine(&machine.name_any()).await?;
    }

    if ctx.managers.unregister(&name).await {
        info!("released cluster manager");
    }

    ctx.store.delete_credential(&name).await?;
    ctx.store.delete_cluster_config_maps(&name).await?;

    for machine in &cluster.spec.machines {
        reset_control_plane_node(ctx, &name, &machine.access).await?;
    }

    info!("cleanup complete, removing finalizer");
    ctx.store
        .remove_cluster_finalizer(&name, CLUSTER_FINALIZER)
        .await?;
    Ok(Action::await_change())
}

async fn mark_terminating(cluster: &Cluster, ctx: &Context) -> Result<()> {
    let phase = cluster.status.as_ref().and_then(|s| s.phase);
    if phase == Some(ClusterPhase::Terminating) {
        return Ok(());
    }
    let mut update = cluster.clone();
    update.status.get_or_insert_with(Default::default).phase = Some(ClusterPhase::Terminating);
    ctx.store.replace_cluster_status(&update).await?;
    Ok(())
}

async fn reset_control_plane_node(
    ctx: &Context,
    cluster_name: &str,
    access: &MachineAccess,
) -> Result<()> {
    info!(host = %access.ip, "resetting control-plane node");
    let target = NodeTarget::from_access(access)?;
    let exec = ctx.executors.connect(&target).await?;
    reset_node(exec.as_ref()).await.map_err(|e| {
        warn!(host = %access.ip, error = %e, "node reset failed");
        Error::provider_for(
            cluster_name,
            "cleanup",
            format!("reset of {} failed: {e}", access.ip),
        )
    })
}
