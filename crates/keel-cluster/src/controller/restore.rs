//! Phase restore
//!
//! The `keel.dev/restore-condition` annotation names a Condition type. The
//! Cluster's Conditions are truncated just before that type and the phase goes
//! back to Initializing, so the provider re-runs every handler from there on.
//! The command is consumed in two resourceVersion-checked writes: the status
//! first, then the annotation. A conflict on either leaves the annotation in
//! place and the command runs again on the next pass.

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{info, warn};

use keel_common::crd::{Cluster, ClusterPhase, Condition};
use keel_common::{Result, RESTORE_CONDITION_ANNOTATION};

use super::Context;

/// Conditions preceding the first one of `type_`, or None if it is absent
pub(crate) fn truncate_at(conditions: &[Condition], type_: &str) -> Option<Vec<Condition>> {
    let index = conditions.iter().position(|c| c.type_ == type_)?;
    Some(conditions[..index].to_vec())
}

/// Requested restore target, if the annotation is set and non-empty
pub(crate) fn requested_target(cluster: &Cluster) -> Option<String> {
    cluster
        .annotations()
        .get(RESTORE_CONDITION_ANNOTATION)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Consume a restore request on `cluster`
pub(crate) async fn restore_conditions(
    cluster: &Cluster,
    ctx: &Context,
    target: &str,
) -> Result<Action> {
    let name = cluster.name_any();
    let conditions = cluster
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();

    let resource_version = match truncate_at(conditions, target) {
        Some(kept) => {
            info!(
                target,
                kept = kept.len(),
                dropped = conditions.len() - kept.len(),
                "restoring cluster phase"
            );
            let mut update = cluster.clone();
            let status = update.status.get_or_insert_with(Default::default);
            status.conditions = kept;
            status.phase = Some(ClusterPhase::Initializing);
            status.clear_failure();
            let written = ctx.store.replace_cluster_status(&update).await?;
            written.resource_version()
        }
        None => {
            warn!(target, "restore target not found, clearing request");
            cluster.resource_version()
        }
    };

    ctx.store
        .remove_cluster_annotation(&name, RESTORE_CONDITION_ANNOTATION, resource_version)
        .await?;
    Ok(Action::requeue(ctx.config.initializing_requeue))
}
