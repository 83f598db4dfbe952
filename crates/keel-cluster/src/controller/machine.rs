//! Machine reconciler
//!
//! A Machine is provisioned only once its Cluster is Running and the
//! Cluster's credential record exists; until then the reconciler requeues
//! without calling the provider. Create failures are reported on the
//! Machine. Update failures are reported on the owning Cluster.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument};

use keel_common::crd::{Cluster, ClusterPhase, Machine, MachinePhase, MachineStatus};
use keel_common::{Error, Result};

use super::cluster::{FAILED_INIT, FAILED_UPDATE};
use super::Context;
use crate::applier::{apply_cluster_status, apply_credential, apply_machine_status};
use crate::provider::ClusterContext;

/// Reconcile a Machine
#[instrument(skip(machine, ctx), fields(machine = %machine.name_any()))]
pub async fn reconcile(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action> {
    let name = machine.name_any();
    let Some(mut machine) = ctx.store.get_machine(&name).await? else {
        debug!("machine no longer exists");
        return Ok(Action::await_change());
    };

    if machine.spec.pause {
        debug!("machine paused");
        return Ok(Action::await_change());
    }

    let Some(phase) = machine.status.as_ref().and_then(|s| s.phase) else {
        info!("entering Initializing");
        machine_status(&mut machine).phase = Some(MachinePhase::Initializing);
        ctx.store.replace_machine_status(&machine).await?;
        return Ok(Action::await_change());
    };

    let cluster_name = machine.spec.cluster_name.clone();
    let Some(cluster) = ctx.store.get_cluster(&cluster_name).await? else {
        debug!(cluster = %cluster_name, "owning cluster not found");
        return Ok(Action::await_change());
    };
    if !is_running(&cluster) {
        info!(cluster = %cluster_name, "waiting for cluster to be Running");
        return Ok(Action::requeue(ctx.config.machine_wait));
    }
    let Some(credential) = ctx.store.get_credential(&cluster_name).await? else {
        info!(cluster = %cluster_name, "waiting for cluster credential");
        return Ok(Action::requeue(ctx.config.machine_wait));
    };

    let provisioner = ctx
        .providers
        .machine_provisioner(&cluster.spec.cluster_type)?;
    let mut pctx = ClusterContext::new(cluster, credential);
    pctx.manager = ctx.managers.get(&cluster_name).await;

    match phase {
        MachinePhase::Initializing => {
            let result = provisioner.on_create(&mut pctx, &mut machine).await;
            let outcome = match result {
                Err(e) => {
                    machine_status(&mut machine).set_failure(FAILED_INIT, e.to_string());
                    Err(e)
                }
                Ok(()) => match failed_condition(&cluster_name, &machine) {
                    Some((reason, e)) => {
                        machine_status(&mut machine).set_failure(reason, e.to_string());
                        Err(e)
                    }
                    None => {
                        machine_status(&mut machine).clear_failure();
                        Ok(())
                    }
                },
            };

            apply_machine_status(ctx.store.as_ref(), &machine).await?;
            apply_credential(ctx.store.as_ref(), &pctx.credential).await?;
            outcome?;

            if machine_status(&mut machine).phase == Some(MachinePhase::Running) {
                Ok(Action::requeue(ctx.config.resync))
            } else {
                Ok(Action::requeue(ctx.config.initializing_requeue))
            }
        }
        MachinePhase::Running => {
            let result = provisioner.on_update(&mut pctx, &mut machine).await;
            if let Err(e) = &result {
                pctx.status_mut().set_failure(FAILED_UPDATE, e.to_string());
                apply_cluster_status(ctx.store.as_ref(), &pctx.cluster).await?;
            } else {
                machine_status(&mut machine).clear_failure();
                pctx.status_mut().clear_failure();
                apply_cluster_status(ctx.store.as_ref(), &pctx.cluster).await?;
                apply_credential(ctx.store.as_ref(), &pctx.credential).await?;
            }
            apply_machine_status(ctx.store.as_ref(), &machine).await?;
            result?;
            Ok(Action::requeue(ctx.config.resync))
        }
        other => Err(Error::unexpected_phase("Machine", other)),
    }
}

/// Error policy for the Machine controller
pub fn error_policy(machine: Arc<Machine>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        machine = %machine.name_any(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(ctx.config.error_backoff)
    } else {
        Action::await_change()
    }
}

fn machine_status(machine: &mut Machine) -> &mut MachineStatus {
    machine.status.get_or_insert_with(Default::default)
}

fn is_running(cluster: &Cluster) -> bool {
    cluster.status.as_ref().and_then(|s| s.phase) == Some(ClusterPhase::Running)
}

/// Reason and error for a False last Condition left by a successful call
fn failed_condition(cluster_name: &str, machine: &Machine) -> Option<(String, Error)> {
    let c = machine
        .status
        .as_ref()
        .and_then(|s| s.conditions.last())
        .filter(|c| c.is_false())?;
    let error = Error::provider_for(
        cluster_name,
        machine.name_any(),
        format!("{}: {}: {}", c.type_, c.reason, c.message),
    );
    Some((c.reason.clone(), error))
}
