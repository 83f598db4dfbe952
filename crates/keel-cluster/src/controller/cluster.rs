//! Cluster reconciler

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use keel_common::crd::{
    Cluster, ClusterCredential, ClusterCredentialSpec, ClusterPhase, ClusterStatus,
};
use keel_common::{Error, Result, CLUSTER_FINALIZER, CLUSTER_LABEL_KEY};

use super::cleanup::{handle_deletion, has_finalizer};
use super::restore::{requested_target, restore_conditions};
use super::Context;
use crate::applier::{apply_cluster_status, apply_credential};
use crate::provider::ClusterContext;

/// Status reason for a failed create pass
pub const FAILED_INIT: &str = "FailedInit";
/// Status reason for a failed update pass
pub const FAILED_UPDATE: &str = "FailedUpdate";
/// Status reason for a version outside the supported set
pub const UNSUPPORTED_VERSION: &str = "UnsupportedVersion";
/// Status reason for a cluster type with no registered provider
pub const UNKNOWN_PROVIDER: &str = "UnknownProvider";

/// Reconcile a Cluster
///
/// The object handed in by the controller may be stale, so the Cluster is
/// read again before anything else.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();
    let Some(cluster) = ctx.store.get_cluster(&name).await? else {
        debug!("cluster no longer exists");
        return Ok(Action::await_change());
    };
    info!("reconciling cluster");

    if cluster.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&cluster, &ctx).await;
    }

    if !has_finalizer(&cluster) {
        info!("adding finalizer");
        ctx.store
            .add_cluster_finalizer(&name, CLUSTER_FINALIZER)
            .await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    if cluster.spec.pause {
        debug!("cluster paused");
        return Ok(Action::await_change());
    }

    if !ctx.config.is_supported(&cluster.spec.version) {
        return mark_not_supported(&cluster, &ctx).await;
    }

    if needs_initializing(cluster.status.as_ref()) {
        info!("entering Initializing");
        let mut update = cluster.clone();
        let status = update.status.get_or_insert_with(Default::default);
        status.phase = Some(ClusterPhase::Initializing);
        status.clear_failure();
        ctx.store.replace_cluster_status(&update).await?;
        return Ok(Action::requeue(ctx.config.initializing_requeue));
    }

    if let Some(target) = requested_target(&cluster) {
        return restore_conditions(&cluster, &ctx, &target).await;
    }

    dispatch(cluster, &ctx).await
}

/// Error policy for the Cluster controller
///
/// Retryable errors come back after the configured backoff. Anything else
/// needs a spec change, so the Cluster waits for one.
pub fn error_policy(cluster: Arc<Cluster>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(ctx.config.error_backoff)
    } else {
        Action::await_change()
    }
}

/// Whether the Cluster must (re)enter Initializing before any provider work
fn needs_initializing(status: Option<&ClusterStatus>) -> bool {
    let Some(status) = status else {
        return true;
    };
    match status.phase {
        None | Some(ClusterPhase::NotSupport) => true,
        Some(ClusterPhase::Initializing) => false,
        Some(_) => status.conditions.is_empty(),
    }
}

async fn mark_not_supported(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    let err = Error::unsupported_version(&cluster.spec.version, &ctx.config.supported_versions);
    let status = cluster.status.clone().unwrap_or_default();
    if status.phase == Some(ClusterPhase::NotSupport) {
        return Ok(Action::await_change());
    }

    warn!(version = %cluster.spec.version, "kubernetes version not supported");
    let mut update = cluster.clone();
    let status = update.status.get_or_insert_with(Default::default);
    status.phase = Some(ClusterPhase::NotSupport);
    status.set_failure(UNSUPPORTED_VERSION, err.to_string());
    ctx.store.replace_cluster_status(&update).await?;
    Ok(Action::await_change())
}

/// Run the provider for the Cluster's phase and persist the outcome
async fn dispatch(cluster: Cluster, ctx: &Context) -> Result<Action> {
    let name = cluster.name_any();
    let phase = cluster
        .status
        .as_ref()
        .and_then(|s| s.phase)
        .unwrap_or(ClusterPhase::Initializing);

    let provisioner = match ctx.providers.cluster_provisioner(&cluster.spec.cluster_type) {
        Ok(p) => p,
        Err(e) => {
            warn!(cluster_type = %cluster.spec.cluster_type, "no provider for cluster type");
            let mut failed = cluster;
            failed
                .status
                .get_or_insert_with(Default::default)
                .set_failure(UNKNOWN_PROVIDER, e.to_string());
            apply_cluster_status(ctx.store.as_ref(), &failed).await?;
            return Err(e);
        }
    };

    let credential = ensure_credential(&cluster, ctx).await?;
    let mut pctx = ClusterContext::new(cluster, credential);
    pctx.manager = ctx.managers.get(&name).await;

    let (result, reason) = match phase {
        ClusterPhase::Initializing => (provisioner.on_create(&mut pctx).await, FAILED_INIT),
        ClusterPhase::Running => {
            register_manager(&mut pctx, ctx).await;
            (provisioner.on_update(&mut pctx).await, FAILED_UPDATE)
        }
        other => return Err(Error::unexpected_phase("Cluster", other)),
    };

    record_outcome(pctx.status_mut(), &result, reason);

    // Conditions appended before a failure must survive it.
    apply_credential(ctx.store.as_ref(), &pctx.credential).await?;
    apply_cluster_status(ctx.store.as_ref(), &pctx.cluster).await?;
    result?;

    let running = pctx.cluster.status.as_ref().and_then(|s| s.phase) == Some(ClusterPhase::Running);
    if running {
        Ok(Action::requeue(ctx.config.resync))
    } else {
        Ok(Action::requeue(ctx.config.initializing_requeue))
    }
}

/// Surface a provider outcome in the status reason and message
///
/// An error wins. Otherwise a False last Condition is reported, and a clean
/// pass clears any earlier failure.
pub(crate) fn record_outcome(status: &mut ClusterStatus, result: &Result<()>, reason: &str) {
    if let Err(e) = result {
        status.set_failure(reason, e.to_string());
        return;
    }
    let failed = status
        .conditions
        .last()
        .filter(|c| c.is_false())
        .map(|c| (c.reason.clone(), c.message.clone()));
    match failed {
        Some((reason, message)) => status.set_failure(reason, message),
        None => status.clear_failure(),
    }
}

/// Fetch the Cluster's credential record, creating an empty one if missing
async fn ensure_credential(cluster: &Cluster, ctx: &Context) -> Result<ClusterCredential> {
    let name = cluster.name_any();
    if let Some(existing) = ctx.store.get_credential(&name).await? {
        return Ok(existing);
    }

    info!("creating credential record");
    let mut credential = ClusterCredential::new(
        &name,
        ClusterCredentialSpec::for_cluster(&name, &cluster.spec.tenant_id),
    );
    credential.metadata.owner_references = cluster.controller_owner_ref(&()).map(|o| vec![o]);
    credential.metadata.labels = Some(BTreeMap::from([(CLUSTER_LABEL_KEY.to_string(), name)]));
    ctx.store.create_credential(&credential).await
}

/// Register a live handle once the external kubeconfig has been harvested
///
/// Failure is logged and retried on a later pass.
async fn register_manager(pctx: &mut ClusterContext, ctx: &Context) {
    if pctx.manager.is_some() {
        return;
    }
    let Some(kubeconfig) = pctx.credential.spec.external_kubeconfig() else {
        debug!("external kubeconfig not yet harvested");
        return;
    };
    match ctx.managers.register(&pctx.name(), kubeconfig).await {
        Ok(handle) => {
            info!("registered cluster manager");
            pctx.manager = Some(handle);
        }
        Err(e) => warn!(error = %e, "failed to register cluster manager"),
    }
}

#[cfg(test)]
mod tests {
    use keel_common::crd::{Condition, ConditionStatus, EXTERNAL_KUBECONFIG_KEY};
    use keel_common::RESTORE_CONDITION_ANNOTATION;

    use super::super::test_support::*;
    use super::*;
    use crate::provider::{MockClusterProvisioner, MockMachineProvisioner, ProviderRegistry};
    use crate::store::MockClusterStore;
    use crate::test_fixtures::{sample_cluster, sample_credential, MockConnector};

    fn finalized(mut cluster: Cluster) -> Cluster {
        cluster.metadata.finalizers = Some(vec![CLUSTER_FINALIZER.to_string()]);
        cluster.metadata.uid = Some("uid-c1".to_string());
        cluster
    }

    fn with_phase(mut cluster: Cluster, phase: ClusterPhase, conditions: &[&str]) -> Cluster {
        cluster.status = Some(ClusterStatus {
            phase: Some(phase),
            conditions: conditions.iter().map(|t| Condition::success(*t)).collect(),
            ..Default::default()
        });
        cluster
    }

    fn registry_with(provisioner: MockClusterProvisioner) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        registry
            .register_parts(
                "Baremetal",
                Arc::new(provisioner),
                Arc::new(MockMachineProvisioner::new()),
            )
            .unwrap();
        registry
    }

    fn context(store: MockClusterStore, providers: ProviderRegistry) -> Arc<Context> {
        Arc::new(Context::for_testing(
            Arc::new(store),
            providers,
            Arc::new(MockConnector::new()),
        ))
    }

    mod phase_gates {
        use super::*;

        /// Story: an unsupported version parks the Cluster in NotSupport and
        /// never reaches a provider
        #[tokio::test]
        async fn story_unsupported_version_sets_not_support() {
            let capture = StatusCapture::default();
            let mut cluster = finalized(sample_cluster("c1"));
            cluster.spec.version = "1.20.4".to_string();
            let store = store_with_cluster(cluster.clone(), None, &capture);
            let mut provisioner = MockClusterProvisioner::new();
            provisioner.expect_on_create().never();
            provisioner.expect_on_update().never();
            let ctx = context(store, registry_with(provisioner));

            let action = reconcile(Arc::new(cluster), ctx.clone()).await.unwrap();
            assert_eq!(action, Action::await_change());

            let status = capture.last_cluster().unwrap();
            assert_eq!(status.phase, Some(ClusterPhase::NotSupport));
            assert_eq!(status.reason.as_deref(), Some(UNSUPPORTED_VERSION));

            // already parked: nothing more is written
            reconcile(Arc::new(sample_cluster("c1")), ctx).await.unwrap();
            assert_eq!(capture.cluster_updates(), 1);
        }

        /// Story: the first pass over an empty status only records
        /// Initializing and asks to be called again
        #[tokio::test]
        async fn story_empty_status_enters_initializing_and_requeues() {
            let capture = StatusCapture::default();
            let cluster = finalized(sample_cluster("c1"));
            let store = store_with_cluster(cluster.clone(), None, &capture);
            let mut provisioner = MockClusterProvisioner::new();
            provisioner.expect_on_create().never();
            let ctx = context(store, registry_with(provisioner));

            let action = reconcile(Arc::new(cluster), ctx.clone()).await.unwrap();
            assert_eq!(action, Action::requeue(ctx.config.initializing_requeue));
            assert_eq!(capture.last_cluster_phase(), Some(ClusterPhase::Initializing));
            assert_eq!(capture.cluster_updates(), 1);
        }

        #[tokio::test]
        async fn test_missing_finalizer_is_added_first() {
            let cluster = sample_cluster("c1");
            let mut store = MockClusterStore::new();
            let c = cluster.clone();
            store
                .expect_get_cluster()
                .returning(move |_| Ok(Some(c.clone())));
            store
                .expect_add_cluster_finalizer()
                .withf(|name, f| name == "c1" && f == CLUSTER_FINALIZER)
                .times(1)
                .returning(|_, _| Ok(()));
            let ctx = context(store, ProviderRegistry::new());

            let action = reconcile(Arc::new(cluster), ctx).await.unwrap();
            assert_eq!(action, Action::requeue(Duration::from_secs(1)));
        }

        #[tokio::test]
        async fn test_paused_cluster_is_left_alone() {
            let capture = StatusCapture::default();
            let mut cluster = finalized(sample_cluster("c1"));
            cluster.spec.pause = true;
            let store = store_with_cluster(cluster.clone(), None, &capture);
            let ctx = context(store, ProviderRegistry::new());

            let action = reconcile(Arc::new(cluster), ctx).await.unwrap();
            assert_eq!(action, Action::await_change());
            assert_eq!(capture.cluster_updates(), 0);
        }

        #[tokio::test]
        async fn test_deleted_cluster_is_a_no_op() {
            let mut store = MockClusterStore::new();
            store.expect_get_cluster().returning(|_| Ok(None));
            let ctx = context(store, ProviderRegistry::new());

            let action = reconcile(Arc::new(sample_cluster("c1")), ctx)
                .await
                .unwrap();
            assert_eq!(action, Action::await_change());
        }

        #[test]
        fn test_needs_initializing() {
            assert!(needs_initializing(None));
            let status = |phase, conditions: Vec<Condition>| ClusterStatus {
                phase,
                conditions,
                ..Default::default()
            };
            assert!(needs_initializing(Some(&status(None, vec![]))));
            assert!(needs_initializing(Some(&status(
                Some(ClusterPhase::NotSupport),
                vec![]
            ))));
            assert!(!needs_initializing(Some(&status(
                Some(ClusterPhase::Initializing),
                vec![]
            ))));
            assert!(needs_initializing(Some(&status(
                Some(ClusterPhase::Running),
                vec![]
            ))));
            assert!(!needs_initializing(Some(&status(
                Some(ClusterPhase::Running),
                vec![Condition::success("EnsureHealthCheck")]
            ))));
        }
    }

    mod dispatch {
        use super::*;

        /// Story: an Initializing Cluster gets its credential record created
        /// and runs the provider's create pass
        #[tokio::test]
        async fn story_initializing_creates_credential_and_runs_on_create() {
            let capture = StatusCapture::default();
            let cluster = with_phase(
                finalized(sample_cluster("c1")),
                ClusterPhase::Initializing,
                &[],
            );
            let store = store_with_cluster(cluster.clone(), None, &capture);
            let mut provisioner = MockClusterProvisioner::new();
            provisioner.expect_on_create().times(1).returning(|ctx| {
                assert_eq!(ctx.credential.spec.cluster_name, "c1");
                let owners = ctx.credential.metadata.owner_references.clone().unwrap();
                assert_eq!(owners[0].uid, "uid-c1");
                ctx.status_mut()
                    .conditions
                    .push(Condition::success("EnsurePreflight"));
                Ok(())
            });
            let ctx = context(store, registry_with(provisioner));

            let action = reconcile(Arc::new(cluster), ctx.clone()).await.unwrap();
            assert_eq!(action, Action::requeue(ctx.config.initializing_requeue));

            let status = capture.last_cluster().unwrap();
            assert_eq!(status.conditions.len(), 1);
            assert_eq!(status.reason, None);
        }

        /// Story: a failing handler leaves its False Condition and a
        /// FailedInit reason behind, and the error still reaches the queue
        #[tokio::test]
        async fn story_failed_create_pass_is_persisted_then_returned() {
            let capture = StatusCapture::default();
            let cluster = with_phase(
                finalized(sample_cluster("c1")),
                ClusterPhase::Initializing,
                &[],
            );
            let store = store_with_cluster(cluster.clone(), Some(sample_credential("c1")), &capture);
            let mut provisioner = MockClusterProvisioner::new();
            provisioner.expect_on_create().returning(|ctx| {
                ctx.status_mut().conditions.push(Condition::failure(
                    "EnsureSystemPrep",
                    "Failed",
                    "swapoff failed",
                ));
                Err(Error::provisioning("10.0.0.1", "SystemPrep", "swapoff failed"))
            });
            let ctx = context(store, registry_with(provisioner));

            let err = reconcile(Arc::new(cluster), ctx).await.unwrap_err();
            assert!(err.is_retryable());

            let status = capture.last_cluster().unwrap();
            assert_eq!(status.reason.as_deref(), Some(FAILED_INIT));
            assert!(status.message.unwrap().contains("swapoff failed"));
            assert_eq!(status.conditions[0].status, ConditionStatus::False);
        }

        /// Story: a Running Cluster registers its manager once the external
        /// kubeconfig exists and then runs the update pass
        #[tokio::test]
        async fn story_running_cluster_registers_manager_then_updates() {
            let capture = StatusCapture::default();
            let cluster = with_phase(
                finalized(sample_cluster("c1")),
                ClusterPhase::Running,
                &["EnsureClusterComplete"],
            );
            let mut credential = sample_credential("c1");
            credential
                .spec
                .kube_data
                .insert(EXTERNAL_KUBECONFIG_KEY.to_string(), "not: [valid".to_string());
            let store = store_with_cluster(cluster.clone(), Some(credential), &capture);
            let mut provisioner = MockClusterProvisioner::new();
            provisioner.expect_on_update().times(1).returning(|ctx| {
                // registration failed on the bad kubeconfig: the pass goes on
                assert!(ctx.manager.is_none());
                Ok(())
            });
            let ctx = context(store, registry_with(provisioner));

            let action = reconcile(Arc::new(cluster), ctx.clone()).await.unwrap();
            assert_eq!(action, Action::requeue(ctx.config.resync));
            assert!(!ctx.managers.exists("c1").await);
        }

        #[tokio::test]
        async fn test_unknown_provider_fails_fast() {
            let capture = StatusCapture::default();
            let mut cluster = with_phase(
                finalized(sample_cluster("c1")),
                ClusterPhase::Initializing,
                &[],
            );
            cluster.spec.cluster_type = "Mainframe".to_string();
            let store = store_with_cluster(cluster.clone(), None, &capture);
            let ctx = context(store, ProviderRegistry::new());

            let err = reconcile(Arc::new(cluster), ctx.clone()).await.unwrap_err();
            assert!(matches!(err, Error::UnknownProvider { .. }));
            assert_eq!(
                capture.last_cluster().unwrap().reason.as_deref(),
                Some(UNKNOWN_PROVIDER)
            );
            assert_eq!(
                error_policy(Arc::new(sample_cluster("c1")), &err, ctx),
                Action::await_change()
            );
        }

        #[tokio::test]
        async fn test_unexpected_phase_is_an_error() {
            let capture = StatusCapture::default();
            let cluster = with_phase(
                finalized(sample_cluster("c1")),
                ClusterPhase::Failed,
                &["EnsurePreflight"],
            );
            let store = store_with_cluster(cluster.clone(), Some(sample_credential("c1")), &capture);
            let ctx = context(store, registry_with(MockClusterProvisioner::new()));

            let err = reconcile(Arc::new(cluster), ctx).await.unwrap_err();
            assert!(matches!(err, Error::UnexpectedPhase { .. }));
        }

        /// Story: the restore annotation is consumed before any provider work
        #[tokio::test]
        async fn story_restore_request_preempts_dispatch() {
            let capture = StatusCapture::default();
            let mut cluster = with_phase(
                finalized(sample_cluster("c1")),
                ClusterPhase::Running,
                &["EnsurePreflight", "SyncVersion"],
            );
            cluster.metadata.annotations = Some(BTreeMap::from([(
                RESTORE_CONDITION_ANNOTATION.to_string(),
                "SyncVersion".to_string(),
            )]));
            let mut store = store_with_cluster(cluster.clone(), None, &capture);
            store
                .expect_remove_cluster_annotation()
                .times(1)
                .returning(|_, _, _| Ok(()));
            let mut provisioner = MockClusterProvisioner::new();
            provisioner.expect_on_update().never();
            let ctx = context(store, registry_with(provisioner));

            reconcile(Arc::new(cluster), ctx).await.unwrap();
            let status = capture.last_cluster().unwrap();
            assert_eq!(status.phase, Some(ClusterPhase::Initializing));
            assert_eq!(status.conditions.len(), 1);
        }
    }

    mod outcome {
        use super::*;

        #[test]
        fn test_error_wins() {
            let mut status = ClusterStatus::default();
            status.conditions.push(Condition::success("A"));
            record_outcome(&mut status, &Err(Error::internal("boom")), FAILED_UPDATE);
            assert_eq!(status.reason.as_deref(), Some(FAILED_UPDATE));
        }

        #[test]
        fn test_false_last_condition_is_surfaced() {
            let mut status = ClusterStatus::default();
            status
                .conditions
                .push(Condition::failure("EnsureAddons", "Failed", "no vip"));
            record_outcome(&mut status, &Ok(()), FAILED_INIT);
            assert_eq!(status.reason.as_deref(), Some("Failed"));
            assert_eq!(status.message.as_deref(), Some("no vip"));
        }

        #[test]
        fn test_clean_pass_clears_failure() {
            let mut status = ClusterStatus::default();
            status.set_failure(FAILED_INIT, "old");
            status.conditions.push(Condition::success("EnsureAddons"));
            record_outcome(&mut status, &Ok(()), FAILED_INIT);
            assert_eq!(status.reason, None);
            assert_eq!(status.message, None);
        }
    }
}
