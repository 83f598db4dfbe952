//! Controller runner - builds the shared context and the controller futures
//!
//! Construction is kept separate from running so `main` only has to join
//! the returned futures.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use tracing::{debug, error, info};

use keel_cluster::controller::{cluster, machine, Context};
use keel_cluster::{BaremetalProvider, ClusterStore, KubeStore, ProviderRegistry, BAREMETAL};
use keel_common::crd::{Cluster, ClusterCredential, Machine};
use keel_common::FIELD_MANAGER;
use keel_node::{ExecutorFactory, Provisioner, SshExecutorFactory};

use crate::config::OperatorConfig;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// All CRD manifests as one multi-document YAML stream
pub fn crd_manifests() -> anyhow::Result<String> {
    let docs = [Cluster::crd(), Machine::crd(), ClusterCredential::crd()]
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
    Ok(docs.join("---\n"))
}

/// Install or update the keel CRDs with server-side apply
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for (name, crd) in [
        (Cluster::crd_name(), Cluster::crd()),
        (Machine::crd_name(), Machine::crd()),
        (ClusterCredential::crd_name(), ClusterCredential::crd()),
    ] {
        info!(crd = name, "installing CRD");
        crds.patch(name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install CRD {name}: {e}"))?;
    }
    Ok(())
}

/// Wire the store, SSH executors and the Baremetal provider into a Context
pub fn build_context(client: Client, config: &OperatorConfig) -> anyhow::Result<Arc<Context>> {
    let store: Arc<dyn ClusterStore> =
        Arc::new(KubeStore::new(client.clone()).with_namespace(&config.system_namespace));
    let executors: Arc<dyn ExecutorFactory> =
        Arc::new(SshExecutorFactory::new(config.ssh_options()));
    let provisioner = Arc::new(Provisioner::new(config.pipeline_config())?);

    let mut providers = ProviderRegistry::new();
    providers.register(
        BAREMETAL,
        Arc::new(BaremetalProvider::new(
            executors.clone(),
            provisioner,
            store.clone(),
            config.provisioning_concurrency,
        )),
    )?;
    info!(types = ?providers.cluster_types(), "providers registered");

    Ok(Arc::new(
        Context::builder(client)
            .store(store)
            .providers(Arc::new(providers))
            .executors(executors)
            .config(config.reconcile_config())
            .build(),
    ))
}

/// Build the Cluster and Machine controller futures
///
/// Machines are also re-triggered whenever their owning Cluster changes, so
/// a Machine waiting on its Cluster starts as soon as the Cluster is Running.
pub fn build_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    let clusters: Api<Cluster> = Api::all(client.clone());
    let machines: Api<Machine> = Api::all(client);

    info!("- Cluster controller");
    let cluster_ctrl = Controller::new(
        clusters.clone(),
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .shutdown_on_signal()
    .run(cluster::reconcile, cluster::error_policy, ctx.clone())
    .for_each(log_reconcile_result("Cluster"));

    info!("- Machine controller");
    let machine_ctrl = Controller::new(
        machines,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    );
    let machine_store = machine_ctrl.store();
    let machine_ctrl = machine_ctrl
        .watches(
            clusters,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
            move |cluster| machines_of(&machine_store, &cluster),
        )
        .shutdown_on_signal()
        .run(machine::reconcile, machine::error_policy, ctx)
        .for_each(log_reconcile_result("Machine"));

    vec![Box::pin(cluster_ctrl), Box::pin(machine_ctrl)]
}

/// Machines in `store` that belong to `cluster`
fn machines_of(store: &Store<Machine>, cluster: &Cluster) -> Vec<ObjectRef<Machine>> {
    let name = cluster.name_any();
    let affected: Vec<ObjectRef<Machine>> = store
        .state()
        .iter()
        .filter(|m| m.spec.cluster_name == name)
        .map(|m| ObjectRef::from_obj(m.as_ref()))
        .collect();
    if !affected.is_empty() {
        debug!(
            cluster = %name,
            affected_count = affected.len(),
            "triggering reconciliation of cluster machines"
        );
    }
    affected
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use kube::runtime::reflector::store::Writer;
    use kube::runtime::watcher::Event;

    use keel_common::crd::{ClusterSpec, MachineSpec};

    use super::*;

    fn machine(name: &str, cluster: &str) -> Machine {
        Machine::new(
            name,
            MachineSpec {
                cluster_name: cluster.to_string(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_cluster_change_maps_to_its_machines() {
        let mut writer: Writer<Machine> = Writer::default();
        for m in [machine("m1", "c1"), machine("m2", "c2"), machine("m3", "c1")] {
            writer.apply_watcher_event(&Event::Apply(m));
        }
        let store = writer.as_reader();

        let c1 = Cluster::new("c1", ClusterSpec::default());
        let mut names: Vec<String> = machines_of(&store, &c1)
            .into_iter()
            .map(|r| r.name)
            .collect();
        names.sort();
        assert_eq!(names, ["m1", "m3"]);

        let c9 = Cluster::new("c9", ClusterSpec::default());
        assert!(machines_of(&store, &c9).is_empty());
    }

    #[test]
    fn test_crd_manifests_cover_every_kind() {
        let yaml = crd_manifests().unwrap();
        assert_eq!(yaml.matches("kind: CustomResourceDefinition").count(), 3);
        assert!(yaml.contains("clusters.keel.dev"));
        assert!(yaml.contains("machines.keel.dev"));
        assert!(yaml.contains("clustercredentials.keel.dev"));
    }
}
