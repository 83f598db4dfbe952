//! Typed access to the management cluster's API server
//!
//! Everything the reconcilers read or write goes through [`ClusterStore`] so
//! tests can substitute a mock and production uses [`KubeStore`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use keel_common::crd::{Cluster, ClusterCredential, Machine};
use keel_common::{Error, CLUSTER_LABEL_KEY, FIELD_MANAGER, KEEL_SYSTEM_NAMESPACE};

/// Reads and writes of keel resources
///
/// Writes that take a whole object carry its `resourceVersion`, so a write
/// based on a stale read fails with a conflict instead of clobbering.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Get a Cluster by name
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>, Error>;

    /// Replace a Cluster's status subresource
    async fn replace_cluster_status(&self, cluster: &Cluster) -> Result<Cluster, Error>;

    /// Add a finalizer to a Cluster, guarded by the resourceVersion it read
    async fn add_cluster_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error>;

    /// Remove a finalizer from a Cluster, guarded by the resourceVersion it read
    async fn remove_cluster_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error>;

    /// Drop one annotation from a Cluster, guarded by `resource_version`
    async fn remove_cluster_annotation(
        &self,
        name: &str,
        key: &str,
        resource_version: Option<String>,
    ) -> Result<(), Error>;

    /// Get a Machine by name
    async fn get_machine(&self, name: &str) -> Result<Option<Machine>, Error>;

    /// List the Machines belonging to a Cluster
    async fn list_machines(&self, cluster_name: &str) -> Result<Vec<Machine>, Error>;

    /// Replace a Machine's status subresource
    async fn replace_machine_status(&self, machine: &Machine) -> Result<Machine, Error>;

    /// Delete a Machine; absent Machines are not an error
    async fn delete_machine(&self, name: &str) -> Result<(), Error>;

    /// Get the credential record of a Cluster
    async fn get_credential(&self, name: &str) -> Result<Option<ClusterCredential>, Error>;

    /// Create a credential record
    async fn create_credential(
        &self,
        credential: &ClusterCredential,
    ) -> Result<ClusterCredential, Error>;

    /// Replace a credential record
    async fn replace_credential(
        &self,
        credential: &ClusterCredential,
    ) -> Result<ClusterCredential, Error>;

    /// Delete a credential record; absent records are not an error
    async fn delete_credential(&self, name: &str) -> Result<(), Error>;

    /// Server-side apply a ConfigMap derived from a Cluster into keel-system
    async fn apply_cluster_config_map(
        &self,
        cluster_name: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// Delete every ConfigMap derived from a Cluster
    async fn delete_cluster_config_maps(&self, cluster_name: &str) -> Result<(), Error>;
}

/// [`ClusterStore`] backed by a kube client
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    namespace: String,
}

impl KubeStore {
    /// Create a store using `client`, keeping derived objects in keel-system
    pub fn new(client: Client) -> Self {
        Self {
            client,
            namespace: KEEL_SYSTEM_NAMESPACE.to_string(),
        }
    }

    /// Keep derived objects in `namespace` instead
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

/// Map a 404 on delete to success
fn ignore_not_found(result: Result<(), kube::Error>) -> Result<(), Error> {
    match result {
        Ok(()) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Merge patch replacing the finalizer list of `cluster`
///
/// Carries the resourceVersion of the read, so a finalizer added by someone
/// else in between turns the write into a 409 instead of being dropped.
fn finalizers_patch(cluster: &Cluster, finalizers: &[String]) -> serde_json::Value {
    serde_json::json!({
        "metadata": {
            "resourceVersion": cluster.resource_version(),
            "finalizers": finalizers
        }
    })
}

/// The label selector matching objects derived from `cluster_name`
pub fn cluster_selector(cluster_name: &str) -> String {
    format!("{CLUSTER_LABEL_KEY}={cluster_name}")
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>, Error> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn replace_cluster_status(&self, cluster: &Cluster) -> Result<Cluster, Error> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        let body = serde_json::to_vec(cluster)?;
        Ok(api
            .replace_status(&cluster.name_any(), &Self::post_params(), body)
            .await?)
    }

    async fn add_cluster_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        let cluster = api.get(name).await?;
        let mut finalizers = cluster.finalizers().to_vec();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());

        let patch = finalizers_patch(&cluster, &finalizers);
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_cluster_finalizer(&self, name: &str, finalizer: &str) -> Result<(), Error> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        let Some(cluster) = api.get_opt(name).await? else {
            return Ok(());
        };
        let finalizers: Vec<String> = cluster
            .finalizers()
            .iter()
            .filter(|f| *f != finalizer)
            .cloned()
            .collect();
        if finalizers.len() == cluster.finalizers().len() {
            return Ok(());
        }

        let patch = finalizers_patch(&cluster, &finalizers);
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn remove_cluster_annotation(
        &self,
        name: &str,
        key: &str,
        resource_version: Option<String>,
    ) -> Result<(), Error> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        // a resourceVersion in a merge patch makes the API server reject stale writes
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": resource_version,
                "annotations": { key: null }
            }
        });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_machine(&self, name: &str) -> Result<Option<Machine>, Error> {
        let api: Api<Machine> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn list_machines(&self, cluster_name: &str) -> Result<Vec<Machine>, Error> {
        let api: Api<Machine> = Api::all(self.client.clone());
        let machines = api.list(&ListParams::default()).await?;
        Ok(machines
            .items
            .into_iter()
            .filter(|m| m.spec.cluster_name == cluster_name)
            .collect())
    }

    async fn replace_machine_status(&self, machine: &Machine) -> Result<Machine, Error> {
        let api: Api<Machine> = Api::all(self.client.clone());
        let body = serde_json::to_vec(machine)?;
        Ok(api
            .replace_status(&machine.name_any(), &Self::post_params(), body)
            .await?)
    }

    async fn delete_machine(&self, name: &str) -> Result<(), Error> {
        let api: Api<Machine> = Api::all(self.client.clone());
        ignore_not_found(api.delete(name, &DeleteParams::default()).await.map(|_| ()))
    }

    async fn get_credential(&self, name: &str) -> Result<Option<ClusterCredential>, Error> {
        let api: Api<ClusterCredential> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_credential(
        &self,
        credential: &ClusterCredential,
    ) -> Result<ClusterCredential, Error> {
        let api: Api<ClusterCredential> = Api::all(self.client.clone());
        Ok(api.create(&Self::post_params(), credential).await?)
    }

    async fn replace_credential(
        &self,
        credential: &ClusterCredential,
    ) -> Result<ClusterCredential, Error> {
        let api: Api<ClusterCredential> = Api::all(self.client.clone());
        Ok(api
            .replace(&credential.name_any(), &Self::post_params(), credential)
            .await?)
    }

    async fn delete_credential(&self, name: &str) -> Result<(), Error> {
        let api: Api<ClusterCredential> = Api::all(self.client.clone());
        ignore_not_found(api.delete(name, &DeleteParams::default()).await.map(|_| ()))
    }

    async fn apply_cluster_config_map(
        &self,
        cluster_name: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    CLUSTER_LABEL_KEY.to_string(),
                    cluster_name.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&config_map),
        )
        .await?;
        Ok(())
    }

    async fn delete_cluster_config_maps(&self, cluster_name: &str) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let selector = cluster_selector(cluster_name);
        debug!(cluster = %cluster_name, %selector, "deleting derived config maps");
        api.delete_collection(
            &DeleteParams::default(),
            &ListParams::default().labels(&selector),
        )
        .await?;
        Ok(())
    }
}
