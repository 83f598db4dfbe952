//! ClusterCredential Custom Resource Definition
//!
//! Connection material harvested from a cluster's first control-plane node.
//! Named after its Cluster and written only by the Cluster's reconciliation.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// `kubeData` key holding the admin kubeconfig pointed at an external address
pub const EXTERNAL_KUBECONFIG_KEY: &str = "external-admin.conf";

/// `kubeData` key holding the admin kubeconfig as written by kubeadm
pub const ADMIN_KUBECONFIG_KEY: &str = "admin.conf";

/// Specification for a ClusterCredential
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "keel.dev",
    version = "v1alpha1",
    kind = "ClusterCredential",
    plural = "clustercredentials",
    shortname = "kcc",
    namespaced = false,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCredentialSpec {
    /// Owning Cluster
    pub cluster_name: String,

    /// Owning tenant
    #[serde(default)]
    pub tenant_id: String,

    /// Cluster CA certificate (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,

    /// Cluster CA key (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_key: Option<String>,

    /// Etcd CA certificate (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_ca_cert: Option<String>,

    /// Etcd CA key (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_ca_key: Option<String>,

    /// Admin bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// kubeadm bootstrap token used by joining nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_token: Option<String>,

    /// Certificate blobs keyed by file name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cert_data: BTreeMap<String, String>,

    /// Kubeconfig blobs keyed by well-known names
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kube_data: BTreeMap<String, String>,

    /// Anything else produced during provisioning
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_data: BTreeMap<String, String>,
}

impl ClusterCredentialSpec {
    /// New credential record for a cluster
    pub fn for_cluster(cluster_name: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            tenant_id: tenant_id.into(),
            ..Default::default()
        }
    }

    /// Admin kubeconfig usable from outside the cluster, if harvested
    pub fn external_kubeconfig(&self) -> Option<&str> {
        self.kube_data
            .get(EXTERNAL_KUBECONFIG_KEY)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}
