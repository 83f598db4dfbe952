//! Machine Custom Resource Definition
//!
//! A Machine is one worker node joined to a Cluster.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Address, Condition, MachineAccess, MachinePhase, NodeTaint};

/// Specification for a Machine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "keel.dev",
    version = "v1alpha1",
    kind = "Machine",
    plural = "machines",
    shortname = "km",
    status = "MachineStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"IP","type":"string","jsonPath":".spec.machine.ip"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Name of the owning Cluster
    pub cluster_name: String,

    /// Owning tenant
    #[serde(default)]
    pub tenant_id: String,

    /// Connection details
    pub machine: MachineAccess,

    /// Node labels applied at join
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Node taints applied at join
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<NodeTaint>,

    /// Stop reconciling this machine
    #[serde(default)]
    pub pause: bool,
}

/// Facts gathered from the node during provisioning
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSystemInfo {
    /// Hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// OS id from /etc/os-release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_image: Option<String>,
    /// Kernel release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_version: Option<String>,
    /// CPU architecture
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
}

/// Status for a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Current phase; unset until first reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<MachinePhase>,

    /// Ordered conditions, one per type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Reachable addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<Address>,

    /// Facts gathered from the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_info: Option<MachineSystemInfo>,

    /// Machine-readable reason for the last failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message about the last failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MachineStatus {
    /// Record a failure reason and message
    pub fn set_failure(&mut self, reason: impl Into<String>, message: impl Into<String>) {
        self.reason = Some(reason.into());
        self.message = Some(message.into());
    }

    /// Clear reason and message
    pub fn clear_failure(&mut self) {
        self.reason = None;
        self.message = None;
    }
}
