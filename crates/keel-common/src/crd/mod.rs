//! Custom Resource Definitions for keel
//!
//! All three kinds are cluster-scoped in group `keel.dev/v1alpha1`.

mod cluster;
mod credential;
mod machine;
mod types;

pub use cluster::{
    minor_version, Cluster, ClusterFeatures, ClusterMachine, ClusterResource, ClusterSpec,
    ClusterStatus, EtcdSpec, ExternalEtcd, ExtraArgs, HaSpec, KubeVipHa, LocalEtcd, RuntimeSpec,
    ThirdPartyHa,
};
pub use credential::{
    ClusterCredential, ClusterCredentialSpec, ADMIN_KUBECONFIG_KEY, EXTERNAL_KUBECONFIG_KEY,
};
pub use machine::{Machine, MachineSpec, MachineStatus, MachineSystemInfo};
pub use types::{
    add_address, find_condition, remove_addresses, select_host, set_condition, Address,
    AddressType, ClusterPhase, Condition, ConditionStatus, MachineAccess, MachinePhase,
    NodeTaint,
};
