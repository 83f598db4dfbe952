//! Node provisioning for keel
//!
//! The [`RemoteExecutor`] contract and its SSH implementation, plus the
//! ordered provisioning pipeline (system prep, container runtime, Kubernetes
//! binaries, HA/etcd addons), kubeadm bring-up and node reset. Nothing here
//! touches the Kubernetes API of the management cluster.

pub mod executor;
pub mod kubeadm;
pub mod os;
pub mod pipeline;
pub mod reset;
pub mod ssh;
pub mod templates;

pub use executor::{
    run_checked, shell_quote, CommandOutput, ExecutorFactory, NodeAuth, NodeTarget,
    RemoteExecutor,
};
pub use kubeadm::{generate_bootstrap_token, HarvestedCredentials, JoinMaterial};
pub use os::OsFamily;
pub use pipeline::{NodeInfo, NodeJob, NodeRole, PipelineConfig, Provisioner};
pub use reset::reset_node;
pub use ssh::{SshExecutor, SshExecutorFactory, SshOptions};

pub use keel_common::{Error, Result};
