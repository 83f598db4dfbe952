//! Common types for keel: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for keel system resources (derived ConfigMaps, operator)
pub const KEEL_SYSTEM_NAMESPACE: &str = "keel-system";

/// Label key tying derived resources back to the Cluster they belong to
pub const CLUSTER_LABEL_KEY: &str = "keel.dev/cluster";

/// Field manager used for every write the controllers issue
pub const FIELD_MANAGER: &str = "keel-controller";

/// Finalizer gating Cluster deletion until node cleanup has run
pub const CLUSTER_FINALIZER: &str = "keel.dev/cluster-cleanup";

/// Annotation requesting a phase restore; its value names a Condition type
pub const RESTORE_CONDITION_ANNOTATION: &str = "keel.dev/restore-condition";

/// Default Kubernetes API server port on control-plane nodes
pub const DEFAULT_APISERVER_PORT: i32 = 6443;

/// Default SSH port for node connections
pub const DEFAULT_SSH_PORT: u16 = 22;
