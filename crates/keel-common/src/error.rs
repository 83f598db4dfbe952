//! Error types for keel
//!
//! Errors carry the cluster, host or step they relate to so that the message
//! surfaced into an object's status is actionable without reading logs.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for keel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.clusterCIDR")
        field: Option<String>,
    },

    /// No provider is registered for the requested cluster type
    #[error("no provider registered for cluster type {cluster_type:?}")]
    UnknownProvider {
        /// The cluster type string that failed lookup
        cluster_type: String,
    },

    /// The requested Kubernetes version is not supported by this controller
    #[error("kubernetes version {version} is not supported (supported: {supported})")]
    UnsupportedVersion {
        /// Version requested in the Cluster spec
        version: String,
        /// Comma separated list of supported versions
        supported: String,
    },

    /// Provider error while driving a cluster or machine
    #[error("provider error [{provider}] for {cluster}: {message}")]
    Provider {
        /// Name of the cluster being provisioned
        cluster: String,
        /// Provider (cluster type) name
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Remote provisioning step failed on a node
    #[error("provisioning step {step} failed on {host}: {message}")]
    Provisioning {
        /// Host identifier of the node
        host: String,
        /// Pipeline step that failed
        step: String,
        /// Description of what failed, including captured diagnostics
        message: String,
    },

    /// Remote execution transport error (connect, auth, channel)
    #[error("remote execution error on {host}: {message}")]
    Remote {
        /// Host the session targeted
        host: String,
        /// Description of what failed
        message: String,
    },

    /// Cluster manager registry error
    #[error("cluster manager error for {cluster}: {message}")]
    Registry {
        /// Cluster whose handle could not be built
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Template rendering error
    #[error("template {template} failed to render: {message}")]
    Template {
        /// Template name
        template: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Object is in a phase no handler exists for
    #[error("no handler for {kind} phase {phase}")]
    UnexpectedPhase {
        /// Resource kind
        kind: String,
        /// The phase found in status
        phase: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "cluster-reconciler")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an unknown-provider error
    pub fn unknown_provider(cluster_type: impl Into<String>) -> Self {
        Self::UnknownProvider {
            cluster_type: cluster_type.into(),
        }
    }

    /// Create an unsupported-version error
    pub fn unsupported_version(version: impl Into<String>, supported: &[String]) -> Self {
        Self::UnsupportedVersion {
            version: version.into(),
            supported: supported.join(", "),
        }
    }

    /// Create a provider error with full context
    pub fn provider_for(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g., configuration error)
    pub fn provider_permanent(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a provisioning error for a step on a host
    pub fn provisioning(
        host: impl Into<String>,
        step: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provisioning {
            host: host.into(),
            step: step.into(),
            message: msg.into(),
        }
    }

    /// Create a remote execution error
    pub fn remote(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Remote {
            host: host.into(),
            message: msg.into(),
        }
    }

    /// Create a cluster manager registry error
    pub fn registry(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registry {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a template error
    pub fn template(template: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an unexpected-phase error
    pub fn unexpected_phase(kind: impl Into<String>, phase: impl std::fmt::Display) -> Self {
        Self::UnexpectedPhase {
            kind: kind.into(),
            phase: phase.to_string(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Returns true if this is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// Returns true if this is an optimistic concurrency conflict (409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Check if this error is retryable
    ///
    /// Configuration errors (validation, unknown provider, unsupported
    /// version) need the desired-state object edited and are not retried
    /// with the same parameters.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Conflicts are retried; other 4xx are not
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
                )
            }
            Error::Validation { .. } => false,
            Error::UnknownProvider { .. } => false,
            Error::UnsupportedVersion { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::Provisioning { .. } => true,
            Error::Remote { .. } => true,
            Error::Registry { .. } => true,
            Error::Template { .. } => false,
            Error::Serialization { .. } => false,
            Error::UnexpectedPhase { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. } => Some(cluster),
            Error::Provider { cluster, .. } => Some(cluster),
            Error::Registry { cluster, .. } => Some(cluster),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
