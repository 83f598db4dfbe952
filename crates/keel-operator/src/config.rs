//! Command line and environment configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;

use keel_cluster::controller::DEFAULT_SUPPORTED_VERSIONS;
use keel_cluster::provider::baremetal::DEFAULT_MAX_PARALLEL_NODES;
use keel_cluster::ReconcileConfig;
use keel_common::telemetry::LogFormat;
use keel_common::KEEL_SYSTEM_NAMESPACE;
use keel_node::{PipelineConfig, SshOptions};

/// keel - CRD-driven lifecycle management for baremetal Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "keel", version, about, long_about = None)]
pub struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub config: OperatorConfig,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the Cluster and Machine controllers (default mode)
    Controller,
}

/// Settings for the controller process
#[derive(Args, Clone, Debug)]
pub struct OperatorConfig {
    /// Accepted Kubernetes minor versions, comma separated
    #[arg(
        long = "supported-versions",
        env = "KEEL_SUPPORTED_VERSIONS",
        value_delimiter = ',',
        default_values_t = DEFAULT_SUPPORTED_VERSIONS
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
    )]
    pub supported_versions: Vec<String>,

    /// Namespace holding ConfigMaps derived from Clusters
    #[arg(long, env = "KEEL_SYSTEM_NAMESPACE", default_value = KEEL_SYSTEM_NAMESPACE)]
    pub system_namespace: String,

    /// Requeue delay after a phase transition
    #[arg(long, env = "KEEL_INIT_REQUEUE", default_value = "3s", value_parser = parse_duration)]
    pub init_requeue: Duration,

    /// Requeue delay while a Machine waits for its Cluster
    #[arg(long, env = "KEEL_MACHINE_WAIT", default_value = "10s", value_parser = parse_duration)]
    pub machine_wait: Duration,

    /// Requeue delay after a retryable error
    #[arg(long, env = "KEEL_ERROR_BACKOFF", default_value = "15s", value_parser = parse_duration)]
    pub error_backoff: Duration,

    /// Resync interval for Running objects
    #[arg(long, env = "KEEL_RESYNC", default_value = "60s", value_parser = parse_duration)]
    pub resync: Duration,

    /// Bound on SSH connect, handshake and authentication
    #[arg(long, env = "KEEL_SSH_CONNECT_TIMEOUT", default_value = "10s", value_parser = parse_duration)]
    pub ssh_connect_timeout: Duration,

    /// Bound on a single remote command
    #[arg(long, env = "KEEL_SSH_COMMAND_TIMEOUT", default_value = "10m", value_parser = parse_duration)]
    pub ssh_command_timeout: Duration,

    /// Node operations allowed to run at once across all objects
    #[arg(long, env = "KEEL_PROVISIONING_CONCURRENCY", default_value_t = DEFAULT_MAX_PARALLEL_NODES)]
    pub provisioning_concurrency: usize,

    /// Local directory holding runtime and Kubernetes bundles
    #[arg(long, env = "KEEL_BUNDLE_DIR", default_value = "/var/lib/keel/bundles")]
    pub bundle_dir: PathBuf,

    /// Log output format: text or json
    #[arg(long, env = "KEEL_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,
}

impl OperatorConfig {
    /// Timing and version policy for the reconcilers
    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            supported_versions: self.supported_versions.clone(),
            initializing_requeue: self.init_requeue,
            machine_wait: self.machine_wait,
            error_backoff: self.error_backoff,
            resync: self.resync,
        }
    }

    /// SSH session settings
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            connect_timeout: self.ssh_connect_timeout,
            command_timeout: self.ssh_command_timeout,
            ..Default::default()
        }
    }

    /// Node pipeline settings
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            bundle_dir: self.bundle_dir.clone(),
            ..Default::default()
        }
    }
}

/// Invalid duration argument
#[derive(Debug, Error)]
#[error("invalid duration '{0}', expected e.g. 500ms, 10s, 5m, 1h")]
pub struct DurationError(String);

/// Parse a human-friendly duration
///
/// Supports `Nms`, `Ns`, `Nm` and `Nh`; a bare number is seconds.
pub fn parse_duration(s: &str) -> Result<Duration, DurationError> {
    let s = s.trim();
    let invalid = || DurationError(s.to_string());
    let number = |n: &str| n.parse::<u64>().map_err(|_| invalid());

    if let Some(ms) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(number(ms)?))
    } else if let Some(hours) = s.strip_suffix('h') {
        Ok(Duration::from_secs(number(hours)? * 3600))
    } else if let Some(minutes) = s.strip_suffix('m') {
        Ok(Duration::from_secs(number(minutes)? * 60))
    } else if let Some(secs) = s.strip_suffix('s') {
        Ok(Duration::from_secs(number(secs)?))
    } else {
        Ok(Duration::from_secs(number(s)?))
    }
}
