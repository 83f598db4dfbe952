//! Ordered node provisioning pipeline
//!
//! Steps run in a fixed order: system prep, container runtime, Kubernetes
//! binaries, HA/etcd addons. Each step is skipped when its sentinel exists on
//! the node, and the sentinel is written only after the step succeeds, so a
//! re-run after a partial failure resumes at the first incomplete step.

mod addons;
mod binaries;
mod runtime;
pub(crate) mod sentinel;
mod system_prep;

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, instrument};

use keel_common::crd::{ClusterSpec, MachineSystemInfo, NodeTaint};
use keel_common::retry::RetryPolicy;
use keel_common::{Error, Result};

use crate::executor::{run_checked, tail_lines, RemoteExecutor, ERROR_TAIL_LINES};
use crate::os::OsFamily;
use crate::templates::NodeTemplates;

use addons::HaAddons;
use binaries::KubernetesBinaries;
use runtime::ContainerRuntime;
use system_prep::SystemPrep;

/// Directory kubelet watches for static pods
pub const STATIC_POD_DIR: &str = "/etc/kubernetes/manifests";

/// Local inputs and node-side paths used by the pipeline
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Local directory holding the runtime, CNI and Kubernetes bundles
    ///
    /// Layout: `containerd.tar.gz`, `cni-plugins.tgz`,
    /// `kubernetes/v<version>/{kubelet,kubeadm,kubectl}`.
    pub bundle_dir: PathBuf,
    /// Node-side directory bundles are staged in
    pub remote_staging_dir: String,
    /// Node-side static pod directory
    pub static_pod_dir: String,
    /// kube-vip image used when the Cluster does not name one
    pub kube_vip_image: String,
    /// etcd image used when the Cluster does not name one
    pub etcd_image: String,
    /// Sandbox image used when the Cluster does not name one
    pub sandbox_image: String,
    /// Journal lines captured when a service fails to start
    pub journal_lines: usize,
    /// Retries for reading credentials off a freshly initialized node
    pub harvest_retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bundle_dir: PathBuf::from("/var/lib/keel/bundles"),
            remote_staging_dir: "/var/lib/keel/bundle".to_string(),
            static_pod_dir: STATIC_POD_DIR.to_string(),
            kube_vip_image: "ghcr.io/kube-vip/kube-vip:v0.8.7".to_string(),
            etcd_image: "registry.k8s.io/etcd:3.5.16-0".to_string(),
            sandbox_image: "registry.k8s.io/pause:3.10".to_string(),
            journal_lines: 50,
            harvest_retry: RetryPolicy::attempts(5),
        }
    }
}

/// What a node becomes once provisioned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    /// First control-plane node; runs `kubeadm init`
    ControlPlaneInit,
    /// Additional control-plane node
    ControlPlane,
    /// Worker node
    Worker,
}

impl NodeRole {
    /// True for both control-plane roles
    pub fn is_control_plane(&self) -> bool {
        !matches!(self, Self::Worker)
    }
}

/// Identity of the node being provisioned
#[derive(Clone, Debug, Default)]
pub struct NodeInfo {
    /// Node IP
    pub ip: String,
    /// Hostname to set; left alone when unset
    pub hostname: Option<String>,
    /// Labels registered by kubelet
    pub labels: BTreeMap<String, String>,
    /// Taints registered by kubelet
    pub taints: Vec<NodeTaint>,
}

/// One node's provisioning run
pub struct NodeJob<'a> {
    /// Session to the node
    pub exec: &'a dyn RemoteExecutor,
    /// Owning cluster name
    pub cluster_name: &'a str,
    /// Owning cluster spec
    pub cluster: &'a ClusterSpec,
    /// Role of the node
    pub role: NodeRole,
    /// Node identity
    pub node: NodeInfo,
    os: OnceCell<OsFamily>,
}

impl<'a> NodeJob<'a> {
    /// Create a job
    pub fn new(
        exec: &'a dyn RemoteExecutor,
        cluster_name: &'a str,
        cluster: &'a ClusterSpec,
        role: NodeRole,
        node: NodeInfo,
    ) -> Self {
        Self {
            exec,
            cluster_name,
            cluster,
            role,
            node,
            os: OnceCell::new(),
        }
    }

    /// Host identifier of the node
    pub fn host(&self) -> String {
        self.exec.host_identifier()
    }

    /// OS family, detected on first use
    pub async fn os(&self) -> Result<OsFamily> {
        self.os
            .get_or_try_init(|| OsFamily::detect(self.exec))
            .await
            .copied()
    }
}

/// A pipeline step guarded by one sentinel
#[async_trait]
pub(crate) trait NodeStep: Send + Sync {
    /// Sentinel name and log label
    fn name(&self) -> &'static str;

    /// Do the work; only called when the sentinel is absent
    async fn apply(&self, provisioner: &Provisioner, job: &NodeJob<'_>) -> Result<()>;
}

/// Runs pipeline steps and kubeadm operations against nodes
#[derive(Debug)]
pub struct Provisioner {
    config: PipelineConfig,
    templates: NodeTemplates,
}

impl Provisioner {
    /// Create a provisioner, compiling templates up front
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Ok(Self {
            config,
            templates: NodeTemplates::new()?,
        })
    }

    /// Pipeline configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub(crate) fn templates(&self) -> &NodeTemplates {
        &self.templates
    }

    /// Step 1: swap, firewall, SELinux, kernel modules, sysctl, hostname
    pub async fn system_prep(&self, job: &NodeJob<'_>) -> Result<()> {
        self.run_step(&SystemPrep, job).await
    }

    /// Step 2: containerd
    pub async fn container_runtime(&self, job: &NodeJob<'_>) -> Result<()> {
        self.run_step(&ContainerRuntime, job).await
    }

    /// Step 3: kubelet, kubeadm, kubectl and CNI plugins
    pub async fn kubernetes_binaries(&self, job: &NodeJob<'_>) -> Result<()> {
        self.run_step(&KubernetesBinaries, job).await
    }

    /// Step 4: kube-vip and etcd static pods
    pub async fn addons(&self, job: &NodeJob<'_>) -> Result<()> {
        self.run_step(&HaAddons, job).await
    }

    /// All four steps in order
    pub async fn run_pipeline(&self, job: &NodeJob<'_>) -> Result<()> {
        self.system_prep(job).await?;
        self.container_runtime(job).await?;
        self.kubernetes_binaries(job).await?;
        self.addons(job).await
    }

    #[instrument(skip(self, step, job), fields(step = step.name(), host = %job.host()))]
    async fn run_step(&self, step: &dyn NodeStep, job: &NodeJob<'_>) -> Result<()> {
        if sentinel::is_done(job.exec, step.name()).await? {
            debug!("sentinel present, skipping");
            return Ok(());
        }
        info!("running step");
        step.apply(self, job).await?;
        sentinel::mark_done(job.exec, step.name()).await?;
        info!("step complete");
        Ok(())
    }

    /// Enable and restart a systemd unit, embedding its journal on failure
    pub(crate) async fn restart_service(
        &self,
        exec: &dyn RemoteExecutor,
        step: &str,
        service: &str,
    ) -> Result<()> {
        let command = format!(
            "systemctl daemon-reload && systemctl enable {service} && systemctl restart {service}"
        );
        let output = exec.execute(&command).await?;
        if output.success() {
            return Ok(());
        }

        let journal = exec
            .execute(&format!(
                "journalctl -u {service} --no-pager -n {}",
                self.config.journal_lines
            ))
            .await
            .map(|o| o.stdout)
            .unwrap_or_else(|e| format!("<journal unavailable: {e}>"));

        Err(Error::provisioning(
            exec.host_identifier(),
            step,
            format!(
                "{service} failed to start (exit {}): {}\n--- journalctl -u {service} ---\n{}",
                output.exit_code,
                output.tail(ERROR_TAIL_LINES),
                journal.trim_end()
            ),
        ))
    }

    /// Whether kubelet is active on the node
    pub async fn probe_kubelet(&self, exec: &dyn RemoteExecutor) -> Result<bool> {
        let output = exec.execute("systemctl is-active --quiet kubelet").await?;
        Ok(output.success())
    }

    /// Collect hostname, kernel, architecture and OS image
    pub async fn system_info(&self, exec: &dyn RemoteExecutor) -> Result<MachineSystemInfo> {
        let output = run_checked(
            exec,
            "SystemInfo",
            "hostname; uname -r; uname -m; . /etc/os-release && echo \"$PRETTY_NAME\"",
        )
        .await?;
        Ok(parse_system_info(&output.stdout))
    }
}

fn parse_system_info(stdout: &str) -> MachineSystemInfo {
    let mut lines = stdout.lines().map(str::trim).map(|l| {
        if l.is_empty() {
            None
        } else {
            Some(l.to_string())
        }
    });
    MachineSystemInfo {
        hostname: lines.next().flatten(),
        kernel_version: lines.next().flatten(),
        architecture: lines.next().flatten(),
        os_image: lines.next().flatten(),
    }
}

/// Run a long command, logging output as it arrives
///
/// Only the last lines of each stream are retained for the error message.
pub(crate) async fn run_streaming(
    exec: &dyn RemoteExecutor,
    step: &str,
    command: &str,
) -> Result<()> {
    let (out_tx, out_rx) = mpsc::channel::<String>(64);
    let (err_tx, err_rx) = mpsc::channel::<String>(64);

    let host = exec.host_identifier();
    let (code, stdout_tail, stderr_tail) = tokio::join!(
        exec.execute_streaming(command, out_tx, err_tx),
        drain(out_rx, &host, step),
        drain(err_rx, &host, step),
    );
    let code = code?;

    if code != 0 {
        let tail = if stderr_tail.is_empty() {
            stdout_tail
        } else {
            stderr_tail
        };
        return Err(Error::provisioning(
            host,
            step,
            format!("exited {code}: {}", tail_lines(&tail, ERROR_TAIL_LINES)),
        ));
    }
    Ok(())
}

async fn drain(mut rx: mpsc::Receiver<String>, host: &str, step: &str) -> String {
    let mut tail = VecDeque::with_capacity(ERROR_TAIL_LINES);
    while let Some(line) = rx.recv().await {
        debug!(host, step, "{line}");
        if tail.len() == ERROR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::executor::MockRemoteExecutor;

    pub(crate) fn cluster_spec() -> ClusterSpec {
        serde_yaml::from_str(
            r#"
clusterType: Baremetal
version: "1.31.2"
networkDevice: eth0
clusterCIDR: 10.244.0.0/16
machines:
  - ip: 10.0.0.1
    password: secret
ha:
  kubeVip:
    vip: 10.0.0.100
etcd:
  local: {}
"#,
        )
        .unwrap()
    }

    pub(crate) fn node() -> NodeInfo {
        NodeInfo {
            ip: "10.0.0.1".to_string(),
            hostname: Some("cp-1".to_string()),
            ..Default::default()
        }
    }

    pub(crate) fn provisioner() -> Provisioner {
        Provisioner::new(PipelineConfig {
            bundle_dir: PathBuf::from("/bundles"),
            ..Default::default()
        })
        .unwrap()
    }

    pub(crate) fn host(exec: &mut MockRemoteExecutor) {
        exec.expect_host_identifier()
            .returning(|| "10.0.0.1".to_string());
    }

    pub(crate) const UBUNTU: &str = "ID=ubuntu\nID_LIKE=debian\n";
}
