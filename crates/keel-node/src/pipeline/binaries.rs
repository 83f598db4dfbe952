use async_trait::async_trait;
use minijinja::context;
use tracing::debug;

use keel_common::Result;

use super::{NodeJob, NodeStep, Provisioner};
use crate::executor::{run_checked, shell_quote};
use crate::templates::KUBELET_UNIT;

const STEP: &str = "EnsureKubernetesBinaries";
const BINARIES: &[&str] = &["kubelet", "kubeadm", "kubectl"];
const BIN_DIR: &str = "/usr/bin";
const CNI_BUNDLE: &str = "cni-plugins.tgz";
const CNI_BIN_DIR: &str = "/opt/cni/bin";
const KUBELET_UNIT_PATH: &str = "/etc/systemd/system/kubelet.service";

pub(crate) struct KubernetesBinaries;

#[async_trait]
impl NodeStep for KubernetesBinaries {
    fn name(&self) -> &'static str {
        "kubernetes-binaries"
    }

    async fn apply(&self, provisioner: &Provisioner, job: &NodeJob<'_>) -> Result<()> {
        let config = provisioner.config();
        let version_dir = config
            .bundle_dir
            .join("kubernetes")
            .join(format!("v{}", job.cluster.version.trim_start_matches('v')));

        for bin in BINARIES {
            let dest = format!("{BIN_DIR}/{bin}");
            if job.exec.exists(&dest).await? {
                debug!(dest = %dest, "binary present, not overwriting");
                continue;
            }
            job.exec.copy_file(&version_dir.join(bin), &dest).await?;
        }
        let paths: Vec<String> = BINARIES.iter().map(|b| format!("{BIN_DIR}/{b}")).collect();
        run_checked(job.exec, STEP, &format!("chmod +x {}", paths.join(" "))).await?;

        let staged_cni = format!("{}/{CNI_BUNDLE}", config.remote_staging_dir);
        if !job.exec.exists(&staged_cni).await? {
            job.exec
                .copy_file(&config.bundle_dir.join(CNI_BUNDLE), &staged_cni)
                .await?;
        }
        run_checked(
            job.exec,
            STEP,
            &format!(
                "mkdir -p {CNI_BIN_DIR} && tar -xzf {} -C {CNI_BIN_DIR}",
                shell_quote(&staged_cni)
            ),
        )
        .await?;

        let os = job.os().await?;
        let unit = provisioner.templates().render(
            KUBELET_UNIT,
            context! { args_file => os.kubelet_args_path() },
        )?;
        job.exec
            .write_file(unit.as_bytes(), KUBELET_UNIT_PATH)
            .await?;

        let args = format!("KUBELET_EXTRA_ARGS={}\n", kubelet_extra_args(job));
        job.exec
            .write_file(args.as_bytes(), os.kubelet_args_path())
            .await?;

        provisioner.restart_service(job.exec, STEP, "kubelet").await?;

        let completion_dir = os.bash_completion_dir();
        run_checked(
            job.exec,
            STEP,
            &format!(
                "mkdir -p {completion_dir} && kubectl completion bash > {completion_dir}/kubectl \
                 && kubeadm completion bash > {completion_dir}/kubeadm"
            ),
        )
        .await?;
        Ok(())
    }
}

/// Flags passed to kubelet through `KUBELET_EXTRA_ARGS`
pub(crate) fn kubelet_extra_args(job: &NodeJob<'_>) -> String {
    let mut args = vec![format!("--node-ip={}", job.node.ip)];

    if !job.node.labels.is_empty() {
        let labels: Vec<String> = job
            .node
            .labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        args.push(format!("--node-labels={}", labels.join(",")));
    }

    if !job.node.taints.is_empty() {
        let taints: Vec<String> = job
            .node
            .taints
            .iter()
            .map(|t| match &t.value {
                Some(v) => format!("{}={}:{}", t.key, v, t.effect),
                None => format!("{}:{}", t.key, t.effect),
            })
            .collect();
        args.push(format!("--register-with-taints={}", taints.join(",")));
    }

    for (k, v) in &job.cluster.extra_args.kubelet {
        args.push(format!("--{}={v}", k.trim_start_matches("--")));
    }
    args.join(" ")
}
