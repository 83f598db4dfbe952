use async_trait::async_trait;
use minijinja::context;
use tracing::debug;

use keel_common::Result;

use super::{NodeJob, NodeRole, NodeStep, Provisioner};

const KUBE_VIP_MANIFEST: &str = "kube-vip.yaml";
const ETCD_MANIFEST: &str = "etcd.yaml";
const DEFAULT_ETCD_DATA_DIR: &str = "/var/lib/etcd";

pub(crate) struct HaAddons;

#[async_trait]
impl NodeStep for HaAddons {
    fn name(&self) -> &'static str {
        "addons"
    }

    async fn apply(&self, provisioner: &Provisioner, job: &NodeJob<'_>) -> Result<()> {
        if !job.role.is_control_plane() {
            debug!("no addons for worker nodes");
            return Ok(());
        }
        let config = provisioner.config();
        let templates = provisioner.templates();

        if let Some(kube_vip) = job.cluster.ha.as_ref().and_then(|h| h.kube_vip.as_ref()) {
            // kubeadm only grants admin.conf cluster-admin after init; the
            // first node's VIP must come up before that.
            let kubeconfig = if job.role == NodeRole::ControlPlaneInit {
                "/etc/kubernetes/super-admin.conf"
            } else {
                "/etc/kubernetes/admin.conf"
            };
            let manifest = templates.render(
                crate::templates::KUBE_VIP,
                context! {
                    image => kube_vip.image.clone().unwrap_or_else(|| config.kube_vip_image.clone()),
                    vip => &kube_vip.vip,
                    interface => job.cluster.network_device.clone().unwrap_or_default(),
                    port => keel_common::DEFAULT_APISERVER_PORT,
                    kubeconfig => kubeconfig,
                },
            )?;
            job.exec
                .write_file(
                    manifest.as_bytes(),
                    &format!("{}/{KUBE_VIP_MANIFEST}", config.static_pod_dir),
                )
                .await?;
        }

        if job.role == NodeRole::ControlPlaneInit {
            if let Some(local) = job.cluster.etcd.as_ref().and_then(|e| e.local.as_ref()) {
                let mut extra: Vec<String> = local
                    .extra_args
                    .iter()
                    .map(|(k, v)| format!("--{}={v}", k.trim_start_matches("--")))
                    .collect();
                extra.sort();
                let manifest = templates.render(
                    crate::templates::ETCD,
                    context! {
                        image => local.image.clone().unwrap_or_else(|| config.etcd_image.clone()),
                        name => job.node.hostname.clone().unwrap_or_else(|| job.node.ip.clone()),
                        ip => &job.node.ip,
                        data_dir => local.data_dir.clone().unwrap_or_else(|| DEFAULT_ETCD_DATA_DIR.to_string()),
                        extra_args => extra,
                    },
                )?;
                job.exec
                    .write_file(
                        manifest.as_bytes(),
                        &format!("{}/{ETCD_MANIFEST}", config.static_pod_dir),
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
