use async_trait::async_trait;
use minijinja::context;

use keel_common::Result;

use super::{NodeJob, NodeStep, Provisioner};
use crate::executor::{run_checked, shell_quote};
use crate::templates::{CONTAINERD_CONFIG, CONTAINERD_UNIT};

const STEP: &str = "EnsureContainerRuntime";
pub(crate) const BUNDLE_FILE: &str = "containerd.tar.gz";
const CONFIG_PATH: &str = "/etc/containerd/config.toml";
const UNIT_PATH: &str = "/etc/systemd/system/containerd.service";

pub(crate) struct ContainerRuntime;

#[async_trait]
impl NodeStep for ContainerRuntime {
    fn name(&self) -> &'static str {
        "container-runtime"
    }

    async fn apply(&self, provisioner: &Provisioner, job: &NodeJob<'_>) -> Result<()> {
        let config = provisioner.config();
        let runtime = &job.cluster.runtime;

        let staged = format!("{}/{BUNDLE_FILE}", config.remote_staging_dir);
        job.exec
            .copy_file(&config.bundle_dir.join(BUNDLE_FILE), &staged)
            .await?;
        run_checked(
            job.exec,
            STEP,
            &format!("tar -xzf {} -C /usr/local", shell_quote(&staged)),
        )
        .await?;

        let unit = provisioner.templates().render(CONTAINERD_UNIT, context! {})?;
        job.exec.write_file(unit.as_bytes(), UNIT_PATH).await?;

        let toml = provisioner.templates().render(
            CONTAINERD_CONFIG,
            context! {
                sandbox_image => runtime
                    .sandbox_image
                    .clone()
                    .unwrap_or_else(|| config.sandbox_image.clone()),
                snapshotter => runtime.snapshotter(),
                systemd_cgroup => runtime.cgroup_driver() == "systemd",
                mirrors => &runtime.registry_mirrors,
                insecure_registries => &runtime.insecure_registries,
            },
        )?;
        job.exec.write_file(toml.as_bytes(), CONFIG_PATH).await?;

        provisioner
            .restart_service(job.exec, STEP, "containerd")
            .await
    }
}
