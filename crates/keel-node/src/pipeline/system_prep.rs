use async_trait::async_trait;
use minijinja::context;
use tracing::debug;

use keel_common::Result;

use super::{sentinel, NodeJob, NodeStep, Provisioner};
use crate::executor::run_checked;
use crate::templates::SYSTEM_PREP;

/// Sub-steps in execution order; each has its own sentinel
const PARTS: &[&str] = &[
    "packages",
    "swap",
    "firewall",
    "selinux",
    "kernel-modules",
    "sysctl",
    "hostname",
];

pub(crate) struct SystemPrep;

#[async_trait]
impl NodeStep for SystemPrep {
    fn name(&self) -> &'static str {
        "system-prep"
    }

    async fn apply(&self, provisioner: &Provisioner, job: &NodeJob<'_>) -> Result<()> {
        let os = job.os().await?;
        let ipvs = job.cluster.features.ipvs;

        for part in PARTS {
            let marker = format!("{}.{part}", self.name());
            if sentinel::is_done(job.exec, &marker).await? {
                debug!(part = *part, "sub-step already done");
                continue;
            }

            let script = provisioner.templates().render(
                SYSTEM_PREP,
                context! {
                    part => part,
                    os => os.to_string(),
                    ipvs => ipvs,
                    hostname => job.node.hostname.clone(),
                    ip => job.node.ip.clone(),
                },
            )?;
            run_checked(job.exec, "EnsureSystemPrep", &script).await?;
            sentinel::mark_done(job.exec, &marker).await?;
        }
        Ok(())
    }
}
