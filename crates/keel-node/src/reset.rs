//! Node reset: undo everything the pipeline and kubeadm did

use tracing::{info, instrument};

use keel_common::Result;

use crate::executor::{run_checked, RemoteExecutor};
use crate::pipeline::sentinel;

const STEP: &str = "ResetNode";

/// Directories removed from the node
pub const STATE_DIRS: &[&str] = &[
    "/etc/kubernetes",
    "/var/lib/kubelet",
    "/var/lib/etcd",
    "/etc/cni/net.d",
    "/var/lib/keel/bundle",
];

/// Shell script run on the node
///
/// Missing tools are tolerated so a half-provisioned node can still be
/// reset; directory removal and rule flushing must succeed.
pub fn reset_script() -> String {
    let lines = [
        "set -u".to_string(),
        "if command -v kubeadm >/dev/null 2>&1; then kubeadm reset -f || true; fi".to_string(),
        "systemctl stop kubelet 2>/dev/null || true".to_string(),
        "systemctl stop containerd 2>/dev/null || true".to_string(),
        "set -e".to_string(),
        format!("rm -rf {}", STATE_DIRS.join(" ")),
        sentinel::clear_all_command(),
        "if command -v ipvsadm >/dev/null 2>&1; then ipvsadm --clear; fi".to_string(),
        "iptables -F && iptables -t nat -F && iptables -t mangle -F && iptables -X".to_string(),
    ];
    lines.join("\n")
}

/// Reset a node to its pre-provisioning state
#[instrument(skip(exec), fields(host = %exec.host_identifier()))]
pub async fn reset_node(exec: &dyn RemoteExecutor) -> Result<()> {
    info!("resetting node");
    run_checked(exec, STEP, &reset_script()).await?;
    info!("node reset");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CommandOutput, MockRemoteExecutor};

    #[test]
    fn test_script_covers_services_state_and_rules() {
        let script = reset_script();
        assert!(script.contains("kubeadm reset -f"));
        assert!(script.contains("systemctl stop kubelet"));
        assert!(script.contains("systemctl stop containerd"));
        assert!(script.contains("/var/lib/etcd"));
        assert!(script.contains("/var/lib/keel/sentinel"));
        assert!(script.contains("ipvsadm --clear"));
        assert!(script.contains("iptables -t nat -F"));

        // tolerant section precedes set -e
        let set_e = script.find("set -e").unwrap();
        assert!(script.find("kubeadm reset").unwrap() < set_e);
        assert!(script.find("rm -rf").unwrap() > set_e);
    }

    #[tokio::test]
    async fn test_reset_failure_is_an_error() {
        let mut exec = MockRemoteExecutor::new();
        exec.expect_host_identifier()
            .returning(|| "10.0.0.1".to_string());
        exec.expect_execute()
            .returning(|_| Ok(CommandOutput::failed(1, "iptables: Permission denied")));

        let err = reset_node(&exec).await.unwrap_err();
        assert!(err.to_string().contains("ResetNode"));
        assert!(err.to_string().contains("Permission denied"));
    }
}
