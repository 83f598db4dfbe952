//! Node OS family detection

use keel_common::{Error, Result};

use crate::executor::{run_checked, RemoteExecutor};

/// Distribution family; selects package manager, firewall and paths
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    /// Debian, Ubuntu and derivatives
    Debian,
    /// RHEL, CentOS, Rocky, Alma, Fedora and derivatives
    RedHat,
}

impl OsFamily {
    /// Where the kubelet unit reads `KUBELET_EXTRA_ARGS` from
    pub fn kubelet_args_path(&self) -> &'static str {
        match self {
            Self::Debian => "/etc/default/kubelet",
            Self::RedHat => "/etc/sysconfig/kubelet",
        }
    }

    /// Where bash completion scripts live
    pub fn bash_completion_dir(&self) -> &'static str {
        "/etc/bash_completion.d"
    }

    /// Parse the contents of `/etc/os-release`
    pub fn from_os_release(content: &str) -> Option<Self> {
        let field = |key: &str| {
            content.lines().find_map(|line| {
                line.strip_prefix(key)
                    .and_then(|rest| rest.strip_prefix('='))
                    .map(|v| v.trim().trim_matches('"').to_ascii_lowercase())
            })
        };

        let mut ids = Vec::new();
        if let Some(id) = field("ID") {
            ids.push(id);
        }
        if let Some(like) = field("ID_LIKE") {
            ids.extend(like.split_whitespace().map(str::to_string));
        }

        ids.iter().find_map(|id| match id.as_str() {
            "debian" | "ubuntu" => Some(Self::Debian),
            "rhel" | "centos" | "fedora" | "rocky" | "almalinux" | "ol" | "openeuler" => {
                Some(Self::RedHat)
            }
            _ => None,
        })
    }

    /// Read `/etc/os-release` on the node
    pub async fn detect(exec: &dyn RemoteExecutor) -> Result<Self> {
        let output = run_checked(exec, "DetectOS", "cat /etc/os-release").await?;
        Self::from_os_release(&output.stdout).ok_or_else(|| {
            Error::provisioning(
                exec.host_identifier(),
                "DetectOS",
                "unsupported operating system family",
            )
        })
    }
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debian => f.write_str("debian"),
            Self::RedHat => f.write_str("redhat"),
        }
    }
}
