//! Embedded scripts and manifests rendered onto nodes
//!
//! Templates use standard Jinja delimiters so shell `${VAR}` expansions pass
//! through untouched. Undefined variables are errors; every context must
//! supply each key a template references, using `None` for "absent".

use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde::Serialize;

use keel_common::{Error, Result};

/// Script run per system-prep sub-step
pub const SYSTEM_PREP: &str = "system_prep.sh.j2";
/// containerd `config.toml`
pub const CONTAINERD_CONFIG: &str = "containerd-config.toml.j2";
/// containerd systemd unit
pub const CONTAINERD_UNIT: &str = "containerd.service.j2";
/// kubelet systemd unit
pub const KUBELET_UNIT: &str = "kubelet.service.j2";
/// kube-vip static pod
pub const KUBE_VIP: &str = "kube-vip.yaml.j2";
/// etcd static pod
pub const ETCD: &str = "etcd.yaml.j2";
/// kubeadm init configuration
pub const KUBEADM_INIT: &str = "kubeadm-init.yaml.j2";

const SOURCES: &[(&str, &str)] = &[
    (SYSTEM_PREP, include_str!("../templates/system_prep.sh.j2")),
    (CONTAINERD_CONFIG, include_str!("../templates/containerd-config.toml.j2")),
    (CONTAINERD_UNIT, include_str!("../templates/containerd.service.j2")),
    (KUBELET_UNIT, include_str!("../templates/kubelet.service.j2")),
    (KUBE_VIP, include_str!("../templates/kube-vip.yaml.j2")),
    (ETCD, include_str!("../templates/etcd.yaml.j2")),
    (KUBEADM_INIT, include_str!("../templates/kubeadm-init.yaml.j2")),
];

/// Compiled node templates
pub struct NodeTemplates {
    env: Environment<'static>,
}

impl std::fmt::Debug for NodeTemplates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTemplates").finish_non_exhaustive()
    }
}

impl NodeTemplates {
    /// Compile all embedded templates
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_trim_blocks(true);
        env.set_keep_trailing_newline(true);

        for &(name, source) in SOURCES {
            env.add_template(name, source)
                .map_err(|e| Error::template(name, e.to_string()))?;
        }
        Ok(Self { env })
    }

    /// Render `name` with `ctx`
    pub fn render<S: Serialize>(&self, name: &str, ctx: S) -> Result<String> {
        let template = self
            .env
            .get_template(name)
            .map_err(|e| Error::template(name, e.to_string()))?;
        template
            .render(ctx)
            .map_err(|e| Error::template(name, format!("{e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;
    use std::collections::BTreeMap;

    fn templates() -> NodeTemplates {
        NodeTemplates::new().unwrap()
    }

    #[test]
    fn test_all_templates_compile() {
        let t = templates();
        for (name, _) in SOURCES {
            assert!(t.env.get_template(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn test_system_prep_selects_os_specific_firewall() {
        let t = templates();
        let debian = t
            .render(
                SYSTEM_PREP,
                context! { part => "firewall", os => "debian", ipvs => false, hostname => (), ip => "10.0.0.1" },
            )
            .unwrap();
        assert!(debian.contains("ufw disable"));
        assert!(!debian.contains("firewalld"));

        let redhat = t
            .render(
                SYSTEM_PREP,
                context! { part => "firewall", os => "redhat", ipvs => false, hostname => (), ip => "10.0.0.1" },
            )
            .unwrap();
        assert!(redhat.contains("firewalld"));
    }

    #[test]
    fn test_system_prep_ipvs_modules_only_when_enabled() {
        let t = templates();
        let render = |ipvs: bool| {
            t.render(
                SYSTEM_PREP,
                context! { part => "kernel-modules", os => "debian", ipvs => ipvs, hostname => (), ip => "10.0.0.1" },
            )
            .unwrap()
        };
        assert!(render(true).contains("ip_vs_rr"));
        assert!(!render(false).contains("ip_vs_rr"));
        assert!(render(false).contains("br_netfilter"));
    }

    #[test]
    fn test_containerd_config_mirrors() {
        let mut mirrors = BTreeMap::new();
        mirrors.insert(
            "docker.io".to_string(),
            vec!["https://mirror.example.com".to_string()],
        );
        let out = templates()
            .render(
                CONTAINERD_CONFIG,
                context! {
                    sandbox_image => "registry.k8s.io/pause:3.10",
                    snapshotter => "overlayfs",
                    systemd_cgroup => true,
                    mirrors => mirrors,
                    insecure_registries => vec!["10.0.0.9:5000"],
                },
            )
            .unwrap();
        assert!(out.contains("SystemdCgroup = true"));
        assert!(out.contains(r#"mirrors."docker.io"]"#));
        assert!(out.contains(r#"endpoint = ["https://mirror.example.com"]"#));
        assert!(out.contains(r#"configs."10.0.0.9:5000".tls]"#));
    }

    #[test]
    fn test_undefined_variable_is_an_error() {
        let err = templates()
            .render(KUBE_VIP, context! { vip => "10.0.0.100" })
            .unwrap_err();
        assert!(err.to_string().contains(KUBE_VIP));
    }

    #[test]
    fn test_shell_expansions_survive_rendering() {
        let out = templates()
            .render(
                SYSTEM_PREP,
                context! { part => "kernel-modules", os => "debian", ipvs => true, hostname => (), ip => "10.0.0.1" },
            )
            .unwrap();
        assert!(out.contains(r#"modprobe "$m""#));
    }
}
