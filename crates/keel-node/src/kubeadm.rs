//! kubeadm bring-up: init, credential harvest and joins

use std::collections::BTreeMap;

use minijinja::context;
use rand::Rng;
use tracing::{info, instrument};

use keel_common::crd::{minor_version, ClusterSpec};
use keel_common::retry::retry_transient;
use keel_common::{Error, Result};

use crate::executor::{run_checked, shell_quote, RemoteExecutor};
use crate::pipeline::{run_streaming, NodeJob, NodeRole, Provisioner};
use crate::templates::KUBEADM_INIT;

/// Admin kubeconfig written by `kubeadm init`
pub const ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";
/// Kubelet kubeconfig present on every joined node
pub const KUBELET_CONF: &str = "/etc/kubernetes/kubelet.conf";
const INIT_CONFIG_PATH: &str = "/etc/kubernetes/keel/kubeadm-init.yaml";
const PKI_DIR: &str = "/etc/kubernetes/pki";

/// PKI files copied into the credential's `certData`, keyed by file name
const HARVESTED_PKI: &[&str] = &[
    "ca.crt",
    "ca.key",
    "sa.key",
    "sa.pub",
    "front-proxy-ca.crt",
    "front-proxy-ca.key",
    "etcd/ca.crt",
    "etcd/ca.key",
];

/// Material read off the first control-plane node after `kubeadm init`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HarvestedCredentials {
    /// admin.conf as written by kubeadm
    pub admin_kubeconfig: String,
    /// admin.conf with the server rewritten to the external endpoint
    pub external_kubeconfig: String,
    /// Cluster CA certificate
    pub ca_cert: String,
    /// Cluster CA key
    pub ca_key: String,
    /// Etcd CA certificate, absent with external etcd
    pub etcd_ca_cert: Option<String>,
    /// Etcd CA key, absent with external etcd
    pub etcd_ca_key: Option<String>,
    /// `sha256:<hex>` of the CA public key, for join discovery
    pub ca_cert_hash: String,
    /// Every harvested PKI file keyed by path relative to the pki dir
    pub cert_data: BTreeMap<String, String>,
}

/// What a node needs to `kubeadm join`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinMaterial {
    /// API endpoint (`host:port`)
    pub endpoint: String,
    /// Bootstrap token
    pub token: String,
    /// `sha256:<hex>` discovery hash
    pub ca_cert_hash: String,
    /// Key for downloading uploaded control-plane certs; control-plane joins only
    pub certificate_key: Option<String>,
}

/// Random token in kubeadm's `[a-z0-9]{6}.[a-z0-9]{16}` format
pub fn generate_bootstrap_token() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let mut pick = |n: usize| -> String {
        (0..n)
            .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
            .collect()
    };
    let id = pick(6);
    let secret = pick(16);
    format!("{id}.{secret}")
}

/// Point every cluster entry of a kubeconfig at `server`
pub fn rewrite_kubeconfig_server(kubeconfig: &str, server: &str) -> Result<String> {
    let mut doc: serde_yaml::Value = serde_yaml::from_str(kubeconfig)?;
    let clusters = doc
        .get_mut("clusters")
        .and_then(|c| c.as_sequence_mut())
        .ok_or_else(|| Error::serialization_for_kind("kubeconfig", "no clusters entry"))?;
    for entry in clusters.iter_mut() {
        if let Some(cluster) = entry.get_mut("cluster").and_then(|c| c.as_mapping_mut()) {
            cluster.insert(
                serde_yaml::Value::from("server"),
                serde_yaml::Value::from(server),
            );
        }
    }
    Ok(serde_yaml::to_string(&doc)?)
}

/// SANs for the API server certificate
fn cert_sans(cluster: &ClusterSpec) -> Vec<String> {
    let mut sans: Vec<String> = vec!["127.0.0.1".to_string(), "localhost".to_string()];
    if let Some(vip) = cluster.ha.as_ref().and_then(|h| h.vip()) {
        sans.push(vip.to_string());
    }
    sans.extend(cluster.machines.iter().map(|m| m.access.ip.clone()));
    sans.extend(cluster.public_alternative_names.iter().cloned());
    let mut seen = std::collections::HashSet::new();
    sans.retain(|s| seen.insert(s.clone()));
    sans
}

impl Provisioner {
    /// Render the kubeadm init configuration for the first control-plane node
    pub fn render_init_config(&self, job: &NodeJob<'_>, bootstrap_token: &str) -> Result<String> {
        let cluster = job.cluster;
        let endpoint = cluster.control_plane_endpoint().ok_or_else(|| {
            Error::validation_for_field(job.cluster_name, "spec.machines", "no control-plane endpoint")
        })?;
        if minor_version(&cluster.version).is_none() {
            return Err(Error::validation_for_field(
                job.cluster_name,
                "spec.version",
                format!("cannot parse version {}", cluster.version),
            ));
        }

        let local_etcd = cluster.etcd.as_ref().and_then(|e| e.local.as_ref());
        self.templates().render(
            KUBEADM_INIT,
            context! {
                bootstrap_token => bootstrap_token,
                advertise_address => &job.node.ip,
                bind_port => keel_common::DEFAULT_APISERVER_PORT,
                node_name => job.node.hostname.clone(),
                cluster_name => job.cluster_name,
                version => cluster.version.trim_start_matches('v'),
                endpoint => endpoint,
                cluster_cidr => &cluster.cluster_cidr,
                service_cidr => &cluster.service_cidr,
                dns_domain => &cluster.dns_domain,
                cert_sans => cert_sans(cluster),
                api_server_args => &cluster.extra_args.api_server,
                controller_manager_args => &cluster.extra_args.controller_manager,
                scheduler_args => &cluster.extra_args.scheduler,
                external_etcd => cluster.etcd.as_ref().and_then(|e| e.external.clone()),
                local_etcd => local_etcd.is_some(),
                local_etcd_data_dir => local_etcd
                    .and_then(|l| l.data_dir.clone())
                    .unwrap_or_else(|| "/var/lib/etcd".to_string()),
                etcd_cert_sans => local_etcd.map(|l| l.server_cert_sans.clone()).unwrap_or_default(),
                cgroup_driver => cluster.runtime.cgroup_driver(),
                ipvs => cluster.features.ipvs,
            },
        )
    }

    /// Run `kubeadm init` unless the node already has an admin kubeconfig
    #[instrument(skip(self, job, bootstrap_token), fields(host = %job.host()))]
    pub async fn kubeadm_init(&self, job: &NodeJob<'_>, bootstrap_token: &str) -> Result<()> {
        const STEP: &str = "EnsureKubeadmInit";
        if job.role != NodeRole::ControlPlaneInit {
            return Err(Error::internal_with_context(
                "kubeadm-init",
                "kubeadm init requested on a non-init node",
            ));
        }
        if job.exec.exists(ADMIN_CONF).await? {
            info!("admin.conf present, control plane already initialized");
            return Ok(());
        }

        let config = self.render_init_config(job, bootstrap_token)?;
        job.exec
            .write_file(config.as_bytes(), INIT_CONFIG_PATH)
            .await?;

        let mut ignored = vec!["DirAvailable--etc-kubernetes-manifests"];
        let mut command = format!("kubeadm init --config {INIT_CONFIG_PATH} --upload-certs");
        if job
            .cluster
            .etcd
            .as_ref()
            .is_some_and(|e| e.local.is_some())
        {
            // etcd runs from the manifest the addon step rendered
            command.push_str(" --skip-phases=etcd");
            ignored.push("FileAvailable--etc-kubernetes-manifests-etcd.yaml");
            ignored.push("DirAvailable--var-lib-etcd");
        }
        command.push_str(&format!(" --ignore-preflight-errors={}", ignored.join(",")));

        run_streaming(job.exec, STEP, &command).await?;
        info!("control plane initialized");
        Ok(())
    }

    /// Read kubeconfig and PKI off the init node
    #[instrument(skip(self, job), fields(host = %job.host()))]
    pub async fn harvest_credentials(&self, job: &NodeJob<'_>) -> Result<HarvestedCredentials> {
        retry_transient(&self.config().harvest_retry, "harvest-credentials", || {
            self.read_credentials(job)
        })
        .await
    }

    async fn read_credentials(&self, job: &NodeJob<'_>) -> Result<HarvestedCredentials> {
        const STEP: &str = "EnsureCredential";
        let exec = job.exec;

        let admin = run_checked(exec, STEP, &format!("cat {ADMIN_CONF}")).await?.stdout;

        let mut cert_data = BTreeMap::new();
        for file in HARVESTED_PKI {
            let path = format!("{PKI_DIR}/{file}");
            if !exec.exists(&path).await? {
                continue;
            }
            let content = run_checked(exec, STEP, &format!("cat {}", shell_quote(&path)))
                .await?
                .stdout;
            cert_data.insert((*file).to_string(), content);
        }

        let ca_cert = cert_data
            .get("ca.crt")
            .cloned()
            .ok_or_else(|| Error::provisioning(exec.host_identifier(), STEP, "ca.crt missing"))?;
        let ca_key = cert_data
            .get("ca.key")
            .cloned()
            .ok_or_else(|| Error::provisioning(exec.host_identifier(), STEP, "ca.key missing"))?;

        let hash = run_checked(
            exec,
            STEP,
            &format!(
                "openssl x509 -pubkey -in {PKI_DIR}/ca.crt | openssl rsa -pubin -outform der 2>/dev/null \
                 | openssl dgst -sha256 -hex | sed 's/^.* //'"
            ),
        )
        .await?
        .stdout;
        let hash = hash.trim();
        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::provisioning(
                exec.host_identifier(),
                STEP,
                format!("unexpected CA hash output: {hash}"),
            ));
        }

        let endpoint = job
            .cluster
            .control_plane_endpoint()
            .unwrap_or_else(|| format!("{}:{}", job.node.ip, keel_common::DEFAULT_APISERVER_PORT));
        let external = rewrite_kubeconfig_server(&admin, &format!("https://{endpoint}"))?;

        Ok(HarvestedCredentials {
            external_kubeconfig: external,
            admin_kubeconfig: admin,
            ca_cert,
            ca_key,
            etcd_ca_cert: cert_data.get("etcd/ca.crt").cloned(),
            etcd_ca_key: cert_data.get("etcd/ca.key").cloned(),
            ca_cert_hash: format!("sha256:{hash}"),
            cert_data,
        })
    }

    /// Re-upload control-plane certs and return the fresh certificate key
    ///
    /// The key expires two hours after upload, so it is refreshed before
    /// every control-plane join.
    pub async fn upload_certs(&self, exec: &dyn RemoteExecutor) -> Result<String> {
        const STEP: &str = "EnsureJoinControlPlane";
        let output = run_checked(
            exec,
            STEP,
            "kubeadm init phase upload-certs --upload-certs 2>/dev/null | tail -n 1",
        )
        .await?;
        let key = output.stdout.trim().to_string();
        if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::provisioning(
                exec.host_identifier(),
                STEP,
                format!("unexpected certificate key output: {key}"),
            ));
        }
        Ok(key)
    }

    /// Make sure `token` exists on the control plane without expiry
    ///
    /// The token in the init config lives 24h; joins after that need a
    /// non-expiring copy.
    pub async fn ensure_bootstrap_token(&self, exec: &dyn RemoteExecutor, token: &str) -> Result<()> {
        let id = token
            .split_once('.')
            .map(|(id, _)| id)
            .ok_or_else(|| Error::validation("malformed bootstrap token"))?;
        run_checked(
            exec,
            "EnsureCredential",
            &format!(
                "kubeadm token list --kubeconfig {ADMIN_CONF} | grep -q '^{id} ' \
                 || kubeadm token create {token} --ttl 0 --kubeconfig {ADMIN_CONF}"
            ),
        )
        .await?;
        Ok(())
    }

    /// `kubeadm join` unless the node already has a kubelet kubeconfig
    #[instrument(skip(self, job, material), fields(host = %job.host(), role = ?job.role))]
    pub async fn kubeadm_join(&self, job: &NodeJob<'_>, material: &JoinMaterial) -> Result<()> {
        let step = match job.role {
            NodeRole::Worker => "EnsureJoinNode",
            NodeRole::ControlPlane => "EnsureJoinControlPlane",
            NodeRole::ControlPlaneInit => {
                return Err(Error::internal_with_context(
                    "kubeadm-join",
                    "the init node does not join",
                ))
            }
        };
        if job.exec.exists(KUBELET_CONF).await? {
            info!("kubelet.conf present, node already joined");
            return Ok(());
        }
        run_streaming(job.exec, step, &join_command(job, material)?).await?;
        info!("node joined");
        Ok(())
    }
}

fn join_command(job: &NodeJob<'_>, material: &JoinMaterial) -> Result<String> {
    let mut command = format!(
        "kubeadm join {} --token {} --discovery-token-ca-cert-hash {} \
         --cri-socket unix:///run/containerd/containerd.sock",
        material.endpoint, material.token, material.ca_cert_hash
    );
    if job.role == NodeRole::ControlPlane {
        let key = material.certificate_key.as_deref().ok_or_else(|| {
            Error::internal_with_context("kubeadm-join", "control-plane join without certificate key")
        })?;
        command.push_str(&format!(
            " --control-plane --certificate-key {key} --apiserver-advertise-address {}",
            job.node.ip
        ));
        command.push_str(" --ignore-preflight-errors=DirAvailable--etc-kubernetes-manifests");
    }
    if let Some(name) = &job.node.hostname {
        command.push_str(&format!(" --node-name {name}"));
    }
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CommandOutput, MockRemoteExecutor};
    use crate::pipeline::test_support::*;
    use crate::pipeline::NodeInfo;
    use std::sync::{Arc, Mutex};

    const ADMIN: &str = r#"apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: Q0E=
    server: https://10.0.0.1:6443
  name: c1
contexts:
- context:
    cluster: c1
    user: kubernetes-admin
  name: kubernetes-admin@c1
current-context: kubernetes-admin@c1
users:
- name: kubernetes-admin
  user:
    client-certificate-data: Q0VSVA==
    client-key-data: S0VZ
"#;

    const HASH: &str = "5c1c1e7e7b2bd1c8d1ff0b4d0b2e3e0f7a6b5c4d3e2f1a0b9c8d7e6f5a4b3c2d";

    #[test]
    fn test_bootstrap_token_format() {
        let token = generate_bootstrap_token();
        let (id, secret) = token.split_once('.').unwrap();
        assert_eq!(id.len(), 6);
        assert_eq!(secret.len(), 16);
        assert!(token
            .chars()
            .all(|c| c == '.' || c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(token, generate_bootstrap_token());
    }

    #[test]
    fn test_rewrite_kubeconfig_server() {
        let out = rewrite_kubeconfig_server(ADMIN, "https://10.0.0.100:6443").unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&out).unwrap();
        assert_eq!(
            doc["clusters"][0]["cluster"]["server"].as_str(),
            Some("https://10.0.0.100:6443")
        );
        assert_eq!(
            doc["users"][0]["user"]["client-key-data"].as_str(),
            Some("S0VZ")
        );
        assert!(rewrite_kubeconfig_server("kind: Config\n", "https://x").is_err());
    }

    #[test]
    fn test_init_config_render() {
        let exec = MockRemoteExecutor::new();
        let mut spec = cluster_spec();
        spec.features.ipvs = true;
        spec.extra_args
            .api_server
            .insert("audit-log-maxage".to_string(), "30".to_string());
        spec.public_alternative_names = vec!["api.example.com".to_string()];
        let job = NodeJob::new(&exec, "c1", &spec, NodeRole::ControlPlaneInit, node());

        let out = provisioner()
            .render_init_config(&job, "abcdef.0123456789abcdef")
            .unwrap();
        assert!(out.contains("token: \"abcdef.0123456789abcdef\""));
        assert!(out.contains("kubernetesVersion: v1.31.2"));
        assert!(out.contains("controlPlaneEndpoint: 10.0.0.100:6443"));
        assert!(out.contains("podSubnet: 10.244.0.0/16"));
        assert!(out.contains("- api.example.com"));
        assert!(out.contains("audit-log-maxage: \"30\""));
        assert!(out.contains("mode: ipvs"));
        assert!(out.contains("name: cp-1"));
        assert!(out.contains("dataDir: /var/lib/etcd"));

        // every document must parse
        for doc in out.split("\n---\n") {
            let _: serde_yaml::Value = serde_yaml::from_str(doc).unwrap();
        }
    }

    #[tokio::test]
    async fn story_init_skipped_when_admin_conf_exists() {
        let mut exec = MockRemoteExecutor::new();
        host(&mut exec);
        exec.expect_exists()
            .withf(|p| p == ADMIN_CONF)
            .returning(|_| Ok(true));
        exec.expect_execute_streaming().never();
        exec.expect_write_file().never();

        let spec = cluster_spec();
        let job = NodeJob::new(&exec, "c1", &spec, NodeRole::ControlPlaneInit, node());
        provisioner().kubeadm_init(&job, "abcdef.0123456789abcdef").await.unwrap();
    }

    #[tokio::test]
    async fn story_init_with_local_etcd_skips_etcd_phase() {
        let command = Arc::new(Mutex::new(String::new()));
        let c = command.clone();

        let mut exec = MockRemoteExecutor::new();
        host(&mut exec);
        exec.expect_exists().returning(|_| Ok(false));
        exec.expect_write_file()
            .withf(|_, p| p == INIT_CONFIG_PATH)
            .returning(|_, _| Ok(()));
        exec.expect_execute_streaming().returning(move |cmd, _, _| {
            *c.lock().unwrap() = cmd.to_string();
            Ok(0)
        });

        let spec = cluster_spec();
        let job = NodeJob::new(&exec, "c1", &spec, NodeRole::ControlPlaneInit, node());
        provisioner().kubeadm_init(&job, "abcdef.0123456789abcdef").await.unwrap();

        let command = command.lock().unwrap();
        assert!(command.starts_with("kubeadm init --config"));
        assert!(command.contains("--skip-phases=etcd"));
        assert!(command.contains("FileAvailable--etc-kubernetes-manifests-etcd.yaml"));
    }

    #[tokio::test]
    async fn story_harvest_reads_kubeconfig_and_pki() {
        let mut exec = MockRemoteExecutor::new();
        host(&mut exec);
        exec.expect_exists()
            .returning(|p| Ok(!p.contains("front-proxy")));
        exec.expect_execute().returning(|cmd| {
            if cmd == format!("cat {ADMIN_CONF}") {
                Ok(CommandOutput::ok(ADMIN))
            } else if cmd.starts_with("openssl") {
                Ok(CommandOutput::ok(format!("{HASH}\n")))
            } else if let Some(path) = cmd.strip_prefix("cat ") {
                Ok(CommandOutput::ok(format!("PEM {}", path.trim_matches('\''))))
            } else {
                Ok(CommandOutput::failed(127, "unexpected"))
            }
        });

        let spec = cluster_spec();
        let job = NodeJob::new(&exec, "c1", &spec, NodeRole::ControlPlaneInit, node());
        let creds = provisioner().harvest_credentials(&job).await.unwrap();

        assert_eq!(creds.ca_cert_hash, format!("sha256:{HASH}"));
        assert_eq!(creds.ca_cert, "PEM /etc/kubernetes/pki/ca.crt");
        assert_eq!(
            creds.etcd_ca_key.as_deref(),
            Some("PEM /etc/kubernetes/pki/etcd/ca.key")
        );
        assert!(!creds.cert_data.contains_key("front-proxy-ca.crt"));
        assert!(creds.external_kubeconfig.contains("https://10.0.0.100:6443"));
        assert!(creds.admin_kubeconfig.contains("https://10.0.0.1:6443"));
    }

    mod joins {
        use super::*;

        fn material(key: Option<&str>) -> JoinMaterial {
            JoinMaterial {
                endpoint: "10.0.0.100:6443".to_string(),
                token: "abcdef.0123456789abcdef".to_string(),
                ca_cert_hash: format!("sha256:{HASH}"),
                certificate_key: key.map(str::to_string),
            }
        }

        fn worker() -> NodeInfo {
            NodeInfo {
                ip: "10.0.0.20".to_string(),
                ..Default::default()
            }
        }

        #[test]
        fn test_worker_join_command() {
            let exec = MockRemoteExecutor::new();
            let spec = cluster_spec();
            let job = NodeJob::new(&exec, "c1", &spec, NodeRole::Worker, worker());
            let cmd = join_command(&job, &material(None)).unwrap();
            assert!(cmd.starts_with("kubeadm join 10.0.0.100:6443 --token abcdef.0123456789abcdef"));
            assert!(!cmd.contains("--control-plane"));
            assert!(!cmd.contains("--node-name"));
        }

        #[test]
        fn test_control_plane_join_requires_key() {
            let exec = MockRemoteExecutor::new();
            let spec = cluster_spec();
            let job = NodeJob::new(&exec, "c1", &spec, NodeRole::ControlPlane, node());
            assert!(join_command(&job, &material(None)).is_err());

            let cmd = join_command(&job, &material(Some(HASH))).unwrap();
            assert!(cmd.contains(&format!("--control-plane --certificate-key {HASH}")));
            assert!(cmd.contains("--apiserver-advertise-address 10.0.0.1"));
            assert!(cmd.contains("--node-name cp-1"));
        }

        #[tokio::test]
        async fn story_already_joined_node_is_left_alone() {
            let mut exec = MockRemoteExecutor::new();
            host(&mut exec);
            exec.expect_exists()
                .withf(|p| p == KUBELET_CONF)
                .returning(|_| Ok(true));
            exec.expect_execute_streaming().never();

            let spec = cluster_spec();
            let job = NodeJob::new(&exec, "c1", &spec, NodeRole::Worker, worker());
            provisioner()
                .kubeadm_join(&job, &material(None))
                .await
                .unwrap();
        }

        #[tokio::test]
        async fn test_ensure_bootstrap_token_creates_missing_token() {
            let mut exec = MockRemoteExecutor::new();
            host(&mut exec);
            exec.expect_execute()
                .withf(|cmd| {
                    cmd.contains("grep -q '^abcdef '")
                        && cmd.contains("kubeadm token create abcdef.0123456789abcdef --ttl 0")
                })
                .times(1)
                .returning(|_| Ok(CommandOutput::ok("")));
            provisioner()
                .ensure_bootstrap_token(&exec, "abcdef.0123456789abcdef")
                .await
                .unwrap();

            assert!(provisioner()
                .ensure_bootstrap_token(&MockRemoteExecutor::new(), "nodot")
                .await
                .is_err());
        }

        #[tokio::test]
        async fn test_upload_certs_validates_output() {
            let mut exec = MockRemoteExecutor::new();
            host(&mut exec);
            exec.expect_execute()
                .times(1)
                .returning(|_| Ok(CommandOutput::ok(format!("{HASH}\n"))));
            assert_eq!(provisioner().upload_certs(&exec).await.unwrap(), HASH);

            let mut exec = MockRemoteExecutor::new();
            host(&mut exec);
            exec.expect_execute()
                .returning(|_| Ok(CommandOutput::ok("error: timed out\n")));
            assert!(provisioner().upload_certs(&exec).await.is_err());
        }
    }
}
