use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use keel_common::crd::{
    add_address, remove_addresses, select_host, set_condition, Address, AddressType,
    ClusterMachine, ClusterPhase, Condition, ADMIN_KUBECONFIG_KEY, EXTERNAL_KUBECONFIG_KEY,
};
use keel_common::{Error, Result, DEFAULT_APISERVER_PORT};
use keel_node::{generate_bootstrap_token, JoinMaterial, NodeJob, NodeRole};

use super::{
    control_plane_node, dns_service_ip, first_incomplete, BaremetalProvider, Stage, BAREMETAL,
    CA_CERT_HASH_KEY, FAILED_REASON,
};
use crate::provider::{ClusterContext, ClusterProvisioner};
use crate::registry::summarize_nodes;

/// Cluster handlers, recorded as Conditions of the same name
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterStep {
    /// Validate the spec and reach every control-plane machine
    Preflight,
    /// Swap, firewall, kernel modules, sysctl
    SystemPrep,
    /// containerd
    ContainerRuntime,
    /// kubelet, kubeadm, kubectl, CNI plugins
    KubernetesBinaries,
    /// kube-vip and local etcd static pods
    Addons,
    /// `kubeadm init` on the first control-plane machine
    KubeadmInit,
    /// Harvest kubeconfig and PKI into the credential record
    Credential,
    /// `kubeadm join --control-plane` on the remaining machines
    JoinControlPlane,
    /// Publish addresses and cluster info
    ClusterComplete,
    /// Periodic health probe of a Running cluster
    HealthCheck,
}

impl ClusterStep {
    /// Handlers run while Initializing, in order
    pub const CREATE: [ClusterStep; 9] = [
        ClusterStep::Preflight,
        ClusterStep::SystemPrep,
        ClusterStep::ContainerRuntime,
        ClusterStep::KubernetesBinaries,
        ClusterStep::Addons,
        ClusterStep::KubeadmInit,
        ClusterStep::Credential,
        ClusterStep::JoinControlPlane,
        ClusterStep::ClusterComplete,
    ];

    /// Handlers run while Running, in order
    pub const UPDATE: [ClusterStep; 1] = [ClusterStep::HealthCheck];

    /// Condition type recording this handler
    pub fn condition_type(self) -> &'static str {
        match self {
            ClusterStep::Preflight => "EnsurePreflight",
            ClusterStep::SystemPrep => "EnsureSystemPrep",
            ClusterStep::ContainerRuntime => "EnsureContainerRuntime",
            ClusterStep::KubernetesBinaries => "EnsureKubernetesBinaries",
            ClusterStep::Addons => "EnsureAddons",
            ClusterStep::KubeadmInit => "EnsureKubeadmInit",
            ClusterStep::Credential => "EnsureCredential",
            ClusterStep::JoinControlPlane => "EnsureJoinControlPlane",
            ClusterStep::ClusterComplete => "EnsureClusterComplete",
            ClusterStep::HealthCheck => "EnsureHealthCheck",
        }
    }
}

fn create_types() -> Vec<&'static str> {
    ClusterStep::CREATE.iter().map(|s| s.condition_type()).collect()
}

impl BaremetalProvider {
    async fn run_cluster_steps(
        &self,
        steps: &[ClusterStep],
        ctx: &mut ClusterContext,
    ) -> Result<()> {
        for step in steps {
            let result = self.run_cluster_step(*step, ctx).await;
            let condition = match &result {
                Ok(()) => Condition::success(step.condition_type()),
                Err(e) => Condition::failure(step.condition_type(), FAILED_REASON, e.to_string()),
            };
            set_condition(&mut ctx.status_mut().conditions, condition);
            if let Err(e) = result {
                warn!(
                    cluster = %ctx.name(),
                    step = step.condition_type(),
                    error = %e,
                    "handler failed"
                );
                return Err(e);
            }
            info!(cluster = %ctx.name(), step = step.condition_type(), "handler complete");
        }
        Ok(())
    }

    async fn run_cluster_step(&self, step: ClusterStep, ctx: &mut ClusterContext) -> Result<()> {
        let name = ctx.name();
        let spec = &ctx.cluster.spec;
        match step {
            ClusterStep::Preflight => {
                spec.validate()?;
                self.run_stage_on_control_plane(Stage::Preflight, &name, spec)
                    .await
            }
            ClusterStep::SystemPrep => {
                self.run_stage_on_control_plane(Stage::SystemPrep, &name, spec)
                    .await
            }
            ClusterStep::ContainerRuntime => {
                self.run_stage_on_control_plane(Stage::ContainerRuntime, &name, spec)
                    .await
            }
            ClusterStep::KubernetesBinaries => {
                self.run_stage_on_control_plane(Stage::KubernetesBinaries, &name, spec)
                    .await
            }
            ClusterStep::Addons => {
                self.run_stage_on_control_plane(Stage::Addons, &name, spec)
                    .await
            }
            ClusterStep::KubeadmInit => self.kubeadm_init(ctx).await,
            ClusterStep::Credential => self.harvest(ctx).await,
            ClusterStep::JoinControlPlane => self.join_control_plane(ctx).await,
            ClusterStep::ClusterComplete => self.complete(ctx).await,
            ClusterStep::HealthCheck => self.health_check(ctx).await,
        }
    }

    async fn kubeadm_init(&self, ctx: &mut ClusterContext) -> Result<()> {
        let name = ctx.name();
        // the token must be in the credential before init bakes it into the node
        let token = ctx
            .credential
            .spec
            .bootstrap_token
            .get_or_insert_with(generate_bootstrap_token)
            .clone();

        let spec = &ctx.cluster.spec;
        let machine = init_machine(&name, ctx)?;
        let _permit = self.permit().await?;
        let exec = self.connect(&machine.access).await?;
        let job = NodeJob::new(
            exec.as_ref(),
            &name,
            spec,
            NodeRole::ControlPlaneInit,
            control_plane_node(machine),
        );
        self.provisioner.kubeadm_init(&job, &token).await
    }

    async fn harvest(&self, ctx: &mut ClusterContext) -> Result<()> {
        let name = ctx.name();
        let machine = init_machine(&name, ctx)?.clone();
        let token = ctx
            .credential
            .spec
            .bootstrap_token
            .clone()
            .ok_or_else(|| Error::provider_for(&name, BAREMETAL, "no bootstrap token recorded"))?;

        let harvested = {
            let _permit = self.permit().await?;
            let exec = self.connect(&machine.access).await?;
            let job = NodeJob::new(
                exec.as_ref(),
                &name,
                &ctx.cluster.spec,
                NodeRole::ControlPlaneInit,
                control_plane_node(&machine),
            );
            let harvested = self.provisioner.harvest_credentials(&job).await?;
            self.provisioner
                .ensure_bootstrap_token(exec.as_ref(), &token)
                .await?;
            harvested
        };

        let credential = &mut ctx.credential.spec;
        credential.ca_cert = Some(harvested.ca_cert);
        credential.ca_key = Some(harvested.ca_key);
        credential.etcd_ca_cert = harvested.etcd_ca_cert;
        credential.etcd_ca_key = harvested.etcd_ca_key;
        credential.cert_data = harvested.cert_data;
        credential
            .kube_data
            .insert(ADMIN_KUBECONFIG_KEY.to_string(), harvested.admin_kubeconfig);
        credential
            .kube_data
            .insert(EXTERNAL_KUBECONFIG_KEY.to_string(), harvested.external_kubeconfig);
        credential
            .extra_data
            .insert(CA_CERT_HASH_KEY.to_string(), harvested.ca_cert_hash);
        info!(cluster = %name, "credentials harvested");
        Ok(())
    }

    async fn join_control_plane(&self, ctx: &mut ClusterContext) -> Result<()> {
        let name = ctx.name();
        let spec = &ctx.cluster.spec;
        if spec.machines.len() < 2 {
            return Ok(());
        }
        let mut material = join_material(ctx)?;
        let init = init_machine(&name, ctx)?;

        // joins go one at a time so etcd membership changes never overlap
        for machine in &spec.machines[1..] {
            let _permit = self.permit().await?;
            let init_exec = self.connect(&init.access).await?;
            let key = self.provisioner.upload_certs(init_exec.as_ref()).await?;
            material.certificate_key = Some(key);

            let exec = self.connect(&machine.access).await?;
            let job = NodeJob::new(
                exec.as_ref(),
                &name,
                spec,
                NodeRole::ControlPlane,
                control_plane_node(machine),
            );
            self.provisioner.kubeadm_join(&job, &material).await?;
        }
        Ok(())
    }

    async fn complete(&self, ctx: &mut ClusterContext) -> Result<()> {
        let name = ctx.name();
        let spec = ctx.cluster.spec.clone();

        let status = ctx.status_mut();
        for type_ in [AddressType::Real, AddressType::Advertise, AddressType::Public] {
            remove_addresses(&mut status.addresses, type_);
        }
        for machine in &spec.machines {
            add_address(
                &mut status.addresses,
                Address::new(AddressType::Real, &machine.access.ip, DEFAULT_APISERVER_PORT),
            );
        }
        let port = spec.ha.as_ref().map_or(DEFAULT_APISERVER_PORT, |ha| ha.vport());
        if let Some(vip) = spec.ha.as_ref().and_then(|ha| ha.vip()) {
            add_address(
                &mut status.addresses,
                Address::new(AddressType::Advertise, vip, port),
            );
        }
        for san in &spec.public_alternative_names {
            add_address(
                &mut status.addresses,
                Address::new(AddressType::Public, san, port),
            );
        }
        status.dns_ip = dns_service_ip(&spec.service_cidr);
        status.version = Some(spec.version.clone());
        let endpoint = select_host(&status.addresses)
            .map(|a| format!("{}:{}", a.host, a.port))
            .map_err(|e| Error::provider_permanent(&name, BAREMETAL, e.to_string()))?;

        let mut info = BTreeMap::from([
            ("endpoint".to_string(), endpoint),
            ("version".to_string(), spec.version.clone()),
        ]);
        if let Some(ca) = &ctx.credential.spec.ca_cert {
            info.insert("ca.crt".to_string(), ca.clone());
        }
        self.store
            .apply_cluster_config_map(&name, &format!("{name}-cluster-info"), info)
            .await
    }

    #[instrument(skip(self, ctx), fields(cluster = %ctx.name()))]
    async fn health_check(&self, ctx: &mut ClusterContext) -> Result<()> {
        let name = ctx.name();
        for machine in &ctx.cluster.spec.machines {
            let _permit = self.permit().await?;
            let exec = self.connect(&machine.access).await?;
            if !self.provisioner.probe_kubelet(exec.as_ref()).await? {
                return Err(Error::provisioning(
                    &machine.access.ip,
                    ClusterStep::HealthCheck.condition_type(),
                    "kubelet is not active",
                ));
            }
        }

        if let Some(manager) = ctx.manager.clone() {
            let version = manager.server_version().await?;
            let resource = summarize_nodes(&manager.nodes());
            let status = ctx.status_mut();
            status.version = Some(version);
            status.resource = resource;
        } else {
            warn!(cluster = %name, "no cluster manager registered, skipping node summary");
        }
        Ok(())
    }
}

fn init_machine<'a>(name: &str, ctx: &'a ClusterContext) -> Result<&'a ClusterMachine> {
    ctx.cluster
        .spec
        .init_machine()
        .ok_or_else(|| Error::provider_permanent(name, BAREMETAL, "cluster has no machines"))
}

/// Join material from the credential record
pub(super) fn join_material(ctx: &ClusterContext) -> Result<JoinMaterial> {
    let name = ctx.name();
    let credential = &ctx.credential.spec;
    let endpoint = ctx.cluster.spec.control_plane_endpoint().ok_or_else(|| {
        Error::provider_permanent(&name, BAREMETAL, "no control-plane endpoint")
    })?;
    let token = credential
        .bootstrap_token
        .clone()
        .ok_or_else(|| Error::provider_for(&name, BAREMETAL, "no bootstrap token recorded"))?;
    let ca_cert_hash = credential
        .extra_data
        .get(CA_CERT_HASH_KEY)
        .cloned()
        .ok_or_else(|| Error::provider_for(&name, BAREMETAL, "no CA cert hash recorded"))?;
    Ok(JoinMaterial {
        endpoint,
        token,
        ca_cert_hash,
        certificate_key: None,
    })
}

#[async_trait]
impl ClusterProvisioner for BaremetalProvider {
    #[instrument(skip(self, ctx), fields(cluster = %ctx.name()))]
    async fn on_create(&self, ctx: &mut ClusterContext) -> Result<()> {
        let types = create_types();
        let start = first_incomplete(&types, &ctx.status_mut().conditions);
        if start < ClusterStep::CREATE.len() {
            info!(from = types[start], "resuming cluster bring-up");
        }
        self.run_cluster_steps(&ClusterStep::CREATE[start..], ctx)
            .await?;

        if first_incomplete(&types, &ctx.status_mut().conditions) == types.len() {
            let status = ctx.status_mut();
            if status.phase != Some(ClusterPhase::Running) {
                info!("cluster bring-up complete");
                status.phase = Some(ClusterPhase::Running);
            }
        }
        Ok(())
    }

    async fn on_update(&self, ctx: &mut ClusterContext) -> Result<()> {
        self.run_cluster_steps(&ClusterStep::UPDATE, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use keel_common::crd::{find_condition, ClusterCredential, ClusterCredentialSpec};
    use keel_node::NodeTarget;

    use super::super::test_support::*;
    use super::*;
    use crate::store::MockClusterStore;
    use crate::test_fixtures::sample_cluster;

    fn context(machines: &[&str]) -> ClusterContext {
        let mut cluster = sample_cluster("c1");
        cluster.spec.machines = machines
            .iter()
            .map(|ip| ClusterMachine {
                access: keel_common::crd::MachineAccess {
                    ip: ip.to_string(),
                    password: Some("pw".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .collect();
        let credential = ClusterCredential::new("c1", ClusterCredentialSpec::for_cluster("c1", "t1"));
        ClusterContext::new(cluster, credential)
    }

    fn condition_types(ctx: &ClusterContext) -> Vec<String> {
        ctx.cluster
            .status
            .as_ref()
            .map(|s| s.conditions.iter().map(|c| c.type_.clone()).collect())
            .unwrap_or_default()
    }

    /// A fresh cluster on already-provisioned nodes walks every create
    /// handler in order, harvests credentials and ends Running.
    #[tokio::test]
    async fn story_fresh_cluster_runs_every_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut store = MockClusterStore::new();
        store
            .expect_apply_cluster_config_map()
            .withf(|cluster, name, data| {
                cluster == "c1"
                    && name == "c1-cluster-info"
                    && data.contains_key("ca.crt")
                    && data["endpoint"] == "10.0.0.100:6443"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let provider = provider(connector(log.clone()), store);

        let mut ctx = context(&["10.0.0.1", "10.0.0.2"]);
        provider.on_create(&mut ctx).await.unwrap();

        let expected: Vec<String> = create_types().iter().map(|t| t.to_string()).collect();
        assert_eq!(condition_types(&ctx), expected);
        let status = ctx.cluster.status.as_ref().unwrap();
        assert_eq!(status.phase, Some(ClusterPhase::Running));
        assert!(status.conditions.iter().all(Condition::is_true));
        assert_eq!(status.dns_ip.as_deref(), Some("10.96.0.10"));
        assert!(status
            .addresses
            .contains(&Address::new(AddressType::Advertise, "10.0.0.100", 6443)));

        let credential = &ctx.credential.spec;
        assert!(credential.bootstrap_token.is_some());
        assert!(credential.external_kubeconfig().is_some());
        assert_eq!(
            credential.extra_data[CA_CERT_HASH_KEY],
            format!("sha256:{}", "ab".repeat(32))
        );

        // the second control-plane machine joined with a fresh certificate key
        let log = log.lock().unwrap();
        assert!(log.iter().any(|l| l == "connect 10.0.0.2"));
        assert!(log.iter().any(|l| l.contains("upload-certs")));
    }

    /// After a failure the next pass starts at the failed handler: completed
    /// handlers are not re-run.
    #[tokio::test]
    async fn story_resume_from_first_incomplete_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let provider = provider(connector(log.clone()), permissive_store());

        let mut ctx = context(&["10.0.0.1"]);
        ctx.credential.spec.bootstrap_token = Some("abcdef.0123456789abcdef".to_string());
        {
            let conditions = &mut ctx.status_mut().conditions;
            for step in &ClusterStep::CREATE[..6] {
                set_condition(conditions, Condition::success(step.condition_type()));
            }
            set_condition(
                conditions,
                Condition::failure("EnsureCredential", FAILED_REASON, "timed out"),
            );
        }

        provider.on_create(&mut ctx).await.unwrap();

        let log = log.lock().unwrap();
        // no pipeline work: preflight would have run `hostname; uname ...`
        assert!(!log.iter().any(|l| l.contains("hostname;")));
        assert!(log.iter().any(|l| l.contains("cat /etc/kubernetes/admin.conf")));
        assert!(find_condition(&ctx.status_mut().conditions, "EnsureCredential")
            .unwrap()
            .is_true());
        // the token recorded before the failure is reused
        assert_eq!(
            ctx.credential.spec.bootstrap_token.as_deref(),
            Some("abcdef.0123456789abcdef")
        );
    }

    /// A failing handler records a False condition and stops the pass;
    /// later handlers never run.
    #[tokio::test]
    async fn story_failure_stops_the_pass() {
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|target: &NodeTarget| {
            Err(Error::remote(&target.host, "connection refused"))
        });
        let provider = provider(connector, MockClusterStore::new());

        let mut ctx = context(&["10.0.0.1"]);
        let err = provider.on_create(&mut ctx).await.unwrap_err();
        assert!(err.is_retryable());

        assert_eq!(condition_types(&ctx), vec!["EnsurePreflight".to_string()]);
        let preflight = &ctx.cluster.status.as_ref().unwrap().conditions[0];
        assert!(preflight.is_false());
        assert_eq!(preflight.reason, FAILED_REASON);
        assert!(preflight.message.contains("connection refused"));
        assert_eq!(ctx.cluster.status.as_ref().unwrap().phase, None);
    }

    #[tokio::test]
    async fn test_preflight_rejects_invalid_spec() {
        let provider = provider(MockConnector::new(), MockClusterStore::new());
        let mut ctx = context(&[]);
        let err = provider.on_create(&mut ctx).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(find_condition(&ctx.status_mut().conditions, "EnsurePreflight")
            .unwrap()
            .is_false());
    }

    #[tokio::test]
    async fn test_health_check_flags_inactive_kubelet() {
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|target| {
            let mut exec = MockRemote::new();
            let host = target.host.clone();
            exec.expect_host_identifier().returning(move || host.clone());
            exec.expect_execute()
                .returning(|_| Ok(keel_node::CommandOutput::failed(3, "")));
            Ok(Arc::new(exec) as Arc<dyn keel_node::RemoteExecutor>)
        });
        let provider = provider(connector, MockClusterStore::new());

        let mut ctx = context(&["10.0.0.1"]);
        assert!(provider.on_update(&mut ctx).await.is_err());
        let check = find_condition(&ctx.status_mut().conditions, "EnsureHealthCheck").unwrap();
        assert!(check.is_false());
        assert!(check.message.contains("kubelet is not active"));
    }

    #[test]
    fn test_join_material_requires_harvested_credentials() {
        let mut ctx = context(&["10.0.0.1"]);
        assert!(join_material(&ctx).is_err());

        ctx.credential.spec.bootstrap_token = Some("abcdef.0123456789abcdef".to_string());
        ctx.credential
            .spec
            .extra_data
            .insert(CA_CERT_HASH_KEY.to_string(), "sha256:00".to_string());
        let material = join_material(&ctx).unwrap();
        assert_eq!(material.endpoint, "10.0.0.100:6443");
        assert!(material.certificate_key.is_none());
    }
}
