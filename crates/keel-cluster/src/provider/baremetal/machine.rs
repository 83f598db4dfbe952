use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use keel_common::crd::{
    add_address, set_condition, Address, AddressType, Condition, Machine,
    MachinePhase, MachineStatus,
};
use keel_common::{Error, Result};
use keel_node::{NodeInfo, NodeJob, NodeRole};

use super::cluster::join_material;
use super::{first_incomplete, BaremetalProvider, Stage, FAILED_REASON};
use crate::provider::{ClusterContext, MachineProvisioner};

/// Machine handlers, recorded as Conditions of the same name
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineStep {
    /// Reach the machine and record its system info
    Preflight,
    /// Swap, firewall, kernel modules, sysctl
    SystemPrep,
    /// containerd
    ContainerRuntime,
    /// kubelet, kubeadm, kubectl, CNI plugins
    KubernetesBinaries,
    /// `kubeadm join` as a worker
    JoinNode,
    /// Publish the machine's address
    NodeComplete,
    /// Periodic health probe of a Running machine
    HealthCheck,
}

impl MachineStep {
    /// Handlers run while Initializing, in order
    pub const CREATE: [MachineStep; 6] = [
        MachineStep::Preflight,
        MachineStep::SystemPrep,
        MachineStep::ContainerRuntime,
        MachineStep::KubernetesBinaries,
        MachineStep::JoinNode,
        MachineStep::NodeComplete,
    ];

    /// Handlers run while Running, in order
    pub const UPDATE: [MachineStep; 1] = [MachineStep::HealthCheck];

    /// Condition type recording this handler
    pub fn condition_type(self) -> &'static str {
        match self {
            MachineStep::Preflight => "EnsurePreflight",
            MachineStep::SystemPrep => "EnsureSystemPrep",
            MachineStep::ContainerRuntime => "EnsureContainerRuntime",
            MachineStep::KubernetesBinaries => "EnsureKubernetesBinaries",
            MachineStep::JoinNode => "EnsureJoinNode",
            MachineStep::NodeComplete => "EnsureNodeComplete",
            MachineStep::HealthCheck => "EnsureHealthCheck",
        }
    }
}

fn machine_status(machine: &mut Machine) -> &mut MachineStatus {
    machine.status.get_or_insert_with(Default::default)
}

fn worker_node(machine: &Machine) -> NodeInfo {
    NodeInfo {
        ip: machine.spec.machine.ip.clone(),
        hostname: Some(machine.name_any()),
        labels: machine.spec.labels.clone(),
        taints: machine.spec.taints.clone(),
    }
}

impl BaremetalProvider {
    async fn run_machine_steps(
        &self,
        steps: &[MachineStep],
        ctx: &ClusterContext,
        machine: &mut Machine,
    ) -> Result<()> {
        for step in steps {
            let result = self.run_machine_step(*step, ctx, machine).await;
            let condition = match &result {
                Ok(()) => Condition::success(step.condition_type()),
                Err(e) => Condition::failure(step.condition_type(), FAILED_REASON, e.to_string()),
            };
            set_condition(&mut machine_status(machine).conditions, condition);
            if let Err(e) = result {
                warn!(
                    machine = %machine.name_any(),
                    step = step.condition_type(),
                    error = %e,
                    "handler failed"
                );
                return Err(e);
            }
            info!(machine = %machine.name_any(), step = step.condition_type(), "handler complete");
        }
        Ok(())
    }

    async fn run_machine_step(
        &self,
        step: MachineStep,
        ctx: &ClusterContext,
        machine: &mut Machine,
    ) -> Result<()> {
        let name = ctx.name();
        let spec = &ctx.cluster.spec;
        let access = machine.spec.machine.clone();
        let node = worker_node(machine);
        match step {
            MachineStep::Preflight => {
                access.validate().map_err(|e| {
                    Error::validation_for_field(machine.name_any(), "spec.machine", e)
                })?;
                let _permit = self.permit().await?;
                let exec = self.connect(&access).await?;
                let info = self.provisioner.system_info(exec.as_ref()).await?;
                machine_status(machine).machine_info = Some(info);
                Ok(())
            }
            MachineStep::SystemPrep
            | MachineStep::ContainerRuntime
            | MachineStep::KubernetesBinaries => {
                let stage = match step {
                    MachineStep::SystemPrep => Stage::SystemPrep,
                    MachineStep::ContainerRuntime => Stage::ContainerRuntime,
                    _ => Stage::KubernetesBinaries,
                };
                self.run_stage(stage, &name, spec, &access, NodeRole::Worker, node)
                    .await
            }
            MachineStep::JoinNode => {
                let material = join_material(ctx)?;
                let _permit = self.permit().await?;
                let exec = self.connect(&access).await?;
                let job = NodeJob::new(exec.as_ref(), &name, spec, NodeRole::Worker, node);
                self.provisioner.kubeadm_join(&job, &material).await
            }
            MachineStep::NodeComplete => {
                let port = i32::from(access.port);
                add_address(
                    &mut machine_status(machine).addresses,
                    Address::new(AddressType::Internal, &access.ip, port),
                );
                Ok(())
            }
            MachineStep::HealthCheck => {
                let _permit = self.permit().await?;
                let exec = self.connect(&access).await?;
                if !self.provisioner.probe_kubelet(exec.as_ref()).await? {
                    return Err(Error::provisioning(
                        &access.ip,
                        step.condition_type(),
                        "kubelet is not active",
                    ));
                }
                if let Some(manager) = &ctx.manager {
                    let hostname = machine.name_any();
                    let registered = manager
                        .nodes()
                        .iter()
                        .any(|n| n.name_any() == hostname);
                    if !registered {
                        warn!(machine = %hostname, "node not yet visible in cluster");
                    }
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MachineProvisioner for BaremetalProvider {
    #[instrument(skip(self, ctx, machine), fields(machine = %machine.name_any()))]
    async fn on_create(&self, ctx: &mut ClusterContext, machine: &mut Machine) -> Result<()> {
        let types: Vec<&str> = MachineStep::CREATE
            .iter()
            .map(|s| s.condition_type())
            .collect();
        let start = first_incomplete(&types, &machine_status(machine).conditions);
        self.run_machine_steps(&MachineStep::CREATE[start..], ctx, machine)
            .await?;

        if first_incomplete(&types, &machine_status(machine).conditions) == types.len() {
            let status = machine_status(machine);
            if status.phase != Some(MachinePhase::Running) {
                info!("machine joined");
                status.phase = Some(MachinePhase::Running);
            }
        }
        Ok(())
    }

    async fn on_update(&self, ctx: &mut ClusterContext, machine: &mut Machine) -> Result<()> {
        self.run_machine_steps(&MachineStep::UPDATE, ctx, machine)
            .await
    }
}
