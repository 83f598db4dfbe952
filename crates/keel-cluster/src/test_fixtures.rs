//! Sample objects and executor mocks shared by unit tests

use std::path::Path;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use mockall::mock;
use tokio::sync::mpsc;

use keel_common::crd::{
    Cluster, ClusterCredential, ClusterCredentialSpec, ClusterMachine, ClusterSpec, HaSpec,
    KubeVipHa, Machine, MachineAccess, MachineSpec,
};
use keel_common::Result;
use keel_node::{CommandOutput, ExecutorFactory, NodeTarget, RemoteExecutor};

use crate::registry::{ManagedCluster, ManagerConnector};

mock! {
    pub Remote {}

    #[async_trait::async_trait]
    impl RemoteExecutor for Remote {
        async fn execute(&self, command: &str) -> Result<CommandOutput>;
        async fn execute_streaming(
            &self,
            command: &str,
            stdout: mpsc::Sender<String>,
            stderr: mpsc::Sender<String>,
        ) -> Result<u32>;
        async fn write_file(&self, content: &[u8], remote_path: &str) -> Result<()>;
        async fn copy_file(&self, local_path: &Path, remote_path: &str) -> Result<()>;
        async fn exists(&self, remote_path: &str) -> Result<bool>;
        fn host_identifier(&self) -> String;
    }
}

mock! {
    pub Connector {}

    #[async_trait::async_trait]
    impl ExecutorFactory for Connector {
        async fn connect(&self, target: &NodeTarget) -> Result<Arc<dyn RemoteExecutor>>;
    }
}

mock! {
    pub Managed {}

    #[async_trait::async_trait]
    impl ManagedCluster for Managed {
        fn name(&self) -> String;
        fn nodes(&self) -> Vec<Node>;
        async fn server_version(&self) -> Result<String>;
    }
}

mock! {
    pub Managers {}

    #[async_trait::async_trait]
    impl ManagerConnector for Managers {
        async fn connect(&self, name: &str, kubeconfig: &str) -> Result<Arc<dyn ManagedCluster>>;
    }
}

/// Connector handing out inert handles for any cluster
pub fn inert_managers() -> MockManagers {
    let mut managers = MockManagers::new();
    managers
        .expect_connect()
        .returning(|_, _| Ok(Arc::new(MockManaged::new()) as Arc<dyn ManagedCluster>));
    managers
}

pub fn access(ip: &str) -> MachineAccess {
    MachineAccess {
        ip: ip.to_string(),
        port: 22,
        username: "root".to_string(),
        password: Some("secret".to_string()),
        ..Default::default()
    }
}

/// A valid single-node Baremetal cluster with a kube-vip VIP
pub fn sample_cluster(name: &str) -> Cluster {
    Cluster::new(
        name,
        ClusterSpec {
            tenant_id: "t1".to_string(),
            cluster_type: "Baremetal".to_string(),
            version: "1.31.2".to_string(),
            network_device: Some("eth0".to_string()),
            cluster_cidr: "10.244.0.0/16".to_string(),
            service_cidr: "10.96.0.0/16".to_string(),
            dns_domain: "cluster.local".to_string(),
            machines: vec![ClusterMachine {
                access: access("10.0.0.1"),
                ..Default::default()
            }],
            ha: Some(HaSpec {
                kube_vip: Some(KubeVipHa {
                    vip: "10.0.0.100".to_string(),
                    image: None,
                }),
                third_party: None,
            }),
            ..Default::default()
        },
    )
}

pub fn sample_credential(cluster_name: &str) -> ClusterCredential {
    ClusterCredential::new(
        cluster_name,
        ClusterCredentialSpec::for_cluster(cluster_name, "t1"),
    )
}

pub fn sample_machine(name: &str, cluster_name: &str) -> Machine {
    Machine::new(
        name,
        MachineSpec {
            cluster_name: cluster_name.to_string(),
            tenant_id: "t1".to_string(),
            machine: access("10.0.0.20"),
            ..Default::default()
        },
    )
}
