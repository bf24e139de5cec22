#![allow(dead_code)]

use std::rc::Rc;

use nodeup::api::{
    Cluster, ClusterSpec, InstanceGroup, InstanceGroupRole, InstanceGroupSpec, KubeProxyConfig,
    NodeupConfig, ObjectMeta,
};
use nodeup::assets::AssetStore;
use nodeup::distro::Distribution;
use nodeup::environment::EnvironmentSnapshot;
use nodeup::model::{NodeupModelContext, KUBERNETES_CA};
use nodeup::pki::{issue, CertType, InMemoryKeystore, Keyset, KeysetItem, Subject};
use nodeup::resource::Resource;
use nodeup::tasks::{File, Service, Task, TaskId, TaskSet};

pub const CLUSTER_NAME: &str = "example.k8s.local";
pub const NODE_NAME: &str = "ip-10-0-0-1.ec2.internal";

/// A self-signed CA with its key.
pub fn ca(common_name: &str) -> KeysetItem {
    let issued = issue("ca", CertType::Ca, &Subject::common_name(common_name), &[], None).unwrap();
    KeysetItem {
        id: "1".to_string(),
        certificate: issued.certificate,
        private_key: Some(issued.private_key),
        distrust_timestamp: None,
    }
}

pub fn keystore() -> InMemoryKeystore {
    let mut keystore = InMemoryKeystore::new();
    for name in &[KUBERNETES_CA, "service-account", "kubelet", "kube-proxy"] {
        keystore.insert_keyset(*name, Keyset::single(ca(name)));
    }
    keystore
}

pub fn cluster_spec(cloud: &str) -> ClusterSpec {
    ClusterSpec {
        cloud_provider: cloud.to_string(),
        kubernetes_version: "1.22.4".to_string(),
        network_cidr: "10.0.0.0/16".to_string(),
        non_masquerade_cidr: "100.64.0.0/10".to_string(),
        service_cluster_ip_range: "100.64.0.0/13".to_string(),
        ..Default::default()
    }
}

/// A model with the binaries every node needs staged.
pub fn model(
    spec: ClusterSpec,
    role: InstanceGroupRole,
    distribution: Distribution,
    nodeup_config: NodeupConfig,
) -> NodeupModelContext {
    let cluster = Cluster {
        metadata: ObjectMeta {
            name: CLUSTER_NAME.to_string(),
        },
        spec,
    };
    let instance_group = InstanceGroup {
        metadata: ObjectMeta {
            name: "nodes".to_string(),
        },
        spec: InstanceGroupSpec {
            role,
            ..Default::default()
        },
    };
    let mut assets = AssetStore::new("/var/cache/nodeup");
    for key in &[
        "kubelet",
        "kubectl",
        "containerd-1.6.8/bin/containerd",
        "containerd-1.6.8/bin/ctr",
        "runc.amd64",
        "cni-plugins-linux-amd64-v1.2.0/bridge",
    ] {
        assets.add_file(*key, format!("/var/cache/nodeup/{}", key), None);
    }
    NodeupModelContext::new(
        cluster,
        instance_group,
        nodeup_config,
        distribution,
        Rc::new(keystore()),
        assets,
        EnvironmentSnapshot::default(),
    )
    .unwrap()
    .with_node_name(NODE_NAME)
}

/// A worker that fetches its kubelet credential from the controller.
pub fn bootstrapping_worker(cloud: &str) -> NodeupModelContext {
    let mut spec = cluster_spec(cloud);
    spec.kube_proxy = Some(KubeProxyConfig {
        enabled: Some(false),
        ..Default::default()
    });
    let config = NodeupConfig {
        use_kops_controller_for_node_bootstrap: true,
        ..Default::default()
    };
    model(spec, InstanceGroupRole::Node, Distribution::Debian12, config)
}

pub fn file<'a>(tasks: &'a TaskSet, path: &str) -> &'a File {
    match tasks.get(&TaskId::new("File", path)) {
        Some(Task::File(f)) => f,
        other => panic!("no file task for {}: {:?}", path, other),
    }
}

pub fn contents(tasks: &TaskSet, path: &str) -> String {
    file(tasks, path)
        .contents
        .as_ref()
        .map(Resource::open_string)
        .unwrap()
        .unwrap()
}

pub fn service<'a>(tasks: &'a TaskSet, name: &str) -> &'a Service {
    match tasks.get(&TaskId::new("Service", name)) {
        Some(Task::Service(s)) => s,
        other => panic!("no service {}: {:?}", name, other),
    }
}
