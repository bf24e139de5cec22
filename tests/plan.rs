mod support;

use std::collections::BTreeMap;

use nodeup::api::{
    AzureSpec, CloudConfiguration, CloudControllerManagerConfig, ClusterSubnetSpec,
    FileAssetSpec, InstanceGroupRole, NodeupConfig,
};
use nodeup::builders::build_tasks;
use nodeup::distro::Distribution;
use nodeup::graph::{is_os_directory, resolve};
use nodeup::model::BOOTSTRAP_KUBECONFIG_PATH;
use nodeup::systemd;
use nodeup::tasks::{FileType, Task, TaskId};

use support::{bootstrapping_worker, cluster_spec, contents, file, model, service};

#[test]
fn azure_cloud_config() {
    let mut spec = cluster_spec("azure");
    spec.network_id = "test-vnet".to_string();
    spec.subnets = vec![ClusterSubnetSpec {
        name: "test-subnet".to_string(),
        region: "eastus".to_string(),
        ..Default::default()
    }];
    spec.cloud_config = Some(CloudConfiguration {
        azure: Some(AzureSpec {
            subscription_id: "subID".to_string(),
            tenant_id: "tenantID".to_string(),
            resource_group_name: "test-resource-group".to_string(),
            route_table_name: "test-route-table".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    });
    let model = model(spec, InstanceGroupRole::Node, Distribution::Ubuntu2204, NodeupConfig::default());
    let tasks = build_tasks(&model).unwrap();

    let parsed: serde_json::Value =
        serde_json::from_str(&contents(&tasks, "/etc/kubernetes/cloud.config")).unwrap();
    assert_eq!(
        parsed,
        serde_json::json!({
            "cloudConfigType": "file",
            "subscriptionId": "subID",
            "tenantId": "tenantID",
            "vmType": "vmss",
            "resourceGroup": "test-resource-group",
            "location": "eastus",
            "routeTableName": "test-route-table",
            "vnetName": "test-vnet",
            "useInstanceMetadata": true,
            "useManagedIdentityExtension": true,
            "disableAvailabilitySetNodes": true,
        })
    );
}

#[test]
fn aws_ipv6_node_families() {
    let mut spec = cluster_spec("aws");
    spec.external_cloud_controller_manager = Some(CloudControllerManagerConfig::default());
    spec.cloud_config = Some(CloudConfiguration {
        node_ip_families: vec!["ipv6".to_string()],
        ..Default::default()
    });
    let model = model(spec, InstanceGroupRole::Node, Distribution::Debian12, NodeupConfig::default());
    let tasks = build_tasks(&model).unwrap();
    assert_eq!(
        contents(&tasks, "/etc/kubernetes/cloud.config"),
        "[global]\nNodeIPFamilies = ipv6\n"
    );
}

#[test]
fn sysctl_composition() {
    let mut spec = cluster_spec("aws");
    spec.sysctl_parameters = vec!["foo=1".to_string()];
    let mut model = model(spec, InstanceGroupRole::Node, Distribution::Debian12, NodeupConfig::default());
    model.instance_group.spec.sysctl_parameters = vec!["bar=2".to_string()];
    let tasks = build_tasks(&model).unwrap();

    let path = "/etc/sysctl.d/99-k8s-general.conf";
    let body = contents(&tasks, path);
    for line in &[
        "vm.max_map_count = 262144",
        "kernel.softlockup_panic = 1",
        "net.ipv4.neigh.default.gc_thresh1=0",
        "net.ipv4.ip_forward=1",
        "foo=1",
        "bar=2",
    ] {
        assert!(body.lines().any(|l| l == *line), "missing {:?} in\n{}", line, body);
    }
    assert_eq!(
        file(&tasks, path).on_change_execute,
        vec![vec!["sysctl".to_string(), "--system".to_string()]]
    );
}

#[test]
fn ntp_on_amazon_linux_2() {
    let model = model(
        cluster_spec("aws"),
        InstanceGroupRole::Node,
        Distribution::AmazonLinux2,
        NodeupConfig::default(),
    );
    let tasks = build_tasks(&model).unwrap();
    assert!(tasks.contains_key(&TaskId::new("Package", "chrony")));
    assert!(contents(&tasks, "/etc/chrony.conf").contains("pool 169.254.169.123 prefer iburst"));
    let chronyd = service(&tasks, "chronyd.service");
    assert!(chronyd.enabled());
    assert!(chronyd.running());
}

#[test]
fn worker_bootstrap_chain() {
    let mut model = bootstrapping_worker("aws");
    model.cluster.spec.master_internal_name = "api.internal.example".to_string();
    let plan = resolve(build_tasks(&model).unwrap()).unwrap();

    let bootstrap = TaskId::new("KubeletBootstrapKubeconfig", BOOTSTRAP_KUBECONFIG_PATH);
    match plan.get(bootstrap.as_str()) {
        Some(Task::KubeletBootstrapKubeconfig(k)) => {
            assert_eq!(k.server_url, "https://api.internal.example")
        }
        other => panic!("no bootstrap kubeconfig task: {:?}", other),
    }

    let kubelet = match plan.get("Service/kubelet.service") {
        Some(Task::Service(s)) => s,
        other => panic!("no kubelet service: {:?}", other),
    };
    let pre = systemd::values(kubelet.definition.as_deref().unwrap(), "ExecStartPre");
    assert!(pre.iter().any(|c| c.contains(BOOTSTRAP_KUBECONFIG_PATH) && c.contains("while")));
    assert!(kubelet.after_files.contains(&BOOTSTRAP_KUBECONFIG_PATH.to_string()));
    assert!(plan
        .edges()
        .contains(&(bootstrap, TaskId::new("Service", "kubelet.service"))));
}

#[test]
fn file_assets_render_templates() {
    let mut spec = cluster_spec("aws");
    spec.network_cidr = "10.79.0.0/24".to_string();
    spec.non_masquerade_cidr = "10.100.0.0/16".to_string();
    spec.file_assets = vec![FileAssetSpec {
        name: "networks".to_string(),
        path: "/etc/networks.conf".to_string(),
        content: "network={{ .Cluster.NetworkCIDR }}\npods={{ .Cluster.NonMasqueradeCIDR }}\n".to_string(),
        ..Default::default()
    }];
    let model = model(spec, InstanceGroupRole::Node, Distribution::Debian12, NodeupConfig::default());
    let tasks = build_tasks(&model).unwrap();
    assert_eq!(
        contents(&tasks, "/etc/networks.conf"),
        "network=10.79.0.0/24\npods=10.100.0.0/16\n"
    );
}

#[test]
fn unknown_distribution_plans_with_warnings() {
    let model = model(
        cluster_spec("aws"),
        InstanceGroupRole::Node,
        Distribution::Unknown("plan9-4".to_string()),
        NodeupConfig::default(),
    );
    let tasks = build_tasks(&model).unwrap();
    assert!(!tasks.contains_key(&TaskId::new("Package", "chrony")));
    assert!(tasks.contains_key(&TaskId::new("Service", "kubelet.service")));
}

#[test]
fn planning_is_deterministic() {
    let plan = || {
        resolve(build_tasks(&bootstrapping_worker("aws")).unwrap())
            .unwrap()
            .ids()
    };
    let first = plan();
    assert!(!first.is_empty());
    for _ in 0..3 {
        assert_eq!(plan(), first);
    }
}

fn planned_nodes() -> Vec<nodeup::graph::Plan> {
    let master = model(
        cluster_spec("aws"),
        InstanceGroupRole::Master,
        Distribution::Ubuntu2204,
        NodeupConfig::default(),
    );
    let worker = model(
        cluster_spec("gce"),
        InstanceGroupRole::Node,
        Distribution::Rocky9,
        NodeupConfig::default(),
    );
    vec![
        resolve(build_tasks(&master).unwrap()).unwrap(),
        resolve(build_tasks(&worker).unwrap()).unwrap(),
        resolve(build_tasks(&bootstrapping_worker("aws")).unwrap()).unwrap(),
    ]
}

#[test]
fn every_edge_points_forward() {
    for plan in planned_nodes() {
        let position: BTreeMap<TaskId, usize> = plan
            .ids()
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();
        for (from, to) in plan.edges() {
            assert!(
                position[from] < position[to],
                "{} must run before {}",
                from,
                to
            );
        }
    }
}

#[test]
fn every_file_follows_its_parent_directory() {
    for plan in planned_nodes() {
        let ids = plan.ids();
        for task in plan.tasks() {
            let path = match task {
                Task::File(f) => &f.path,
                _ => continue,
            };
            let parent = match std::path::Path::new(path).parent().and_then(|p| p.to_str()) {
                Some(parent) if !is_os_directory(parent) => parent.to_string(),
                _ => continue,
            };
            let parent_id = TaskId::new("File", &parent);
            match plan.get(parent_id.as_str()) {
                Some(Task::File(dir)) => assert_eq!(dir.file_type, FileType::Directory, "{}", parent),
                other => panic!("{} has no parent directory task: {:?}", path, other),
            }
            let parent_at = ids.iter().position(|id| *id == parent_id).unwrap();
            let file_at = ids.iter().position(|id| *id == task.id()).unwrap();
            assert!(parent_at < file_at, "{} planned before {}", path, parent);
        }
    }
}

#[test]
fn master_runs_the_control_plane() {
    let plans = planned_nodes();
    let master = &plans[0];
    for manifest in &["kube-apiserver", "kube-controller-manager", "kube-scheduler", "kube-proxy"] {
        let path = format!("File//etc/kubernetes/manifests/{}.manifest", manifest);
        assert!(master.get(&path).is_some(), "missing {}", path);
    }
    assert!(master.get("IssueCert/master").is_some());
    assert!(master.get("File//usr/local/bin/kubectl").is_some());

    let worker = &plans[1];
    assert!(worker.get("File//etc/kubernetes/manifests/kube-apiserver.manifest").is_none());
    assert!(worker.get("File//var/lib/kube-proxy/kubeconfig").is_some());
}
