//! The kube-controller-manager static pod.

use crate::error::Result;
use crate::model::{NodeupModelContext, CLOUD_CONFIG_PATH};

use super::manifest::StaticPod;
use super::{add_manifest, local_client_kubeconfig, static_pod_log, TaskContext};

const NAME: &str = "kube-controller-manager";

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    if !model.is_master() {
        return Ok(());
    }
    let config = model
        .cluster
        .spec
        .kube_controller_manager
        .clone()
        .unwrap_or_default();
    let kubeconfig = local_client_kubeconfig(model, c, NAME, "system:kube-controller-manager")?;
    static_pod_log(c, NAME)?;

    let srv = model.path_srv_kubernetes();
    let mut flags = config.flags();
    flags
        .set("kubeconfig", &kubeconfig)
        .set("authentication-kubeconfig", &kubeconfig)
        .set("authorization-kubeconfig", &kubeconfig)
        .set("root-ca-file", format!("{}/ca.crt", srv))
        .set("service-account-private-key-file", format!("{}/service-account.key", srv))
        .set("use-service-account-credentials", true);
    if config.cluster_name.is_none() {
        flags.set("cluster-name", model.cluster_name());
    }
    if model.cluster.spec.cloud_config.is_some() {
        flags.set("cloud-config", CLOUD_CONFIG_PATH);
    }

    let image = if config.image.is_empty() {
        format!("registry.k8s.io/kube-controller-manager:v{}", model.kubernetes_version())
    } else {
        config.image.clone()
    };
    let mut pod = StaticPod::new(NAME, &image);
    pod.command_with_log("/usr/local/bin/kube-controller-manager", flags.build(), NAME)
        .host_path("varlibkcm", &format!("/var/lib/{}", NAME), true)
        .host_path("srvkube", srv, true)
        .liveness("/healthz", 10257, "HTTPS")
        .requests(config.cpu_request.as_deref(), "100m", None);
    pod.read_only_paths(&model.ssl_host_paths());
    if model.cluster.spec.cloud_config.is_some() {
        pod.host_path("cloudconfig", CLOUD_CONFIG_PATH, true);
    }
    add_manifest(c, NAME, pod.to_yaml()?)
}
