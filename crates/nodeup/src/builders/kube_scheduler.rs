//! The kube-scheduler static pod and its component config.

use serde_json::json;

use crate::api::FlagBuilder;
use crate::error::{Error, Result};
use crate::model::NodeupModelContext;
use crate::tasks::File;

use super::manifest::StaticPod;
use super::{add_manifest, local_client_kubeconfig, static_pod_log, TaskContext};

const NAME: &str = "kube-scheduler";
const CONFIG_PATH: &str = "/var/lib/kube-scheduler/config.yaml";

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    if !model.is_master() {
        return Ok(());
    }
    let config = model.cluster.spec.kube_scheduler.clone().unwrap_or_default();
    let kubeconfig = local_client_kubeconfig(model, c, NAME, "system:kube-scheduler")?;
    static_pod_log(c, NAME)?;

    let api_version = if model.is_kubernetes_gte(1, 25) {
        "kubescheduler.config.k8s.io/v1"
    } else {
        "kubescheduler.config.k8s.io/v1beta2"
    };
    let component_config = json!({
        "apiVersion": api_version,
        "kind": "KubeSchedulerConfiguration",
        "clientConnection": { "kubeconfig": kubeconfig },
        "leaderElection": { "leaderElect": config.leader_elect.unwrap_or(true) },
    });
    let component_config = serde_yaml::to_string(&component_config)
        .map_err(|e| Error::config(format!("unable to serialize scheduler config: {}", e)))?;
    c.add_task(File::file(CONFIG_PATH, component_config, Some("0400")))?;

    let mut flags = FlagBuilder::new();
    flags
        .set("config", CONFIG_PATH)
        .set("authentication-kubeconfig", &kubeconfig)
        .set("authorization-kubeconfig", &kubeconfig)
        .opt("v", &config.log_level);
    if let Some(gates) = &config.feature_gates {
        flags.map("feature-gates", gates);
    }

    let image = if config.image.is_empty() {
        format!("registry.k8s.io/kube-scheduler:v{}", model.kubernetes_version())
    } else {
        config.image.clone()
    };
    let mut pod = StaticPod::new(NAME, &image);
    pod.command_with_log("/usr/local/bin/kube-scheduler", flags.build(), NAME)
        .host_path("varlibkubescheduler", "/var/lib/kube-scheduler", true)
        .liveness("/healthz", 10259, "HTTPS")
        .requests(config.cpu_request.as_deref(), "100m", None);
    add_manifest(c, NAME, pod.to_yaml()?)
}
