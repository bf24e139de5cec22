//! The kube-proxy static pod, on every node unless disabled.

use crate::error::Result;
use crate::kubeconfig::Kubeconfig;
use crate::model::NodeupModelContext;
use crate::tasks::File;

use super::manifest::StaticPod;
use super::{
    add_manifest, keystore_pair, kubernetes_ca_file, local_client_kubeconfig, static_pod_log,
    TaskContext,
};

const NAME: &str = "kube-proxy";
const DIR: &str = "/var/lib/kube-proxy";

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    let config = model.cluster.spec.kube_proxy.clone().unwrap_or_default();
    if config.enabled == Some(false) {
        return Ok(());
    }

    let kubeconfig = if model.is_master() {
        local_client_kubeconfig(model, c, NAME, "system:kube-proxy")?
    } else {
        worker_kubeconfig(model, c)?
    };
    static_pod_log(c, NAME)?;

    let mut flags = config.flags();
    flags
        .set("kubeconfig", &kubeconfig)
        .set("hostname-override", model.node_name())
        .set("conntrack-max-per-core", 131072)
        .set("oom-score-adj", -998);

    let image = if config.image.is_empty() {
        format!("registry.k8s.io/kube-proxy:v{}", model.kubernetes_version())
    } else {
        config.image.clone()
    };
    let mut pod = StaticPod::new(NAME, &image);
    pod.command_with_log("/usr/local/bin/kube-proxy", flags.build(), NAME)
        .host_path("kubeconfig", &kubeconfig, true)
        .host_path("modules", "/lib/modules", true)
        .host_path("iptableslock", "/run/xtables.lock", false)
        .requests(config.cpu_request.as_deref(), "100m", config.memory_request.as_deref())
        .privileged();
    pod.read_only_paths(&model.ssl_host_paths());
    add_manifest(c, NAME, pod.to_yaml()?)
}

/// Nodes outside the control plane use the shared kube-proxy keypair.
fn worker_kubeconfig(model: &NodeupModelContext, c: &mut TaskContext) -> Result<String> {
    let (certificate, key) = keystore_pair(model, NAME, DIR, NAME)?;
    let kubeconfig = Kubeconfig::with_client_cert(
        NAME,
        &format!("https://{}", model.api_internal_name()),
        &format!("{}/ca.crt", model.path_srv_kubernetes()),
        &certificate.path,
        &key.path,
    );
    c.add_task(certificate)?;
    c.add_task(key)?;
    c.ensure_task(kubernetes_ca_file(model)?)?;

    let path = format!("{}/kubeconfig", DIR);
    c.add_task(File::file(path.as_str(), kubeconfig.to_yaml()?, Some("0400")))?;
    Ok(path)
}
