//! Kubelet credentials from kops-controller for worker nodes.

use crate::error::Result;
use crate::model::{NodeupModelContext, BOOTSTRAP_KUBECONFIG_PATH, KUBERNETES_CA};
use crate::tasks::{BootstrapClient, KubeletBootstrapKubeconfig};

use super::TaskContext;

const CLIENT_NAME: &str = "kops-controller";

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    if !model.uses_kops_controller_bootstrap() {
        return Ok(());
    }
    let ca = model.ca_certificate(KUBERNETES_CA)?;
    c.add_task(BootstrapClient {
        name: CLIENT_NAME.to_string(),
        controller_host: model.kops_controller_name(),
        ca: ca.clone(),
    })?;

    let instance_group = if model.nodeup_config.instance_group_name.is_empty() {
        model.instance_group.metadata.name.clone()
    } else {
        model.nodeup_config.instance_group_name.clone()
    };
    c.add_task(KubeletBootstrapKubeconfig {
        path: BOOTSTRAP_KUBECONFIG_PATH.to_string(),
        server_url: format!("https://{}", model.api_internal_name()),
        ca_certificate: ca,
        client: CLIENT_NAME.to_string(),
        node_name: model.node_name().to_string(),
        instance_group,
    })
}
