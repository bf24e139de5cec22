//! The cloud provider configuration shared by kubelet and the control plane.

use serde::Serialize;
use tracing::debug;

use crate::api::{CloudConfiguration, CloudProvider};
use crate::error::{Error, Result};
use crate::model::{NodeupModelContext, CLOUD_CONFIG_PATH};
use crate::tasks::File;

use super::TaskContext;

/// The document the Azure cloud provider reads.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AzureCloudConfig {
    cloud_config_type: &'static str,
    subscription_id: String,
    tenant_id: String,
    vm_type: &'static str,
    resource_group: String,
    location: String,
    route_table_name: String,
    vnet_name: String,
    use_instance_metadata: bool,
    use_managed_identity_extension: bool,
    disable_availability_set_nodes: bool,
}

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    let default_config = CloudConfiguration::default();
    let cloud_config = model
        .cluster
        .spec
        .cloud_config
        .as_ref()
        .unwrap_or(&default_config);

    let contents = match model.cloud_provider() {
        CloudProvider::Azure => azure(model, cloud_config)?,
        CloudProvider::Aws => ini(aws_lines(model, cloud_config)),
        CloudProvider::Gce => ini(gce_lines(cloud_config)),
        CloudProvider::Openstack => ini(openstack_lines(cloud_config)),
        provider => {
            debug!(%provider, "no cloud configuration needed");
            return Ok(());
        }
    };
    c.add_task(File::file(CLOUD_CONFIG_PATH, contents, Some("0644")))
}

fn ini(lines: Vec<String>) -> String {
    let mut out = String::from("[global]\n");
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn aws_lines(model: &NodeupModelContext, config: &CloudConfiguration) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(disable) = config.disable_security_group_ingress {
        lines.push(format!("DisableSecurityGroupIngress = {}", disable));
    }
    if let Some(group) = &config.elb_security_group {
        lines.push(format!("ElbSecurityGroup = {}", group));
    }
    if model.cluster.spec.uses_external_ccm() {
        for family in &config.node_ip_families {
            lines.push(format!("NodeIPFamilies = {}", family));
        }
    }
    lines
}

fn gce_lines(config: &CloudConfiguration) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(tags) = &config.node_tags {
        lines.push(format!("node-tags = {}", tags));
    }
    if let Some(prefix) = &config.node_instance_prefix {
        lines.push(format!("node-instance-prefix = {}", prefix));
    }
    if let Some(multizone) = config.multizone {
        lines.push(format!("multizone = {}", multizone));
    }
    lines
}

fn openstack_lines(config: &CloudConfiguration) -> Vec<String> {
    let mut lines = Vec::new();
    let openstack = match &config.openstack {
        Some(openstack) => openstack,
        None => return lines,
    };
    if let Some(skip) = openstack.insecure_skip_verify {
        lines.push(format!("insecure = {}", skip));
    }
    if let Some(lb) = &openstack.loadbalancer {
        lines.push(String::new());
        lines.push("[LoadBalancer]".to_string());
        if let Some(method) = &lb.method {
            lines.push(format!("lb-method = {}", method));
        }
        if let Some(provider) = &lb.provider {
            lines.push(format!("lb-provider = {}", provider));
        }
        if let Some(network) = &lb.floating_network_id {
            lines.push(format!("floating-network-id = {}", network));
        }
        if let Some(subnet) = &lb.floating_subnet {
            lines.push(format!("floating-subnet = {}", subnet));
        }
    }
    lines
}

fn azure(model: &NodeupModelContext, config: &CloudConfiguration) -> Result<String> {
    let spec = &model.cluster.spec;
    let azure = config
        .azure
        .as_ref()
        .ok_or_else(|| Error::config("azure clusters need spec.cloudConfig.azure"))?;
    let location = spec
        .subnets
        .first()
        .map(|s| s.region.as_str())
        .filter(|r| !r.is_empty())
        .ok_or_else(|| Error::config("azure clusters need a subnet with a region"))?;

    let document = AzureCloudConfig {
        cloud_config_type: "file",
        subscription_id: azure.subscription_id.clone(),
        tenant_id: azure.tenant_id.clone(),
        vm_type: "vmss",
        resource_group: azure.resource_group_name.clone(),
        location: location.to_string(),
        route_table_name: azure.route_table_name.clone(),
        vnet_name: spec.network_id.clone(),
        use_instance_metadata: true,
        use_managed_identity_extension: true,
        disable_availability_set_nodes: true,
    };
    serde_json::to_string(&document)
        .map_err(|e| Error::config(format!("unable to serialize azure cloud config: {}", e)))
}
