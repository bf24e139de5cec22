use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::cluster::{FileAssetSpec, HookSpec};
use super::components::KubeletConfigSpec;
use super::ObjectMeta;

/// An instance group specification document.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGroup {
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// The desired group configuration
    #[serde(default)]
    pub spec: InstanceGroupSpec,
}

/// What the machines of a group are for.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstanceGroupRole {
    /// Control plane node
    #[serde(alias = "ControlPlane")]
    Master,
    /// Worker node
    Node,
    /// SSH jump host
    Bastion,
    /// Dedicated API server node
    #[serde(rename = "APIServer")]
    ApiServer,
}

impl Default for InstanceGroupRole {
    fn default() -> Self {
        InstanceGroupRole::Node
    }
}

impl fmt::Display for InstanceGroupRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceGroupRole::Master => "Master",
            InstanceGroupRole::Node => "Node",
            InstanceGroupRole::Bastion => "Bastion",
            InstanceGroupRole::ApiServer => "APIServer",
        };
        f.write_str(name)
    }
}

/// The desired state of an instance group.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceGroupSpec {
    /// Role of the machines
    pub role: InstanceGroupRole,
    /// Machine type
    pub machine_type: String,
    /// kubelet settings for this group
    pub kubelet: Option<KubeletConfigSpec>,
    /// Extra sysctl settings in `name=value` form
    pub sysctl_parameters: Vec<String>,
    /// Extra files
    pub file_assets: Vec<FileAssetSpec>,
    /// Extra units
    pub hooks: Vec<HookSpec>,
    /// Labels registered with the node
    pub node_labels: BTreeMap<String, String>,
    /// Taints registered with the node
    pub taints: Vec<String>,
}
