use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::components::KubeletConfigSpec;
use super::instance_group::InstanceGroupRole;

/// CPU architecture of the node.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    /// x86_64
    Amd64,
    /// aarch64
    Arm64,
}

impl Default for Architecture {
    fn default() -> Self {
        Architecture::Amd64
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
        })
    }
}

/// A static pod manifest published in the config base.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct StaticManifest {
    /// Manifest name; becomes `<key>.manifest`
    pub key: String,
    /// Path relative to the config base
    pub path: String,
    /// Restrict to control plane nodes
    pub roles: Vec<InstanceGroupRole>,
}

/// How the node was told to bootstrap.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BootConfig {
    /// Cloud provider name
    pub cloud_provider: String,
    /// Location of the cluster configuration
    pub config_base: Option<String>,
    /// Instance group name
    pub instance_group_name: String,
    /// Instance group role
    pub instance_group_role: InstanceGroupRole,
    /// Hash of the node-up configuration document
    pub nodeup_config_hash: String,
}

/// The per-node configuration document.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeupConfig {
    /// Cluster name
    pub cluster_name: String,
    /// Node architecture
    pub architecture: Architecture,
    /// Instance group name
    pub instance_group_name: String,
    /// Instance group role
    pub instance_group_role: InstanceGroupRole,
    /// Addon channels
    pub channels: Vec<String>,
    /// Etcd clusters hosted on this node
    pub etcd_cluster_names: Vec<String>,
    /// Keypair id to sign with, per CA name
    #[serde(rename = "keypairIDs")]
    pub keypair_ids: BTreeMap<String, String>,
    /// CA bundles, per CA name
    #[serde(rename = "CAs")]
    pub ca_certificates: BTreeMap<String, String>,
    /// API server addresses, for clusters without DNS
    #[serde(rename = "apiServerIPs")]
    pub api_server_ips: Vec<String>,
    /// Fully merged kubelet settings overriding the cluster spec
    pub kubelet_config: Option<KubeletConfigSpec>,
    /// Extra static pod manifests
    pub static_manifests: Vec<StaticManifest>,
    /// Boot configuration
    pub boot_config: Option<BootConfig>,
    /// Do not manage the NTP daemon
    #[serde(rename = "NTPUnmanaged")]
    pub ntp_unmanaged: bool,
    /// Unattended upgrade policy: `automatic` or `external`
    pub update_policy: String,
    /// Assets as `sha256@url` entries, per architecture
    pub assets: BTreeMap<Architecture, Vec<String>>,
    /// Images pulled ahead of time
    pub warm_pool_images: Vec<String>,
    /// Workers obtain their kubelet credential from the controller
    pub use_kops_controller_for_node_bootstrap: bool,
}
