use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::components::*;
use super::instance_group::InstanceGroupRole;
use super::ObjectMeta;

/// A cluster specification document.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    /// Object metadata; the name is the cluster name
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// The desired cluster configuration
    #[serde(default)]
    pub spec: ClusterSpec,
}

/// The desired state of a cluster, as far as a node needs to know it.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSpec {
    /// Cloud provider name: aws, gce, azure, openstack, digitalocean, scaleway, hetzner, yandex
    pub cloud_provider: String,
    /// Kubernetes version, with or without a leading `v`
    pub kubernetes_version: String,
    /// Network subnets the cluster spans
    pub subnets: Vec<ClusterSubnetSpec>,
    /// Public DNS name of the API
    pub master_public_name: String,
    /// Internal DNS name of the API; defaults to `api.internal.<cluster>`
    pub master_internal_name: String,
    /// CIDR of the cloud network
    #[serde(rename = "networkCIDR")]
    pub network_cidr: String,
    /// Provider id of the cloud network
    #[serde(rename = "networkID")]
    pub network_id: String,
    /// DNS zone holding the cluster records
    pub dns_zone: String,
    /// In-cluster DNS domain
    #[serde(rename = "clusterDNSDomain")]
    pub cluster_dns_domain: String,
    /// Range service IPs are allocated from
    #[serde(rename = "serviceClusterIPRange")]
    pub service_cluster_ip_range: String,
    /// Range that is not masqueraded (pods + services)
    #[serde(rename = "nonMasqueradeCIDR")]
    pub non_masquerade_cidr: String,
    /// Unattended upgrade policy: `automatic` or `external`
    pub update_policy: Option<String>,
    /// Etcd clusters backing the control plane
    pub etcd_clusters: Vec<EtcdClusterSpec>,
    /// Container runtime name; only `containerd` is supported
    pub container_runtime: String,
    /// containerd settings
    pub containerd: Option<ContainerdConfig>,
    /// Cluster DNS settings
    #[serde(rename = "kubeDNS")]
    pub kube_dns: Option<KubeDnsConfig>,
    /// kube-apiserver settings
    #[serde(rename = "kubeAPIServer")]
    pub kube_api_server: Option<KubeApiServerConfig>,
    /// kube-controller-manager settings
    pub kube_controller_manager: Option<KubeControllerManagerConfig>,
    /// External cloud controller manager; present means in-tree providers are off
    pub external_cloud_controller_manager: Option<CloudControllerManagerConfig>,
    /// kube-scheduler settings
    pub kube_scheduler: Option<KubeSchedulerConfig>,
    /// kube-proxy settings
    pub kube_proxy: Option<KubeProxyConfig>,
    /// kubelet settings for every node
    pub kubelet: Option<KubeletConfigSpec>,
    /// kubelet settings layered on top for control plane nodes
    pub master_kubelet: Option<KubeletConfigSpec>,
    /// Cloud provider configuration
    pub cloud_config: Option<CloudConfiguration>,
    /// Networking mode
    pub networking: Option<NetworkingSpec>,
    /// Authentication webhooks
    pub authentication: Option<AuthenticationSpec>,
    /// Whether secrets are encrypted at rest
    pub encryption_config: Option<bool>,
    /// Extra files placed on nodes
    pub file_assets: Vec<FileAssetSpec>,
    /// Extra systemd units run on nodes
    pub hooks: Vec<HookSpec>,
    /// Extra sysctl settings in `name=value` form
    pub sysctl_parameters: Vec<String>,
    /// Time synchronization
    #[serde(rename = "ntp")]
    pub ntp: Option<NtpConfig>,
    /// HTTP proxy settings for node daemons
    pub egress_proxy: Option<EgressProxySpec>,
}

impl ClusterSpec {
    /// The parsed cloud provider.
    pub fn cloud_provider(&self) -> CloudProvider {
        CloudProvider::from(self.cloud_provider.as_str())
    }

    /// Whether an out-of-tree cloud controller manager is used.
    pub fn uses_external_ccm(&self) -> bool {
        self.external_cloud_controller_manager.is_some()
    }

    /// The node IP families from the cloud configuration.
    pub fn node_ip_families(&self) -> &[String] {
        self.cloud_config
            .as_ref()
            .map(|c| c.node_ip_families.as_slice())
            .unwrap_or_default()
    }

    /// Whether pods use IPv6 addressing.
    pub fn is_ipv6_only(&self) -> bool {
        self.non_masquerade_cidr.contains(':')
    }
}

/// The cloud a cluster runs on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloudProvider {
    /// Amazon Web Services
    Aws,
    /// Google Compute Engine
    Gce,
    /// Microsoft Azure
    Azure,
    /// OpenStack
    Openstack,
    /// DigitalOcean
    DigitalOcean,
    /// Scaleway
    Scaleway,
    /// Hetzner Cloud
    Hetzner,
    /// Yandex Cloud
    Yandex,
    /// Bare metal, no cloud integration
    Metal,
    /// Anything else
    Other(String),
}

impl From<&str> for CloudProvider {
    fn from(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "aws" => CloudProvider::Aws,
            "gce" => CloudProvider::Gce,
            "azure" => CloudProvider::Azure,
            "openstack" => CloudProvider::Openstack,
            "digitalocean" => CloudProvider::DigitalOcean,
            "scaleway" => CloudProvider::Scaleway,
            "hetzner" => CloudProvider::Hetzner,
            "yandex" => CloudProvider::Yandex,
            "metal" | "" => CloudProvider::Metal,
            other => CloudProvider::Other(other.to_string()),
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CloudProvider::Aws => "aws",
            CloudProvider::Gce => "gce",
            CloudProvider::Azure => "azure",
            CloudProvider::Openstack => "openstack",
            CloudProvider::DigitalOcean => "digitalocean",
            CloudProvider::Scaleway => "scaleway",
            CloudProvider::Hetzner => "hetzner",
            CloudProvider::Yandex => "yandex",
            CloudProvider::Metal => "metal",
            CloudProvider::Other(name) => name,
        };
        f.write_str(name)
    }
}

/// One subnet of the cluster network.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSubnetSpec {
    /// Subnet name
    pub name: String,
    /// Availability zone
    pub zone: String,
    /// Cloud region (Azure, OpenStack)
    pub region: String,
    /// IPv4 CIDR
    #[serde(rename = "cidr")]
    pub cidr: String,
    /// IPv6 CIDR
    #[serde(rename = "ipv6CIDR")]
    pub ipv6_cidr: String,
    /// Public, Private or Utility
    #[serde(rename = "type")]
    pub subnet_type: String,
}

/// Cloud provider configuration rendered into `cloud.config`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudConfiguration {
    /// Whether storage classes are managed
    pub manage_storage_classes: Option<bool>,
    /// `ipv4` and/or `ipv6`, in preference order
    #[serde(rename = "nodeIPFamilies")]
    pub node_ip_families: Vec<String>,
    /// AWS: do not add ingress rules to security groups
    pub disable_security_group_ingress: Option<bool>,
    /// AWS: security group used for ELBs
    pub elb_security_group: Option<String>,
    /// GCE: multizone clusters
    pub multizone: Option<bool>,
    /// GCE: tags applied to nodes
    pub node_tags: Option<String>,
    /// GCE: node instance prefix
    pub node_instance_prefix: Option<String>,
    /// Azure settings
    pub azure: Option<AzureSpec>,
    /// OpenStack settings
    pub openstack: Option<OpenstackSpec>,
}

/// Azure specific settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AzureSpec {
    /// Subscription the cluster lives in
    #[serde(rename = "subscriptionID")]
    pub subscription_id: String,
    /// Tenant the cluster lives in
    #[serde(rename = "tenantID")]
    pub tenant_id: String,
    /// Resource group holding cluster resources
    pub resource_group_name: String,
    /// Route table attached to the cluster subnet
    pub route_table_name: String,
    /// Admin user of the VMs
    pub admin_user: String,
}

/// OpenStack specific settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OpenstackSpec {
    /// Load balancer integration
    pub loadbalancer: Option<OpenstackLoadbalancerConfig>,
    /// Skip TLS verification of the OpenStack API
    pub insecure_skip_verify: Option<bool>,
}

/// OpenStack load balancer integration.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OpenstackLoadbalancerConfig {
    /// Load balancer method, e.g. ROUND_ROBIN
    pub method: Option<String>,
    /// Octavia provider
    pub provider: Option<String>,
    /// Network floating IPs come from
    pub floating_network_id: Option<String>,
    /// Subnet VIPs are allocated in
    pub floating_subnet: Option<String>,
}

/// Networking mode. Exactly one field is expected to be set.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkingSpec {
    /// Cloud routes, no overlay
    pub classic: Option<EmptyConfig>,
    /// kubenet
    pub kubenet: Option<EmptyConfig>,
    /// Externally managed
    pub external: Option<EmptyConfig>,
    /// Bring-your-own CNI
    pub cni: Option<EmptyConfig>,
    /// Calico
    pub calico: Option<EmptyConfig>,
    /// Canal
    pub canal: Option<EmptyConfig>,
    /// Cilium
    pub cilium: Option<EmptyConfig>,
    /// Flannel
    pub flannel: Option<EmptyConfig>,
    /// Weave
    pub weave: Option<EmptyConfig>,
    /// kube-router
    pub kuberouter: Option<EmptyConfig>,
    /// AWS VPC CNI
    #[serde(rename = "amazonvpc")]
    pub amazon_vpc: Option<EmptyConfig>,
}

impl NetworkingSpec {
    /// Whether the mode runs a CNI plugin.
    pub fn uses_cni(&self) -> bool {
        self.classic.is_none() && self.external.is_none()
    }

    /// Whether kubenet is the network plugin.
    pub fn uses_kubenet(&self) -> bool {
        self.kubenet.is_some()
    }
}

/// Placeholder for configuration blocks whose contents nodeup ignores.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EmptyConfig {}

/// One etcd cluster.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EtcdClusterSpec {
    /// Cluster name, usually `main` or `events`
    pub name: String,
    /// `Manager` (default) or `Legacy`
    pub provider: Option<String>,
    /// etcd version
    pub version: String,
    /// Members of the cluster
    #[serde(rename = "etcdMembers")]
    pub members: Vec<EtcdMemberSpec>,
    /// etcd-manager settings
    pub manager: Option<EtcdManagerSpec>,
    /// CPU request of the etcd-manager pod
    pub cpu_request: Option<String>,
    /// Memory request of the etcd-manager pod
    pub memory_request: Option<String>,
    /// Serve clients over TLS even under the legacy provider
    #[serde(rename = "enableEtcdTLS")]
    pub enable_etcd_tls: bool,
}

impl EtcdClusterSpec {
    /// Whether the cluster is run by etcd-manager.
    pub fn uses_manager(&self) -> bool {
        !matches!(self.provider.as_deref(), Some("Legacy"))
    }

    /// Whether clients must present a certificate. etcd-manager always serves TLS.
    pub fn uses_tls(&self) -> bool {
        self.enable_etcd_tls || self.uses_manager()
    }
}

/// A member of an etcd cluster.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EtcdMemberSpec {
    /// Member name
    pub name: String,
    /// Instance group hosting the member
    pub instance_group: Option<String>,
}

/// etcd-manager settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EtcdManagerSpec {
    /// etcd-manager image
    pub image: String,
    /// Log verbosity
    pub log_level: Option<i32>,
}

/// Authentication webhooks for the API server.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthenticationSpec {
    /// AWS IAM authenticator
    pub aws: Option<AwsAuthenticationSpec>,
    /// kopeio authentication
    pub kopeio: Option<EmptyConfig>,
}

/// AWS IAM authenticator settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AwsAuthenticationSpec {
    /// Authenticator image
    pub image: String,
    /// Backend mode, e.g. `MountedFile,EKSConfigMap`
    pub backend_mode: String,
    /// Cluster id the authenticator expects in tokens
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
}

/// An extra file placed on matching nodes.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FileAssetSpec {
    /// Asset name
    pub name: String,
    /// Absolute destination path
    pub path: String,
    /// Roles the file is placed on; empty means all
    pub roles: Vec<InstanceGroupRole>,
    /// File contents, possibly a template
    pub content: String,
    /// Whether `content` is base64 encoded
    pub is_base64: bool,
    /// File mode, octal string; defaults to 0440
    pub mode: Option<String>,
}

/// An extra systemd unit run on matching nodes.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HookSpec {
    /// Unit name; defaults to `kops-hook-<index>.service`
    pub name: String,
    /// Writes the unit but keeps it stopped and disabled
    pub disabled: bool,
    /// Roles the hook applies to; empty means all
    pub roles: Vec<InstanceGroupRole>,
    /// Units this hook must run before
    pub before: Vec<String>,
    /// Units this hook requires
    pub requires: Vec<String>,
    /// `[Service]` section body, or the whole unit with `useRawManifest`
    pub manifest: String,
    /// Use `manifest` as the complete unit
    pub use_raw_manifest: bool,
    /// Run a container instead of a command
    pub exec_container: Option<ExecContainerAction>,
}

/// A container run by a hook.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecContainerAction {
    /// Image to run
    pub image: String,
    /// Command and arguments
    pub command: Vec<String>,
    /// Environment passed to the container
    pub environment: BTreeMap<String, String>,
}

/// Time synchronization settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct NtpConfig {
    /// Whether nodeup manages the NTP daemon; defaults to true
    pub managed: Option<bool>,
}

/// Egress proxy settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EgressProxySpec {
    /// The HTTP proxy
    pub http_proxy: HttpProxy,
    /// Comma separated exclusions
    pub proxy_excludes: String,
}

/// An HTTP proxy endpoint.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpProxy {
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
}
