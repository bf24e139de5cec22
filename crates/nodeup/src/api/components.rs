//! Per-component configuration blocks and their command line rendering.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::flags::FlagBuilder;

/// Overwrites each listed option of `$target` that is set in `$overlay`.
macro_rules! merge_options {
    ($target:expr, $overlay:expr, $($field:ident),+ $(,)?) => {
        $(
            if $overlay.$field.is_some() {
                $target.$field = $overlay.$field.clone();
            }
        )+
    };
}

/// Settings for the kubelet.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeletConfigSpec {
    /// Allow anonymous requests to the kubelet server
    pub anonymous_auth: Option<bool>,
    /// Authorization mode of the kubelet server
    pub authorization_mode: Option<String>,
    /// Use the TokenReview API for bearer tokens
    pub authentication_token_webhook: Option<bool>,
    /// CA used to verify client certificates
    pub client_ca_file: Option<String>,
    /// Log verbosity
    pub log_level: Option<i32>,
    /// Static pod directory
    pub pod_manifest_path: Option<String>,
    /// Node name override; `@cloud` reads it from instance metadata
    pub hostname_override: Option<String>,
    /// Sandbox image
    pub pod_infra_container_image: Option<String>,
    /// Cluster DNS domain
    pub cluster_domain: Option<String>,
    /// Cluster DNS service IP
    #[serde(rename = "clusterDNS")]
    pub cluster_dns: Option<String>,
    /// Cloud provider passed to the kubelet
    pub cloud_provider: Option<String>,
    /// cgroup driver
    pub cgroup_driver: Option<String>,
    /// Maximum number of pods
    pub max_pods: Option<i32>,
    /// Register the node as schedulable
    pub register_schedulable: Option<bool>,
    /// Hard eviction thresholds
    pub eviction_hard: Option<String>,
    /// Refuse to start if kernel tunables differ from kubelet defaults
    pub protect_kernel_defaults: Option<bool>,
    /// Serve with certificates signed by the cluster CA
    pub tls_cert_file: Option<String>,
    /// Key for `tls_cert_file`
    pub tls_private_key_file: Option<String>,
    /// Resources reserved for Kubernetes daemons
    pub kube_reserved: Option<BTreeMap<String, String>>,
    /// Resources reserved for system daemons
    pub system_reserved: Option<BTreeMap<String, String>>,
    /// Labels registered with the node
    pub node_labels: Option<BTreeMap<String, String>>,
    /// Taints registered with the node
    pub taints: Option<Vec<String>>,
    /// Feature gates
    pub feature_gates: Option<BTreeMap<String, String>>,
}

impl KubeletConfigSpec {
    /// Layers `overlay` on top of `self`; set fields in `overlay` win.
    pub fn merge(&mut self, overlay: &KubeletConfigSpec) {
        merge_options!(
            self,
            overlay,
            anonymous_auth,
            authorization_mode,
            authentication_token_webhook,
            client_ca_file,
            log_level,
            pod_manifest_path,
            hostname_override,
            pod_infra_container_image,
            cluster_domain,
            cluster_dns,
            cloud_provider,
            cgroup_driver,
            max_pods,
            register_schedulable,
            eviction_hard,
            protect_kernel_defaults,
            tls_cert_file,
            tls_private_key_file,
            kube_reserved,
            system_reserved,
            taints,
            feature_gates,
        );
        if let Some(labels) = &overlay.node_labels {
            self.node_labels
                .get_or_insert_with(BTreeMap::new)
                .extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }

    /// Renders the settings as kubelet flags.
    pub fn flags(&self) -> FlagBuilder {
        let mut f = FlagBuilder::new();
        f.opt("anonymous-auth", &self.anonymous_auth)
            .opt("authorization-mode", &self.authorization_mode)
            .opt("authentication-token-webhook", &self.authentication_token_webhook)
            .opt("client-ca-file", &self.client_ca_file)
            .opt("v", &self.log_level)
            .opt("pod-manifest-path", &self.pod_manifest_path)
            .opt("pod-infra-container-image", &self.pod_infra_container_image)
            .opt("cluster-domain", &self.cluster_domain)
            .opt("cluster-dns", &self.cluster_dns)
            .opt("cloud-provider", &self.cloud_provider)
            .opt("cgroup-driver", &self.cgroup_driver)
            .opt("max-pods", &self.max_pods)
            .opt("register-schedulable", &self.register_schedulable)
            .opt("eviction-hard", &self.eviction_hard)
            .opt("protect-kernel-defaults", &self.protect_kernel_defaults)
            .opt("tls-cert-file", &self.tls_cert_file)
            .opt("tls-private-key-file", &self.tls_private_key_file);
        if let Some(m) = &self.kube_reserved {
            f.map("kube-reserved", m);
        }
        if let Some(m) = &self.system_reserved {
            f.map("system-reserved", m);
        }
        if let Some(m) = &self.node_labels {
            f.map("node-labels", m);
        }
        if let Some(t) = &self.taints {
            f.list("register-with-taints", t);
        }
        if let Some(m) = &self.feature_gates {
            f.map("feature-gates", m);
        }
        f
    }
}

/// Settings for kube-apiserver.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeApiServerConfig {
    /// Container image
    pub image: String,
    /// Log verbosity
    pub log_level: Option<i32>,
    /// Cloud provider flag
    pub cloud_provider: Option<String>,
    /// HTTPS port
    pub secure_port: Option<i32>,
    /// Bind address
    pub bind_address: Option<String>,
    /// etcd endpoints
    pub etcd_servers: Vec<String>,
    /// etcd endpoints per resource
    pub etcd_servers_overrides: Vec<String>,
    /// Service IP range
    #[serde(rename = "serviceClusterIPRange")]
    pub service_cluster_ip_range: Option<String>,
    /// Admission plugins
    pub enable_admission_plugins: Vec<String>,
    /// Allow anonymous requests
    pub anonymous_auth: Option<bool>,
    /// Authorization mode, e.g. `Node,RBAC`
    pub authorization_mode: Option<String>,
    /// Preferred kubelet address types
    pub kubelet_preferred_address_types: Vec<String>,
    /// Allow privileged containers
    pub allow_privileged: Option<bool>,
    /// Node port range
    pub service_node_port_range: Option<String>,
    /// Accept bootstrap tokens for authentication
    pub enable_bootstrap_auth_token: Option<bool>,
    /// Runtime API groups
    pub runtime_config: Option<BTreeMap<String, String>>,
    /// Feature gates
    pub feature_gates: Option<BTreeMap<String, String>>,
    /// CPU request
    pub cpu_request: Option<String>,
    /// Memory request
    pub memory_request: Option<String>,
    /// Audit log location
    pub audit_log_path: Option<String>,
}

impl KubeApiServerConfig {
    /// Renders the settings that map one to one onto flags.
    pub fn flags(&self) -> FlagBuilder {
        let mut f = FlagBuilder::new();
        f.opt("v", &self.log_level)
            .opt("cloud-provider", &self.cloud_provider)
            .opt("secure-port", &self.secure_port)
            .opt("bind-address", &self.bind_address)
            .list("etcd-servers", &self.etcd_servers)
            .list("etcd-servers-overrides", &self.etcd_servers_overrides)
            .opt("service-cluster-ip-range", &self.service_cluster_ip_range)
            .list("enable-admission-plugins", &self.enable_admission_plugins)
            .opt("anonymous-auth", &self.anonymous_auth)
            .opt("authorization-mode", &self.authorization_mode)
            .list(
                "kubelet-preferred-address-types",
                &self.kubelet_preferred_address_types,
            )
            .opt("allow-privileged", &self.allow_privileged)
            .opt("service-node-port-range", &self.service_node_port_range)
            .opt("enable-bootstrap-token-auth", &self.enable_bootstrap_auth_token)
            .opt("audit-log-path", &self.audit_log_path);
        if let Some(m) = &self.runtime_config {
            f.map("runtime-config", m);
        }
        if let Some(m) = &self.feature_gates {
            f.map("feature-gates", m);
        }
        f
    }
}

/// Settings for kube-controller-manager.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeControllerManagerConfig {
    /// Container image
    pub image: String,
    /// Log verbosity
    pub log_level: Option<i32>,
    /// Cloud provider flag
    pub cloud_provider: Option<String>,
    /// Cluster name used for cloud resource tagging
    pub cluster_name: Option<String>,
    /// Pod CIDR of the cluster
    #[serde(rename = "clusterCIDR")]
    pub cluster_cidr: Option<String>,
    /// Allocate per-node pod CIDRs
    #[serde(rename = "allocateNodeCIDRs")]
    pub allocate_node_cidrs: Option<bool>,
    /// Program cloud routes for pod CIDRs
    pub configure_cloud_routes: Option<bool>,
    /// Leader election
    pub leader_elect: Option<bool>,
    /// Feature gates
    pub feature_gates: Option<BTreeMap<String, String>>,
    /// CPU request
    pub cpu_request: Option<String>,
}

impl KubeControllerManagerConfig {
    /// Renders the settings that map one to one onto flags.
    pub fn flags(&self) -> FlagBuilder {
        let mut f = FlagBuilder::new();
        f.opt("v", &self.log_level)
            .opt("cloud-provider", &self.cloud_provider)
            .opt("cluster-name", &self.cluster_name)
            .opt("cluster-cidr", &self.cluster_cidr)
            .opt("allocate-node-cidrs", &self.allocate_node_cidrs)
            .opt("configure-cloud-routes", &self.configure_cloud_routes)
            .opt("leader-elect", &self.leader_elect);
        if let Some(m) = &self.feature_gates {
            f.map("feature-gates", m);
        }
        f
    }
}

/// Settings for kube-scheduler.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeSchedulerConfig {
    /// Container image
    pub image: String,
    /// Log verbosity
    pub log_level: Option<i32>,
    /// Leader election
    pub leader_elect: Option<bool>,
    /// Feature gates
    pub feature_gates: Option<BTreeMap<String, String>>,
    /// CPU request
    pub cpu_request: Option<String>,
}

/// Settings for kube-proxy.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeProxyConfig {
    /// Whether kube-proxy runs at all; defaults to true
    pub enabled: Option<bool>,
    /// Container image
    pub image: String,
    /// Log verbosity
    pub log_level: Option<i32>,
    /// Pod CIDR of the cluster
    #[serde(rename = "clusterCIDR")]
    pub cluster_cidr: Option<String>,
    /// iptables or ipvs
    pub proxy_mode: Option<String>,
    /// Metrics endpoint
    pub metrics_bind_address: Option<String>,
    /// Feature gates
    pub feature_gates: Option<BTreeMap<String, String>>,
    /// CPU request
    pub cpu_request: Option<String>,
    /// Memory request
    pub memory_request: Option<String>,
}

impl KubeProxyConfig {
    /// Renders the settings that map one to one onto flags.
    pub fn flags(&self) -> FlagBuilder {
        let mut f = FlagBuilder::new();
        f.opt("v", &self.log_level)
            .opt("cluster-cidr", &self.cluster_cidr)
            .opt("proxy-mode", &self.proxy_mode)
            .opt("metrics-bind-address", &self.metrics_bind_address);
        if let Some(m) = &self.feature_gates {
            f.map("feature-gates", m);
        }
        f
    }
}

/// Settings for an out-of-tree cloud controller manager.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudControllerManagerConfig {
    /// Container image
    pub image: String,
    /// Cloud provider flag
    pub cloud_provider: Option<String>,
}

/// containerd settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerdConfig {
    /// containerd version
    pub version: Option<String>,
    /// Complete replacement for the generated config.toml
    pub config_override: Option<String>,
    /// Log level
    pub log_level: Option<String>,
    /// Registry mirrors, by registry host
    pub registry_mirrors: BTreeMap<String, Vec<String>>,
    /// Use the containerd preinstalled on the image
    pub skip_install: bool,
    /// Paths marked immutable once installed
    pub mark_immutable: Vec<String>,
}

/// Cluster DNS settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct KubeDnsConfig {
    /// CoreDNS or KubeDNS
    pub provider: String,
    /// Service IP of the DNS service
    #[serde(rename = "serverIP")]
    pub server_ip: String,
    /// Cluster DNS domain
    pub domain: String,
}
