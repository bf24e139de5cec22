//! The read-only per-node model the builders plan from.
//!
//! A [`NodeupModelContext`] is assembled once per run from the three input
//! documents, the detected distribution and the stores. Everything a builder
//! needs to decide what to contribute is answered here, so builders never
//! touch the live system while planning.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;

use semver::Version;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::api::{
    Architecture, CloudProvider, Cluster, InstanceGroup, InstanceGroupRole, KubeletConfigSpec,
    NodeupConfig,
};
use crate::assets::AssetStore;
use crate::distro::{Distribution, Family};
use crate::environment::EnvironmentSnapshot;
use crate::error::{Error, Result};
use crate::metadata::MetadataClient;
use crate::pki::{KeysetItem, Keystore};

/// Where static pod manifests go.
pub const MANIFESTS_DIR: &str = "/etc/kubernetes/manifests";
/// The cloud provider configuration file.
pub const CLOUD_CONFIG_PATH: &str = "/etc/kubernetes/cloud.config";
/// The bootstrap kubeconfig a worker obtains from the controller.
pub const BOOTSTRAP_KUBECONFIG_PATH: &str = "/var/lib/kubelet/bootstrap-kubeconfig";
/// The kubelet's own kubeconfig.
pub const KUBELET_KUBECONFIG_PATH: &str = "/var/lib/kubelet/kubeconfig";
/// The keyset signing cluster certificates.
pub const KUBERNETES_CA: &str = "kubernetes-ca";

const ROLE_LABEL: &str = "kubernetes.io/role";
const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";
const NODE_LABEL: &str = "node-role.kubernetes.io/node";

/// Node name overrides that ask the metadata service.
const CLOUD_NODE_NAMES: &[&str] = &[
    "@cloud",
    "@aws",
    "@gce",
    "@digitalocean",
    "@hetzner",
    "@scaleway",
];

/// The inputs of one run.
pub struct NodeupModelContext {
    /// Cluster specification
    pub cluster: Cluster,
    /// Specification of this node's instance group
    pub instance_group: InstanceGroup,
    /// Per-node configuration
    pub nodeup_config: NodeupConfig,
    /// Detected operating system
    pub distribution: Distribution,
    /// Certificates, keys and secrets
    pub keystore: Rc<dyn Keystore>,
    /// Pre-staged binaries and archives
    pub assets: AssetStore,
    /// Environment propagated to node daemons
    pub environment: EnvironmentSnapshot,
    /// Directory static manifests are published in
    pub config_base: Option<PathBuf>,
    node_name: String,
    kubernetes_version: Version,
    kubelet_config: KubeletConfigSpec,
    template_data: Rc<Value>,
}

impl NodeupModelContext {
    /// Assembles the model, parsing the kubernetes version and merging the
    /// kubelet configuration once.
    pub fn new(
        cluster: Cluster,
        instance_group: InstanceGroup,
        nodeup_config: NodeupConfig,
        distribution: Distribution,
        keystore: Rc<dyn Keystore>,
        assets: AssetStore,
        environment: EnvironmentSnapshot,
    ) -> Result<Self> {
        let kubernetes_version = parse_kubernetes_version(&cluster.spec.kubernetes_version)?;
        let template_data = Rc::new(json!({
            "Cluster": to_value("cluster", &cluster.spec)?,
            "InstanceGroup": to_value("instance group", &instance_group.spec)?,
            "NodeupConfig": to_value("nodeup config", &nodeup_config)?,
        }));
        let mut model = NodeupModelContext {
            cluster,
            instance_group,
            nodeup_config,
            distribution,
            keystore,
            assets,
            environment,
            config_base: None,
            node_name: String::new(),
            kubernetes_version,
            kubelet_config: KubeletConfigSpec::default(),
            template_data,
        };
        model.kubelet_config = model.build_kubelet_config();
        Ok(model)
    }

    /// Sets the directory static manifests are read from.
    pub fn with_config_base(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_base = Some(dir.into());
        self
    }

    /// Sets the resolved node name.
    pub fn with_node_name(mut self, name: impl Into<String>) -> Self {
        self.node_name = name.into();
        self
    }

    /// The node name, once resolved.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// The cluster name.
    pub fn cluster_name(&self) -> &str {
        if self.nodeup_config.cluster_name.is_empty() {
            &self.cluster.metadata.name
        } else {
            &self.nodeup_config.cluster_name
        }
    }

    /// CPU architecture of the node.
    pub fn architecture(&self) -> Architecture {
        self.nodeup_config.architecture
    }

    /// The parsed kubernetes version.
    pub fn kubernetes_version(&self) -> &Version {
        &self.kubernetes_version
    }

    /// Whether the cluster runs at least `major.minor`.
    pub fn is_kubernetes_gte(&self, major: u64, minor: u64) -> bool {
        (self.kubernetes_version.major, self.kubernetes_version.minor) >= (major, minor)
    }

    /// The role of this node's instance group.
    pub fn role(&self) -> InstanceGroupRole {
        self.instance_group.spec.role
    }

    /// Whether this node runs the control plane.
    pub fn is_master(&self) -> bool {
        self.role() == InstanceGroupRole::Master
    }

    /// Whether this node serves the kubernetes API.
    pub fn is_api_server(&self) -> bool {
        matches!(self.role(), InstanceGroupRole::Master | InstanceGroupRole::ApiServer)
    }

    /// Whether a role list selects this node. An empty list selects all.
    pub fn has_role(&self, roles: &[InstanceGroupRole]) -> bool {
        roles.is_empty() || roles.contains(&self.role())
    }

    /// The cloud the cluster runs on.
    pub fn cloud_provider(&self) -> CloudProvider {
        self.cluster.spec.cloud_provider()
    }

    /// Whether any etcd cluster is run by etcd-manager.
    pub fn uses_etcd_manager(&self) -> bool {
        self.cluster.spec.etcd_clusters.iter().any(|e| e.uses_manager())
    }

    /// Whether the API server reaches etcd with a client certificate.
    pub fn uses_etcd_tls(&self) -> bool {
        self.cluster.spec.etcd_clusters.iter().any(|e| e.uses_tls())
    }

    /// Whether pods are networked by a CNI plugin.
    pub fn uses_cni(&self) -> bool {
        self.cluster
            .spec
            .networking
            .as_ref()
            .map(|n| n.uses_cni())
            .unwrap_or(true)
    }

    /// Whether kubenet is the network plugin.
    pub fn uses_kubenet(&self) -> bool {
        self.cluster
            .spec
            .networking
            .as_ref()
            .map(|n| n.uses_kubenet())
            .unwrap_or(false)
    }

    /// Whether the api server accepts bootstrap tokens.
    pub fn uses_bootstrap_tokens(&self) -> bool {
        self.cluster
            .spec
            .kube_api_server
            .as_ref()
            .and_then(|a| a.enable_bootstrap_auth_token)
            .unwrap_or(false)
    }

    /// Whether anonymous access to the kubelet API is off.
    pub fn uses_secure_kubelet(&self) -> bool {
        self.kubelet_config.anonymous_auth == Some(false)
    }

    /// Whether cluster DNS is gossip based.
    pub fn is_gossip(&self) -> bool {
        self.cluster_name().ends_with(".k8s.local")
    }

    /// Whether the cluster uses neither public nor private DNS.
    pub fn uses_no_dns(&self) -> bool {
        self.cluster.spec.dns_zone.is_empty() && !self.is_gossip()
    }

    /// The name nodes use to reach the api server.
    pub fn api_internal_name(&self) -> String {
        if self.cluster.spec.master_internal_name.is_empty() {
            format!("api.internal.{}", self.cluster_name())
        } else {
            self.cluster.spec.master_internal_name.clone()
        }
    }

    /// The name nodes use to reach kops-controller.
    pub fn kops_controller_name(&self) -> String {
        format!("kops-controller.internal.{}", self.cluster_name())
    }

    /// Whether this node obtains its kubelet credentials from kops-controller.
    pub fn uses_kops_controller_bootstrap(&self) -> bool {
        self.nodeup_config.use_kops_controller_for_node_bootstrap && !self.is_master()
    }

    /// Whether the container runtime is containerd.
    pub fn uses_containerd(&self) -> bool {
        matches!(self.cluster.spec.container_runtime.as_str(), "" | "containerd")
    }

    /// Root that relative File paths are placed under.
    pub fn service_files_root(&self) -> &'static str {
        match self.distribution {
            Distribution::ContainerOs => "/home/kubernetes",
            _ => "/etc/kubernetes",
        }
    }

    /// Where cluster certificates and keys live.
    pub fn path_srv_kubernetes(&self) -> &'static str {
        match self.distribution {
            Distribution::ContainerOs => "/etc/srv/kubernetes",
            _ => "/srv/kubernetes",
        }
    }

    /// Directory kubernetes binaries are installed in.
    pub fn bin_dir(&self) -> &'static str {
        match self.distribution {
            Distribution::ContainerOs => "/home/kubernetes/bin",
            Distribution::Flatcar => "/opt/kubernetes/bin",
            _ => "/usr/local/bin",
        }
    }

    /// Location of the kubelet binary.
    pub fn kubelet_path(&self) -> String {
        format!("{}/kubelet", self.bin_dir())
    }

    /// Location of the kubectl binary.
    pub fn kubectl_path(&self) -> String {
        format!("{}/kubectl", self.bin_dir())
    }

    /// Directory CNI plugin binaries are installed in.
    pub fn cni_bin_dir(&self) -> &'static str {
        match self.distribution {
            Distribution::ContainerOs => "/home/kubernetes/bin/",
            _ => "/opt/cni/bin/",
        }
    }

    /// Directory CNI network configuration is read from.
    pub fn cni_conf_dir(&self) -> &'static str {
        "/etc/cni/net.d/"
    }

    /// Host directories with system TLS trust that static pods mount.
    pub fn ssl_host_paths(&self) -> Vec<&'static str> {
        let mut paths = vec!["/etc/ssl", "/etc/pki/tls", "/etc/pki/ca-trust"];
        match self.distribution.family() {
            Family::Debian => paths.push("/usr/share/ca-certificates"),
            Family::Rhel | Family::Amazon => paths.push("/etc/pki/ca-trust/extracted"),
            Family::Immutable => paths.push("/usr/share/ca-certificates"),
            Family::Unknown => {}
        }
        paths
    }

    /// The data templated resources render against.
    pub fn template_data(&self) -> Rc<Value> {
        Rc::clone(&self.template_data)
    }

    /// The kubelet configuration for this node.
    pub fn kubelet_config(&self) -> &KubeletConfigSpec {
        &self.kubelet_config
    }

    fn build_kubelet_config(&self) -> KubeletConfigSpec {
        let mut config = KubeletConfigSpec::default();
        let cluster_level = if self.is_master() {
            self.cluster.spec.master_kubelet.as_ref()
        } else {
            self.cluster.spec.kubelet.as_ref()
        };
        if let Some(base) = cluster_level {
            config.merge(base);
        }
        if let Some(overrides) = &self.nodeup_config.kubelet_config {
            config.merge(overrides);
        }
        if let Some(overrides) = &self.instance_group.spec.kubelet {
            config.merge(overrides);
        }

        let labels = config.node_labels.get_or_insert_with(BTreeMap::new);
        if self.is_master() {
            labels.insert(CONTROL_PLANE_LABEL.to_string(), String::new());
            labels.insert(ROLE_LABEL.to_string(), "master".to_string());
        } else {
            labels.insert(NODE_LABEL.to_string(), String::new());
            labels.insert(ROLE_LABEL.to_string(), "node".to_string());
        }
        labels.extend(
            self.instance_group
                .spec
                .node_labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        let taints = config.taints.get_or_insert_with(Vec::new);
        taints.extend(self.instance_group.spec.taints.iter().cloned());
        if taints.is_empty() && self.is_master() {
            taints.push(format!("{}=:NoSchedule", CONTROL_PLANE_LABEL));
        }
        config.register_schedulable = Some(true);
        config
    }

    /// Resolves the node name from the kubelet hostname override.
    ///
    /// Cloud placeholders such as `@cloud` ask the instance metadata service.
    /// Without an override the OS hostname is used.
    pub async fn resolve_node_name(&self, metadata: Option<&MetadataClient>) -> Result<String> {
        match self.kubelet_config.hostname_override.as_deref() {
            Some(placeholder) if CLOUD_NODE_NAMES.contains(&placeholder) => {
                let metadata = metadata.ok_or_else(|| {
                    Error::config(format!(
                        "hostname override {} needs instance metadata, which {} does not offer",
                        placeholder,
                        self.cloud_provider()
                    ))
                })?;
                let name = metadata.node_name().await?;
                debug!(node = %name, "node name from instance metadata");
                Ok(name)
            }
            Some(placeholder) if placeholder.starts_with('@') => Err(Error::config(format!(
                "unknown hostname override {}",
                placeholder
            ))),
            Some(name) if !name.is_empty() => Ok(name.to_string()),
            _ => {
                let name = hostname::get().map_err(|e| Error::io("/etc/hostname", e))?;
                Ok(name.to_string_lossy().to_ascii_lowercase())
            }
        }
    }

    /// The PEM trust bundle of a CA keyset.
    ///
    /// Falls back to the CAs carried in the nodeup config.
    pub fn ca_certificate(&self, name: &str) -> Result<String> {
        if let Some(keyset) = self.keystore.find_keyset(name)? {
            let bundle = keyset.trust_bundle();
            if !bundle.is_empty() {
                return Ok(bundle);
            }
        }
        self.nodeup_config
            .ca_certificates
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("keyset", name))
    }

    /// The keyset item signing with `name`.
    ///
    /// The nodeup config may pin a keypair id. Otherwise the primary item
    /// signs.
    pub fn signer(&self, name: &str) -> Result<KeysetItem> {
        let keyset = self
            .keystore
            .find_keyset(name)?
            .ok_or_else(|| Error::not_found("keyset", name))?;
        let item = match self.nodeup_config.keypair_ids.get(name) {
            Some(id) => keyset.item(id),
            None => keyset.primary(),
        };
        match item {
            Some(item) if item.private_key.is_some() => Ok(item.clone()),
            Some(_) => Err(Error::not_found("private key", name)),
            None => Err(Error::not_found("keyset item", name)),
        }
    }

    /// The update policy, node level first.
    pub fn update_policy(&self) -> &str {
        if !self.nodeup_config.update_policy.is_empty() {
            &self.nodeup_config.update_policy
        } else {
            self.cluster.spec.update_policy.as_deref().unwrap_or("automatic")
        }
    }

    /// Warns that a recipe has nothing to offer this distribution.
    pub fn warn_unsupported(&self, what: &str) {
        warn!(
            distribution = ?self.distribution,
            "unknown distribution; skipping {}", what
        );
    }
}

fn to_value<T: serde::Serialize>(what: &str, value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| Error::config(format!("unable to serialize {}: {}", what, e)))
}

/// Parses `v1.22.3`, `1.22` and similar spellings.
pub fn parse_kubernetes_version(version: &str) -> Result<Version> {
    let trimmed = version.trim().trim_start_matches('v');
    let core = trimmed.split(|c| c == '-' || c == '+').next().unwrap_or_default();
    let padded = match core.split('.').count() {
        1 => format!("{}.0.0", core),
        2 => format!("{}.0", core),
        _ => core.to_string(),
    };
    Version::parse(&padded).map_err(|e| {
        Error::config(format!("unable to parse kubernetes version {:?}: {}", version, e))
    })
}
