//! Runtime configuration for a node-up run.
//!
//! Build one with [`Config::default_config`] or, with the "cli" feature, from
//! command line flags and `NODEUP_*` environment variables through
//! [`Config::new_from_flags`].

use std::path::{Path, PathBuf};

#[cfg(feature = "cli")]
use structopt::StructOpt;

use tracing::debug;

use crate::api::{from_yaml, Cluster, InstanceGroup, NodeupConfig};
use crate::error::{Error, Result};

const DEFAULT_CONF: &str = "/opt/kops/conf/kube_env.yaml";
const DEFAULT_CLUSTER: &str = "/opt/kops/conf/cluster_spec.yaml";
const DEFAULT_INSTANCE_GROUP: &str = "/opt/kops/conf/ig_spec.yaml";
const DEFAULT_CACHE_DIR: &str = "/var/cache/kubernetes-install";
const DEFAULT_KEYSTORE_DIR: &str = "/opt/kops/pki";

/// Everything a run needs besides the input documents themselves.
#[derive(Clone, Debug)]
pub struct Config {
    /// The node-up configuration document
    pub conf: PathBuf,
    /// The cluster specification
    pub cluster: PathBuf,
    /// The instance group specification
    pub instance_group: PathBuf,
    /// Where static manifests are read from; defaults to the directory of `conf`
    pub config_base: Option<PathBuf>,
    /// Where staged assets live
    pub cache_dir: PathBuf,
    /// Where keysets and secrets live
    pub keystore_dir: PathBuf,
    /// The filesystem root node paths are resolved against
    pub root: PathBuf,
    /// Overrides the resolved node name
    pub node_name: Option<String>,
    /// Port of the controller's bootstrap endpoint
    pub bootstrap_port: u16,
    /// Token proving this node's identity to the controller
    pub bootstrap_token: Option<String>,
    /// Print the plan without applying it
    pub plan: bool,
}

/// The three input documents.
#[derive(Clone, Debug)]
pub struct Inputs {
    /// The cluster
    pub cluster: Cluster,
    /// This node's instance group
    pub instance_group: InstanceGroup,
    /// The per-node configuration
    pub nodeup_config: NodeupConfig,
}

impl Config {
    /// A config with the standard on-node locations.
    pub fn default_config() -> Self {
        Config {
            conf: PathBuf::from(DEFAULT_CONF),
            cluster: PathBuf::from(DEFAULT_CLUSTER),
            instance_group: PathBuf::from(DEFAULT_INSTANCE_GROUP),
            config_base: None,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            keystore_dir: PathBuf::from(DEFAULT_KEYSTORE_DIR),
            root: PathBuf::from("/"),
            node_name: None,
            bootstrap_port: bootstrap_client::DEFAULT_PORT,
            bootstrap_token: None,
            plan: false,
        }
    }

    /// Parses all command line flags. The version of your application is
    /// shown by `--version`.
    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub fn new_from_flags(version: &str) -> Self {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        Config {
            conf: opts.conf,
            cluster: opts.cluster,
            instance_group: opts.instance_group,
            config_base: opts.config_base,
            cache_dir: opts.cache_dir,
            keystore_dir: opts.keystore_dir,
            root: opts.root,
            node_name: opts.node_name,
            bootstrap_port: opts.bootstrap_port,
            bootstrap_token: opts.bootstrap_token,
            plan: opts.plan,
        }
    }

    /// The directory static manifests are read from.
    pub fn config_base(&self) -> PathBuf {
        match &self.config_base {
            Some(dir) => dir.clone(),
            None => self
                .conf
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    /// Reads and parses the three input documents.
    pub fn read_inputs(&self) -> Result<Inputs> {
        let inputs = Inputs {
            cluster: read_document("cluster spec", &self.cluster)?,
            instance_group: read_document("instance group spec", &self.instance_group)?,
            nodeup_config: read_document("nodeup config", &self.conf)?,
        };
        if inputs.cluster.spec.kubernetes_version.is_empty() {
            return Err(Error::config("cluster spec has no kubernetesVersion"));
        }
        Ok(inputs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

fn read_document<T: serde::de::DeserializeOwned>(what: &str, path: &Path) -> Result<T> {
    let data = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    debug!(document = what, path = ?path, "read input document");
    from_yaml(what, &data)
}

/// CLI options for nodeup.
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
#[structopt(
    name = "nodeup",
    about = "Configures this machine as a node of a Kubernetes cluster"
)]
pub struct Opts {
    #[structopt(
        long = "conf",
        env = "NODEUP_CONF",
        default_value = DEFAULT_CONF,
        help = "The node-up configuration for this node"
    )]
    conf: PathBuf,

    #[structopt(
        long = "cluster",
        env = "NODEUP_CLUSTER",
        default_value = DEFAULT_CLUSTER,
        help = "The cluster specification"
    )]
    cluster: PathBuf,

    #[structopt(
        long = "instance-group",
        env = "NODEUP_INSTANCE_GROUP",
        default_value = DEFAULT_INSTANCE_GROUP,
        help = "The instance group specification"
    )]
    instance_group: PathBuf,

    #[structopt(
        long = "config-base",
        env = "NODEUP_CONFIG_BASE",
        help = "Directory static manifests are read from. Defaults to the directory of --conf"
    )]
    config_base: Option<PathBuf>,

    #[structopt(
        long = "cache-dir",
        env = "NODEUP_CACHE_DIR",
        default_value = DEFAULT_CACHE_DIR,
        help = "Directory holding the staged assets"
    )]
    cache_dir: PathBuf,

    #[structopt(
        long = "keystore",
        env = "NODEUP_KEYSTORE",
        default_value = DEFAULT_KEYSTORE_DIR,
        help = "Directory holding keysets and secrets"
    )]
    keystore_dir: PathBuf,

    #[structopt(
        long = "root",
        env = "NODEUP_ROOT",
        default_value = "/",
        help = "Filesystem root to apply the node configuration under"
    )]
    root: PathBuf,

    #[structopt(
        long = "node-name",
        env = "NODEUP_NODE_NAME",
        help = "The node name, overriding the hostname and instance metadata"
    )]
    node_name: Option<String>,

    #[structopt(
        long = "bootstrap-port",
        env = "NODEUP_BOOTSTRAP_PORT",
        default_value = "3988",
        help = "Port of the controller's bootstrap endpoint"
    )]
    bootstrap_port: u16,

    #[structopt(
        long = "bootstrap-token",
        env = "NODEUP_BOOTSTRAP_TOKEN",
        hide_env_values = true,
        help = "Token proving this node's identity to the controller"
    )]
    bootstrap_token: Option<String>,

    #[structopt(
        long = "plan",
        env = "NODEUP_PLAN",
        help = "Print the ordered task identities and exit without applying"
    )]
    plan: bool,
}
