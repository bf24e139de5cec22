//! A crate for turning a Kubernetes cluster specification into a configured
//! node.
//!
//! A run has two halves. Planning reads the cluster, instance group and
//! node-up documents into a [`model::NodeupModelContext`], lets every recipe
//! builder contribute tasks and resolves them into an ordered
//! [`graph::Plan`]. Applying walks the plan against a
//! [`target::LocalTarget`], changing only what differs from the desired
//! state.
//!
//! # Example
//! ```rust,no_run
//! use nodeup::config::Config;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> nodeup::Result<()> {
//!     let config = Config::default_config();
//!     let node = nodeup::prepare(&config).await?;
//!     for id in node.plan.ids() {
//!         println!("{}", id);
//!     }
//!     nodeup::apply(&config, node).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(feature = "docs", feature(doc_cfg))]

use std::rc::Rc;
use std::sync::Arc;

use bootstrap_client::StaticTokenAuthenticator;
use tracing::{debug, info};

pub mod api;
pub mod assets;
pub mod builders;
pub mod config;
pub mod distro;
pub mod environment;
mod error;
pub mod executor;
pub mod graph;
pub mod kubeconfig;
pub mod metadata;
pub mod model;
pub mod pki;
pub mod resource;
pub mod systemd;
pub mod target;
pub mod tasks;

pub use error::{Error, ErrorKind, Result};

use crate::assets::AssetStore;
use crate::config::Config;
use crate::distro::Distribution;
use crate::environment::EnvironmentSnapshot;
use crate::executor::RunReport;
use crate::graph::Plan;
use crate::metadata::MetadataClient;
use crate::model::NodeupModelContext;
use crate::pki::FileKeystore;
use crate::target::{BootstrapSettings, LocalTarget, SystemRunner};

/// A planned node, ready to apply.
pub struct Node {
    /// The model the plan was built from
    pub model: NodeupModelContext,
    /// The ordered tasks
    pub plan: Plan,
    metadata: Option<MetadataClient>,
}

/// Reads the inputs named by `config` and plans the node.
///
/// Nothing on the node changes. The instance metadata service is consulted
/// only when the node name must come from it.
pub async fn prepare(config: &Config) -> Result<Node> {
    let inputs = config.read_inputs()?;
    let distribution = Distribution::detect(&config.root)?;
    debug!(distribution = ?distribution, "detected distribution");

    let keystore = FileKeystore::new(&config.keystore_dir)
        .with_certificates(&inputs.nodeup_config.ca_certificates);
    let mut assets = AssetStore::new(&config.cache_dir);
    let architecture = inputs.nodeup_config.architecture;
    for line in inputs.nodeup_config.assets.get(&architecture).into_iter().flatten() {
        assets.add_asset(line)?;
    }

    let metadata = MetadataClient::for_provider(&inputs.cluster.spec.cloud_provider())?;
    let model = NodeupModelContext::new(
        inputs.cluster,
        inputs.instance_group,
        inputs.nodeup_config,
        distribution,
        Rc::new(keystore),
        assets,
        EnvironmentSnapshot::capture(),
    )?
    .with_config_base(config.config_base());
    let node_name = match &config.node_name {
        Some(name) => name.clone(),
        None => model.resolve_node_name(metadata.as_ref()).await?,
    };
    info!(node = %node_name, role = %model.role(), "planning node");
    let model = model.with_node_name(node_name);

    let plan = graph::resolve(builders::build_tasks(&model)?)?;
    Ok(Node {
        model,
        plan,
        metadata,
    })
}

/// Applies a planned node to the machine under `config.root`.
pub async fn apply(config: &Config, node: Node) -> Result<RunReport> {
    let mut target = LocalTarget::new(
        &config.root,
        node.model.distribution.clone(),
        &config.cache_dir,
        Box::new(SystemRunner),
    );
    if let Some(metadata) = node.metadata {
        target = target.with_metadata(metadata);
    }
    if let Some(token) = &config.bootstrap_token {
        let mut settings = BootstrapSettings::new(Arc::new(StaticTokenAuthenticator::new(token.as_str())));
        settings.port = config.bootstrap_port;
        target = target.with_bootstrap(settings);
    }
    let report = executor::execute(&node.plan, &mut target).await?;
    info!(
        changed = report.changed.len(),
        tasks = node.plan.tasks().len(),
        "node configured"
    );
    Ok(report)
}
