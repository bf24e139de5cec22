//! The input documents nodeup consumes: the cluster specification, the
//! instance group specification and the per-node configuration.

mod cluster;
mod components;
mod flags;
mod instance_group;
mod nodeup_config;

pub use cluster::*;
pub use components::*;
pub use flags::FlagBuilder;
pub use instance_group::*;
pub use nodeup_config::*;

use serde::{Deserialize, Serialize};

/// The metadata shared by the top-level documents.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name
    #[serde(default)]
    pub name: String,
}

/// Parses a YAML (or JSON) document.
pub fn from_yaml<T: serde::de::DeserializeOwned>(what: &str, data: &[u8]) -> crate::Result<T> {
    serde_yaml::from_slice(data)
        .map_err(|e| crate::Error::config(format!("unable to parse {}: {}", what, e)))
}
