//! The subset of the process environment propagated to node daemons.
//!
//! Proxy settings and cloud credentials are captured once at startup. Recipes
//! read them from the snapshot carried by the model context, never from the
//! live process environment.

use std::collections::BTreeMap;

const PROXY_VARIABLES: &[&str] = &[
    "http_proxy",
    "https_proxy",
    "no_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
];

const CLOUD_VARIABLES: &[&str] = &[
    "AWS_REGION",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "S3_ENDPOINT",
    "S3_REGION",
    "S3_ACCESS_KEY_ID",
    "S3_SECRET_ACCESS_KEY",
    "DIGITALOCEAN_ACCESS_TOKEN",
    "HCLOUD_TOKEN",
    "AZURE_STORAGE_ACCOUNT",
    "YANDEX_CLOUD_CREDENTIAL_FILE",
];

const CLOUD_PREFIXES: &[&str] = &["OS_", "SCW_"];

/// An immutable copy of the propagated environment variables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvironmentSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvironmentSnapshot {
    /// Captures the propagated variables from the current process.
    pub fn capture() -> Self {
        Self::from_pairs(std::env::vars())
    }

    /// Builds a snapshot from arbitrary pairs, keeping only propagated names.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, v)| is_propagated(k) && !v.is_empty())
            .collect();
        EnvironmentSnapshot { vars }
    }

    /// Looks up a single captured variable.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Proxy variables only, sorted by name.
    pub fn proxy(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars
            .iter()
            .filter(|(k, _)| PROXY_VARIABLES.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Every captured variable, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Renders the snapshot as a systemd `EnvironmentFile`.
    pub fn to_environment_file(&self) -> String {
        self.vars
            .iter()
            .map(|(k, v)| format!("{}={}\n", k, v))
            .collect()
    }
}

fn is_propagated(name: &str) -> bool {
    PROXY_VARIABLES.contains(&name)
        || CLOUD_VARIABLES.contains(&name)
        || CLOUD_PREFIXES.iter().any(|p| name.starts_with(p))
}
