//! The kubeconfig document kubelet, kube-proxy and friends read.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single-cluster, single-user kubeconfig.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// Always `v1`
    pub api_version: String,
    /// Always `Config`
    pub kind: String,
    /// Clusters by name
    pub clusters: Vec<NamedCluster>,
    /// Users by name
    pub users: Vec<NamedUser>,
    /// Contexts by name
    pub contexts: Vec<NamedContext>,
    /// The context used by default
    pub current_context: String,
}

/// A cluster entry.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct NamedCluster {
    /// Entry name
    pub name: String,
    /// Connection details
    pub cluster: ClusterEntry,
}

/// API server connection details.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    /// API server URL
    pub server: String,
    /// Base64 PEM CA bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    /// Path of a PEM CA bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority: Option<String>,
}

/// A user entry.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct NamedUser {
    /// Entry name
    pub name: String,
    /// Credentials
    pub user: UserEntry,
}

/// Credentials: a bearer token or a client certificate.
#[derive(Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct UserEntry {
    /// Bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Path of a client certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<String>,
    /// Path of the client key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

impl std::fmt::Debug for UserEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserEntry")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("client_certificate", &self.client_certificate)
            .field("client_key", &self.client_key)
            .finish()
    }
}

/// A context entry.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct NamedContext {
    /// Entry name
    pub name: String,
    /// Cluster and user binding
    pub context: ContextEntry,
}

/// Binds a cluster to a user.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ContextEntry {
    /// Cluster entry name
    pub cluster: String,
    /// User entry name
    pub user: String,
}

impl Kubeconfig {
    /// A kubeconfig named `name` for `server` using `user`.
    pub fn new(name: &str, server: &str, cluster: ClusterEntry, user: UserEntry) -> Self {
        Kubeconfig {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![NamedCluster {
                name: name.to_string(),
                cluster: ClusterEntry {
                    server: server.to_string(),
                    ..cluster
                },
            }],
            users: vec![NamedUser {
                name: name.to_string(),
                user,
            }],
            contexts: vec![NamedContext {
                name: "service-account-context".to_string(),
                context: ContextEntry {
                    cluster: name.to_string(),
                    user: name.to_string(),
                },
            }],
            current_context: "service-account-context".to_string(),
        }
    }

    /// A kubeconfig authenticating with a bearer token and inline CA.
    pub fn with_token(name: &str, server: &str, ca_pem: &[u8], token: &str) -> Self {
        Self::new(
            name,
            server,
            ClusterEntry {
                server: String::new(),
                certificate_authority_data: Some(base64::encode(ca_pem)),
                certificate_authority: None,
            },
            UserEntry {
                token: Some(token.to_string()),
                ..Default::default()
            },
        )
    }

    /// A kubeconfig authenticating with client certificate files.
    pub fn with_client_cert(name: &str, server: &str, ca_path: &str, cert_path: &str, key_path: &str) -> Self {
        Self::new(
            name,
            server,
            ClusterEntry {
                server: String::new(),
                certificate_authority_data: None,
                certificate_authority: Some(ca_path.to_string()),
            },
            UserEntry {
                token: None,
                client_certificate: Some(cert_path.to_string()),
                client_key: Some(key_path.to_string()),
            },
        )
    }

    /// Serializes as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::config(format!("unable to serialize kubeconfig: {}", e)))
    }
}
