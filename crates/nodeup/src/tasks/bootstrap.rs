use async_trait::async_trait;
use bootstrap_client::backoff::ExponentialBackoffStrategy;
use bootstrap_client::{BootstrapRequest, Client, ClientConfig};
use tracing::{debug, info, warn};
use url::Url;

use super::{Delta, TaskId};
use crate::error::{Error, Result};
use crate::kubeconfig::Kubeconfig;
use crate::target::{write_atomic, LocalTarget};

/// A handle on the controller's bootstrap endpoint.
///
/// Rendering builds a CA-pinned client and registers it with the target
/// under `name`; no request is made until a
/// [`KubeletBootstrapKubeconfig`] needs one. Without a node identity nothing
/// is registered, and only a kubeconfig that still has to be fetched fails.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapClient {
    /// Handle name
    pub name: String,
    /// Controller host name
    pub controller_host: String,
    /// PEM CA bundle the controller's certificate must chain to
    pub ca: String,
}

#[async_trait(?Send)]
impl Delta for BootstrapClient {
    type Actual = ();

    async fn find(&self, target: &LocalTarget) -> Result<Option<()>> {
        Ok(target.bootstrap_client(&self.name).map(|_| ()))
    }

    async fn render(&self, target: &mut LocalTarget, actual: Option<&()>) -> Result<bool> {
        if actual.is_some() {
            return Ok(false);
        }
        let settings = match target.bootstrap_settings().cloned() {
            Some(settings) => settings,
            None => {
                warn!(client = %self.name, "no node identity configured; bootstrap client not registered");
                return Ok(false);
            }
        };
        let server = Url::parse(&format!("{}://{}:{}", settings.scheme, self.controller_host, settings.port))
            .map_err(|e| Error::config(format!("bad controller address {}: {}", self.controller_host, e)))?;
        let mut config = ClientConfig::new(server, self.ca.clone().into_bytes());
        config.timeout = settings.timeout;
        config.max_attempts = settings.max_attempts;
        config.backoff = ExponentialBackoffStrategy::new(settings.backoff_base, settings.backoff_base * 15);
        let client = Client::new(config, settings.authenticator)?;
        debug!(client = ?client, "bootstrap client ready");
        target.register_bootstrap_client(&self.name, client);
        // Registering a handle is not a change to the node.
        Ok(false)
    }
}

/// The kubeconfig the kubelet uses for its first contact with the API server.
///
/// Converged as soon as the file exists and is non-empty; tokens are never
/// renewed here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubeletBootstrapKubeconfig {
    /// Where the kubeconfig is written
    pub path: String,
    /// API server URL
    pub server_url: String,
    /// PEM CA bundle for the API server
    pub ca_certificate: String,
    /// Name of the [`BootstrapClient`] to use
    pub client: String,
    /// Name the node registers with
    pub node_name: String,
    /// Instance group the node belongs to
    pub instance_group: String,
}

#[async_trait(?Send)]
impl Delta for KubeletBootstrapKubeconfig {
    type Actual = ();

    async fn find(&self, target: &LocalTarget) -> Result<Option<()>> {
        let path = target.path(&self.path);
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(Some(())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    fn check_changes(&self, id: &TaskId, _actual: Option<&()>) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::config(format!("{}: node name is empty", id)));
        }
        Ok(())
    }

    async fn render(&self, target: &mut LocalTarget, actual: Option<&()>) -> Result<bool> {
        if actual.is_some() {
            debug!(path = %self.path, "bootstrap kubeconfig present, not contacting controller");
            return Ok(false);
        }
        let path = target.path(&self.path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let client = target.bootstrap_client(&self.client).ok_or_else(|| {
            Error::config(format!(
                "bootstrap client {} is not available: node bootstrap needs a node identity",
                self.client
            ))
        })?;
        let mut request = BootstrapRequest::new(&self.node_name);
        request.instance_group = Some(self.instance_group.clone());
        let response = client.bootstrap(&request).await?;

        let kubeconfig = Kubeconfig::with_token(
            "kubelet",
            &self.server_url,
            self.ca_certificate.as_bytes(),
            &response.bearer_token,
        );
        write_atomic(&path, kubeconfig.to_yaml()?.as_bytes(), 0o640)?;
        info!(path = %self.path, expires_at = %response.expires_at, "wrote bootstrap kubeconfig");
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::distro::Distribution;
    use crate::tasks::test::scratch_target;
    use crate::tasks::Task;

    fn kubeconfig_task() -> Task {
        KubeletBootstrapKubeconfig {
            path: "/var/lib/kubelet/bootstrap-kubeconfig".into(),
            server_url: "https://api.internal.example".into(),
            ca_certificate: "CA".into(),
            client: "kops-controller".into(),
            node_name: "node-1".into(),
            instance_group: "nodes".into(),
        }
        .into()
    }

    fn client_task() -> Task {
        BootstrapClient {
            name: "kops-controller".into(),
            controller_host: "kops-controller.internal.example".into(),
            ca: String::new(),
        }
        .into()
    }

    #[tokio::test]
    async fn client_without_identity_registers_nothing() {
        let (_dir, mut target, _log) = scratch_target(Distribution::Debian12);
        assert!(!client_task().apply(&mut target).await.unwrap());
        assert!(target.bootstrap_client("kops-controller").is_none());

        let err = kubeconfig_task().apply(&mut target).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
        assert!(err.to_string().contains("node identity"));
    }

    #[tokio::test]
    async fn existing_kubeconfig_skips_controller() {
        let (_dir, mut target, _log) = scratch_target(Distribution::Debian12);
        std::fs::create_dir_all(target.path("/var/lib/kubelet")).unwrap();
        std::fs::write(target.path("/var/lib/kubelet/bootstrap-kubeconfig"), "apiVersion: v1\n").unwrap();
        // A rerun without a token: no client is registered and none is needed.
        assert!(!client_task().apply(&mut target).await.unwrap());
        assert!(!kubeconfig_task().apply(&mut target).await.unwrap());
    }

    #[tokio::test]
    async fn empty_kubeconfig_is_not_converged() {
        let (_dir, mut target, _log) = scratch_target(Distribution::Debian12);
        std::fs::create_dir_all(target.path("/var/lib/kubelet")).unwrap();
        std::fs::write(target.path("/var/lib/kubelet/bootstrap-kubeconfig"), "").unwrap();
        let err = kubeconfig_task().apply(&mut target).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }
}
