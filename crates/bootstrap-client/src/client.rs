//! Bootstrap RPC client
//!
//! The controller exposes a single `POST /bootstrap` endpoint. The request
//! body names the node; the `Authorization` header carries the identity
//! proof produced by an [`Authenticator`]. A successful answer is a JSON
//! document holding the bearer token and its expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::Authenticator;
use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};
use crate::errors::BootstrapError;
use crate::BOOTSTRAP_API_VERSION;

const BOOTSTRAP_PATH: &str = "/bootstrap";

/// Settings used to build a [`Client`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the controller, e.g. `https://kops-controller.internal.example:3988`
    pub server: Url,
    /// PEM encoded CA bundle the controller's serving certificate must chain to.
    ///
    /// When empty, only plain HTTP endpoints can be used.
    pub ca_certificate: Vec<u8>,
    /// Budget for a single attempt, connect included.
    pub timeout: Duration,
    /// Total number of attempts before giving up.
    pub max_attempts: u32,
    /// Wait schedule between attempts.
    pub backoff: ExponentialBackoffStrategy,
}

impl ClientConfig {
    /// A config with the default timeout and retry schedule.
    pub fn new(server: Url, ca_certificate: Vec<u8>) -> Self {
        ClientConfig {
            server,
            ca_certificate,
            timeout: Duration::from_secs(60),
            max_attempts: 3,
            backoff: ExponentialBackoffStrategy::default(),
        }
    }
}

/// The body of a bootstrap request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequest {
    /// Always [`BOOTSTRAP_API_VERSION`]
    pub api_version: String,
    /// The name the node will register with
    pub node_name: String,
    /// The instance group the node belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_group: Option<String>,
}

impl BootstrapRequest {
    /// Creates a request for `node_name`.
    pub fn new(node_name: impl Into<String>) -> Self {
        BootstrapRequest {
            api_version: BOOTSTRAP_API_VERSION.to_string(),
            node_name: node_name.into(),
            instance_group: None,
        }
    }
}

/// A successful bootstrap answer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapResponse {
    /// Short lived credential for the kubelet's first contact with the API server
    pub bearer_token: String,
    /// When the credential stops being accepted
    pub expires_at: DateTime<Utc>,
}

/// Talks to the controller's bootstrap endpoint.
pub struct Client {
    config: ClientConfig,
    http: reqwest::Client,
    authenticator: Arc<dyn Authenticator>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.config.server.as_str())
            .field("timeout", &self.config.timeout)
            .field("max_attempts", &self.config.max_attempts)
            .finish()
    }
}

impl Client {
    /// Builds a client trusting only `config.ca_certificate`.
    pub fn new(
        config: ClientConfig,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self, BootstrapError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout);

        if !config.ca_certificate.is_empty() {
            let cert = reqwest::Certificate::from_pem(&config.ca_certificate)
                .map_err(|e| BootstrapError::Configuration(format!("invalid CA bundle: {}", e)))?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(cert);
        } else if config.server.scheme() == "https" {
            return Err(BootstrapError::Configuration(format!(
                "no CA certificate supplied for {}",
                config.server
            )));
        }

        let http = builder
            .build()
            .map_err(|e| BootstrapError::Configuration(e.to_string()))?;

        Ok(Client {
            config,
            http,
            authenticator,
        })
    }

    /// The full URL of the bootstrap endpoint.
    pub fn endpoint(&self) -> Result<Url, BootstrapError> {
        self.config
            .server
            .join(BOOTSTRAP_PATH)
            .map_err(|e| BootstrapError::Configuration(e.to_string()))
    }

    /// Requests a bootstrap token, retrying transient failures with backoff.
    pub async fn bootstrap(
        &self,
        request: &BootstrapRequest,
    ) -> Result<BootstrapResponse, BootstrapError> {
        let mut backoff = self.config.backoff.clone();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(request).await {
                Ok(response) => {
                    info!(
                        node = %request.node_name,
                        expires_at = %response.expires_at,
                        "obtained bootstrap token"
                    );
                    return Ok(response);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let wait = backoff.next_duration();
                    warn!(attempt, error = %e, ?wait, "bootstrap request failed, retrying");
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(&self, request: &BootstrapRequest) -> Result<BootstrapResponse, BootstrapError> {
        let url = self.endpoint()?;
        let body = serde_json::to_vec(request)
            .map_err(|e| BootstrapError::Configuration(e.to_string()))?;
        let token = self.authenticator.create_token(&body).await?;

        debug!(%url, "sending bootstrap request");
        let send = self
            .http
            .post(url.clone())
            .header(AUTHORIZATION, token)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send();

        let response = match tokio::time::timeout(self.config.timeout, send).await {
            Err(_) => return Err(BootstrapError::Timeout(self.config.timeout)),
            Ok(Err(e)) if e.is_timeout() => return Err(BootstrapError::Timeout(self.config.timeout)),
            Ok(Err(e)) => {
                return Err(BootstrapError::ControllerUnreachable {
                    url: url.to_string(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BootstrapError::ControllerUnreachable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(BootstrapError::Unauthorized {
                status: status.as_u16(),
                message: text.trim().to_string(),
            }),
            s if !s.is_success() => Err(BootstrapError::ControllerUnreachable {
                url: url.to_string(),
                reason: format!("{}: {}", s, text.trim()),
            }),
            _ => parse_response(&text),
        }
    }
}

fn parse_response(body: &str) -> Result<BootstrapResponse, BootstrapError> {
    let response: BootstrapResponse = serde_json::from_str(body)
        .map_err(|e| BootstrapError::MalformedResponse(e.to_string()))?;
    if response.bearer_token.trim().is_empty() {
        return Err(BootstrapError::MalformedResponse(
            "response carries an empty bearer token".to_string(),
        ));
    }
    Ok(response)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::auth::StaticTokenAuthenticator;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use warp::http::StatusCode as WarpStatus;
    use warp::Filter;

    fn client_for(addr: SocketAddr) -> Client {
        let mut config = ClientConfig::new(
            Url::parse(&format!("http://{}", addr)).unwrap(),
            Vec::new(),
        );
        config.timeout = Duration::from_secs(5);
        config.backoff =
            ExponentialBackoffStrategy::new(Duration::from_millis(1), Duration::from_millis(5));
        Client::new(config, Arc::new(StaticTokenAuthenticator::new("node-secret"))).unwrap()
    }

    macro_rules! serve {
        ($filter:expr) => {{
            let (addr, server) = warp::serve($filter).bind_ephemeral(([127, 0, 0, 1], 0));
            tokio::spawn(server);
            addr
        }};
    }

    #[tokio::test]
    async fn test_bootstrap_success() {
        let route = warp::post()
            .and(warp::path("bootstrap"))
            .and(warp::header::<String>("authorization"))
            .and(warp::body::json())
            .map(|auth: String, req: BootstrapRequest| {
                assert_eq!(auth, "x-node-token node-secret");
                assert_eq!(req.api_version, BOOTSTRAP_API_VERSION);
                warp::reply::json(&serde_json::json!({
                    "bearerToken": format!("token-for-{}", req.node_name),
                    "expiresAt": "2030-01-01T00:00:00Z",
                }))
            });
        let client = client_for(serve!(route));
        let response = client
            .bootstrap(&BootstrapRequest::new("node-a"))
            .await
            .unwrap();
        assert_eq!(response.bearer_token, "token-for-node-a");
        assert_eq!(response.expires_at.to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_forbidden_is_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let route = warp::path("bootstrap").map(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            warp::reply::with_status("identity not recognized", WarpStatus::FORBIDDEN)
        });
        let client = client_for(serve!(route));
        let err = client
            .bootstrap(&BootstrapRequest::new("node-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::Unauthorized { status: 403, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried_then_fail() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let route = warp::path("bootstrap").map(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            warp::reply::with_status("try later", WarpStatus::SERVICE_UNAVAILABLE)
        });
        let client = client_for(serve!(route));
        let err = client
            .bootstrap(&BootstrapRequest::new("node-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::ControllerUnreachable { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_garbage_is_malformed() {
        let route = warp::path("bootstrap").map(|| "<html>not json</html>");
        let client = client_for(serve!(route));
        let err = client
            .bootstrap(&BootstrapRequest::new("node-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_unreachable_controller() {
        // Bind and drop a listener to get a port nothing listens on.
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let client = client_for(addr);
        let err = client
            .bootstrap(&BootstrapRequest::new("node-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::ControllerUnreachable { .. }));
    }

    #[test]
    fn test_https_requires_ca() {
        let config = ClientConfig::new(Url::parse("https://controller:3988").unwrap(), Vec::new());
        let err = Client::new(config, Arc::new(StaticTokenAuthenticator::new("t"))).unwrap_err();
        assert!(matches!(err, BootstrapError::Configuration(_)));
    }

    #[test]
    fn test_pinned_ca_is_accepted() {
        let ca = rcgen::generate_simple_self_signed(vec!["controller".to_string()]).unwrap();
        let pem = ca.serialize_pem().unwrap();
        let config = ClientConfig::new(
            Url::parse("https://controller:3988").unwrap(),
            pem.into_bytes(),
        );
        let client = Client::new(config, Arc::new(StaticTokenAuthenticator::new("t"))).unwrap();
        assert_eq!(
            client.endpoint().unwrap().as_str(),
            "https://controller:3988/bootstrap"
        );
    }

    #[test]
    fn test_empty_token_is_malformed() {
        let err = parse_response(r#"{"bearerToken":"","expiresAt":"2030-01-01T00:00:00Z"}"#)
            .unwrap_err();
        assert!(matches!(err, BootstrapError::MalformedResponse(_)));
    }
}
