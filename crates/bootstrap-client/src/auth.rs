//! Node identity proofs attached to bootstrap requests.

use crate::errors::BootstrapError;

/// Produces the `Authorization` header value proving this node's identity.
///
/// The proof may be bound to the request body, so the serialized body is
/// passed in. Implementations typically read an instance identity document
/// or a pre-provisioned node token.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the header value for a request carrying `body`.
    async fn create_token(&self, body: &[u8]) -> Result<String, BootstrapError>;
}

/// Authenticates with a fixed, pre-provisioned node token.
#[derive(Clone)]
pub struct StaticTokenAuthenticator {
    token: String,
}

impl StaticTokenAuthenticator {
    /// Creates an authenticator sending `token` with the `x-node-token` scheme.
    pub fn new(token: impl Into<String>) -> Self {
        StaticTokenAuthenticator {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenAuthenticator")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait::async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn create_token(&self, _body: &[u8]) -> Result<String, BootstrapError> {
        if self.token.trim().is_empty() {
            return Err(BootstrapError::Configuration(
                "node token is empty".to_string(),
            ));
        }
        Ok(format!("x-node-token {}", self.token.trim()))
    }
}
