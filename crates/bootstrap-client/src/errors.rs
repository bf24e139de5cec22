//! Errors returned while talking to the bootstrap controller

use std::time::Duration;

/// A failure of the bootstrap RPC.
#[derive(thiserror::Error, Debug)]
pub enum BootstrapError {
    /// The controller could not be reached, or kept failing after all retries.
    #[error("controller at {url} is unreachable: {reason}")]
    ControllerUnreachable {
        /// The endpoint that was contacted
        url: String,
        /// The last transport or server error observed
        reason: String,
    },
    /// The controller refused the node identity proof.
    #[error("controller rejected the bootstrap request ({status}): {message}")]
    Unauthorized {
        /// HTTP status code returned by the controller
        status: u16,
        /// Body returned by the controller
        message: String,
    },
    /// The controller answered with something that is not a bootstrap response.
    #[error("malformed bootstrap response: {0}")]
    MalformedResponse(String),
    /// A single attempt exceeded its time budget.
    #[error("bootstrap request timed out after {0:?}")]
    Timeout(Duration),
    /// The client itself was configured incorrectly (bad CA bundle, bad URL).
    #[error("invalid bootstrap client configuration: {0}")]
    Configuration(String),
}

impl BootstrapError {
    /// Whether another attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BootstrapError::ControllerUnreachable { .. } | BootstrapError::Timeout(_)
        )
    }
}
