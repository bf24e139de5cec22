//! Errors surfaced while planning or applying node state.

use std::path::PathBuf;
use std::time::Duration;

use bootstrap_client::BootstrapError;

/// A convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The broad category an [`Error`] belongs to.
///
/// Every category is fatal to a run; the category only tells the operator
/// (and the supervisor retrying the unit) what went wrong.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The inputs are internally inconsistent.
    Configuration,
    /// A requested asset, certificate or key is absent.
    NotFound,
    /// A hash did not match.
    Integrity,
    /// A task refused to perform an impossible transition.
    PreconditionFailed,
    /// A filesystem, network or command hiccup.
    TransientIo,
    /// The bootstrap controller could not be reached.
    ControllerUnreachable,
    /// The bootstrap controller rejected this node.
    Unauthorized,
    /// The bootstrap controller answered with garbage.
    MalformedResponse,
    /// The task graph contains a cycle.
    CycleDetected,
    /// A blocking operation ran past its budget.
    Timeout,
}

/// Everything that can go wrong in nodeup.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The inputs are internally inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A named asset, certificate, key or secret does not exist.
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// What was looked up (asset, keyset, secret, ...)
        kind: &'static str,
        /// The name that was looked up
        name: String,
    },

    /// Content did not hash to the expected value.
    #[error("hash mismatch for {name}: expected {expected}, got {actual}")]
    Integrity {
        /// The asset or download that failed verification
        name: String,
        /// The expected hex digest
        expected: String,
        /// The computed hex digest
        actual: String,
    },

    /// A resource could not be opened.
    #[error("unable to open resource {name}: {reason}")]
    OpenFailed {
        /// Description of the resource
        name: String,
        /// Why it could not be opened
        reason: String,
    },

    /// A task refused the requested transition.
    #[error("precondition failed for {task}: {reason}")]
    PreconditionFailed {
        /// Identity of the rejecting task
        task: String,
        /// Why the transition is impossible
        reason: String,
    },

    /// An existing account has a different uid than requested.
    #[error("user {user} exists with uid {actual}, expected {expected}")]
    UidConflict {
        /// Account name
        user: String,
        /// Requested uid
        expected: u32,
        /// uid found on the system
        actual: u32,
    },

    /// A filesystem operation failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// The path being operated on
        path: PathBuf,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },

    /// An OS command exited unsuccessfully.
    #[error("command {command:?} failed ({status}): {output}")]
    Command {
        /// The argv that was run
        command: Vec<String>,
        /// Exit status description
        status: String,
        /// Combined output
        output: String,
    },

    /// A network request (other than the bootstrap RPC) failed.
    #[error("request to {url} failed: {reason}")]
    Http {
        /// The URL requested
        url: String,
        /// Why it failed
        reason: String,
    },

    /// The bootstrap RPC failed.
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    /// The task graph contains a dependency cycle.
    #[error("dependency cycle detected between tasks: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    /// A blocking operation exceeded its budget.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// How long was waited
        after: Duration,
    },
}

impl Error {
    /// Wraps an I/O error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Shorthand for a [`Error::NotFound`].
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Shorthand for a [`Error::Configuration`].
    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Integrity { .. } => ErrorKind::Integrity,
            Error::OpenFailed { .. } | Error::Io { .. } | Error::Command { .. } | Error::Http { .. } => {
                ErrorKind::TransientIo
            }
            Error::PreconditionFailed { .. } | Error::UidConflict { .. } => {
                ErrorKind::PreconditionFailed
            }
            Error::Bootstrap(e) => match e {
                BootstrapError::ControllerUnreachable { .. } => ErrorKind::ControllerUnreachable,
                BootstrapError::Unauthorized { .. } => ErrorKind::Unauthorized,
                BootstrapError::MalformedResponse(_) => ErrorKind::MalformedResponse,
                BootstrapError::Timeout(_) => ErrorKind::Timeout,
                BootstrapError::Configuration(_) => ErrorKind::Configuration,
            },
            Error::CycleDetected(_) => ErrorKind::CycleDetected,
            Error::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kinds_follow_variants() {
        assert_eq!(
            Error::UidConflict {
                user: "etcd".into(),
                expected: 1,
                actual: 2
            }
            .kind(),
            ErrorKind::PreconditionFailed
        );
        assert_eq!(
            Error::from(BootstrapError::Unauthorized {
                status: 401,
                message: String::new()
            })
            .kind(),
            ErrorKind::Unauthorized
        );
        assert_eq!(
            Error::io("/etc/hosts", std::io::Error::from(std::io::ErrorKind::Other)).kind(),
            ErrorKind::TransientIo
        );
    }

    #[test]
    fn cycle_message_lists_members() {
        let err = Error::CycleDetected(vec!["File//a".into(), "File//b".into()]);
        assert_eq!(
            err.to_string(),
            "dependency cycle detected between tasks: File//a -> File//b"
        );
    }
}
