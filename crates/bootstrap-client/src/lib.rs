//! A client for obtaining kubelet bootstrap credentials from the cluster
//! controller.
//!
//! Worker nodes never hold a CA signing key. Before the kubelet is allowed to
//! start they present a node identity proof to the controller over a
//! CA-pinned TLS channel and receive a short lived bearer token in exchange.
#![cfg_attr(not(test), deny(missing_docs))]

pub mod auth;
pub mod backoff;
pub mod client;
pub mod errors;

#[doc(inline)]
pub use auth::{Authenticator, StaticTokenAuthenticator};
#[doc(inline)]
pub use client::{BootstrapRequest, BootstrapResponse, Client, ClientConfig};
#[doc(inline)]
pub use errors::BootstrapError;

/// The port the controller serves the bootstrap endpoint on.
pub const DEFAULT_PORT: u16 = 3988;

/// The API version sent with every bootstrap request.
pub const BOOTSTRAP_API_VERSION: &str = "bootstrap.kops.k8s.io/v1alpha1";
