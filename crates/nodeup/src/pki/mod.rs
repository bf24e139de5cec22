//! Certificates, keys and secrets.
//!
//! The [`Keystore`] is read-mostly: builders look up CA material and secrets
//! while planning, and [`issue`] signs new leaf certificates with a keyset
//! item when an `IssueCert` task renders.

mod issue;
mod keystore;

pub use issue::{issue, issued_for, is_pem, CertType, IssuedCert, Subject};
pub use keystore::{FileKeystore, InMemoryKeystore, Keyset, KeysetItem, Keystore};

#[cfg(test)]
pub(crate) use issue::test::test_ca;
