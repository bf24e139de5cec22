use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// One certificate (and optionally its key) inside a [`Keyset`].
#[derive(Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeysetItem {
    /// Keypair ID
    pub id: String,
    /// PEM certificate
    pub certificate: String,
    /// PEM private key, absent for trust-only items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// When set, the item is no longer trusted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distrust_timestamp: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for KeysetItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeysetItem")
            .field("id", &self.id)
            .field("has_private_key", &self.private_key.is_some())
            .field("distrust_timestamp", &self.distrust_timestamp)
            .finish()
    }
}

/// An ordered set of certificates sharing a name, used to rotate CAs.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Keyset {
    /// The item used for signing when no keypair ID is requested
    #[serde(default)]
    pub primary_id: String,
    /// Items in keypair ID order
    #[serde(default)]
    pub items: Vec<KeysetItem>,
}

impl Keyset {
    /// A keyset holding just `item`, which is also primary.
    pub fn single(item: KeysetItem) -> Self {
        Keyset {
            primary_id: item.id.clone(),
            items: vec![item],
        }
    }

    /// The primary item, falling back to the last one listed.
    pub fn primary(&self) -> Option<&KeysetItem> {
        self.items
            .iter()
            .find(|i| i.id == self.primary_id)
            .or_else(|| self.items.last())
    }

    /// The item with keypair ID `id`.
    pub fn item(&self, id: &str) -> Option<&KeysetItem> {
        self.items.iter().find(|i| i.id == id)
    }

    /// Every still-trusted certificate, concatenated as a PEM bundle.
    pub fn trust_bundle(&self) -> String {
        self.items
            .iter()
            .filter(|i| i.distrust_timestamp.is_none())
            .map(|i| i.certificate.trim_end().to_string() + "\n")
            .collect()
    }
}

/// Read access to CA certificates, keypairs and secrets.
///
/// Access is sequential; implementations need not be thread safe.
pub trait Keystore {
    /// All items stored under `name`.
    fn find_keyset(&self, name: &str) -> Result<Option<Keyset>>;

    /// Opaque secret bytes.
    fn secret(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// The primary certificate of keyset `name`.
    fn find_cert(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .find_keyset(name)?
            .and_then(|k| k.primary().map(|i| i.certificate.clone())))
    }

    /// The primary private key of keyset `name`.
    fn find_private_key(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .find_keyset(name)?
            .and_then(|k| k.primary().and_then(|i| i.private_key.clone())))
    }
}

/// A keystore kept in memory, seeded by tests or from the node-up config.
#[derive(Debug, Default)]
pub struct InMemoryKeystore {
    keysets: BTreeMap<String, Keyset>,
    secrets: BTreeMap<String, Vec<u8>>,
}

impl InMemoryKeystore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces keyset `name`.
    pub fn insert_keyset(&mut self, name: impl Into<String>, keyset: Keyset) {
        self.keysets.insert(name.into(), keyset);
    }

    /// Adds or replaces secret `name`.
    pub fn insert_secret(&mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.secrets.insert(name.into(), data.into());
    }
}

impl Keystore for InMemoryKeystore {
    fn find_keyset(&self, name: &str) -> Result<Option<Keyset>> {
        Ok(self.keysets.get(name).cloned())
    }

    fn secret(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.secrets.get(name).cloned())
    }
}

/// A keystore laid out on disk.
///
/// Keysets live in `<dir>/<name>/keyset.yaml`, secrets in
/// `<dir>/secrets/<name>`. Trust-only certificates handed down in the
/// node-up config are layered underneath as fallbacks.
#[derive(Debug)]
pub struct FileKeystore {
    dir: PathBuf,
    fallback: InMemoryKeystore,
}

impl FileKeystore {
    /// A store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileKeystore {
            dir: dir.into(),
            fallback: InMemoryKeystore::new(),
        }
    }

    /// Serves `certificates` (name to PEM bundle) when no keyset file exists.
    pub fn with_certificates(mut self, certificates: &BTreeMap<String, String>) -> Self {
        for (name, pem) in certificates {
            self.fallback.insert_keyset(
                name.clone(),
                Keyset::single(KeysetItem {
                    id: "0".to_string(),
                    certificate: pem.clone(),
                    ..Default::default()
                }),
            );
        }
        self
    }

    fn read_optional(&self, path: PathBuf) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(path, e)),
        }
    }
}

impl Keystore for FileKeystore {
    fn find_keyset(&self, name: &str) -> Result<Option<Keyset>> {
        let path = self.dir.join(name).join("keyset.yaml");
        match self.read_optional(path)? {
            Some(data) => {
                debug!(keyset = name, "loaded keyset from disk");
                crate::api::from_yaml(&format!("keyset {}", name), &data).map(Some)
            }
            None => self.fallback.find_keyset(name),
        }
    }

    fn secret(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.read_optional(self.dir.join("secrets").join(name))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn item(id: &str, cert: &str, key: Option<&str>) -> KeysetItem {
        KeysetItem {
            id: id.to_string(),
            certificate: cert.to_string(),
            private_key: key.map(String::from),
            distrust_timestamp: None,
        }
    }

    #[test]
    fn primary_item_is_used_for_lookups() {
        let mut store = InMemoryKeystore::new();
        store.insert_keyset(
            "kubernetes-ca",
            Keyset {
                primary_id: "2".to_string(),
                items: vec![item("1", "old", Some("oldkey")), item("2", "new", Some("newkey"))],
            },
        );
        assert_eq!(store.find_cert("kubernetes-ca").unwrap().as_deref(), Some("new"));
        assert_eq!(
            store.find_private_key("kubernetes-ca").unwrap().as_deref(),
            Some("newkey")
        );
        assert_eq!(store.find_cert("missing").unwrap(), None);
    }

    #[test]
    fn distrusted_items_leave_the_bundle() {
        let mut old = item("1", "old", None);
        old.distrust_timestamp = Some(Utc::now());
        let keyset = Keyset {
            primary_id: "2".to_string(),
            items: vec![old, item("2", "new", None)],
        };
        assert_eq!(keyset.trust_bundle(), "new\n");
    }

    #[test]
    fn file_store_reads_keysets_secrets_and_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etcd-clients-ca")).unwrap();
        std::fs::write(
            dir.path().join("etcd-clients-ca/keyset.yaml"),
            "primaryId: \"7\"\nitems:\n- id: \"7\"\n  certificate: CERT\n  privateKey: KEY\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("secrets")).unwrap();
        std::fs::write(dir.path().join("secrets/encryptionconfig"), b"kind: X").unwrap();

        let mut cas = BTreeMap::new();
        cas.insert("kubernetes-ca".to_string(), "CA".to_string());
        let store = FileKeystore::new(dir.path()).with_certificates(&cas);

        assert_eq!(store.find_private_key("etcd-clients-ca").unwrap().as_deref(), Some("KEY"));
        assert_eq!(store.find_cert("kubernetes-ca").unwrap().as_deref(), Some("CA"));
        assert_eq!(store.find_private_key("kubernetes-ca").unwrap(), None);
        assert_eq!(store.secret("encryptionconfig").unwrap().unwrap(), b"kind: X");
        assert_eq!(store.secret("nope").unwrap(), None);
    }
}
