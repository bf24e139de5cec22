use std::cell::RefCell;
use std::rc::Rc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Delta, File, TaskId};
use crate::error::{Error, Result};
use crate::pki::{is_pem, issue, issued_for, CertType, IssuedCert, KeysetItem, Subject};
use crate::resource::Resource;
use crate::target::LocalTarget;

/// A certificate and key signed by a keystore CA.
///
/// The pair is written by two [`File`] tasks (see [`IssueCert::files`]) that
/// read the issued material through deferred resources. An existing pair is
/// reused when its certificate still carries the requested subject and names
/// and was signed by the requested CA.
#[derive(Clone)]
pub struct IssueCert {
    /// Pair name; files are `<dir>/<name>.pem` and `<dir>/<name>-key.pem`
    pub name: String,
    /// Keyset name of the signing CA
    pub signer: String,
    /// Keypair ID within the signer keyset; the primary item when unset
    pub keypair_id: Option<String>,
    /// Intended usage
    pub cert_type: CertType,
    /// Distinguished name
    pub subject: Subject,
    /// DNS names and IP addresses
    pub alternate_names: Vec<String>,
    /// Directory the pair is written to
    pub dir: String,
    /// Signing material, resolved from the keystore while planning
    pub signer_item: Option<KeysetItem>,
    slot: Rc<RefCell<Option<IssuedCert>>>,
}

impl std::fmt::Debug for IssueCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssueCert")
            .field("name", &self.name)
            .field("signer", &self.signer)
            .field("keypair_id", &self.keypair_id)
            .field("cert_type", &self.cert_type)
            .field("subject", &self.subject)
            .field("alternate_names", &self.alternate_names)
            .field("dir", &self.dir)
            .finish()
    }
}

impl PartialEq for IssueCert {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.signer == other.signer
            && self.keypair_id == other.keypair_id
            && self.cert_type == other.cert_type
            && self.subject == other.subject
            && self.alternate_names == other.alternate_names
            && self.dir == other.dir
            && self.signer_item == other.signer_item
    }
}

impl IssueCert {
    /// A request to sign `subject` with keyset `signer`, written under `dir`.
    pub fn new(name: &str, signer: &str, cert_type: CertType, subject: Subject, dir: &str) -> Self {
        IssueCert {
            name: name.to_string(),
            signer: signer.to_string(),
            keypair_id: None,
            cert_type,
            subject,
            alternate_names: Vec::new(),
            dir: dir.trim_end_matches('/').to_string(),
            signer_item: None,
            slot: Rc::new(RefCell::new(None)),
        }
    }

    /// Adds subject alternative names.
    pub fn with_alternate_names(mut self, names: Vec<String>) -> Self {
        self.alternate_names = names;
        self
    }

    /// Supplies the signing keyset item.
    pub fn signed_by(mut self, item: KeysetItem) -> Self {
        self.signer_item = Some(item);
        self
    }

    /// Path of the certificate.
    pub fn certificate_path(&self) -> String {
        format!("{}/{}.pem", self.dir, self.name)
    }

    /// Path of the private key.
    pub fn key_path(&self) -> String {
        format!("{}/{}-key.pem", self.dir, self.name)
    }

    fn id(&self) -> TaskId {
        TaskId::new("IssueCert", &self.name)
    }

    fn output(&self, label: &'static str, pick: fn(&IssuedCert) -> &String) -> Resource {
        let slot = Rc::clone(&self.slot);
        let producer = self.id();
        let name = self.name.clone();
        Resource::deferred(producer.as_str(), label, move || {
            slot.borrow()
                .as_ref()
                .map(|issued| pick(issued).clone().into_bytes())
                .ok_or_else(|| Error::OpenFailed {
                    name: format!("{} of {}", label, name),
                    reason: "certificate has not been issued yet".to_string(),
                })
        })
    }

    /// The certificate, readable once this task has rendered.
    pub fn certificate(&self) -> Resource {
        self.output("certificate", |i| &i.certificate)
    }

    /// The private key, readable once this task has rendered.
    pub fn private_key(&self) -> Resource {
        self.output("private-key", |i| &i.private_key)
    }

    /// The File tasks writing the pair.
    pub fn files(&self) -> (File, File) {
        (
            File::file(self.certificate_path(), self.certificate(), Some("0644")),
            File::file(self.key_path(), self.private_key(), Some("0600")),
        )
    }
}

#[async_trait(?Send)]
impl Delta for IssueCert {
    type Actual = ();

    async fn find(&self, target: &LocalTarget) -> Result<Option<()>> {
        let read = |p: String| std::fs::read(target.path(&p)).ok().filter(|d| is_pem(d));
        match (read(self.certificate_path()), read(self.key_path())) {
            (Some(cert), Some(key)) => {
                if !issued_for(&cert, &self.subject, &self.alternate_names, self.signer_item.as_ref()) {
                    info!(name = %self.name, "existing certificate does not match the request; reissuing");
                    return Ok(None);
                }
                debug!(name = %self.name, "reusing issued certificate");
                *self.slot.borrow_mut() = Some(IssuedCert {
                    certificate: String::from_utf8_lossy(&cert).into_owned(),
                    private_key: String::from_utf8_lossy(&key).into_owned(),
                });
                Ok(Some(()))
            }
            _ => Ok(None),
        }
    }

    fn check_changes(&self, id: &TaskId, _actual: Option<&()>) -> Result<()> {
        if self.signer_item.is_none() && self.cert_type != CertType::Ca {
            return Err(Error::not_found("keyset", format!("{} (signer for {})", self.signer, id)));
        }
        Ok(())
    }

    async fn render(&self, _target: &mut LocalTarget, actual: Option<&()>) -> Result<bool> {
        if actual.is_some() {
            return Ok(false);
        }
        info!(name = %self.name, signer = %self.signer, "issuing certificate");
        let issued = issue(
            &self.name,
            self.cert_type,
            &self.subject,
            &self.alternate_names,
            self.signer_item.as_ref(),
        )?;
        *self.slot.borrow_mut() = Some(issued);
        Ok(true)
    }
}
