use std::collections::BTreeSet;
use std::net::IpAddr;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, SanType,
};
use serde::{Deserialize, Serialize};
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

use super::KeysetItem;
use crate::error::{Error, Result};

/// What an issued certificate is for.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CertType {
    /// TLS client authentication
    Client,
    /// TLS server authentication
    Server,
    /// A signing CA
    Ca,
}

/// Distinguished name of an issued certificate.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    /// CN
    pub common_name: String,
    /// O, one entry per organization
    #[serde(default)]
    pub organization: Vec<String>,
}

impl Subject {
    /// A subject with only a common name.
    pub fn common_name(cn: impl Into<String>) -> Self {
        Subject {
            common_name: cn.into(),
            organization: Vec::new(),
        }
    }
}

/// PEM encoded output of [`issue`].
#[derive(Clone, PartialEq)]
pub struct IssuedCert {
    /// Certificate
    pub certificate: String,
    /// PKCS#8 private key
    pub private_key: String,
}

impl std::fmt::Debug for IssuedCert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCert").finish()
    }
}

/// Whether `data` looks like PEM.
pub fn is_pem(data: &[u8]) -> bool {
    std::str::from_utf8(data)
        .map(|s| s.trim_start().starts_with("-----BEGIN ") && s.contains("-----END "))
        .unwrap_or(false)
}

/// Whether the PEM `certificate` still answers a request for `subject` and
/// `alternate_names` signed by `signer`.
///
/// Unparseable input never matches, so it gets reissued.
pub fn issued_for(
    certificate: &[u8],
    subject: &Subject,
    alternate_names: &[String],
    signer: Option<&KeysetItem>,
) -> bool {
    let pem = match parse_x509_pem(certificate) {
        Ok((_, pem)) => pem,
        Err(_) => return false,
    };
    let cert = match pem.parse_x509() {
        Ok(cert) => cert,
        Err(_) => return false,
    };

    let common_names: Vec<_> = cert
        .subject()
        .iter_common_name()
        .filter_map(|a| a.as_str().ok())
        .collect();
    if common_names != [subject.common_name.as_str()] {
        return false;
    }
    let organizations: BTreeSet<_> = cert
        .subject()
        .iter_organization()
        .filter_map(|a| a.as_str().ok())
        .collect();
    if organizations != subject.organization.iter().map(String::as_str).collect::<BTreeSet<_>>() {
        return false;
    }

    let actual: BTreeSet<String> = cert
        .tbs_certificate.subject_alternative_name()
        .map(|(_, san)| san.general_names.iter().filter_map(general_name).collect())
        .unwrap_or_default();
    let wanted: BTreeSet<String> = alternate_names
        .iter()
        .map(|n| match n.parse::<IpAddr>() {
            Ok(ip) => ip.to_string(),
            Err(_) => n.clone(),
        })
        .collect();
    if actual != wanted {
        return false;
    }

    match signer {
        Some(item) => {
            let ca_pem = match parse_x509_pem(item.certificate.as_bytes()) {
                Ok((_, pem)) => pem,
                Err(_) => return false,
            };
            match ca_pem.parse_x509() {
                Ok(ca) => {
                    cert.issuer().as_raw() == ca.subject().as_raw()
                        && cert.verify_signature(Some(ca.public_key())).is_ok()
                }
                Err(_) => false,
            }
        }
        None => cert.issuer().as_raw() == cert.subject().as_raw(),
    }
}

fn general_name(name: &GeneralName<'_>) -> Option<String> {
    match name {
        GeneralName::DNSName(dns) => Some(dns.to_string()),
        GeneralName::IPAddress(bytes) => match bytes.len() {
            4 => <[u8; 4]>::try_from(*bytes).ok().map(|b| IpAddr::from(b).to_string()),
            16 => <[u8; 16]>::try_from(*bytes).ok().map(|b| IpAddr::from(b).to_string()),
            _ => None,
        },
        _ => None,
    }
}

/// Issues a new keypair and certificate.
///
/// Leaf certificates are valid for a year and CA certificates for ten.
/// Without a `signer` the certificate is self-signed.
pub fn issue(
    name: &str,
    cert_type: CertType,
    subject: &Subject,
    alternate_names: &[String],
    signer: Option<&KeysetItem>,
) -> Result<IssuedCert> {
    let failed = |reason: String| Error::OpenFailed {
        name: format!("certificate {}", name),
        reason,
    };

    let mut params = CertificateParams::default();
    let now = chrono::Utc::now();
    params.not_before = now - chrono::Duration::minutes(5);
    params.not_after = match cert_type {
        CertType::Ca => now + chrono::Duration::days(3650),
        _ => now + chrono::Duration::days(365),
    };

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, subject.common_name.as_str());
    for org in &subject.organization {
        dn.push(DnType::OrganizationName, org.as_str());
    }
    params.distinguished_name = dn;

    params.subject_alt_names = alternate_names
        .iter()
        .map(|n| match n.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(n.clone()),
        })
        .collect();

    match cert_type {
        CertType::Client => params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth],
        CertType::Server => params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth],
        CertType::Ca => params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained),
    }

    let cert = Certificate::from_params(params).map_err(|e| failed(e.to_string()))?;

    let certificate = match signer {
        Some(item) => {
            let key_pem = item.private_key.as_deref().ok_or_else(|| {
                Error::not_found("private key", format!("{} (keypair {})", name, item.id))
            })?;
            let key = KeyPair::from_pem(key_pem).map_err(|e| failed(e.to_string()))?;
            let ca_params = CertificateParams::from_ca_cert_pem(&item.certificate, key)
                .map_err(|e| failed(e.to_string()))?;
            let ca = Certificate::from_params(ca_params).map_err(|e| failed(e.to_string()))?;
            cert.serialize_pem_with_signer(&ca)
                .map_err(|e| failed(e.to_string()))?
        }
        None => cert.serialize_pem().map_err(|e| failed(e.to_string()))?,
    };

    Ok(IssuedCert {
        certificate,
        private_key: cert.serialize_private_key_pem(),
    })
}
