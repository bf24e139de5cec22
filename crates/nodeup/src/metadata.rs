//! Cloud instance metadata.
//!
//! Only the handful of documents node-up needs are read: the node's private
//! hostname, instance ID, zone and delegated IPv6 prefix.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use tracing::{debug, warn};
use url::Url;

use crate::api::CloudProvider;
use crate::error::{Error, Result};

const AWS_TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const AWS_TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";

/// Which metadata dialect the endpoint speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataFlavor {
    /// EC2 IMDS, with IMDSv2 session tokens when available
    Aws,
    /// GCE metadata server (`Metadata-Flavor: Google`)
    Gce,
    /// Plain GETs (DigitalOcean, Hetzner, OpenStack)
    Generic,
}

/// Reads documents from the instance metadata service.
#[derive(Clone, Debug)]
pub struct MetadataClient {
    flavor: MetadataFlavor,
    base: Url,
    token_url: Option<Url>,
    http: reqwest::Client,
}

impl MetadataClient {
    /// The well-known endpoint for `provider`, if it has one.
    pub fn for_provider(provider: &CloudProvider) -> Result<Option<Self>> {
        let (flavor, base) = match provider {
            CloudProvider::Aws => (MetadataFlavor::Aws, "http://169.254.169.254/latest/meta-data/"),
            CloudProvider::Gce => (
                MetadataFlavor::Gce,
                "http://metadata.google.internal/computeMetadata/v1/",
            ),
            CloudProvider::DigitalOcean => (MetadataFlavor::Generic, "http://169.254.169.254/metadata/v1/"),
            CloudProvider::Hetzner => (MetadataFlavor::Generic, "http://169.254.169.254/hetzner/v1/metadata/"),
            CloudProvider::Openstack => (
                MetadataFlavor::Generic,
                "http://169.254.169.254/openstack/latest/",
            ),
            _ => return Ok(None),
        };
        let base = Url::parse(base).map_err(|e| Error::config(e.to_string()))?;
        Self::with_base(flavor, base).map(Some)
    }

    /// A client for an arbitrary endpoint; `base` must end in `/`.
    pub fn with_base(flavor: MetadataFlavor, base: Url) -> Result<Self> {
        let token_url = match flavor {
            MetadataFlavor::Aws => Some(
                base.join("../api/token")
                    .map_err(|e| Error::config(e.to_string()))?,
            ),
            _ => None,
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Http {
                url: base.to_string(),
                reason: e.to_string(),
            })?;
        Ok(MetadataClient {
            flavor,
            base,
            token_url,
            http,
        })
    }

    /// The dialect in use.
    pub fn flavor(&self) -> MetadataFlavor {
        self.flavor
    }

    async fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match self.flavor {
            MetadataFlavor::Gce => {
                headers.insert("Metadata-Flavor", HeaderValue::from_static("Google"));
            }
            MetadataFlavor::Aws => {
                if let Some(token) = self.aws_token().await {
                    if let Ok(value) = token.parse() {
                        headers.insert(AWS_TOKEN_HEADER, value);
                    }
                }
            }
            MetadataFlavor::Generic => {}
        }
        headers
    }

    async fn aws_token(&self) -> Option<String> {
        let url = self.token_url.as_ref()?;
        let resp = self
            .http
            .put(url.clone())
            .header(AWS_TOKEN_TTL_HEADER, "60")
            .send()
            .await;
        match resp {
            Ok(r) if r.status().is_success() => r.text().await.ok(),
            Ok(r) => {
                debug!(status = %r.status(), "IMDSv2 token unavailable, using IMDSv1");
                None
            }
            Err(e) => {
                debug!(error = %e, "IMDSv2 token unavailable, using IMDSv1");
                None
            }
        }
    }

    /// Reads `path`, returning `None` when the document does not exist.
    pub async fn get_optional(&self, path: &str) -> Result<Option<String>> {
        let url = self.base.join(path).map_err(|e| Error::config(e.to_string()))?;
        let http_err = |reason: String| Error::Http {
            url: url.to_string(),
            reason,
        };
        let resp = self
            .http
            .get(url.clone())
            .headers(self.headers().await)
            .send()
            .await
            .map_err(|e| http_err(e.to_string()))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let body = resp.text().await.map_err(|e| http_err(e.to_string()))?;
                Ok(Some(body.trim().to_string()))
            }
            s => Err(http_err(format!("unexpected status {}", s))),
        }
    }

    /// Reads `path`, failing when it does not exist.
    pub async fn get(&self, path: &str) -> Result<String> {
        self.get_optional(path)
            .await?
            .ok_or_else(|| Error::not_found("metadata", path))
    }

    /// The name the cloud knows this instance by.
    pub async fn node_name(&self) -> Result<String> {
        match self.flavor {
            MetadataFlavor::Aws => self.get("local-hostname").await,
            MetadataFlavor::Gce => {
                let hostname = self.get("instance/hostname").await?;
                Ok(hostname.split('.').next().unwrap_or_default().to_string())
            }
            MetadataFlavor::Generic => self.get("hostname").await,
        }
    }

    /// The cloud's instance ID.
    pub async fn instance_id(&self) -> Result<String> {
        match self.flavor {
            MetadataFlavor::Gce => self.get("instance/id").await,
            MetadataFlavor::Aws => self.get("instance-id").await,
            MetadataFlavor::Generic => self.get("id").await,
        }
    }

    /// The zone the instance runs in.
    pub async fn availability_zone(&self) -> Result<String> {
        match self.flavor {
            MetadataFlavor::Aws => self.get("placement/availability-zone").await,
            MetadataFlavor::Gce => {
                let zone = self.get("instance/zone").await?;
                Ok(zone.rsplit('/').next().unwrap_or_default().to_string())
            }
            MetadataFlavor::Generic => self.get("region").await,
        }
    }

    /// The IPv6 prefix delegated to the primary interface, once assigned.
    pub async fn ipv6_prefix(&self) -> Result<Option<String>> {
        if self.flavor != MetadataFlavor::Aws {
            warn!(flavor = ?self.flavor, "IPv6 prefix delegation is only read from EC2 metadata");
            return Ok(None);
        }
        let mac = self.get("mac").await?;
        let prefixes = self
            .get_optional(&format!("network/interfaces/macs/{}/ipv6-prefix", mac))
            .await?;
        Ok(prefixes.and_then(|p| p.lines().next().map(|l| l.trim().to_string())).filter(|p| !p.is_empty()))
    }
}
