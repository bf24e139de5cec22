//! Byte sources for file contents.
//!
//! A [`Resource`] is a small value that can be opened any number of times and
//! yields the same bytes each time within a run. Contents that only exist once
//! another task has rendered (an issued certificate, a kubeconfig embedding
//! one) are modeled as a [`Resource::Deferred`] closure over that task's
//! output slot, together with the producing task's identity so the resolver
//! can order the consumer after the producer.

use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

lazy_static! {
    static ref TEMPLATE_ACTION: Regex =
        Regex::new(r"\{\{-?\s*(.*?)\s*-?\}\}").expect("template action pattern is valid");
}

type Opener = Rc<dyn Fn() -> Result<Vec<u8>>>;

/// A uniform source of bytes.
#[derive(Clone)]
pub enum Resource {
    /// Inline bytes
    Bytes(Vec<u8>),
    /// Inline text
    Text(String),
    /// A file in the local asset cache, optionally hash-verified on open
    Asset(AssetResource),
    /// A template rendered against the model's input documents
    Template(TemplateResource),
    /// Contents produced by another task at render time
    Deferred(DeferredResource),
}

/// A file on local disk, checked against a sha256 digest when opened.
#[derive(Clone, Debug, PartialEq)]
pub struct AssetResource {
    /// Logical name, for messages
    pub name: String,
    /// Where the bytes live
    pub path: PathBuf,
    /// Expected lowercase hex sha256
    pub sha256: Option<String>,
}

/// A Go-style `{{ .Cluster.Field }}` template.
#[derive(Clone)]
pub struct TemplateResource {
    /// Name, for messages
    pub name: String,
    /// Template source
    pub template: String,
    /// Values available to the template (`Cluster`, `InstanceGroup`, `NodeupConfig`)
    pub data: Rc<Value>,
}

/// Contents computed on open by the task named in `producer`.
#[derive(Clone)]
pub struct DeferredResource {
    /// Identity of the task whose output this reads
    pub producer: String,
    /// Which output of the producer, e.g. `certificate`
    pub label: String,
    open: Opener,
}

impl Resource {
    /// Inline text.
    pub fn text(s: impl Into<String>) -> Self {
        Resource::Text(s.into())
    }

    /// Inline bytes.
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Resource::Bytes(b.into())
    }

    /// An existing file, read when opened.
    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Resource::Asset(AssetResource {
            name: name.into(),
            path: path.into(),
            sha256: None,
        })
    }

    /// A template rendered against `data` when opened.
    pub fn template(name: impl Into<String>, template: impl Into<String>, data: Rc<Value>) -> Self {
        Resource::Template(TemplateResource {
            name: name.into(),
            template: template.into(),
            data,
        })
    }

    /// Contents produced by the task `producer` once it has rendered.
    pub fn deferred<F>(producer: impl Into<String>, label: impl Into<String>, open: F) -> Self
    where
        F: Fn() -> Result<Vec<u8>> + 'static,
    {
        Resource::Deferred(DeferredResource {
            producer: producer.into(),
            label: label.into(),
            open: Rc::new(open),
        })
    }

    /// Yields the bytes.
    pub fn open(&self) -> Result<Vec<u8>> {
        match self {
            Resource::Bytes(b) => Ok(b.clone()),
            Resource::Text(s) => Ok(s.clone().into_bytes()),
            Resource::Asset(asset) => asset.open(),
            Resource::Template(t) => render_template(&t.name, &t.template, &t.data).map(String::into_bytes),
            Resource::Deferred(d) => (d.open)(),
        }
    }

    /// Yields the bytes as UTF-8 text.
    pub fn open_string(&self) -> Result<String> {
        String::from_utf8(self.open()?).map_err(|e| Error::OpenFailed {
            name: self.describe(),
            reason: e.to_string(),
        })
    }

    /// The identity of the task that must render before this can be opened.
    pub fn producer(&self) -> Option<&str> {
        match self {
            Resource::Deferred(d) => Some(&d.producer),
            _ => None,
        }
    }

    /// A short description for logs.
    pub fn describe(&self) -> String {
        match self {
            Resource::Bytes(b) => format!("<{} bytes>", b.len()),
            Resource::Text(s) => format!("<{} chars>", s.len()),
            Resource::Asset(a) => format!("asset {} ({})", a.name, a.path.display()),
            Resource::Template(t) => format!("template {}", t.name),
            Resource::Deferred(d) => format!("{} of {}", d.label, d.producer),
        }
    }
}

impl AssetResource {
    fn open(&self) -> Result<Vec<u8>> {
        let data = std::fs::read(&self.path).map_err(|e| Error::OpenFailed {
            name: self.name.clone(),
            reason: format!("{}: {}", self.path.display(), e),
        })?;
        if let Some(expected) = &self.sha256 {
            let actual = sha256_hex(&data);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(Error::Integrity {
                    name: self.name.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(data)
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resource({})", self.describe())
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Resource::Bytes(a), Resource::Bytes(b)) => a == b,
            (Resource::Text(a), Resource::Text(b)) => a == b,
            (Resource::Asset(a), Resource::Asset(b)) => a == b,
            (Resource::Template(a), Resource::Template(b)) => {
                a.name == b.name && a.template == b.template && a.data == b.data
            }
            (Resource::Deferred(a), Resource::Deferred(b)) => {
                a.producer == b.producer && a.label == b.label
            }
            _ => false,
        }
    }
}

impl From<&str> for Resource {
    fn from(s: &str) -> Self {
        Resource::text(s)
    }
}

impl From<String> for Resource {
    fn from(s: String) -> Self {
        Resource::Text(s)
    }
}

/// Lowercase hex sha256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Renders `{{ .Root.Field.Sub }}` actions against `data`.
///
/// Field names match JSON keys case-insensitively, so `.Cluster.NetworkCIDR`
/// finds `networkCIDR`. Unknown fields are an error; null values render empty.
pub fn render_template(name: &str, template: &str, data: &Value) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in TEMPLATE_ACTION.captures_iter(template) {
        let whole = caps.get(0).expect("capture 0 always exists");
        out.push_str(&template[last..whole.start()]);
        let expr = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        out.push_str(&evaluate(name, expr, data)?);
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

fn evaluate(name: &str, expr: &str, data: &Value) -> Result<String> {
    let fail = |reason: String| Error::OpenFailed {
        name: name.to_string(),
        reason,
    };
    let path = expr
        .strip_prefix('.')
        .ok_or_else(|| fail(format!("unsupported template action {:?}", expr)))?;
    let mut current = data;
    if !path.is_empty() {
        for field in path.split('.') {
            current = lookup(current, field)
                .ok_or_else(|| fail(format!("no field {:?} in {:?}", field, expr)))?;
        }
    }
    Ok(match current {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    })
}

fn lookup<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    let object = value.as_object()?;
    object.get(field).or_else(|| {
        object
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(field))
            .map(|(_, v)| v)
    })
}
