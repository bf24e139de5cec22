//! The local asset store.
//!
//! Assets are pre-staged binaries and archives in the cache directory. Plain
//! files are registered under their file name and verified against their
//! sha256 when opened. Archives are verified and unpacked once, and every
//! member is registered as `<archive stem>/<member path>`. A marker next to
//! the unpacked directory records the digest of the archive it came from.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use regex::Regex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::resource::{sha256_hex, AssetResource, Resource};

#[derive(Clone, Debug)]
struct AssetEntry {
    key: String,
    path: PathBuf,
    sha256: Option<String>,
}

impl AssetEntry {
    fn basename(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    fn resource(&self) -> Resource {
        Resource::Asset(AssetResource {
            name: self.key.clone(),
            path: self.path.clone(),
            sha256: self.sha256.clone(),
        })
    }
}

/// A parsed `sha256@url[,mirror...]` asset line.
#[derive(Clone, Debug, PartialEq)]
pub struct AssetLocation {
    /// Expected digest, if given
    pub sha256: Option<String>,
    /// Download locations, primary first
    pub urls: Vec<String>,
}

impl AssetLocation {
    /// Parses an asset line.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (sha256, rest) = match line.split_once('@') {
            Some((hash, rest)) if hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit()) => {
                (Some(hash.to_ascii_lowercase()), rest)
            }
            _ => (None, line),
        };
        let urls: Vec<String> = rest
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect();
        if urls.is_empty() {
            return Err(Error::config(format!("asset {:?} has no location", line)));
        }
        Ok(AssetLocation { sha256, urls })
    }

    /// The file name the primary location resolves to.
    pub fn file_name(&self) -> &str {
        let url = self.urls[0].split(&['?', '#'][..]).next().unwrap_or_default();
        url.rsplit('/').next().unwrap_or(url)
    }
}

/// Looks up pre-staged assets by logical name.
#[derive(Clone, Debug, Default)]
pub struct AssetStore {
    cache_dir: PathBuf,
    entries: Vec<AssetEntry>,
}

impl AssetStore {
    /// An empty store rooted at `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        AssetStore {
            cache_dir: cache_dir.into(),
            entries: Vec::new(),
        }
    }

    /// The directory assets are staged in.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Registers a single file under `key`.
    pub fn add_file(&mut self, key: impl Into<String>, path: impl Into<PathBuf>, sha256: Option<String>) {
        self.entries.push(AssetEntry {
            key: key.into(),
            path: path.into(),
            sha256,
        });
    }

    /// Registers a staged asset described by an asset line.
    ///
    /// Archives are verified, unpacked next to themselves (once) and indexed.
    pub fn add_asset(&mut self, line: &str) -> Result<()> {
        let location = AssetLocation::parse(line)?;
        let name = location.file_name().to_string();
        let path = self.cache_dir.join(&name);
        match archive_stem(&name) {
            Some(stem) => {
                let dest = self.cache_dir.join(stem);
                let data = std::fs::read(&path).map_err(|e| Error::io(&path, e))?;
                verify(&name, &data, location.sha256.as_deref())?;
                let digest = sha256_hex(&data);
                let marker = self.cache_dir.join(format!(".nodeup-unpacked-{}", stem));
                let complete = dest.is_dir()
                    && std::fs::read_to_string(&marker)
                        .map(|m| m.trim() == digest)
                        .unwrap_or(false);
                if complete {
                    debug!(asset = %name, "archive already unpacked");
                } else {
                    info!(asset = %name, dest = ?dest, "unpacking asset archive");
                    replace_with_archive(&data, &dest)?;
                    crate::target::write_atomic(&marker, digest.as_bytes(), 0o644)?;
                }
                self.index_dir(stem, &dest)?;
            }
            None => self.add_file(name, path, location.sha256),
        }
        Ok(())
    }

    fn index_dir(&mut self, prefix: &str, dir: &Path) -> Result<()> {
        let mut stack = vec![dir.to_path_buf()];
        let mut found = Vec::new();
        while let Some(current) = stack.pop() {
            let entries = std::fs::read_dir(&current).map_err(|e| Error::io(&current, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| Error::io(&current, e))?;
                let path = entry.path();
                let file_type = entry.file_type().map_err(|e| Error::io(&path, e))?;
                if file_type.is_dir() {
                    stack.push(path);
                } else {
                    found.push(path);
                }
            }
        }
        found.sort();
        for path in found {
            let relative = path
                .strip_prefix(dir)
                .map_err(|e| Error::config(e.to_string()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            debug!(key = %format!("{}/{}", prefix, relative), "indexed asset");
            self.add_file(format!("{}/{}", prefix, relative), path, None);
        }
        Ok(())
    }

    /// Finds the single asset whose file name is `name` and, if given, whose
    /// key ends with `path`.
    pub fn find(&self, name: &str, path: Option<&str>) -> Result<Resource> {
        let matches: Vec<&AssetEntry> = self
            .entries
            .iter()
            .filter(|e| e.basename() == name)
            .filter(|e| match path {
                Some(p) => e.key.ends_with(p.trim_start_matches('/')),
                None => true,
            })
            .collect();
        match matches.as_slice() {
            [] => Err(Error::not_found("asset", name)),
            [one] => Ok(one.resource()),
            many => Err(Error::config(format!(
                "found {} assets matching {:?}: {}",
                many.len(),
                name,
                many.iter().map(|e| e.key.as_str()).collect::<Vec<_>>().join(", ")
            ))),
        }
    }

    /// All assets whose key matches `pattern`, by file name.
    pub fn find_matches(&self, pattern: &Regex) -> BTreeMap<String, Resource> {
        self.entries
            .iter()
            .filter(|e| pattern.is_match(&e.key))
            .map(|e| (e.basename().to_string(), e.resource()))
            .collect()
    }
}

fn archive_stem(name: &str) -> Option<&str> {
    name.strip_suffix(".tar.gz")
        .or_else(|| name.strip_suffix(".tgz"))
}

/// Checks `data` against an expected sha256, if there is one.
pub(crate) fn verify(name: &str, data: &[u8], expected: Option<&str>) -> Result<()> {
    if let Some(expected) = expected {
        let actual = sha256_hex(data);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(Error::Integrity {
                name: name.to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
    }
    Ok(())
}

/// Unpacks a gzipped tarball into `dest`.
///
/// `map` decides where each regular file goes, relative to `dest`; `None`
/// skips the member. Members escaping `dest` are rejected. Returns the paths
/// written.
pub(crate) fn unpack_tar_gz<F>(data: &[u8], dest: &Path, map: F) -> Result<Vec<PathBuf>>
where
    F: Fn(&Path) -> Option<PathBuf>,
{
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let mut written = Vec::new();
    let entries = archive.entries().map_err(|e| Error::io(dest, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::io(dest, e))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let member = entry.path().map_err(|e| Error::io(dest, e))?.into_owned();
        let member = normalize(&member);
        let target = match map(&member) {
            Some(relative) => relative,
            None => continue,
        };
        if target
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(Error::config(format!(
                "archive member {} escapes {}",
                member.display(),
                dest.display()
            )));
        }
        let out = dest.join(&target);
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let mode = entry.header().mode().unwrap_or(0o644);
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|e| Error::io(&out, e))?;
        crate::target::write_atomic(&out, &contents, mode)?;
        written.push(out);
    }
    Ok(written)
}

/// Unpacks into a staging directory beside `dest` and renames it into place,
/// so `dest` never holds a partial archive.
fn replace_with_archive(data: &[u8], dest: &Path) -> Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let staging = tempfile::Builder::new()
        .prefix(".unpack-")
        .tempdir_in(parent)
        .map_err(|e| Error::io(parent, e))?;
    unpack_tar_gz(data, staging.path(), |member| Some(member.to_path_buf()))?;
    if dest.exists() {
        std::fs::remove_dir_all(dest).map_err(|e| Error::io(dest, e))?;
    }
    let staged = staging.into_path();
    std::fs::rename(&staged, dest).map_err(|e| Error::io(dest, e))
}

fn normalize(member: &Path) -> PathBuf {
    member
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Fetches `url` and verifies it against `sha256` before returning it.
///
/// `file://` URLs and bare paths are read from local disk.
pub(crate) async fn download(url: &str, sha256: Option<&str>) -> Result<Vec<u8>> {
    let data = match url.strip_prefix("file://").or_else(|| url.strip_prefix('/').map(|_| url)) {
        Some(path) => std::fs::read(path).map_err(|e| Error::io(path, e))?,
        None => {
            info!(url, "downloading");
            let http_err = |e: reqwest::Error| Error::Http {
                url: url.to_string(),
                reason: e.to_string(),
            };
            reqwest::get(url)
                .await
                .and_then(|r| r.error_for_status())
                .map_err(http_err)?
                .bytes()
                .await
                .map_err(http_err)?
                .to_vec()
        }
    };
    verify(url, &data, sha256)?;
    Ok(data)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    pub(crate) fn tarball(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn parses_asset_lines() {
        let hash = "a".repeat(64);
        let loc = AssetLocation::parse(&format!(
            "{}@https://dl.k8s.io/v1.29.0/bin/linux/amd64/kubelet,https://mirror/kubelet",
            hash
        ))
        .unwrap();
        assert_eq!(loc.sha256.as_deref(), Some(hash.as_str()));
        assert_eq!(loc.urls.len(), 2);
        assert_eq!(loc.file_name(), "kubelet");
        assert_eq!(
            AssetLocation::parse("https://x/y/runc.amd64").unwrap().sha256,
            None
        );
    }

    #[test]
    fn find_by_name_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tarball(&[
            ("./usr/local/bin/containerd", b"containerd"),
            ("./usr/local/bin/ctr", b"ctr"),
            ("./usr/local/sbin/runc", b"runc"),
        ]);
        std::fs::write(dir.path().join("containerd-1.7.0-linux-amd64.tar.gz"), &archive).unwrap();
        std::fs::write(dir.path().join("kubelet"), b"kubelet").unwrap();

        let mut store = AssetStore::new(dir.path());
        store
            .add_asset(&format!(
                "{}@https://x/containerd-1.7.0-linux-amd64.tar.gz",
                sha256_hex(&archive)
            ))
            .unwrap();
        store
            .add_asset(&format!("{}@https://x/kubelet", sha256_hex(b"kubelet")))
            .unwrap();

        assert_eq!(store.find("kubelet", None).unwrap().open().unwrap(), b"kubelet");
        assert_eq!(
            store
                .find("ctr", Some("usr/local/bin/ctr"))
                .unwrap()
                .open()
                .unwrap(),
            b"ctr"
        );
        assert!(matches!(
            store.find("docker", None),
            Err(Error::NotFound { .. })
        ));

        let bins = store.find_matches(&Regex::new(r"^containerd[^/]*/usr/local/bin/[^/]+$").unwrap());
        assert_eq!(bins.keys().collect::<Vec<_>>(), vec!["containerd", "ctr"]);
    }

    #[test]
    fn archive_hash_mismatch_leaves_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tarball(&[("bridge", b"bridge")]);
        std::fs::write(dir.path().join("cni-plugins.tgz"), &archive).unwrap();
        let mut store = AssetStore::new(dir.path());
        let err = store
            .add_asset(&format!("{}@https://x/cni-plugins.tgz", "0".repeat(64)))
            .unwrap_err();
        assert!(matches!(err, Error::Integrity { .. }));
        assert!(!dir.path().join("cni-plugins").exists());
    }

    #[test]
    fn interrupted_unpack_is_redone() {
        let dir = tempfile::tempdir().unwrap();
        let archive = tarball(&[("bridge", b"bridge"), ("loopback", b"loopback")]);
        std::fs::write(dir.path().join("cni-plugins.tgz"), &archive).unwrap();
        // An earlier run died after writing one member.
        std::fs::create_dir_all(dir.path().join("cni-plugins")).unwrap();
        std::fs::write(dir.path().join("cni-plugins/bridge"), b"bri").unwrap();

        let line = format!("{}@https://x/cni-plugins.tgz", sha256_hex(&archive));
        let mut store = AssetStore::new(dir.path());
        store.add_asset(&line).unwrap();
        assert_eq!(store.find("bridge", None).unwrap().open().unwrap(), b"bridge");
        assert_eq!(store.find("loopback", None).unwrap().open().unwrap(), b"loopback");
        assert_eq!(
            std::fs::read_to_string(dir.path().join(".nodeup-unpacked-cni-plugins")).unwrap(),
            sha256_hex(&archive)
        );

        // Completed unpacks are left alone.
        std::fs::write(dir.path().join("cni-plugins/extra"), b"extra").unwrap();
        let mut again = AssetStore::new(dir.path());
        again.add_asset(&line).unwrap();
        assert!(again.find("extra", None).is_ok());
    }

    #[test]
    fn corrupted_plain_asset_fails_on_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kubectl"), b"tampered").unwrap();
        let mut store = AssetStore::new(dir.path());
        store
            .add_asset(&format!("{}@https://x/kubectl", sha256_hex(b"kubectl")))
            .unwrap();
        let resource = store.find("kubectl", None).unwrap();
        assert!(matches!(resource.open(), Err(Error::Integrity { .. })));
    }
}
