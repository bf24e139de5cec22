use std::path::{Path, PathBuf};

use async_trait::async_trait;
use glob::Pattern;
use tracing::info;

use super::{Delta, TaskId};
use crate::assets::{download, unpack_tar_gz};
use crate::error::{Error, Result};
use crate::target::{write_atomic, LocalTarget};

/// A gzipped tarball extracted into a directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Archive {
    /// Name, also used for the convergence marker
    pub name: String,
    /// URL or local path of the tarball
    pub source: String,
    /// sha256 of the tarball
    pub hash: String,
    /// Directory members are extracted under
    pub target_dir: String,
    /// Ordered `(glob, destination prefix)` rules; the last matching rule
    /// wins and unmatched members are skipped. Without rules every member is
    /// extracted at its own path.
    pub map_files: Vec<(String, String)>,
}

impl Archive {
    fn marker(&self) -> String {
        format!("{}/.nodeup-archive-{}", self.target_dir.trim_end_matches('/'), self.name)
    }

    fn destination(&self, rules: &[(Pattern, String)], member: &Path) -> Option<PathBuf> {
        if rules.is_empty() {
            return Some(member.to_path_buf());
        }
        let name = member.to_string_lossy();
        let (_, prefix) = rules.iter().rev().find(|(glob, _)| glob.matches(&name))?;
        let file_name = member.file_name()?;
        Some(Path::new(prefix.trim_start_matches('/')).join(file_name))
    }

    fn compile(&self) -> Result<Vec<(Pattern, String)>> {
        self.map_files
            .iter()
            .map(|(glob, dest)| {
                Pattern::new(glob)
                    .map(|p| (p, dest.clone()))
                    .map_err(|e| Error::config(format!("archive {}: bad pattern {:?}: {}", self.name, glob, e)))
            })
            .collect()
    }
}

#[async_trait(?Send)]
impl Delta for Archive {
    type Actual = String;

    async fn find(&self, target: &LocalTarget) -> Result<Option<String>> {
        let path = target.path(&self.marker());
        match std::fs::read_to_string(&path) {
            Ok(hash) => Ok(Some(hash.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    fn check_changes(&self, _id: &TaskId, _actual: Option<&String>) -> Result<()> {
        self.compile().map(|_| ())
    }

    async fn render(&self, target: &mut LocalTarget, actual: Option<&String>) -> Result<bool> {
        if actual.map_or(false, |h| h.eq_ignore_ascii_case(&self.hash)) {
            return Ok(false);
        }
        let data = download(&self.source, Some(&self.hash)).await?;
        let rules = self.compile()?;
        let dest = target.path(&self.target_dir);
        std::fs::create_dir_all(&dest).map_err(|e| Error::io(&dest, e))?;
        let written = unpack_tar_gz(&data, &dest, |member| self.destination(&rules, member))?;
        info!(archive = %self.name, files = written.len(), dest = %self.target_dir, "extracted archive");
        write_atomic(&target.path(&self.marker()), self.hash.as_bytes(), 0o644)?;
        Ok(true)
    }
}
