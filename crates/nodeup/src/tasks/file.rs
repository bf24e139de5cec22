use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{os_path, Delta, TaskId};
use crate::error::{Error, Result};
use crate::resource::Resource;
use crate::target::{parse_mode, write_atomic, LocalTarget};

/// What kind of filesystem object a [`File`] task manages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    /// A regular file
    File,
    /// A directory
    Directory,
    /// A symbolic link
    Symlink,
}

/// A file, directory or symlink.
#[derive(Clone, Debug, PartialEq)]
pub struct File {
    /// Absolute path on the node
    pub path: String,
    /// Contents of a regular file
    pub contents: Option<Resource>,
    /// Octal mode; files default to `0644`, directories to `0755`
    pub mode: Option<String>,
    /// Owning user
    pub owner: Option<String>,
    /// Owning group
    pub group: Option<String>,
    /// Object type
    pub file_type: FileType,
    /// Link target for symlinks
    pub symlink: Option<String>,
    /// Leave an existing object alone
    pub if_not_exists: bool,
    /// Commands run at the end of the run when this file changed
    pub on_change_execute: Vec<Vec<String>>,
    /// Files that must exist first
    pub after_files: Vec<String>,
    /// Services that must start after this file is written
    pub before_services: Vec<String>,
}

impl File {
    fn new(path: impl Into<String>, file_type: FileType) -> Self {
        File {
            path: path.into(),
            contents: None,
            mode: None,
            owner: None,
            group: None,
            file_type,
            symlink: None,
            if_not_exists: false,
            on_change_execute: Vec::new(),
            after_files: Vec::new(),
            before_services: Vec::new(),
        }
    }

    /// A regular file.
    pub fn file(path: impl Into<String>, contents: impl Into<Resource>, mode: Option<&str>) -> Self {
        let mut f = Self::new(path, FileType::File);
        f.contents = Some(contents.into());
        f.mode = mode.map(String::from);
        f
    }

    /// A directory.
    pub fn directory(path: impl Into<String>, mode: Option<&str>) -> Self {
        let mut f = Self::new(path, FileType::Directory);
        f.mode = mode.map(String::from);
        f
    }

    /// A symlink at `path` pointing at `target`.
    pub fn symlink(path: impl Into<String>, target: impl Into<String>) -> Self {
        let mut f = Self::new(path, FileType::Symlink);
        f.symlink = Some(target.into());
        f
    }

    /// Sets the owner and group.
    pub fn owned_by(mut self, owner: &str, group: &str) -> Self {
        self.owner = Some(owner.to_string());
        self.group = Some(group.to_string());
        self
    }

    /// Only creates the object if it is missing.
    pub fn if_not_exists(mut self) -> Self {
        self.if_not_exists = true;
        self
    }

    /// Appends a command to run when this file changes.
    pub fn on_change(mut self, argv: &[&str]) -> Self {
        self.on_change_execute
            .push(argv.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Orders this file after `path`.
    pub fn after(mut self, path: &str) -> Self {
        self.after_files.push(path.to_string());
        self
    }

    /// Orders `service` after this file.
    pub fn before_service(mut self, service: &str) -> Self {
        self.before_services.push(service.to_string());
        self
    }

    fn desired_mode(&self) -> Result<u32> {
        match (&self.mode, self.file_type) {
            (Some(m), _) => parse_mode(m),
            (None, FileType::Directory) => Ok(0o755),
            (None, _) => Ok(0o644),
        }
    }
}

/// Observed state of a path.
#[derive(Debug)]
pub(crate) struct FileState {
    file_type: FileType,
    mode: u32,
    contents: Option<Vec<u8>>,
    symlink: Option<String>,
    uid: u32,
    gid: u32,
}

#[async_trait(?Send)]
impl Delta for File {
    type Actual = FileState;

    async fn find(&self, target: &LocalTarget) -> Result<Option<FileState>> {
        let path = target.path(&self.path);
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(&path, e)),
        };
        let ft = meta.file_type();
        let (file_type, contents, symlink) = if ft.is_symlink() {
            let link = std::fs::read_link(&path).map_err(|e| Error::io(&path, e))?;
            (FileType::Symlink, None, Some(link.display().to_string()))
        } else if ft.is_dir() {
            (FileType::Directory, None, None)
        } else {
            let data = std::fs::read(&path).map_err(|e| Error::io(&path, e))?;
            (FileType::File, Some(data), None)
        };
        Ok(Some(FileState {
            file_type,
            mode: meta.permissions().mode() & 0o7777,
            contents,
            symlink,
            uid: meta.uid(),
            gid: meta.gid(),
        }))
    }

    fn check_changes(&self, id: &TaskId, actual: Option<&FileState>) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(Error::config(format!("{}: path must be absolute", id)));
        }
        if self.file_type == FileType::Symlink && self.symlink.is_none() {
            return Err(Error::config(format!("{}: symlink target not set", id)));
        }
        if let Some(actual) = actual {
            let was_dir = actual.file_type == FileType::Directory;
            let want_dir = self.file_type == FileType::Directory;
            if was_dir != want_dir && !self.if_not_exists {
                return Err(Error::PreconditionFailed {
                    task: id.to_string(),
                    reason: format!(
                        "cannot change {:?} into {:?}",
                        actual.file_type, self.file_type
                    ),
                });
            }
        }
        Ok(())
    }

    async fn render(&self, target: &mut LocalTarget, actual: Option<&FileState>) -> Result<bool> {
        if actual.is_some() && self.if_not_exists {
            debug!(path = %self.path, "exists, leaving alone");
            return Ok(false);
        }
        let path = target.path(&self.path);
        let mode = self.desired_mode()?;
        let mut changed = false;
        let mut created = false;

        match self.file_type {
            FileType::Directory => {
                if actual.is_none() {
                    std::fs::create_dir_all(&path).map_err(|e| Error::io(&path, e))?;
                    set_mode(&path, mode)?;
                    changed = true;
                    created = true;
                }
            }
            FileType::File => {
                let data = match &self.contents {
                    Some(resource) => resource.open()?,
                    None => Vec::new(),
                };
                let current = actual.and_then(|a| a.contents.as_deref());
                if current != Some(data.as_slice()) {
                    ensure_parent(&path)?;
                    write_atomic(&path, &data, mode)?;
                    changed = true;
                    created = true;
                }
            }
            FileType::Symlink => {
                let link = self.symlink.as_deref().unwrap_or_default();
                if actual.and_then(|a| a.symlink.as_deref()) != Some(link) {
                    ensure_parent(&path)?;
                    if actual.is_some() {
                        std::fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
                    }
                    std::os::unix::fs::symlink(link, &path).map_err(|e| Error::io(&path, e))?;
                    changed = true;
                }
                // Link permissions are meaningless.
                return Ok(changed);
            }
        }

        if !created {
            if let Some(actual) = actual {
                if actual.mode != mode {
                    info!(path = %self.path, from = %format!("{:o}", actual.mode), to = %format!("{:o}", mode), "changing mode");
                    set_mode(&path, mode)?;
                    changed = true;
                }
            }
        }

        if self.owner.is_some() || self.group.is_some() {
            changed |= self.reconcile_ownership(target, actual, created)?;
        }
        Ok(changed)
    }
}

impl File {
    fn reconcile_ownership(&self, target: &mut LocalTarget, actual: Option<&FileState>, created: bool) -> Result<bool> {
        let uid = match &self.owner {
            Some(o) => target.lookup_uid(o)?,
            None => None,
        };
        let gid = match &self.group {
            Some(g) => target.lookup_gid(g)?,
            None => None,
        };
        // Unknown accounts are created later in the run, so only a fresh write
        // can be chowned by name.
        let needs_chown = created
            || match actual {
                Some(a) => uid.map_or(false, |u| u != a.uid) || gid.map_or(false, |g| g != a.gid),
                None => true,
            };
        if !needs_chown {
            return Ok(false);
        }
        let spec = match (&self.owner, &self.group) {
            (Some(o), Some(g)) => format!("{}:{}", o, g),
            (Some(o), None) => o.clone(),
            (None, Some(g)) => format!(":{}", g),
            (None, None) => return Ok(false),
        };
        let path = os_path(target, &self.path);
        target.run_checked(&["chown".to_string(), spec, path])?;
        Ok(true)
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
    }
    Ok(())
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| Error::io(path, e))
}
