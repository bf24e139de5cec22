use std::os::unix::fs::PermissionsExt;

use async_trait::async_trait;
use tracing::{info, warn};

use super::Delta;
use crate::assets::download;
use crate::distro::{Distribution, Family};
use crate::error::{Error, Result};
use crate::target::{argv, write_atomic, LocalTarget};

const POLICY_RC_D: &str = "/usr/sbin/policy-rc.d";

/// An OS package.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Package {
    /// Package name
    pub name: String,
    /// Required version prefix
    pub version: Option<String>,
    /// URL of a package file to install instead of using the repositories
    pub source: Option<String>,
    /// sha256 of `source`
    pub hash: Option<String>,
    /// Do not let the package start its services while installing
    pub prevent_start: bool,
    /// Packages that must be installed first
    pub deps: Vec<String>,
}

impl Package {
    /// A package from the distribution's repositories.
    pub fn new(name: &str) -> Self {
        Package {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// Installed version and whether the package database considers it healthy.
#[derive(Debug)]
pub(crate) struct PackageState {
    version: String,
    healthy: bool,
}

#[async_trait(?Send)]
impl Delta for Package {
    type Actual = PackageState;

    async fn find(&self, target: &LocalTarget) -> Result<Option<PackageState>> {
        query(target, &self.name)
    }

    async fn render(&self, target: &mut LocalTarget, actual: Option<&PackageState>) -> Result<bool> {
        if let Some(actual) = actual {
            let version_ok = self
                .version
                .as_deref()
                .map_or(true, |v| actual.version.starts_with(v));
            if actual.healthy && version_ok {
                return Ok(false);
            }
        }
        let family = target.distribution().family();
        if matches!(family, Family::Immutable | Family::Unknown) {
            warn!(package = %self.name, distribution = %target.distribution(), "no package manager for distribution, skipping");
            return Ok(false);
        }

        let local = match &self.source {
            Some(source) => Some(self.fetch(target, source).await?),
            None => None,
        };
        let install = install_command(target.distribution(), &self.name, self.version.as_deref(), local.as_deref());

        info!(package = %self.name, version = ?self.version, "installing package");
        let prevent = self.prevent_start && family == Family::Debian;
        let mut previous = None;
        if prevent {
            let path = ensure_parent(target, POLICY_RC_D)?;
            previous = match std::fs::read(&path) {
                Ok(contents) => {
                    let meta = std::fs::metadata(&path).map_err(|e| Error::io(&path, e))?;
                    Some((contents, meta.permissions().mode()))
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(Error::io(&path, e)),
            };
            write_atomic(&path, b"#!/bin/sh\nexit 101\n", 0o755)?;
        }
        let result = target.run_checked(&install);
        if prevent {
            let path = target.path(POLICY_RC_D);
            match previous {
                Some((contents, mode)) => write_atomic(&path, &contents, mode & 0o7777)?,
                None => std::fs::remove_file(&path).map_err(|e| Error::io(&path, e))?,
            }
        }
        result?;
        Ok(true)
    }
}

impl Package {
    async fn fetch(&self, target: &LocalTarget, source: &str) -> Result<String> {
        let file_name = source.rsplit('/').next().unwrap_or(&self.name);
        let dest = target.cache_dir().join("packages").join(file_name);
        if let Ok(existing) = std::fs::read(&dest) {
            if crate::assets::verify(source, &existing, self.hash.as_deref()).is_ok() {
                return Ok(dest.display().to_string());
            }
        }
        let data = download(source, self.hash.as_deref()).await?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        write_atomic(&dest, &data, 0o644)?;
        Ok(dest.display().to_string())
    }
}

fn ensure_parent(target: &LocalTarget, node_path: &str) -> Result<std::path::PathBuf> {
    let path = target.path(node_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    Ok(path)
}

fn query(target: &LocalTarget, name: &str) -> Result<Option<PackageState>> {
    let output = match target.distribution().family() {
        Family::Debian => target.run(&argv(&["dpkg-query", "-f", "${db:Status-Abbrev}${Version}\\n", "-W", name]))?,
        Family::Rhel | Family::Amazon => target.run(&argv(&["rpm", "-q", "--queryformat", "%{VERSION}", name]))?,
        Family::Immutable | Family::Unknown => return Ok(None),
    };
    if !output.success {
        return Ok(None);
    }
    let line = output.stdout.lines().next().unwrap_or_default().trim();
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(match target.distribution().family() {
        Family::Debian => {
            let (status, version) = line.split_at(line.find(' ').unwrap_or(line.len()));
            PackageState {
                version: version.trim().to_string(),
                healthy: status == "ii",
            }
        }
        _ => PackageState {
            version: line.to_string(),
            healthy: true,
        },
    }))
}

fn install_command(distro: &Distribution, name: &str, version: Option<&str>, local: Option<&str>) -> Vec<String> {
    match distro.family() {
        Family::Debian => match local {
            Some(file) => argv(&["dpkg", "-i", file]),
            None => {
                let spec = match version {
                    Some(v) => format!("{}={}*", name, v),
                    None => name.to_string(),
                };
                argv(&[
                    "env",
                    "DEBIAN_FRONTEND=noninteractive",
                    "apt-get",
                    "install",
                    "--yes",
                    "--no-install-recommends",
                    &spec,
                ])
            }
        },
        _ => {
            let tool = if *distro == Distribution::AmazonLinux2 { "yum" } else { "dnf" };
            let spec = match (local, version) {
                (Some(file), _) => file.to_string(),
                (None, Some(v)) => format!("{}-{}", name, v),
                (None, None) => name.to_string(),
            };
            argv(&[tool, "install", "-y", &spec])
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::sha256_hex;
    use crate::target::CommandOutput;
    use crate::tasks::test::{scratch_target, scripted_target};
    use crate::tasks::Task;

    #[tokio::test]
    async fn installs_missing_debian_package() {
        let (_dir, mut target, log) = scripted_target(Distribution::Ubuntu2204, |r| {
            r.respond(&["dpkg-query"], CommandOutput::failed(1, "no packages found"));
        });
        let task: Task = Package::new("conntrack").into();
        assert!(task.apply(&mut target).await.unwrap());
        let lines = log.lines();
        assert_eq!(
            lines.last().unwrap(),
            "env DEBIAN_FRONTEND=noninteractive apt-get install --yes --no-install-recommends conntrack"
        );
    }

    #[tokio::test]
    async fn healthy_package_is_converged() {
        let (_dir, mut target, log) = scripted_target(Distribution::Debian12, |r| {
            r.respond(&["dpkg-query"], CommandOutput::ok("ii 1:1.4.7-1\n"));
        });
        let task: Task = Package::new("conntrack").into();
        assert!(!task.apply(&mut target).await.unwrap());
        assert_eq!(log.calls().len(), 1);
    }

    #[tokio::test]
    async fn half_installed_package_is_reinstalled() {
        let (_dir, mut target, log) = scripted_target(Distribution::Debian12, |r| {
            r.respond(&["dpkg-query"], CommandOutput::ok("iF 1.0\n"));
        });
        let task: Task = Package::new("ebtables").into();
        assert!(task.apply(&mut target).await.unwrap());
        assert_eq!(log.calls().len(), 2);
    }

    #[tokio::test]
    async fn rpm_families_use_their_installer() {
        let (_dir, mut target, log) = scripted_target(Distribution::AmazonLinux2, |r| {
            r.respond(&["rpm"], CommandOutput::failed(1, "package chrony is not installed"));
        });
        Task::from(Package::new("chrony")).apply(&mut target).await.unwrap();
        assert_eq!(log.lines().last().unwrap(), "yum install -y chrony");

        let (_dir, mut target, log) = scripted_target(Distribution::Rocky9, |r| {
            r.respond(&["rpm"], CommandOutput::failed(1, ""));
        });
        Task::from(Package::new("chrony")).apply(&mut target).await.unwrap();
        assert_eq!(log.lines().last().unwrap(), "dnf install -y chrony");
    }

    #[tokio::test]
    async fn unknown_distribution_only_warns() {
        let (_dir, mut target, log) = scratch_target(Distribution::Unknown("plan9".into()));
        assert!(!Task::from(Package::new("chrony")).apply(&mut target).await.unwrap());
        assert!(log.calls().is_empty());
    }

    #[tokio::test]
    async fn sourced_package_is_verified_and_start_prevented() {
        let (dir, mut target, log) = scripted_target(Distribution::Debian12, |r| {
            r.respond(&["dpkg-query"], CommandOutput::failed(1, ""));
        });
        let deb = dir.path().join("containerd.deb");
        std::fs::write(&deb, b"not really a deb").unwrap();
        let task = Package {
            name: "containerd".into(),
            source: Some(format!("file://{}", deb.display())),
            hash: Some(sha256_hex(b"not really a deb")),
            prevent_start: true,
            ..Default::default()
        };
        assert!(Task::from(task.clone()).apply(&mut target).await.unwrap());
        let cached = target.cache_dir().join("packages/containerd.deb");
        assert!(cached.exists());
        assert_eq!(log.lines().last().unwrap(), &format!("dpkg -i {}", cached.display()));
        assert!(!target.path(POLICY_RC_D).exists());

        let mut bad = task;
        bad.hash = Some("00".repeat(32));
        std::fs::remove_file(&cached).unwrap();
        let err = Task::from(bad).apply(&mut target).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Integrity);
    }

    #[tokio::test]
    async fn existing_start_policy_is_restored() {
        let (_dir, mut target, log) = scripted_target(Distribution::Ubuntu2204, |r| {
            r.respond(&["dpkg-query"], CommandOutput::failed(1, ""));
        });
        let policy = target.path(POLICY_RC_D);
        std::fs::create_dir_all(policy.parent().unwrap()).unwrap();
        std::fs::write(&policy, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&policy, std::fs::Permissions::from_mode(0o700)).unwrap();

        let task = Package {
            name: "containerd".into(),
            prevent_start: true,
            ..Default::default()
        };
        assert!(Task::from(task).apply(&mut target).await.unwrap());
        assert!(log.lines().last().unwrap().ends_with("containerd"));
        assert_eq!(std::fs::read_to_string(&policy).unwrap(), "#!/bin/sh\nexit 0\n");
        assert_eq!(std::fs::metadata(&policy).unwrap().permissions().mode() & 0o777, 0o700);
    }
}
