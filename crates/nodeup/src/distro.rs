//! Linux distribution detection.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use tracing::warn;

use crate::error::{Error, Result};

/// The package-management family a distribution belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    /// dpkg/apt based
    Debian,
    /// rpm/dnf based
    Rhel,
    /// rpm/yum based Amazon Linux
    Amazon,
    /// Image based, no package manager
    Immutable,
    /// Not recognized
    Unknown,
}

/// A recognized operating system release.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Distribution {
    /// Debian 11 (bullseye)
    Debian11,
    /// Debian 12 (bookworm)
    Debian12,
    /// Ubuntu 20.04
    Ubuntu2004,
    /// Ubuntu 22.04
    Ubuntu2204,
    /// Ubuntu 24.04
    Ubuntu2404,
    /// Amazon Linux 2
    AmazonLinux2,
    /// Amazon Linux 2023
    AmazonLinux2023,
    /// Red Hat Enterprise Linux 8
    Rhel8,
    /// Red Hat Enterprise Linux 9
    Rhel9,
    /// Rocky Linux 8
    Rocky8,
    /// Rocky Linux 9
    Rocky9,
    /// Flatcar Container Linux
    Flatcar,
    /// Google Container-Optimized OS
    ContainerOs,
    /// Anything else, carrying the os-release `ID` and `VERSION_ID`
    Unknown(String),
}

impl Distribution {
    /// Maps os-release `ID` / `VERSION_ID` to a distribution.
    pub fn from_os_release(id: &str, version_id: &str) -> Self {
        let major = version_id.split('.').next().unwrap_or_default();
        match (id, version_id, major) {
            ("debian", _, "11") => Distribution::Debian11,
            ("debian", _, "12") => Distribution::Debian12,
            ("ubuntu", "20.04", _) => Distribution::Ubuntu2004,
            ("ubuntu", "22.04", _) => Distribution::Ubuntu2204,
            ("ubuntu", "24.04", _) => Distribution::Ubuntu2404,
            ("amzn", "2", _) => Distribution::AmazonLinux2,
            ("amzn", "2023", _) => Distribution::AmazonLinux2023,
            ("rhel", _, "8") => Distribution::Rhel8,
            ("rhel", _, "9") => Distribution::Rhel9,
            ("rocky", _, "8") => Distribution::Rocky8,
            ("rocky", _, "9") => Distribution::Rocky9,
            ("flatcar", _, _) => Distribution::Flatcar,
            ("cos", _, _) => Distribution::ContainerOs,
            _ => Distribution::Unknown(format!("{}-{}", id, version_id)),
        }
    }

    /// Reads `<root>/etc/os-release`. An unrecognized release is not an error.
    pub fn detect(root: &Path) -> Result<Self> {
        let path = root.join("etc/os-release");
        let contents = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let fields = parse_os_release(&contents);
        let id = fields.get("ID").map(String::as_str).unwrap_or_default();
        let version = fields.get("VERSION_ID").map(String::as_str).unwrap_or_default();
        let distribution = Distribution::from_os_release(id, version);
        if let Distribution::Unknown(name) = &distribution {
            warn!(distribution = %name, "unknown distribution; continuing with generic defaults");
        }
        Ok(distribution)
    }

    /// The package-management family.
    pub fn family(&self) -> Family {
        match self {
            Distribution::Debian11
            | Distribution::Debian12
            | Distribution::Ubuntu2004
            | Distribution::Ubuntu2204
            | Distribution::Ubuntu2404 => Family::Debian,
            Distribution::AmazonLinux2 | Distribution::AmazonLinux2023 => Family::Amazon,
            Distribution::Rhel8 | Distribution::Rhel9 | Distribution::Rocky8 | Distribution::Rocky9 => {
                Family::Rhel
            }
            Distribution::Flatcar | Distribution::ContainerOs => Family::Immutable,
            Distribution::Unknown(_) => Family::Unknown,
        }
    }

    /// Debian or Ubuntu.
    pub fn is_debian_family(&self) -> bool {
        self.family() == Family::Debian
    }

    /// RHEL, Rocky or Amazon Linux.
    pub fn is_rhel_family(&self) -> bool {
        matches!(self.family(), Family::Rhel | Family::Amazon)
    }

    /// Ubuntu in any version.
    pub fn is_ubuntu(&self) -> bool {
        matches!(
            self,
            Distribution::Ubuntu2004 | Distribution::Ubuntu2204 | Distribution::Ubuntu2404
        )
    }

    /// Where packaged systemd units live.
    pub fn systemd_unit_dir(&self) -> &'static str {
        match self.family() {
            Family::Debian => "/lib/systemd/system",
            Family::Rhel | Family::Amazon => "/usr/lib/systemd/system",
            Family::Immutable | Family::Unknown => "/etc/systemd/system",
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Distribution::Debian11 => "debian11",
            Distribution::Debian12 => "debian12",
            Distribution::Ubuntu2004 => "ubuntu2004",
            Distribution::Ubuntu2204 => "ubuntu2204",
            Distribution::Ubuntu2404 => "ubuntu2404",
            Distribution::AmazonLinux2 => "amazonlinux2",
            Distribution::AmazonLinux2023 => "amazonlinux2023",
            Distribution::Rhel8 => "rhel8",
            Distribution::Rhel9 => "rhel9",
            Distribution::Rocky8 => "rocky8",
            Distribution::Rocky9 => "rocky9",
            Distribution::Flatcar => "flatcar",
            Distribution::ContainerOs => "containeros",
            Distribution::Unknown(name) => name,
        };
        f.write_str(name)
    }
}

fn parse_os_release(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .filter(|l| !l.trim_start().starts_with('#'))
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| {
            (
                k.trim().to_string(),
                v.trim().trim_matches('"').trim_matches('\'').to_string(),
            )
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[test]
    fn detects_amazon_linux_2() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("etc")).unwrap();
        std::fs::write(
            root.path().join("etc/os-release"),
            "NAME=\"Amazon Linux\"\nVERSION=\"2\"\nID=\"amzn\"\nID_LIKE=\"centos rhel fedora\"\nVERSION_ID=\"2\"\n",
        )
        .unwrap();
        let distro = Distribution::detect(root.path()).unwrap();
        assert_eq!(distro, Distribution::AmazonLinux2);
        assert_eq!(distro.family(), Family::Amazon);
        assert!(distro.is_rhel_family());
        assert_eq!(distro.systemd_unit_dir(), "/usr/lib/systemd/system");
    }

    #[test]
    fn unknown_release_is_not_an_error() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("etc")).unwrap();
        std::fs::write(root.path().join("etc/os-release"), "ID=gentoo\nVERSION_ID=2.14\n").unwrap();
        let distro = Distribution::detect(root.path()).unwrap();
        assert_eq!(distro, Distribution::Unknown("gentoo-2.14".to_string()));
        assert_eq!(distro.family(), Family::Unknown);
    }

    #[rstest(
        id,
        version,
        expected,
        case("debian", "12", Distribution::Debian12),
        case("rocky", "9.3", Distribution::Rocky9),
        case("ubuntu", "22.04", Distribution::Ubuntu2204),
        case("ubuntu", "24.04", Distribution::Ubuntu2404)
    )]
    fn versions_match_on_major(id: &str, version: &str, expected: Distribution) {
        assert_eq!(Distribution::from_os_release(id, version), expected);
    }
}
