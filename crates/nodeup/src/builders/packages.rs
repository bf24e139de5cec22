//! Miscellaneous OS packages kubernetes relies on.

use crate::distro::Family;
use crate::error::Result;
use crate::model::NodeupModelContext;
use crate::tasks::Package;

use super::TaskContext;

const DEBIAN_PACKAGES: &[&str] = &[
    "conntrack",
    "ebtables",
    "ethtool",
    "iptables",
    "libseccomp2",
    "nfs-common",
    "pigz",
    "socat",
    "util-linux",
];

const RHEL_PACKAGES: &[&str] = &[
    "conntrack-tools",
    "ethtool",
    "iptables",
    "libseccomp",
    "nfs-utils",
    "pigz",
    "socat",
    "util-linux",
];

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    let packages = match model.distribution.family() {
        Family::Debian => DEBIAN_PACKAGES,
        Family::Rhel | Family::Amazon => RHEL_PACKAGES,
        Family::Immutable => return Ok(()),
        Family::Unknown => {
            model.warn_unsupported("miscellaneous package install");
            return Ok(());
        }
    };
    for name in packages {
        c.ensure_task(Package::new(name))?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{ClusterSpec, InstanceGroupRole};
    use crate::builders::test::run;
    use crate::distro::Distribution;
    use crate::model::test::model;
    use crate::tasks::TaskId;

    #[test]
    fn unknown_distribution_warns_and_continues() {
        let m = model(
            ClusterSpec::default(),
            InstanceGroupRole::Node,
            Distribution::Unknown("gentoo-2.14".to_string()),
        );
        assert!(run(build, &m).is_empty());
    }

    #[test]
    fn family_selects_names() {
        let tasks = run(build, &model(ClusterSpec::default(), InstanceGroupRole::Node, Distribution::Debian11));
        assert!(tasks.contains_key(&TaskId::new("Package", "conntrack")));
        let tasks = run(build, &model(ClusterSpec::default(), InstanceGroupRole::Node, Distribution::AmazonLinux2));
        assert!(tasks.contains_key(&TaskId::new("Package", "conntrack-tools")));
        let tasks = run(build, &model(ClusterSpec::default(), InstanceGroupRole::Node, Distribution::Flatcar));
        assert!(tasks.is_empty());
    }
}
