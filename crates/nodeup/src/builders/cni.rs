//! CNI plugin binaries and kernel modules pod networking needs.

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Error, Result};
use crate::model::NodeupModelContext;
use crate::tasks::File;

use super::TaskContext;

lazy_static! {
    static ref CNI_PLUGINS: Regex =
        Regex::new(r"^cni-plugins[^/]*/(\./)?[^/]+$").expect("pattern is valid");
}

const MODULES_PATH: &str = "/etc/modules-load.d/k8s.conf";

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    if !model.uses_cni() && !model.uses_kubenet() {
        return Ok(());
    }

    let bin_dir = model.cni_bin_dir().trim_end_matches('/');
    c.add_task(File::directory(bin_dir, Some("0755")))?;
    c.add_task(File::directory(model.cni_conf_dir().trim_end_matches('/'), Some("0755")))?;

    let plugins = model.assets.find_matches(&CNI_PLUGINS);
    if plugins.is_empty() {
        return Err(Error::not_found("asset", "cni-plugins"));
    }
    for (name, resource) in plugins {
        c.add_task(File::file(format!("{}/{}", bin_dir, name), resource, Some("0755")))?;
    }

    c.add_task(
        File::file(MODULES_PATH, "br_netfilter\noverlay\n", Some("0644"))
            .on_change(&["systemctl", "restart", "systemd-modules-load.service"]),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{ClusterSpec, EmptyConfig, InstanceGroupRole, NetworkingSpec};
    use crate::builders::test::{file, run};
    use crate::distro::Distribution;
    use crate::error::ErrorKind;
    use crate::model::test::model;
    use crate::tasks::TaskId;

    #[test]
    fn plugins_land_in_bin_dir() {
        let mut m = model(ClusterSpec::default(), InstanceGroupRole::Node, Distribution::Debian12);
        for plugin in &["bridge", "loopback", "portmap"] {
            m.assets.add_file(
                format!("cni-plugins-linux-amd64-v1.2.0/{}", plugin),
                format!("/var/cache/nodeup/cni-plugins-linux-amd64-v1.2.0/{}", plugin),
                None,
            );
        }
        let tasks = run(build, &m);
        assert_eq!(file(&tasks, "/opt/cni/bin/bridge").mode.as_deref(), Some("0755"));
        assert!(tasks.contains_key(&TaskId::new("File", "/opt/cni/bin")));
        assert!(tasks.contains_key(&TaskId::new("File", MODULES_PATH)));
    }

    #[test]
    fn classic_networking_skips_cni() {
        let spec = ClusterSpec {
            networking: Some(NetworkingSpec {
                classic: Some(EmptyConfig {}),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(run(build, &model(spec, InstanceGroupRole::Node, Distribution::Debian12)).is_empty());

        let m = model(ClusterSpec::default(), InstanceGroupRole::Node, Distribution::Debian12);
        let mut c = TaskContext::new("/etc/kubernetes");
        assert_eq!(build(&m, &mut c).unwrap_err().kind(), ErrorKind::NotFound);
    }
}
