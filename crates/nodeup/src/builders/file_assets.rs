//! Arbitrary files declared on the cluster and the instance group.

use crate::api::FileAssetSpec;
use crate::error::{Error, Result};
use crate::model::NodeupModelContext;
use crate::resource::Resource;
use crate::tasks::File;

use super::TaskContext;

const DEFAULT_MODE: &str = "0440";

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    let assets = model
        .cluster
        .spec
        .file_assets
        .iter()
        .chain(model.instance_group.spec.file_assets.iter())
        .filter(|asset| model.has_role(&asset.roles));
    for asset in assets {
        c.add_task(file(model, asset)?)?;
    }
    Ok(())
}

fn file(model: &NodeupModelContext, asset: &FileAssetSpec) -> Result<File> {
    if asset.path.is_empty() {
        return Err(Error::config(format!("file asset {} has no path", asset.name)));
    }
    let contents = if asset.is_base64 {
        let decoded = base64::decode(asset.content.trim()).map_err(|e| {
            Error::config(format!("file asset {} is not valid base64: {}", asset.name, e))
        })?;
        Resource::bytes(decoded)
    } else {
        Resource::template(asset.name.as_str(), asset.content.as_str(), model.template_data())
    };
    let mode = asset.mode.as_deref().unwrap_or(DEFAULT_MODE);
    Ok(File::file(asset.path.as_str(), contents, Some(mode)))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{ClusterSpec, InstanceGroupRole};
    use crate::builders::test::{contents, file as file_task, run};
    use crate::distro::Distribution;
    use crate::error::ErrorKind;
    use crate::model::test::model;

    fn asset(name: &str, path: &str, content: &str) -> FileAssetSpec {
        FileAssetSpec {
            name: name.to_string(),
            path: path.to_string(),
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn templates_render_against_the_cluster() {
        let spec = ClusterSpec {
            network_cidr: "10.79.0.0/24".to_string(),
            non_masquerade_cidr: "10.100.0.0/16".to_string(),
            file_assets: vec![asset(
                "networks",
                "/etc/networks.conf",
                "network={{ .Cluster.NetworkCIDR }}\npods={{ .Cluster.NonMasqueradeCIDR }}\n",
            )],
            ..Default::default()
        };
        let tasks = run(build, &model(spec, InstanceGroupRole::Node, Distribution::Debian12));
        assert_eq!(
            contents(&tasks, "/etc/networks.conf"),
            "network=10.79.0.0/24\npods=10.100.0.0/16\n"
        );
        assert_eq!(file_task(&tasks, "/etc/networks.conf").mode.as_deref(), Some("0440"));
    }

    #[test]
    fn base64_and_roles() {
        let mut master_only = asset("secret", "/etc/secret", "aGVsbG8=");
        master_only.is_base64 = true;
        master_only.roles = vec![InstanceGroupRole::Master];
        let spec = ClusterSpec {
            file_assets: vec![master_only],
            ..Default::default()
        };

        let worker = model(spec.clone(), InstanceGroupRole::Node, Distribution::Debian12);
        assert!(run(build, &worker).is_empty());

        let master = model(spec, InstanceGroupRole::Master, Distribution::Debian12);
        assert_eq!(contents(&run(build, &master), "/etc/secret"), "hello");
    }

    #[test]
    fn instance_group_assets_are_included() {
        let mut model = model(ClusterSpec::default(), InstanceGroupRole::Node, Distribution::Debian12);
        let mut relative = asset("motd", "motd", "hi");
        relative.mode = Some("0644".to_string());
        model.instance_group.spec.file_assets.push(relative);
        let tasks = run(build, &model);
        assert_eq!(file_task(&tasks, "/etc/kubernetes/motd").mode.as_deref(), Some("0644"));
    }

    #[test]
    fn duplicate_paths_are_rejected() {
        let spec = ClusterSpec {
            file_assets: vec![asset("a", "/etc/x", "1"), asset("b", "/etc/x", "2")],
            ..Default::default()
        };
        let model = model(spec, InstanceGroupRole::Node, Distribution::Debian12);
        let mut c = TaskContext::new(model.service_files_root());
        assert_eq!(build(&model, &mut c).unwrap_err().kind(), ErrorKind::Configuration);
    }
}
