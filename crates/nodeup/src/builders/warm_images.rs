//! Images pre-pulled so warm pool instances start quickly.

use std::collections::BTreeSet;

use tracing::warn;

use crate::error::Result;
use crate::model::NodeupModelContext;
use crate::tasks::PullImage;

use super::TaskContext;

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    let images: BTreeSet<&String> = model.nodeup_config.warm_pool_images.iter().collect();
    if images.is_empty() {
        return Ok(());
    }
    if !model.uses_containerd() {
        warn!(
            runtime = %model.cluster.spec.container_runtime,
            "image pre-pulling needs containerd; skipping"
        );
        return Ok(());
    }
    for image in images {
        c.add_task(PullImage::new(image))?;
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
    fn each_image_is_pulled_once() {
        let mut model = model(ClusterSpec::default(), InstanceGroupRole::Node, Distribution::Debian12);
        model.nodeup_config.warm_pool_images = vec![
            "registry.k8s.io/pause:3.6".to_string(),
            "registry.k8s.io/kube-proxy:v1.22.4".to_string(),
            "registry.k8s.io/pause:3.6".to_string(),
        ];
        let tasks = run(build, &model);
        assert_eq!(tasks.len(), 2);
        assert!(tasks.contains_key(&TaskId::new("PullImage", "registry.k8s.io/pause:3.6")));
    }

    #[test]
    fn other_runtimes_skip_pulling() {
        let spec = ClusterSpec {
            container_runtime: "docker".to_string(),
            ..Default::default()
        };
        let mut model = model(spec, InstanceGroupRole::Node, Distribution::Debian12);
        model.nodeup_config.warm_pool_images = vec!["busybox".to_string()];
        assert!(run(build, &model).is_empty());
    }
}
