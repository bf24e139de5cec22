//! IPv6 prefix delegation for IPv6-only pods on AWS.

use crate::api::CloudProvider;
use crate::error::Result;
use crate::model::NodeupModelContext;
use crate::tasks::Prefix;

use super::TaskContext;

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    if model.cloud_provider() != CloudProvider::Aws || !model.cluster.spec.is_ipv6_only() {
        return Ok(());
    }
    c.add_task(Prefix::new("prefix"))
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
    fn only_ipv6_clusters_on_aws_wait_for_a_prefix() {
        let spec = |cloud: &str, pods: &str| ClusterSpec {
            cloud_provider: cloud.to_string(),
            non_masquerade_cidr: pods.to_string(),
            ..Default::default()
        };
        let node = |s| model(s, InstanceGroupRole::Node, Distribution::Debian12);

        let tasks = run(build, &node(spec("aws", "::/0")));
        assert!(tasks.contains_key(&TaskId::new("Prefix", "prefix")));
        assert!(run(build, &node(spec("aws", "100.64.0.0/10"))).is_empty());
        assert!(run(build, &node(spec("gce", "::/0"))).is_empty());
    }
}
