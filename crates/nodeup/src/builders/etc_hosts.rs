//! Static name resolution for clusters without DNS.

use crate::error::Result;
use crate::model::NodeupModelContext;
use crate::tasks::{HostRecord, UpdateEtcHosts};

use super::TaskContext;

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    if !model.is_gossip() && !model.uses_no_dns() {
        return Ok(());
    }

    let api_addresses = if model.is_api_server() {
        vec!["127.0.0.1".to_string()]
    } else {
        model.nodeup_config.api_server_ips.clone()
    };
    if api_addresses.is_empty() {
        return Ok(());
    }

    let mut records = vec![HostRecord {
        hostname: model.api_internal_name(),
        addresses: api_addresses.clone(),
    }];
    if model.uses_kops_controller_bootstrap() {
        records.push(HostRecord {
            hostname: model.kops_controller_name(),
            addresses: api_addresses,
        });
    }
    c.add_task(UpdateEtcHosts {
        name: "kops".to_string(),
        records,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{ClusterSpec, InstanceGroupRole};
    use crate::builders::test::run;
    use crate::distro::Distribution;
    use crate::model::test::model;
    use crate::tasks::{Task, TaskId};

    #[test]
    fn gossip_workers_point_at_api_servers() {
        let mut m = model(ClusterSpec::default(), InstanceGroupRole::Node, Distribution::Debian12);
        m.nodeup_config.api_server_ips = vec!["10.0.1.10".to_string()];
        m.nodeup_config.use_kops_controller_for_node_bootstrap = true;
        let tasks = run(build, &m);
        match tasks.get(&TaskId::new("UpdateEtcHosts", "kops")) {
            Some(Task::UpdateEtcHosts(t)) => {
                assert_eq!(t.records.len(), 2);
                assert_eq!(t.records[0].hostname, "api.internal.example.k8s.local");
                assert_eq!(t.records[1].addresses, vec!["10.0.1.10"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn masters_resolve_themselves() {
        let m = model(ClusterSpec::default(), InstanceGroupRole::Master, Distribution::Debian12);
        let tasks = run(build, &m);
        match tasks.get(&TaskId::new("UpdateEtcHosts", "kops")) {
            Some(Task::UpdateEtcHosts(t)) => assert_eq!(t.records[0].addresses, vec!["127.0.0.1"]),
            other => panic!("unexpected {:?}", other),
        }
    }
}
