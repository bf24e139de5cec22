//! Kernel parameters for kubernetes nodes.

use crate::api::CloudProvider;
use crate::error::Result;
use crate::model::NodeupModelContext;
use crate::tasks::File;

use super::TaskContext;

const SYSCTL_PATH: &str = "/etc/sysctl.d/99-k8s-general.conf";

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    let mut lines: Vec<String> = [
        "# Kubernetes Settings",
        "",
        "# Increase the number of connections",
        "net.core.somaxconn = 32768",
        "",
        "# Maximum Socket Receive Buffer",
        "net.core.rmem_max = 16777216",
        "",
        "# Default Socket Send Buffer",
        "net.core.wmem_max = 16777216",
        "",
        "# Increase the maximum total buffer-space allocatable",
        "net.ipv4.tcp_wmem = 4096 12582912 16777216",
        "net.ipv4.tcp_rmem = 4096 12582912 16777216",
        "",
        "# Increase the number of outstanding syn requests allowed",
        "net.ipv4.tcp_max_syn_backlog = 8096",
        "",
        "# For persistent HTTP connections",
        "net.ipv4.tcp_slow_start_after_idle = 0",
        "",
        "# Allow to reuse TIME_WAIT sockets for new connections",
        "# when it is safe from protocol viewpoint",
        "net.ipv4.tcp_tw_reuse = 1",
        "",
        "# Max number of memory map areas a process may have",
        "vm.max_map_count = 262144",
        "",
        "# Panic on soft lockups",
        "kernel.softlockup_panic = 1",
        "",
        "# Allow many concurrent file watches",
        "fs.inotify.max_user_instances = 8192",
        "fs.inotify.max_user_watches = 524288",
        "",
    ]
    .iter()
    .map(|l| l.to_string())
    .collect();

    if model.cloud_provider() == CloudProvider::Aws {
        lines.push("# AWS settings".to_string());
        lines.push("# Issue #23395".to_string());
        lines.push("net.ipv4.neigh.default.gc_thresh1=0".to_string());
        lines.push(String::new());
    }

    lines.push("# Prevent docker from changing iptables: https://github.com/kubernetes/kubernetes/issues/40182".to_string());
    lines.push("net.ipv4.ip_forward=1".to_string());
    if model.cluster.spec.is_ipv6_only() {
        lines.push("net.ipv6.conf.all.forwarding=1".to_string());
        lines.push("net.ipv6.conf.all.accept_ra=2".to_string());
    }
    lines.push(String::new());

    let custom: Vec<&String> = model
        .cluster
        .spec
        .sysctl_parameters
        .iter()
        .chain(model.instance_group.spec.sysctl_parameters.iter())
        .collect();
    if !custom.is_empty() {
        lines.push("# Custom sysctl parameters from instance group and cluster specs".to_string());
        lines.extend(custom.into_iter().cloned());
        lines.push(String::new());
    }

    c.add_task(
        File::file(SYSCTL_PATH, lines.join("\n"), Some("0644")).on_change(&["sysctl", "--system"]),
    )
}
