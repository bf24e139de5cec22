//! Log rotation for component logs written outside journald.

use crate::distro::Family;
use crate::error::Result;
use crate::model::NodeupModelContext;
use crate::systemd::Manifest;
use crate::tasks::{File, Package, Service};

use super::TaskContext;

const NODE_LOGS: &[&str] = &["kube-proxy", "kubelet"];
const CONTROL_PLANE_LOGS: &[&str] = &[
    "kube-apiserver",
    "kube-controller-manager",
    "kube-scheduler",
    "kops-controller",
];

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    match model.distribution.family() {
        Family::Immutable => return Ok(()),
        Family::Unknown => model.warn_unsupported("logrotate package"),
        _ => c.add_task(Package::new("logrotate"))?,
    }

    let mut logs: Vec<String> = NODE_LOGS.iter().map(|s| s.to_string()).collect();
    if model.is_master() {
        logs.extend(CONTROL_PLANE_LOGS.iter().map(|s| s.to_string()));
        for etcd in &model.cluster.spec.etcd_clusters {
            logs.push(format!("etcd-{}", etcd.name));
        }
    }
    for name in &logs {
        c.add_task(File::file(
            format!("/etc/logrotate.d/{}", name),
            rotation(name),
            Some("0644"),
        ))?;
    }

    let mut service = Manifest::new();
    service
        .set("Unit", "Description", "Rotate and Compress System Logs")
        .set("Service", "ExecStart", "/usr/sbin/logrotate /etc/logrotate.conf");
    let mut rotate = Service::new("logrotate.service", service.render());
    rotate.running = Some(false);
    rotate.enabled = Some(false);
    c.add_task(rotate)?;

    let mut timer = Manifest::new();
    timer
        .set("Unit", "Description", "Run logrotate hourly")
        .set("Timer", "OnCalendar", "hourly")
        .set("Timer", "AccuracySec", "1m")
        .set("Timer", "Persistent", "true")
        .set("Install", "WantedBy", "timers.target");
    c.add_task(Service::new("logrotate.timer", timer.render()))
}

fn rotation(name: &str) -> String {
    format!(
        "/var/log/{}.log {{\n\trotate 5\n\tcopytruncate\n\tmissingok\n\tnotifempty\n\tdelaycompress\n\tmaxsize 100M\n\tdaily\n\tdateext\n\tdateformat -%Y%m%d-%s\n\tcreate 0644 root root\n}}\n",
        name
    )
}
