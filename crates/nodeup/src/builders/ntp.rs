//! Time synchronization with chrony.

use tracing::debug;

use crate::api::CloudProvider;
use crate::distro::Family;
use crate::error::Result;
use crate::model::NodeupModelContext;
use crate::tasks::{File, Package, Service};

use super::TaskContext;

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    let unmanaged = model.nodeup_config.ntp_unmanaged
        || model.cluster.spec.ntp.as_ref().and_then(|n| n.managed) == Some(false);
    if unmanaged {
        debug!("time synchronization is managed externally");
        return Ok(());
    }

    let (config_path, service) = match model.distribution.family() {
        Family::Debian => ("/etc/chrony/chrony.conf", "chrony.service"),
        Family::Rhel | Family::Amazon => ("/etc/chrony.conf", "chronyd.service"),
        Family::Immutable => return Ok(()),
        Family::Unknown => {
            model.warn_unsupported("ntp configuration");
            return Ok(());
        }
    };

    c.add_task(Package::new("chrony"))?;
    c.add_task(File::file(config_path, chrony_conf(&model.cloud_provider()), Some("0644")))?;
    let mut chrony = Service::existing(service);
    chrony.after_files.push(config_path.to_string());
    c.add_task(chrony)
}

fn chrony_conf(cloud: &CloudProvider) -> String {
    let pool = match cloud {
        CloudProvider::Aws => "pool 169.254.169.123 prefer iburst",
        CloudProvider::Gce => "pool metadata.google.internal prefer iburst",
        _ => "pool pool.ntp.org iburst",
    };
    [
        "# Built by nodeup - do NOT edit",
        "",
        pool,
        "",
        "driftfile /var/lib/chrony/drift",
        "makestep 1.0 3",
        "rtcsync",
        "logdir /var/log/chrony",
        "",
    ]
    .join("\n")
}
