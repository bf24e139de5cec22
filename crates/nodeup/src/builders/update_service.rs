//! Unattended OS updates.

use tracing::debug;

use crate::distro::{Distribution, Family};
use crate::error::{Error, Result};
use crate::model::NodeupModelContext;
use crate::tasks::{Package, Service};

use super::TaskContext;

const AUTOMATIC: &str = "automatic";
const EXTERNAL: &str = "external";

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    match model.update_policy() {
        AUTOMATIC => automatic(model, c),
        EXTERNAL => external(model, c),
        other => Err(Error::config(format!("unknown update policy {:?}", other))),
    }
}

fn automatic(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    match model.distribution.family() {
        Family::Debian => c.add_task(Package::new("unattended-upgrades")),
        Family::Rhel | Family::Amazon => {
            c.add_task(Package::new("dnf-automatic"))?;
            let mut timer = Service::existing("dnf-automatic-install.timer");
            timer.smart_restart = Some(false);
            c.add_task(timer)
        }
        Family::Immutable => {
            debug!("image based distribution updates itself");
            Ok(())
        }
        Family::Unknown => {
            model.warn_unsupported("unattended upgrades");
            Ok(())
        }
    }
}

fn external(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    if model.distribution != Distribution::Flatcar {
        return Ok(());
    }
    let mut engine = Service::existing("update-engine.service");
    engine.running = Some(false);
    engine.enabled = Some(false);
    engine.smart_restart = Some(false);
    c.add_task(engine)?;
    let mut locksmith = Service::existing("locksmithd.service");
    locksmith.running = Some(false);
    locksmith.enabled = Some(false);
    locksmith.smart_restart = Some(false);
    c.add_task(locksmith)
}
