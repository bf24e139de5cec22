//! Directories every node needs before binaries and configs arrive.

use crate::distro::Distribution;
use crate::error::Result;
use crate::model::NodeupModelContext;
use crate::tasks::{BindMount, File};

use super::TaskContext;

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    c.add_task(File::directory(model.service_files_root(), Some("0755")))?;

    if model.distribution == Distribution::ContainerOs {
        // /home is mounted noexec on ContainerOS.
        let bin = model.bin_dir();
        c.add_task(File::directory(bin, Some("0755")))?;
        c.add_task(BindMount::new(bin, bin, &["exec"]))?;
    }
    Ok(())
}
