//! kubectl on control-plane nodes.

use crate::error::Result;
use crate::model::NodeupModelContext;
use crate::tasks::File;

use super::TaskContext;

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    if !model.is_master() {
        return Ok(());
    }
    c.add_task(File::file(
        model.kubectl_path(),
        model.assets.find("kubectl", None)?,
        Some("0755"),
    ))
}
