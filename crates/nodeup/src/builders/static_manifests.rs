//! Static pod manifests shipped alongside the node-up config.

use crate::error::{Error, Result};
use crate::model::{NodeupModelContext, MANIFESTS_DIR};
use crate::resource::Resource;
use crate::tasks::File;

use super::TaskContext;

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    let manifests = model
        .nodeup_config
        .static_manifests
        .iter()
        .filter(|m| model.has_role(&m.roles));
    for manifest in manifests {
        let base = model.config_base.as_ref().ok_or_else(|| {
            Error::config(format!(
                "static manifest {} needs a config base directory",
                manifest.key
            ))
        })?;
        let source = base.join(manifest.path.trim_start_matches('/'));
        c.add_task(File::file(
            format!("{}/{}.manifest", MANIFESTS_DIR, manifest.key),
            Resource::file(manifest.key.as_str(), source),
            Some("0644"),
        ))?;
    }
    Ok(())
}
