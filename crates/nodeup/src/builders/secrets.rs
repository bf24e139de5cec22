//! Control-plane key material shared by the apiserver and the controller manager.

use crate::error::Result;
use crate::model::NodeupModelContext;

use super::{keystore_pair, kubernetes_ca_file, TaskContext};

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    if !model.is_master() {
        return Ok(());
    }
    c.ensure_task(kubernetes_ca_file(model)?)?;

    let (certificate, key) = keystore_pair(
        model,
        "service-account",
        model.path_srv_kubernetes(),
        "service-account",
    )?;
    c.add_task(certificate)?;
    c.add_task(key)
}
