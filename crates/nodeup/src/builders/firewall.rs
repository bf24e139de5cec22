//! Host firewall rules for image based distributions that drop traffic by
//! default.

use crate::distro::Distribution;
use crate::error::Result;
use crate::model::NodeupModelContext;
use crate::systemd::Manifest;
use crate::tasks::{File, Service};

use super::TaskContext;

const SCRIPT: &str = r#"#!/bin/bash
# Built by nodeup - do not edit

iptables -w -P INPUT ACCEPT
iptables -w -P FORWARD ACCEPT
iptables -w -P OUTPUT ACCEPT
iptables -w -A FORWARD -w -p tcp -m tcp -j ACCEPT
iptables -w -A FORWARD -w -p udp -m udp -j ACCEPT
iptables -w -A FORWARD -w -p icmp -m icmp --icmp-type any -j ACCEPT
"#;

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    if model.distribution != Distribution::ContainerOs {
        return Ok(());
    }
    let script = format!("{}/iptables-setup", model.bin_dir());
    c.add_task(File::file(script.as_str(), SCRIPT, Some("0755")))?;

    let mut manifest = Manifest::new();
    manifest
        .set("Unit", "Description", "Configure iptables for kubernetes")
        .set("Unit", "Documentation", "https://github.com/kubernetes/kops")
        .set("Unit", "Before", "network.target")
        .set("Service", "Type", "oneshot")
        .set("Service", "RemainAfterExit", "yes")
        .set("Service", "ExecStart", script.as_str())
        .set("Install", "WantedBy", "basic.target");
    c.add_task(Service::new("kubernetes-iptables-setup.service", manifest.render()))
}
