//! The containerd container runtime.

use lazy_static::lazy_static;
use regex::Regex;
use toml::{Table, Value};
use tracing::debug;

use crate::api::ContainerdConfig;
use crate::distro::{Distribution, Family};
use crate::error::{Error, Result};
use crate::model::NodeupModelContext;
use crate::resource::Resource;
use crate::systemd::Manifest;
use crate::tasks::{Chattr, File, Service, TaskId};

use super::TaskContext;

const CNI_TEMPLATE_PATH: &str = "/etc/containerd/config-cni.template";
const IP_MASQ_SCRIPT: &str = "/opt/kops/bin/cni-iptables-setup";
const SYSCONFIG_PATH: &str = "/etc/sysconfig/containerd";
const DROP_IN_PATH: &str = "/etc/systemd/system/containerd.service.d/10-kops.conf";

lazy_static! {
    static ref CONTAINERD_BINARIES: [Regex; 2] = [
        Regex::new(r"(^|/)bin/(containerd[^/]*|ctr)$").expect("pattern is valid"),
        Regex::new(r"(^|/)usr/local/bin/(containerd[^/]*|crictl|ctr)$").expect("pattern is valid"),
    ];
    static ref RUNC_BINARIES: [Regex; 2] = [
        Regex::new(r"(^|/)runc\.(amd64|arm64)$").expect("pattern is valid"),
        Regex::new(r"(^|/)usr/local/sbin/runc$").expect("pattern is valid"),
    ];
}

const CNI_TEMPLATE: &str = r#"{
    "cniVersion": "0.4.0",
    "name": "k8s-pod-network",
    "plugins": [
        {
            "type": "ptp",
            "ipam": {
                "type": "host-local",
                "ranges": [[{"subnet": "{{.PodCIDR}}"}]],
                "routes": [{ "dst": "0.0.0.0/0" }]
            }
        },
        {
            "type": "portmap",
            "capabilities": {"portMappings": true}
        }
    ]
}
"#;

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    if !model.uses_containerd() {
        debug!(runtime = %model.cluster.spec.container_runtime, "not a containerd node");
        return Ok(());
    }
    let containerd = model.cluster.spec.containerd.clone().unwrap_or_default();
    if containerd.skip_install {
        debug!("using the containerd shipped with the image");
        return Ok(());
    }

    let config_path = config_file_path(&model.distribution);
    c.add_task(File::file(config_path, config_file(model, &containerd)?, Some("0644")))?;

    match model.distribution {
        Distribution::ContainerOs => {
            c.add_task(drop_in(
                &["[Service]", "EnvironmentFile=/etc/environment", "TasksMax=infinity"],
                config_path,
            ))?;
        }
        Distribution::Flatcar => {
            let exec = format!("ExecStart=/usr/bin/containerd --config {}", config_path);
            c.add_task(drop_in(
                &["[Service]", "EnvironmentFile=/etc/environment", "ExecStart=", &exec],
                config_path,
            ))?;
        }
        _ => {
            install_binaries(model, c)?;
            c.add_task(File::file(
                "/etc/crictl.yaml",
                "runtime-endpoint: unix:///run/containerd/containerd.sock\n",
                Some("0644"),
            ))?;
            c.add_task(File::file(SYSCONFIG_PATH, sysconfig(model, &containerd), Some("0644")))?;
            let mut service = Service::new("containerd.service", unit(model, config_path));
            service.after_files.push(config_path.to_string());
            c.add_task(service)?;
        }
    }

    if model.uses_kubenet() {
        c.add_task(File::file(CNI_TEMPLATE_PATH, CNI_TEMPLATE, Some("0644")))?;
        ip_masquerade_rules(model, c)?;
    }

    for path in &containerd.mark_immutable {
        c.add_task(Chattr::immutable(path, TaskId::new("File", path)))?;
    }
    Ok(())
}

fn config_file_path(distribution: &Distribution) -> &'static str {
    match distribution {
        Distribution::ContainerOs => "/etc/containerd/config.toml",
        _ => "/etc/containerd/config-kops.toml",
    }
}

fn install_binaries(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    let binaries = CONTAINERD_BINARIES
        .iter()
        .map(|p| model.assets.find_matches(p))
        .find(|found| !found.is_empty())
        .ok_or_else(|| Error::not_found("asset", "containerd binaries"))?;
    for (name, resource) in binaries {
        c.add_task(File::file(format!("/usr/bin/{}", name), resource, Some("0755")))?;
    }

    let runc: Vec<Resource> = RUNC_BINARIES
        .iter()
        .map(|p| model.assets.find_matches(p))
        .find(|found| !found.is_empty())
        .map(|found| found.into_values().collect())
        .unwrap_or_default();
    match <[Resource; 1]>::try_from(runc) {
        Ok([resource]) => c.add_task(File::file("/usr/sbin/runc", resource, Some("0755"))),
        Err(found) if found.is_empty() => Err(Error::not_found("asset", "runc")),
        Err(found) => Err(Error::config(format!("found {} runc assets, expected one", found.len()))),
    }
}

fn unit(model: &NodeupModelContext, config_path: &str) -> String {
    let mut manifest = Manifest::new();
    manifest
        .set("Unit", "Description", "containerd container runtime")
        .set("Unit", "Documentation", "https://containerd.io")
        .set("Unit", "After", "network.target local-fs.target");
    if model.distribution.family() == Family::Rhel {
        manifest
            .set("Service", "ExecStartPre", "/bin/sh -c 'restorecon -v /usr/sbin/runc'")
            .set("Service", "ExecStartPre", "/bin/sh -c 'restorecon -v /usr/bin/containerd*'");
    }
    manifest
        .set("Service", "EnvironmentFile", SYSCONFIG_PATH)
        .set("Service", "EnvironmentFile", "-/etc/environment")
        .set("Service", "ExecStartPre", "-/sbin/modprobe overlay")
        .set(
            "Service",
            "ExecStart",
            format!("/usr/bin/containerd -c {} \"$CONTAINERD_OPTS\"", config_path),
        )
        .set("Service", "Type", "notify")
        .set("Service", "Delegate", "yes")
        .set("Service", "KillMode", "process")
        .set("Service", "Restart", "always")
        .set("Service", "RestartSec", "5")
        .set("Service", "LimitNPROC", "infinity")
        .set("Service", "LimitCORE", "infinity")
        .set("Service", "LimitNOFILE", "infinity")
        .set("Service", "TasksMax", "infinity")
        .set("Service", "OOMScoreAdjust", "-999")
        .set("Install", "WantedBy", "multi-user.target");
    manifest.render()
}

fn drop_in(lines: &[&str], config_path: &str) -> File {
    let mut contents = lines.join("\n");
    contents.push('\n');
    File::file(DROP_IN_PATH, contents, Some("0644"))
        .after(config_path)
        .on_change(&["systemctl", "daemon-reload"])
        .on_change(&["systemctl", "restart", "containerd.service"])
        // nodeup runs inside kops-configuration, so that restart must not be waited on
        .on_change(&["systemctl", "restart", "kops-configuration.service", "&"])
}

fn sysconfig(model: &NodeupModelContext, containerd: &ContainerdConfig) -> String {
    let mut opts = Vec::new();
    if let Some(level) = &containerd.log_level {
        opts.push(format!("--log-level={}", level));
    }
    let mut contents = format!("CONTAINERD_OPTS={}\n", opts.join(" "));
    for (name, value) in model.environment.proxy() {
        contents.push_str(&format!("{}={}\n", name, value));
    }
    contents
}

fn config_file(model: &NodeupModelContext, containerd: &ContainerdConfig) -> Result<String> {
    if let Some(config) = containerd.config_override.as_ref().filter(|c| !c.is_empty()) {
        return Ok(config.clone());
    }

    const CRI: &str = "io.containerd.grpc.v1.cri";
    let mut config = Table::new();
    config.insert("version".to_string(), Value::Integer(2));
    if let Some(image) = &model.kubelet_config().pod_infra_container_image {
        set_path(&mut config, &["plugins", CRI, "sandbox_image"], Value::String(image.clone()));
    }
    for (registry, endpoints) in &containerd.registry_mirrors {
        set_path(
            &mut config,
            &["plugins", CRI, "registry", "mirrors", registry, "endpoint"],
            Value::Array(endpoints.iter().cloned().map(Value::String).collect()),
        );
    }
    set_path(
        &mut config,
        &["plugins", CRI, "containerd", "runtimes", "runc", "runtime_type"],
        Value::String("io.containerd.runc.v2".to_string()),
    );
    set_path(
        &mut config,
        &["plugins", CRI, "containerd", "runtimes", "runc", "options", "SystemdCgroup"],
        Value::Boolean(true),
    );
    if model.uses_kubenet() {
        set_path(
            &mut config,
            &["plugins", CRI, "cni", "conf_template"],
            Value::String(CNI_TEMPLATE_PATH.to_string()),
        );
    }
    toml::to_string(&config)
        .map_err(|e| Error::config(format!("unable to render containerd config: {}", e)))
}

fn set_path(table: &mut Table, path: &[&str], value: Value) {
    match path {
        [] => {}
        [last] => {
            table.insert(last.to_string(), value);
        }
        [first, rest @ ..] => {
            let entry = table
                .entry(first.to_string())
                .or_insert(Value::Table(Table::new()));
            if !entry.is_table() {
                *entry = Value::Table(Table::new());
            }
            if let Value::Table(inner) = entry {
                set_path(inner, rest, value);
            }
        }
    }
}

fn ip_masquerade_rules(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    let cidr = &model.cluster.spec.non_masquerade_cidr;
    if cidr.is_empty() {
        return Err(Error::config("nonMasqueradeCIDR is not set"));
    }
    let script = format!(
        r#"#!/bin/bash
# Built by nodeup - do not edit

iptables -w -t nat -N IP-MASQ
iptables -w -t nat -A POSTROUTING -m comment --comment "ip-masq: ensure nat POSTROUTING directs all non-LOCAL destination traffic to our custom IP-MASQ chain" -m addrtype ! --dst-type LOCAL -j IP-MASQ
iptables -w -t nat -A IP-MASQ -d {} -m comment --comment "ip-masq: pod cidr is not subject to MASQUERADE" -j RETURN
iptables -w -t nat -A IP-MASQ -m comment --comment "ip-masq: outbound traffic is subject to MASQUERADE (must be last in chain)" -j MASQUERADE
"#,
        cidr
    );
    c.add_task(File::file(IP_MASQ_SCRIPT, script, Some("0755")))?;

    let mut manifest = Manifest::new();
    manifest
        .set("Unit", "Description", "Configure iptables for kubernetes CNI")
        .set("Unit", "Documentation", "https://github.com/kubernetes/kops")
        .set("Unit", "Before", "network.target")
        .set("Service", "Type", "oneshot")
        .set("Service", "RemainAfterExit", "yes")
        .set("Service", "ExecStart", IP_MASQ_SCRIPT)
        .set("Install", "WantedBy", "basic.target");
    c.add_task(Service::new("cni-iptables-setup.service", manifest.render()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{ClusterSpec, EmptyConfig, InstanceGroupRole, NetworkingSpec};
    use crate::builders::test::{contents, file, run, with_kubelet_asset};
    use crate::error::ErrorKind;
    use crate::model::test::model;
    use crate::tasks::Task;

    fn spec() -> ClusterSpec {
        ClusterSpec {
            container_runtime: "containerd".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn installs_binaries_and_unit() {
        let m = with_kubelet_asset(model(spec(), InstanceGroupRole::Node, Distribution::Debian12));
        let tasks = run(build, &m);
        assert_eq!(file(&tasks, "/usr/bin/containerd").mode.as_deref(), Some("0755"));
        assert!(tasks.contains_key(&TaskId::new("File", "/usr/bin/ctr")));
        assert!(tasks.contains_key(&TaskId::new("File", "/usr/sbin/runc")));
        match tasks.get(&TaskId::new("Service", "containerd.service")) {
            Some(task @ Task::Service(_)) => {
                let triggers = task.restart_triggers();
                assert!(triggers.contains(&"/etc/containerd/config-kops.toml".to_string()));
                assert!(triggers.contains(&SYSCONFIG_PATH.to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
        let config: Table = toml::from_str(&contents(&tasks, "/etc/containerd/config-kops.toml")).unwrap();
        assert_eq!(config["version"].as_integer(), Some(2));
    }

    #[test]
    fn missing_binaries_are_not_found() {
        let m = model(spec(), InstanceGroupRole::Node, Distribution::Debian12);
        let mut c = TaskContext::new("/etc/kubernetes");
        assert_eq!(build(&m, &mut c).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn container_os_gets_a_drop_in_with_detached_restart() {
        let tasks = run(build, &model(spec(), InstanceGroupRole::Node, Distribution::ContainerOs));
        let drop_in = file(&tasks, DROP_IN_PATH);
        assert_eq!(drop_in.after_files, vec!["/etc/containerd/config.toml".to_string()]);
        assert_eq!(
            drop_in.on_change_execute.last().map(|c| c.last().cloned()),
            Some(Some("&".to_string()))
        );
        assert!(!tasks.contains_key(&TaskId::new("Service", "containerd.service")));
    }

    #[test]
    fn kubenet_adds_template_and_masquerading() {
        let mut s = spec();
        s.non_masquerade_cidr = "100.64.0.0/10".to_string();
        s.networking = Some(NetworkingSpec {
            kubenet: Some(EmptyConfig {}),
            ..Default::default()
        });
        s.containerd = Some(ContainerdConfig {
            mark_immutable: vec!["/usr/bin/containerd".to_string()],
            ..Default::default()
        });
        let tasks = run(build, &with_kubelet_asset(model(s, InstanceGroupRole::Node, Distribution::Debian12)));
        let config = contents(&tasks, "/etc/containerd/config-kops.toml");
        assert!(config.contains("conf_template = \"/etc/containerd/config-cni.template\""));
        assert!(contents(&tasks, IP_MASQ_SCRIPT).contains("-d 100.64.0.0/10"));
        assert!(tasks.contains_key(&TaskId::new("Chattr", "/usr/bin/containerd")));
    }
}
