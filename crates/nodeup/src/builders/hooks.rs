//! User supplied systemd units from the cluster and instance group specs.

use crate::api::{ExecContainerAction, HookSpec};
use crate::error::{Error, Result};
use crate::model::NodeupModelContext;
use crate::systemd::Manifest;
use crate::tasks::Service;

use super::TaskContext;

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    // Instance group hooks replace cluster hooks of the same name.
    let mut hooks: Vec<(String, &HookSpec)> = Vec::new();
    let all = model
        .cluster
        .spec
        .hooks
        .iter()
        .chain(model.instance_group.spec.hooks.iter());
    for (index, hook) in all.enumerate() {
        let name = service_name(hook, index);
        match hooks.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = hook,
            None => hooks.push((name, hook)),
        }
    }

    for (name, hook) in hooks {
        if !model.has_role(&hook.roles) {
            continue;
        }
        let mut service = Service::new(&name, definition(&name, hook)?);
        if hook.disabled {
            service.enabled = Some(false);
            service.running = Some(false);
        }
        c.add_task(service)?;
    }
    Ok(())
}

fn service_name(hook: &HookSpec, index: usize) -> String {
    let name = if hook.name.is_empty() {
        format!("kops-hook-{}", index)
    } else {
        hook.name.clone()
    };
    if name.ends_with(".service") {
        name
    } else {
        format!("{}.service", name)
    }
}

fn definition(name: &str, hook: &HookSpec) -> Result<String> {
    if hook.use_raw_manifest {
        return Ok(hook.manifest.clone());
    }
    let mut manifest = Manifest::new();
    manifest.set("Unit", "Description", format!("Kops Hook {}", name.trim_end_matches(".service")));
    if !hook.requires.is_empty() {
        manifest.set("Unit", "Requires", hook.requires.join(" "));
    }
    if !hook.before.is_empty() {
        manifest.set("Unit", "Before", hook.before.join(" "));
    }
    match &hook.exec_container {
        Some(action) => exec_container(&mut manifest, name, action)?,
        None => {
            for line in hook.manifest.lines().map(str::trim).filter(|l| !l.is_empty()) {
                let (key, value) = line.split_once('=').ok_or_else(|| {
                    Error::config(format!("hook {}: malformed manifest line {:?}", name, line))
                })?;
                manifest.set("Service", key.trim(), value.trim());
            }
        }
    }
    manifest.set("Install", "WantedBy", "multi-user.target");
    Ok(manifest.render())
}

fn exec_container(manifest: &mut Manifest, name: &str, action: &ExecContainerAction) -> Result<()> {
    if action.image.is_empty() {
        return Err(Error::config(format!("hook {}: execContainer needs an image", name)));
    }
    let mut run = vec![
        "/usr/bin/ctr".to_string(),
        "--namespace".to_string(),
        "k8s.io".to_string(),
        "run".to_string(),
        "--rm".to_string(),
        "--net-host".to_string(),
        "--privileged".to_string(),
    ];
    for (key, value) in &action.environment {
        run.push(format!("--env={}={}", key, value));
    }
    run.push(action.image.clone());
    run.push(name.trim_end_matches(".service").to_string());
    run.extend(action.command.iter().cloned());

    manifest
        .set("Service", "Type", "oneshot")
        .set(
            "Service",
            "ExecStartPre",
            format!("/usr/bin/ctr --namespace k8s.io images pull {}", action.image),
        )
        .set("Service", "ExecStart", run.join(" "));
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{ClusterSpec, InstanceGroupRole};
    use crate::builders::test::run;
    use crate::distro::Distribution;
    use crate::model::test::model;
    use crate::systemd;
    use crate::tasks::{Task, TaskId};

    fn service<'a>(tasks: &'a crate::tasks::TaskSet, name: &str) -> &'a Service {
        match tasks.get(&TaskId::new("Service", name)) {
            Some(Task::Service(s)) => s,
            other => panic!("no service {}: {:?}", name, other),
        }
    }

    #[test]
    fn container_hooks_run_through_ctr() {
        let spec = ClusterSpec {
            hooks: vec![HookSpec {
                name: "fix-dns".to_string(),
                before: vec!["kubelet.service".to_string()],
                exec_container: Some(ExecContainerAction {
                    image: "busybox".to_string(),
                    command: vec!["sh".to_string(), "-c".to_string(), "true".to_string()],
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let tasks = run(build, &model(spec, InstanceGroupRole::Node, Distribution::Debian12));
        let unit = service(&tasks, "fix-dns.service").definition.clone().unwrap();
        assert_eq!(systemd::values(&unit, "Before"), vec!["kubelet.service"]);
        assert_eq!(
            systemd::values(&unit, "ExecStart"),
            vec!["/usr/bin/ctr --namespace k8s.io run --rm --net-host --privileged busybox fix-dns sh -c true"]
        );
    }

    #[test]
    fn instance_group_hooks_override_and_disable() {
        let cluster_hook = HookSpec {
            name: "tune".to_string(),
            manifest: "Type=oneshot\nExecStart=/bin/true".to_string(),
            ..Default::default()
        };
        let spec = ClusterSpec {
            hooks: vec![cluster_hook.clone()],
            ..Default::default()
        };
        let mut model = model(spec, InstanceGroupRole::Node, Distribution::Debian12);
        model.instance_group.spec.hooks.push(HookSpec {
            disabled: true,
            ..cluster_hook
        });
        let tasks = run(build, &model);
        assert_eq!(tasks.len(), 1);
        let tune = service(&tasks, "tune.service");
        assert!(!tune.running());
        assert!(!tune.enabled());
        assert_eq!(systemd::values(tune.definition.as_deref().unwrap(), "ExecStart"), vec!["/bin/true"]);
    }

    #[test]
    fn raw_manifests_are_used_verbatim() {
        let raw = "[Unit]\nDescription=raw\n";
        let spec = ClusterSpec {
            hooks: vec![HookSpec {
                name: "raw.service".to_string(),
                manifest: raw.to_string(),
                use_raw_manifest: true,
                roles: vec![InstanceGroupRole::Node],
                ..Default::default()
            }],
            ..Default::default()
        };
        let tasks = run(build, &model(spec.clone(), InstanceGroupRole::Node, Distribution::Debian12));
        assert_eq!(service(&tasks, "raw.service").definition.as_deref(), Some(raw));
        assert!(run(build, &model(spec, InstanceGroupRole::Master, Distribution::Debian12)).is_empty());
    }
}
