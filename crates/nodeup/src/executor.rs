//! Applies a [`Plan`] to a [`LocalTarget`].
//!
//! Tasks run one at a time in plan order. A task that changed something
//! queues its `onChangeExecute` commands and the restarts of services that
//! watch the path it wrote. The queue is drained once every task has run,
//! in the order entries were queued, with duplicates dropped.

use std::collections::HashMap;

use tracing::{debug, error, info};

use crate::error::Result;
use crate::graph::Plan;
use crate::target::{argv, LocalTarget};
use crate::tasks::TaskId;

const DETACH: &str = "&";

/// What a run did.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Tasks that changed the node, in execution order
    pub changed: Vec<TaskId>,
    /// Side-effect commands run to completion, in order
    pub commands: Vec<Vec<String>>,
    /// Side-effect commands started detached
    pub detached: Vec<Vec<String>>,
}

#[derive(Debug, PartialEq, Eq)]
enum Trigger {
    Command(Vec<String>),
    Restart(String),
}

#[derive(Debug, Default)]
struct TriggerQueue {
    entries: Vec<Trigger>,
}

impl TriggerQueue {
    fn push(&mut self, trigger: Trigger) {
        if !self.entries.contains(&trigger) {
            self.entries.push(trigger);
        }
    }
}

/// Runs every task in `plan` against `target`, then the queued side effects.
///
/// The first error stops the run.
pub async fn execute(plan: &Plan, target: &mut LocalTarget) -> Result<RunReport> {
    let mut watchers: HashMap<String, Vec<String>> = HashMap::new();
    for task in plan.tasks() {
        if let crate::tasks::Task::Service(service) = task {
            for path in task.restart_triggers() {
                watchers.entry(path).or_default().push(service.name.clone());
            }
        }
    }

    let mut report = RunReport::default();
    let mut queue = TriggerQueue::default();
    for task in plan.tasks() {
        let id = task.id();
        let changed = match task.apply(target).await {
            Ok(changed) => changed,
            Err(e) => {
                error!(task = %id, error = %e, "task failed");
                return Err(e);
            }
        };
        if !changed {
            debug!(task = %id, "up to date");
            continue;
        }
        info!(task = %id, "changed");
        for command in task.on_change_execute() {
            queue.push(Trigger::Command(command.clone()));
        }
        if let Some(services) = task.produced_path().and_then(|p| watchers.get(p)) {
            for service in services {
                queue.push(Trigger::Restart(service.clone()));
            }
        }
        report.changed.push(id);
    }

    drain(queue, target, &mut report)?;
    Ok(report)
}

fn drain(queue: TriggerQueue, target: &mut LocalTarget, report: &mut RunReport) -> Result<()> {
    let daemon_reload = argv(&["systemctl", "daemon-reload"]);
    for trigger in queue.entries {
        match trigger {
            Trigger::Command(command) if command.last().map(String::as_str) == Some(DETACH) => {
                let command = command[..command.len() - 1].to_vec();
                info!(command = ?command, "starting detached side effect");
                target.spawn_detached(&command)?;
                report.detached.push(command);
            }
            Trigger::Command(command) => {
                if command == daemon_reload && report.commands.contains(&daemon_reload) {
                    continue;
                }
                info!(command = ?command, "running side effect");
                target.run_checked(&command)?;
                report.commands.push(command);
            }
            Trigger::Restart(service) => {
                if target.was_started(&service) {
                    debug!(service = %service, "started during this run, not restarting");
                    continue;
                }
                if !report.commands.contains(&daemon_reload) {
                    target.run_checked(&daemon_reload)?;
                    report.commands.push(daemon_reload.clone());
                }
                let restart = argv(&["systemctl", "restart", &service]);
                info!(service = %service, "restarting after configuration change");
                target.run_checked(&restart)?;
                target.mark_started(&service);
                report.commands.push(restart);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::distro::Distribution;
    use crate::graph::resolve;
    use crate::target::{CommandOutput, RecordingRunner};
    use crate::tasks::{File, Service, Task, TaskSet};

    fn set(tasks: Vec<Task>) -> TaskSet {
        tasks.into_iter().map(|t| (t.id(), t)).collect()
    }

    fn active_target() -> (tempfile::TempDir, LocalTarget, crate::target::CommandLog) {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = RecordingRunner::new();
        runner.respond(
            &["systemctl", "show"],
            CommandOutput::ok("LoadState=loaded\nActiveState=active\nUnitFileState=enabled\n"),
        );
        let log = runner.log();
        let target = LocalTarget::new(dir.path(), Distribution::Debian12, dir.path().join("cache"), Box::new(runner));
        (dir, target, log)
    }

    #[tokio::test]
    async fn on_change_commands_run_once_in_order_after_all_tasks() {
        let (_dir, mut target, log) = active_target();
        let plan = resolve(set(vec![
            File::file("/etc/a.conf", "a", None)
                .on_change(&["sysctl", "--system"])
                .on_change(&["touch", "/tmp/a"])
                .into(),
            File::file("/etc/b.conf", "b", None).on_change(&["sysctl", "--system"]).into(),
            File::file("/etc/c.conf", "c", None).on_change(&["sleep", "10", "&"]).into(),
        ]))
        .unwrap();
        let report = execute(&plan, &mut target).await.unwrap();
        assert_eq!(report.changed.len(), 3);
        assert_eq!(
            report.commands,
            vec![argv(&["sysctl", "--system"]), argv(&["touch", "/tmp/a"])]
        );
        assert_eq!(log.detached(), vec![argv(&["sleep", "10"])]);

        let report = execute(&plan, &mut target).await.unwrap();
        assert!(report.changed.is_empty());
        assert!(report.commands.is_empty());
    }

    #[tokio::test]
    async fn changed_config_restarts_running_service_once() {
        let (_dir, mut target, log) = active_target();
        let unit = "[Service]\nEnvironmentFile=/etc/sysconfig/kubelet\nExecStart=/usr/local/bin/kubelet\n";
        std::fs::create_dir_all(target.path("/lib/systemd/system")).unwrap();
        std::fs::write(target.path("/lib/systemd/system/kubelet.service"), unit).unwrap();
        let mut containerd = Service::new("containerd.service", "[Service]\nExecStart=/usr/bin/containerd\n");
        containerd.after_files.push("/etc/containerd/config.toml".into());
        std::fs::write(target.path("/lib/systemd/system/containerd.service"), containerd.definition.clone().unwrap()).unwrap();

        let plan = resolve(set(vec![
            File::file("/etc/sysconfig/kubelet", "DAEMON_ARGS=\n", None).into(),
            File::file("/usr/local/bin/kubelet", "bin", Some("0755")).into(),
            File::file("/etc/containerd/config.toml", "version = 2\n", None).into(),
            Service::new("kubelet.service", unit).into(),
            containerd.into(),
        ]))
        .unwrap();
        let report = execute(&plan, &mut target).await.unwrap();
        assert_eq!(
            report.commands,
            vec![
                argv(&["systemctl", "daemon-reload"]),
                argv(&["systemctl", "restart", "kubelet.service"]),
                argv(&["systemctl", "restart", "containerd.service"]),
            ]
        );
        let restarts = log.lines().iter().filter(|l| l.contains("restart kubelet")).count();
        assert_eq!(restarts, 1);
    }

    #[tokio::test]
    async fn services_started_this_run_are_not_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let runner = RecordingRunner::new();
        let mut target = LocalTarget::new(dir.path(), Distribution::Debian12, dir.path().join("cache"), Box::new(runner));
        let unit = "[Service]\nEnvironmentFile=/etc/sysconfig/kubelet\n";
        let plan = resolve(set(vec![
            File::file("/etc/sysconfig/kubelet", "x", None).into(),
            Service::new("kubelet.service", unit).into(),
        ]))
        .unwrap();
        let report = execute(&plan, &mut target).await.unwrap();
        assert!(report.commands.is_empty());
        assert!(target.was_started("kubelet.service"));
    }

    #[tokio::test]
    async fn first_failure_stops_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = RecordingRunner::new();
        runner.respond(&["chown"], CommandOutput::failed(1, "invalid user"));
        let log = runner.log();
        let mut target = LocalTarget::new(dir.path(), Distribution::Debian12, dir.path().join("cache"), Box::new(runner));
        let plan = resolve(set(vec![
            File::file("/etc/a", "a", None).owned_by("nobody", "nobody").on_change(&["true"]).into(),
            File::file("/etc/b", "b", None).into(),
        ]))
        .unwrap();
        let err = execute(&plan, &mut target).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::TransientIo);
        assert!(!target.path("/etc/b").exists());
        assert!(!log.lines().contains(&"true".to_string()));
    }
}
