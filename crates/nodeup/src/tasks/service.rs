use async_trait::async_trait;
use tracing::{debug, info};

use super::Delta;
use crate::error::{Error, Result};
use crate::target::{argv, write_atomic, LocalTarget};

/// A systemd unit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Service {
    /// Unit name, e.g. `kubelet.service`
    pub name: String,
    /// Unit file contents
    pub definition: Option<String>,
    /// Enable the unit; defaults to `running`
    pub enabled: Option<bool>,
    /// Touch runtime state at all; defaults to true
    pub managed: Option<bool>,
    /// Desired run state; defaults to true
    pub running: Option<bool>,
    /// Restart when the unit or a file it depends on changes; defaults to true
    pub smart_restart: Option<bool>,
    /// Files the unit reads on start
    pub after_files: Vec<String>,
}

impl Service {
    /// A running, enabled unit defined by `definition`.
    pub fn new(name: &str, definition: impl Into<String>) -> Self {
        Service {
            name: name.to_string(),
            definition: Some(definition.into()),
            ..Default::default()
        }
    }

    /// A unit shipped by a package, only managed at runtime.
    pub fn existing(name: &str) -> Self {
        Service {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Whether runtime state is managed.
    pub fn managed(&self) -> bool {
        self.managed.unwrap_or(true)
    }

    /// Whether the unit should be running.
    pub fn running(&self) -> bool {
        self.running.unwrap_or(true)
    }

    /// Whether the unit should be enabled.
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or_else(|| self.running())
    }

    /// Whether file changes restart the unit.
    pub fn smart_restart(&self) -> bool {
        self.smart_restart.unwrap_or(true)
    }

    fn unit_path(&self, target: &LocalTarget) -> String {
        format!("{}/{}", target.distribution().systemd_unit_dir(), self.name)
    }
}

/// What systemd reports about a unit.
#[derive(Debug, Default)]
pub(crate) struct ServiceState {
    definition: Option<String>,
    active: bool,
    enabled: bool,
}

fn show_value<'a>(output: &'a str, key: &str) -> Option<&'a str> {
    output.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        if k == key {
            Some(v.trim())
        } else {
            None
        }
    })
}

#[async_trait(?Send)]
impl Delta for Service {
    type Actual = ServiceState;

    async fn find(&self, target: &LocalTarget) -> Result<Option<ServiceState>> {
        let path = target.path(&self.unit_path(target));
        let definition = match std::fs::read_to_string(&path) {
            Ok(d) => Some(d),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(Error::io(&path, e)),
        };
        let show = target.run(&argv(&["systemctl", "show", "--all", &self.name]))?;
        let load_state = show_value(&show.stdout, "LoadState");
        if definition.is_none() && (load_state.is_none() || load_state == Some("not-found")) {
            return Ok(None);
        }
        Ok(Some(ServiceState {
            definition,
            active: matches!(show_value(&show.stdout, "ActiveState"), Some("active") | Some("activating")),
            enabled: matches!(show_value(&show.stdout, "UnitFileState"), Some("enabled") | Some("static")),
        }))
    }

    async fn render(&self, target: &mut LocalTarget, actual: Option<&ServiceState>) -> Result<bool> {
        let default = ServiceState::default();
        let actual = actual.unwrap_or(&default);
        let mut changed = false;
        let mut definition_changed = false;

        if let Some(definition) = &self.definition {
            if actual.definition.as_deref() != Some(definition.as_str()) {
                let path = target.path(&self.unit_path(target));
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
                }
                info!(service = %self.name, "writing unit file");
                write_atomic(&path, definition.as_bytes(), 0o644)?;
                target.run_checked(&argv(&["systemctl", "daemon-reload"]))?;
                changed = true;
                definition_changed = true;
            }
        }

        if !self.managed() {
            debug!(service = %self.name, "unmanaged, leaving runtime state alone");
            return Ok(changed);
        }

        if self.enabled() != actual.enabled {
            let verb = if self.enabled() { "enable" } else { "disable" };
            target.run_checked(&argv(&["systemctl", verb, &self.name]))?;
            changed = true;
        }

        if self.running() {
            if !actual.active {
                info!(service = %self.name, "starting service");
                target.run_checked(&argv(&["systemctl", "start", &self.name]))?;
                target.mark_started(&self.name);
                changed = true;
            } else if definition_changed && self.smart_restart() {
                info!(service = %self.name, "unit changed, restarting service");
                target.run_checked(&argv(&["systemctl", "restart", &self.name]))?;
                target.mark_started(&self.name);
            }
        } else if actual.active {
            info!(service = %self.name, "stopping service");
            target.run_checked(&argv(&["systemctl", "stop", &self.name]))?;
            changed = true;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::distro::Distribution;
    use crate::target::CommandOutput;
    use crate::tasks::test::{scratch_target, scripted_target};
    use crate::tasks::Task;

    const UNIT: &str = "[Unit]\nDescription=chrony\n\n[Service]\nExecStart=/usr/sbin/chronyd\n";

    #[tokio::test]
    async fn writes_enables_and_starts() {
        let (_dir, mut target, log) = scratch_target(Distribution::Debian12);
        let task: Task = Service::new("chrony.service", UNIT).into();
        assert!(task.apply(&mut target).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(target.path("/lib/systemd/system/chrony.service")).unwrap(),
            UNIT
        );
        assert_eq!(
            log.lines(),
            vec![
                "systemctl show --all chrony.service",
                "systemctl daemon-reload",
                "systemctl enable chrony.service",
                "systemctl start chrony.service",
            ]
        );
        assert!(target.was_started("chrony.service"));
    }

    #[tokio::test]
    async fn running_enabled_unit_is_converged() {
        let (_dir, mut target, log) = scripted_target(Distribution::AmazonLinux2, |r| {
            r.respond(
                &["systemctl", "show"],
                CommandOutput::ok("LoadState=loaded\nActiveState=active\nUnitFileState=enabled\n"),
            );
        });
        std::fs::create_dir_all(target.path("/usr/lib/systemd/system")).unwrap();
        std::fs::write(target.path("/usr/lib/systemd/system/chronyd.service"), UNIT).unwrap();
        let task: Task = Service::new("chronyd.service", UNIT).into();
        assert!(!task.apply(&mut target).await.unwrap());
        assert_eq!(log.calls().len(), 1);
    }

    #[tokio::test]
    async fn changed_unit_restarts_running_service() {
        let (_dir, mut target, log) = scripted_target(Distribution::Debian12, |r| {
            r.respond(
                &["systemctl", "show"],
                CommandOutput::ok("LoadState=loaded\nActiveState=active\nUnitFileState=enabled\n"),
            );
        });
        std::fs::create_dir_all(target.path("/lib/systemd/system")).unwrap();
        std::fs::write(target.path("/lib/systemd/system/kubelet.service"), "old").unwrap();
        let task: Task = Service::new("kubelet.service", UNIT).into();
        assert!(task.apply(&mut target).await.unwrap());
        assert_eq!(log.lines().last().unwrap(), "systemctl restart kubelet.service");
    }

    #[tokio::test]
    async fn unmanaged_only_writes_unit() {
        let (_dir, mut target, log) = scratch_target(Distribution::Debian12);
        let mut svc = Service::new("kops-configuration.service", UNIT);
        svc.managed = Some(false);
        assert!(Task::from(svc).apply(&mut target).await.unwrap());
        assert!(!log.lines().iter().any(|l| l.contains("start") || l.contains("enable")));
    }

    #[tokio::test]
    async fn stopped_and_disabled() {
        let (_dir, mut target, log) = scripted_target(Distribution::Flatcar, |r| {
            r.respond(
                &["systemctl", "show"],
                CommandOutput::ok("LoadState=loaded\nActiveState=active\nUnitFileState=enabled\n"),
            );
        });
        let mut svc = Service::existing("update-engine.service");
        svc.running = Some(false);
        assert!(Task::from(svc).apply(&mut target).await.unwrap());
        assert_eq!(
            log.lines()[1..].to_vec(),
            vec!["systemctl disable update-engine.service", "systemctl stop update-engine.service"]
        );
    }
}
