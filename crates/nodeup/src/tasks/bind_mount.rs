use async_trait::async_trait;
use tracing::info;

use super::{os_path, Delta, TaskId};
use crate::error::{Error, Result};
use crate::target::LocalTarget;

const REMOUNT_OPTIONS: &[&str] = &["exec", "noexec", "ro", "rw", "nosuid", "suid", "nodev", "dev"];
const PROPAGATION_OPTIONS: &[&str] = &["shared", "rshared", "private", "rprivate", "slave", "rslave"];

/// A bind mount of `source` onto `mountpoint`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindMount {
    /// Directory being exposed
    pub source: String,
    /// Where it appears
    pub mountpoint: String,
    /// Mount flags (`ro`, `exec`, `nosuid`, `nodev`) and propagation (`shared`, `rshared`)
    pub options: Vec<String>,
    /// Bind submounts too
    pub recursive: bool,
}

impl BindMount {
    /// A plain bind mount.
    pub fn new(source: &str, mountpoint: &str, options: &[&str]) -> Self {
        BindMount {
            source: source.to_string(),
            mountpoint: mountpoint.to_string(),
            options: options.iter().map(|s| s.to_string()).collect(),
            recursive: false,
        }
    }
}

/// A mountpoint as listed in `/proc/self/mountinfo`.
#[derive(Debug)]
pub(crate) struct MountState {
    options: Vec<String>,
}

fn find_mount(mountinfo: &str, mountpoint: &str) -> Option<MountState> {
    mountinfo
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match (fields.get(4), fields.get(5)) {
                (Some(mp), Some(opts)) if *mp == mountpoint => Some(MountState {
                    options: opts.split(',').map(String::from).collect(),
                }),
                _ => None,
            }
        })
        .last()
}

#[async_trait(?Send)]
impl Delta for BindMount {
    type Actual = MountState;

    async fn find(&self, target: &LocalTarget) -> Result<Option<MountState>> {
        let path = target.path("/proc/self/mountinfo");
        let mountinfo = match std::fs::read_to_string(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(&path, e)),
        };
        Ok(find_mount(&mountinfo, &os_path(target, &self.mountpoint)))
    }

    fn check_changes(&self, id: &TaskId, _actual: Option<&MountState>) -> Result<()> {
        for option in &self.options {
            if !REMOUNT_OPTIONS.contains(&option.as_str()) && !PROPAGATION_OPTIONS.contains(&option.as_str()) {
                return Err(Error::config(format!("{}: unsupported mount option {:?}", id, option)));
            }
        }
        Ok(())
    }

    async fn render(&self, target: &mut LocalTarget, actual: Option<&MountState>) -> Result<bool> {
        let mountpoint = os_path(target, &self.mountpoint);
        let remount: Vec<&str> = self
            .options
            .iter()
            .map(String::as_str)
            .filter(|o| REMOUNT_OPTIONS.contains(o))
            .collect();

        let mut changed = false;
        if actual.is_none() {
            let dir = target.path(&self.mountpoint);
            std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
            let bind = if self.recursive { "--rbind" } else { "--bind" };
            let source = os_path(target, &self.source);
            info!(source = %self.source, mountpoint = %self.mountpoint, "bind mounting");
            target.run_checked(&["mount".to_string(), bind.to_string(), source, mountpoint.clone()])?;
            changed = true;
        }

        let flags_missing = match actual {
            Some(a) => remount.iter().any(|o| !a.options.iter().any(|have| have == o)),
            None => !remount.is_empty(),
        };
        if flags_missing {
            target.run_checked(&[
                "mount".to_string(),
                "-o".to_string(),
                format!("remount,bind,{}", remount.join(",")),
                mountpoint.clone(),
            ])?;
            changed = true;
        }

        // Propagation is not visible in the option column, so it is only set on mount.
        if actual.is_none() {
            for option in self.options.iter().filter(|o| PROPAGATION_OPTIONS.contains(&o.as_str())) {
                target.run_checked(&["mount".to_string(), format!("--make-{}", option), mountpoint.clone()])?;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::distro::Distribution;
    use crate::tasks::test::scratch_target;
    use crate::tasks::Task;

    #[tokio::test]
    async fn mounts_then_converges() {
        let (_dir, mut target, log) = scratch_target(Distribution::ContainerOs);
        let task: Task = BindMount::new("/home/kubernetes/bin", "/home/kubernetes/bin", &["exec", "rshared"]).into();
        assert!(task.apply(&mut target).await.unwrap());
        let mp = target.path("/home/kubernetes/bin").display().to_string();
        assert_eq!(
            log.lines(),
            vec![
                format!("mount --bind {} {}", mp, mp),
                format!("mount -o remount,bind,exec {}", mp),
                format!("mount --make-rshared {}", mp),
            ]
        );

        std::fs::create_dir_all(target.path("/proc/self")).unwrap();
        std::fs::write(
            target.path("/proc/self/mountinfo"),
            format!("36 35 98:0 /home/kubernetes/bin {} rw,exec,relatime shared:1 - ext4 /dev/sda1 rw\n", mp),
        )
        .unwrap();
        log.clear();
        assert!(!task.apply(&mut target).await.unwrap());
        assert!(log.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_option_is_rejected() {
        let (_dir, mut target, _log) = scratch_target(Distribution::ContainerOs);
        let task: Task = BindMount::new("/a", "/b", &["loud"]).into();
        let err = task.apply(&mut target).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }
}
