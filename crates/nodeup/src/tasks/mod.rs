//! The closed catalog of node tasks.
//!
//! A [`Task`] is one unit of desired state. Every variant follows the same
//! three-step contract, expressed by the crate-private [`Delta`] trait:
//!
//! 1. `find` observes the system and returns the current state, or `None`;
//! 2. `check_changes` rejects transitions that cannot be made safely;
//! 3. `render` performs the minimal change and reports whether anything
//!    changed.
//!
//! Tasks are built during planning and never mutated afterwards. The one
//! exception is an issued certificate, which lives in a shared slot owned by
//! its [`IssueCert`] task and read through [`Resource::Deferred`] values.
//!
//! [`Resource::Deferred`]: crate::resource::Resource::Deferred

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{ErrorKind, Result};
use crate::systemd;
use crate::target::LocalTarget;

mod archive;
mod bind_mount;
mod bootstrap;
mod chattr;
mod etc_hosts;
mod file;
mod issue_cert;
mod package;
mod prefix;
mod pull_image;
mod service;
mod user;

pub use archive::Archive;
pub use bind_mount::BindMount;
pub use bootstrap::{BootstrapClient, KubeletBootstrapKubeconfig};
pub use chattr::Chattr;
pub use etc_hosts::{HostRecord, UpdateEtcHosts};
pub use file::{File, FileType};
pub use issue_cert::IssueCert;
pub use package::Package;
pub use prefix::Prefix;
pub use pull_image::PullImage;
pub use service::Service;
pub use user::{Group, User};

/// A task's stable identity, `<Kind>/<key>`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(String);

impl TaskId {
    /// The identity of the `kind` task keyed by `key`.
    pub fn new(kind: &str, key: &str) -> Self {
        TaskId(format!("{}/{}", kind, key))
    }

    /// The identity as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The kind part of the identity.
    pub fn kind(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tasks keyed by identity, as produced by the builder pipeline.
pub type TaskSet = BTreeMap<TaskId, Task>;

/// One unit of desired node state.
#[derive(Clone, Debug, PartialEq)]
pub enum Task {
    /// A file, directory or symlink
    File(File),
    /// A bind mount
    BindMount(BindMount),
    /// An OS package
    Package(Package),
    /// A tarball extracted onto disk
    Archive(Archive),
    /// A systemd unit
    Service(Service),
    /// A local account
    User(User),
    /// A local group
    Group(Group),
    /// Extended file attributes
    Chattr(Chattr),
    /// A certificate and key signed by a CA from the keystore
    IssueCert(IssueCert),
    /// Records merged into `/etc/hosts`
    UpdateEtcHosts(UpdateEtcHosts),
    /// A delegated IPv6 prefix
    Prefix(Prefix),
    /// A container image present in the runtime's store
    PullImage(PullImage),
    /// A handle on the controller's bootstrap endpoint
    BootstrapClient(BootstrapClient),
    /// The kubelet's bootstrap kubeconfig
    KubeletBootstrapKubeconfig(KubeletBootstrapKubeconfig),
}

impl Task {
    /// The kind, first half of the identity.
    pub fn kind(&self) -> &'static str {
        match self {
            Task::File(_) => "File",
            Task::BindMount(_) => "BindMount",
            Task::Package(_) => "Package",
            Task::Archive(_) => "Archive",
            Task::Service(_) => "Service",
            Task::User(_) => "User",
            Task::Group(_) => "Group",
            Task::Chattr(_) => "Chattr",
            Task::IssueCert(_) => "IssueCert",
            Task::UpdateEtcHosts(_) => "UpdateEtcHosts",
            Task::Prefix(_) => "Prefix",
            Task::PullImage(_) => "PullImage",
            Task::BootstrapClient(_) => "BootstrapClient",
            Task::KubeletBootstrapKubeconfig(_) => "KubeletBootstrapKubeconfig",
        }
    }

    fn key(&self) -> &str {
        match self {
            Task::File(t) => &t.path,
            Task::BindMount(t) => &t.mountpoint,
            Task::Package(t) => &t.name,
            Task::Archive(t) => &t.name,
            Task::Service(t) => &t.name,
            Task::User(t) => &t.name,
            Task::Group(t) => &t.name,
            Task::Chattr(t) => &t.file,
            Task::IssueCert(t) => &t.name,
            Task::UpdateEtcHosts(t) => &t.name,
            Task::Prefix(t) => &t.name,
            Task::PullImage(t) => &t.image,
            Task::BootstrapClient(t) => &t.name,
            Task::KubeletBootstrapKubeconfig(t) => &t.path,
        }
    }

    /// The stable identity.
    pub fn id(&self) -> TaskId {
        TaskId::new(self.kind(), self.key())
    }

    /// The path this task writes, for tasks that produce a single file.
    pub fn produced_path(&self) -> Option<&str> {
        match self {
            Task::File(t) => Some(&t.path),
            Task::KubeletBootstrapKubeconfig(t) => Some(&t.path),
            _ => None,
        }
    }

    /// Dependencies named directly in the task's fields.
    pub fn explicit_dependencies(&self) -> Vec<TaskId> {
        match self {
            Task::Package(t) => t.deps.iter().map(|d| TaskId::new("Package", d)).collect(),
            Task::Chattr(t) => t.deps.clone(),
            Task::File(t) => t
                .contents
                .as_ref()
                .and_then(|c| c.producer())
                .map(|p| vec![TaskId(p.to_string())])
                .unwrap_or_default(),
            Task::PullImage(t) if t.runtime == "containerd" => {
                vec![TaskId::new("Service", "containerd.service")]
            }
            Task::KubeletBootstrapKubeconfig(t) => vec![TaskId::new("BootstrapClient", &t.client)],
            _ => Vec::new(),
        }
    }

    /// Paths that must be written before this task runs.
    pub fn after_files(&self) -> &[String] {
        match self {
            Task::File(t) => &t.after_files,
            Task::Service(t) => &t.after_files,
            _ => &[],
        }
    }

    /// Services that must start after this task.
    pub fn before_services(&self) -> &[String] {
        match self {
            Task::File(t) => &t.before_services,
            _ => &[],
        }
    }

    /// Commands to run at the end of the run if this task changed anything.
    pub fn on_change_execute(&self) -> &[Vec<String>] {
        match self {
            Task::File(t) => &t.on_change_execute,
            _ => &[],
        }
    }

    /// Paths whose change should restart this task's service.
    pub fn restart_triggers(&self) -> Vec<String> {
        match self {
            Task::Service(s) if s.smart_restart() && s.managed() && s.running() => {
                let mut triggers = s.after_files.clone();
                if let Some(def) = &s.definition {
                    triggers.extend(systemd::file_dependencies(def));
                }
                triggers
            }
            _ => Vec::new(),
        }
    }

    /// Runs find, check and render, returning whether the system changed.
    pub async fn apply(&self, target: &mut LocalTarget) -> Result<bool> {
        let id = self.id();
        match self {
            Task::File(t) => apply(t, &id, target).await,
            Task::BindMount(t) => apply(t, &id, target).await,
            Task::Package(t) => apply(t, &id, target).await,
            Task::Archive(t) => apply(t, &id, target).await,
            Task::Service(t) => apply(t, &id, target).await,
            Task::User(t) => apply(t, &id, target).await,
            Task::Group(t) => apply(t, &id, target).await,
            Task::Chattr(t) => apply(t, &id, target).await,
            Task::IssueCert(t) => apply(t, &id, target).await,
            Task::UpdateEtcHosts(t) => apply(t, &id, target).await,
            Task::Prefix(t) => apply(t, &id, target).await,
            Task::PullImage(t) => apply(t, &id, target).await,
            Task::BootstrapClient(t) => apply(t, &id, target).await,
            Task::KubeletBootstrapKubeconfig(t) => apply(t, &id, target).await,
        }
    }
}

macro_rules! impl_from_task {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Task {
                fn from(t: $variant) -> Self {
                    Task::$variant(t)
                }
            }
        )*
    };
}

impl_from_task!(
    File,
    BindMount,
    Package,
    Archive,
    Service,
    User,
    Group,
    Chattr,
    IssueCert,
    UpdateEtcHosts,
    Prefix,
    PullImage,
    BootstrapClient,
    KubeletBootstrapKubeconfig
);

/// Find, check and render for one task type.
#[async_trait(?Send)]
pub(crate) trait Delta {
    /// Observed state.
    type Actual;

    /// Observes the system. `None` means the object is absent.
    async fn find(&self, target: &LocalTarget) -> Result<Option<Self::Actual>>;

    /// Rejects transitions that cannot be made from `actual`.
    fn check_changes(&self, _id: &TaskId, _actual: Option<&Self::Actual>) -> Result<()> {
        Ok(())
    }

    /// Moves the system from `actual` to the desired state.
    async fn render(&self, target: &mut LocalTarget, actual: Option<&Self::Actual>) -> Result<bool>;
}

async fn apply<D: Delta>(task: &D, id: &TaskId, target: &mut LocalTarget) -> Result<bool> {
    let actual = match task.find(target).await {
        Ok(actual) => actual,
        Err(e) if e.kind() == ErrorKind::Integrity => {
            warn!(task = %id, error = %e, "current state failed verification, treating as absent");
            None
        }
        Err(e) => return Err(e),
    };
    task.check_changes(id, actual.as_ref())?;
    task.render(target, actual.as_ref()).await
}

/// Renders a path argument for an OS command run against `target`.
pub(crate) fn os_path(target: &LocalTarget, node_path: &str) -> String {
    target.path(node_path).display().to_string()
}
