//! The recipe builders and the task context they fill.
//!
//! Builders run in a fixed order. Each inspects the model, decides whether
//! it applies to this node and contributes tasks. Builders never see each
//! other's output: ordering between their tasks is expressed through task
//! fields and settled by the resolver.

use std::collections::btree_map::Entry;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::kubeconfig::Kubeconfig;
use crate::model::{NodeupModelContext, KUBERNETES_CA, MANIFESTS_DIR};
use crate::pki::{CertType, Subject};
use crate::tasks::{File, IssueCert, Task, TaskSet};

mod bootstrap_client;
mod cloud_config;
mod cni;
mod containerd;
mod directories;
mod etc_hosts;
mod etcd_manager;
mod file_assets;
mod firewall;
mod hooks;
mod kube_apiserver;
mod kube_controller_manager;
mod kube_proxy;
mod kube_scheduler;
mod kubectl;
mod kubelet;
mod logrotate;
mod manifest;
mod ntp;
mod packages;
mod prefix;
mod secrets;
mod static_manifests;
mod sysctl;
mod update_service;
mod warm_images;

type BuildFn = fn(&NodeupModelContext, &mut TaskContext) -> Result<()>;

/// Every builder, in the order it runs.
const BUILDERS: &[(&str, BuildFn)] = &[
    ("directories", directories::build),
    ("update-service", update_service::build),
    ("packages", packages::build),
    ("etc-hosts", etc_hosts::build),
    ("ntp", ntp::build),
    ("sysctl", sysctl::build),
    ("firewall", firewall::build),
    ("logrotate", logrotate::build),
    ("containerd", containerd::build),
    ("cni", cni::build),
    ("cloud-config", cloud_config::build),
    ("secrets", secrets::build),
    ("etcd-manager", etcd_manager::build),
    ("bootstrap-client", bootstrap_client::build),
    ("kubelet", kubelet::build),
    ("kube-apiserver", kube_apiserver::build),
    ("kube-controller-manager", kube_controller_manager::build),
    ("kube-scheduler", kube_scheduler::build),
    ("kube-proxy", kube_proxy::build),
    ("kubectl", kubectl::build),
    ("file-assets", file_assets::build),
    ("hooks", hooks::build),
    ("static-manifests", static_manifests::build),
    ("prefix", prefix::build),
    ("warm-images", warm_images::build),
];

/// The names of the builders, in the order they run.
pub fn builder_names() -> impl Iterator<Item = &'static str> {
    BUILDERS.iter().map(|(name, _)| *name)
}

/// Runs every builder against `model` and returns the planned tasks.
///
/// Planning is pure: equal models always produce equal task sets.
pub fn build_tasks(model: &NodeupModelContext) -> Result<TaskSet> {
    let mut context = TaskContext::new(model.service_files_root());
    for (name, build) in BUILDERS {
        let before = context.len();
        build(model, &mut context)?;
        debug!(builder = %name, tasks = context.len() - before, "builder finished");
    }
    info!(tasks = context.len(), "planned node tasks");
    Ok(context.finish())
}

/// The collection builders insert tasks into.
#[derive(Debug)]
pub struct TaskContext {
    service_files_root: String,
    tasks: TaskSet,
}

impl TaskContext {
    /// An empty context rooting relative file paths at `service_files_root`.
    pub fn new(service_files_root: &str) -> Self {
        TaskContext {
            service_files_root: service_files_root.trim_end_matches('/').to_string(),
            tasks: TaskSet::new(),
        }
    }

    /// Adds a task. A second task with the same identity is an error.
    pub fn add_task(&mut self, task: impl Into<Task>) -> Result<()> {
        let task = self.root(task.into());
        match self.tasks.entry(task.id()) {
            Entry::Occupied(existing) => Err(Error::config(format!(
                "duplicate task {}",
                existing.key()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(task);
                Ok(())
            }
        }
    }

    /// Adds a task unless an equal one is already present.
    ///
    /// A different task with the same identity is an error.
    pub fn ensure_task(&mut self, task: impl Into<Task>) -> Result<()> {
        let task = self.root(task.into());
        match self.tasks.entry(task.id()) {
            Entry::Occupied(existing) if existing.get() == &task => Ok(()),
            Entry::Occupied(existing) => Err(Error::config(format!(
                "conflicting definitions of task {}",
                existing.key()
            ))),
            Entry::Vacant(slot) => {
                slot.insert(task);
                Ok(())
            }
        }
    }

    /// Adds a certificate issuance and the two files it writes.
    pub fn add_issued_cert(&mut self, cert: IssueCert) -> Result<()> {
        let (certificate, key) = cert.files();
        self.add_task(cert)?;
        self.add_task(certificate)?;
        self.add_task(key)
    }

    /// The tasks added so far.
    pub fn tasks(&self) -> &TaskSet {
        &self.tasks
    }

    /// Number of tasks added so far.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task was added.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Hands over the planned tasks.
    pub fn finish(self) -> TaskSet {
        self.tasks
    }

    fn root(&self, task: Task) -> Task {
        match task {
            Task::File(mut file) if !file.path.starts_with('/') => {
                file.path = format!("{}/{}", self.service_files_root, file.path);
                Task::File(file)
            }
            other => other,
        }
    }
}

/// The cluster CA bundle in the service directory.
///
/// Several builders need it, so it is always added with `ensure_task`.
fn kubernetes_ca_file(model: &NodeupModelContext) -> Result<File> {
    Ok(File::file(
        format!("{}/ca.crt", model.path_srv_kubernetes()),
        model.ca_certificate(KUBERNETES_CA)?,
        Some("0644"),
    ))
}

/// A certificate and key from the keystore, written as `<base>.crt` and `<base>.key`.
fn keystore_pair(model: &NodeupModelContext, name: &str, dir: &str, base: &str) -> Result<(File, File)> {
    let certificate = model
        .keystore
        .find_cert(name)?
        .ok_or_else(|| Error::not_found("certificate", name))?;
    let key = model
        .keystore
        .find_private_key(name)?
        .ok_or_else(|| Error::not_found("private key", name))?;
    Ok((
        File::file(format!("{}/{}.crt", dir, base), certificate, Some("0644")),
        File::file(format!("{}/{}.key", dir, base), key, Some("0600")),
    ))
}

/// Issues a client certificate for `user` and writes a kubeconfig using it
/// against the local API server, both under `/var/lib/<component>`.
///
/// Returns the kubeconfig path.
fn local_client_kubeconfig(
    model: &NodeupModelContext,
    c: &mut TaskContext,
    component: &str,
    user: &str,
) -> Result<String> {
    let dir = format!("/var/lib/{}", component);
    let cert = IssueCert::new(
        component,
        KUBERNETES_CA,
        CertType::Client,
        Subject::common_name(user),
        &dir,
    )
    .signed_by(model.signer(KUBERNETES_CA)?);
    let kubeconfig = Kubeconfig::with_client_cert(
        component,
        "https://127.0.0.1",
        &format!("{}/ca.crt", model.path_srv_kubernetes()),
        &cert.certificate_path(),
        &cert.key_path(),
    );
    c.add_issued_cert(cert)?;
    c.ensure_task(kubernetes_ca_file(model)?)?;

    let path = format!("{}/kubeconfig", dir);
    c.add_task(File::file(path.as_str(), kubeconfig.to_yaml()?, Some("0400")))?;
    Ok(path)
}

/// Pre-creates the log file a static pod appends to.
fn static_pod_log(c: &mut TaskContext, component: &str) -> Result<()> {
    c.add_task(File::file(format!("/var/log/{}.log", component), "", Some("0400")).if_not_exists())
}

/// Adds a static pod manifest to the kubelet's manifest directory.
fn add_manifest(c: &mut TaskContext, name: &str, yaml: String) -> Result<()> {
    c.add_task(File::file(
        format!("{}/{}.manifest", MANIFESTS_DIR, name),
        yaml,
        Some("0644"),
    ))
}
