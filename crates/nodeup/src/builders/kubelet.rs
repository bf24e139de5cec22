//! The kubelet: binary, flags, credentials and systemd unit.

use crate::distro::Distribution;
use crate::error::Result;
use crate::kubeconfig::Kubeconfig;
use crate::model::{
    NodeupModelContext, BOOTSTRAP_KUBECONFIG_PATH, CLOUD_CONFIG_PATH, KUBELET_KUBECONFIG_PATH,
    KUBERNETES_CA, MANIFESTS_DIR,
};
use crate::pki::{CertType, Subject};
use crate::systemd::Manifest;
use crate::tasks::{File, IssueCert, Service};

use super::{keystore_pair, kubernetes_ca_file, TaskContext};

const SYSCONFIG_PATH: &str = "/etc/sysconfig/kubelet";
const KUBELET_DIR: &str = "/var/lib/kubelet";
/// Five-second polls for the bootstrap kubeconfig, inside systemd's default start timeout.
const BOOTSTRAP_WAIT_ATTEMPTS: u32 = 12;

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    c.add_task(File::file(
        model.kubelet_path(),
        model.assets.find("kubelet", None)?,
        Some("0755"),
    ))?;

    c.ensure_task(kubernetes_ca_file(model)?)?;
    c.ensure_task(File::directory(MANIFESTS_DIR, None))?;

    let bootstrap = model.uses_kops_controller_bootstrap();
    if !bootstrap {
        add_kubeconfig(model, c)?;
    }

    c.add_task(File::file(SYSCONFIG_PATH, sysconfig(model, bootstrap), None))?;
    let mut service = Service::new("kubelet.service", unit(model, bootstrap));
    if bootstrap {
        service.after_files.push(BOOTSTRAP_KUBECONFIG_PATH.to_string());
    }
    c.add_task(service)
}

/// Client credentials for nodes that do not bootstrap through the controller.
///
/// Control-plane nodes sign their own; other nodes use the shared keypair.
fn add_kubeconfig(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    let ca_path = format!("{}/ca.crt", model.path_srv_kubernetes());
    let kubeconfig = if model.is_master() {
        let mut subject = Subject::common_name(format!("system:node:{}", model.node_name()));
        subject.organization.push("system:nodes".to_string());
        let cert = IssueCert::new("kubelet", KUBERNETES_CA, CertType::Client, subject, KUBELET_DIR)
            .signed_by(model.signer(KUBERNETES_CA)?);
        let kubeconfig = Kubeconfig::with_client_cert(
            "kubelet",
            "https://127.0.0.1",
            &ca_path,
            &cert.certificate_path(),
            &cert.key_path(),
        );
        c.add_issued_cert(cert)?;
        kubeconfig
    } else {
        let (certificate, key) = keystore_pair(model, "kubelet", KUBELET_DIR, "kubelet")?;
        let kubeconfig = Kubeconfig::with_client_cert(
            "kubelet",
            &format!("https://{}", model.api_internal_name()),
            &ca_path,
            &certificate.path,
            &key.path,
        );
        c.add_task(certificate)?;
        c.add_task(key)?;
        kubeconfig
    };
    c.add_task(File::file(KUBELET_KUBECONFIG_PATH, kubeconfig.to_yaml()?, Some("0400")))
}

fn sysconfig(model: &NodeupModelContext, bootstrap: bool) -> String {
    let config = model.kubelet_config();
    let mut flags = config.flags();
    if config.client_ca_file.is_none() {
        flags.set("client-ca-file", format!("{}/ca.crt", model.path_srv_kubernetes()));
    }
    if config.pod_manifest_path.is_none() {
        flags.set("pod-manifest-path", MANIFESTS_DIR);
    }
    if config.hostname_override.is_some() {
        flags.set("hostname-override", model.node_name());
    }
    if model.cluster.spec.cloud_config.is_some() {
        flags.set("cloud-config", CLOUD_CONFIG_PATH);
    }
    if model.uses_containerd() {
        flags.set("container-runtime-endpoint", "unix:///run/containerd/containerd.sock");
    }
    flags.set("kubeconfig", KUBELET_KUBECONFIG_PATH);
    if bootstrap {
        flags.set("bootstrap-kubeconfig", BOOTSTRAP_KUBECONFIG_PATH);
    }
    format!("DAEMON_ARGS=\"{}\"\nHOME=\"/root\"\n", flags.build().join(" "))
}

fn unit(model: &NodeupModelContext, bootstrap: bool) -> String {
    let mut manifest = Manifest::new();
    manifest
        .set("Unit", "Description", "Kubernetes Kubelet Server")
        .set("Unit", "Documentation", "https://github.com/kubernetes/kubernetes")
        .set("Unit", "After", "containerd.service");
    if model.distribution == Distribution::Flatcar {
        // socat and friends live in /opt/kubernetes/bin
        manifest.set(
            "Service",
            "Environment",
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin:/opt/kubernetes/bin",
        );
    }
    manifest.set("Service", "EnvironmentFile", SYSCONFIG_PATH);
    if bootstrap {
        manifest.set(
            "Service",
            "ExecStartPre",
            // `$$` is a literal dollar in unit files. On timeout the unit fails
            // and Restart=always tries again.
            format!(
                "/bin/bash -c 'n=0; while [ ! -f {path} ]; do \
                 n=$$((n+1)); if [ $$n -gt {attempts} ]; then echo \"{path} still missing\" >&2; exit 1; fi; \
                 echo \"waiting for {path}\"; sleep 5; done'",
                path = BOOTSTRAP_KUBECONFIG_PATH,
                attempts = BOOTSTRAP_WAIT_ATTEMPTS,
            ),
        );
    }
    manifest
        .set("Service", "ExecStart", format!("{} \"$DAEMON_ARGS\"", model.kubelet_path()))
        .set("Service", "Restart", "always")
        .set("Service", "RestartSec", "2s")
        .set("Service", "StartLimitInterval", "0")
        .set("Service", "KillMode", "process")
        .set("Service", "User", "root")
        .set("Service", "CPUAccounting", "true")
        .set("Service", "MemoryAccounting", "true")
        .set("Install", "WantedBy", "multi-user.target");
    manifest.render()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{ClusterSpec, InstanceGroupRole};
    use crate::builders::test::{contents, file, run, with_kubelet_asset};
    use crate::error::ErrorKind;
    use crate::model::test::model;
    use crate::systemd;
    use crate::tasks::{Task, TaskId};

    fn kubelet_service(tasks: &crate::tasks::TaskSet) -> &Service {
        match tasks.get(&TaskId::new("Service", "kubelet.service")) {
            Some(Task::Service(s)) => s,
            other => panic!("no kubelet service: {:?}", other),
        }
    }

    #[test]
    fn bootstrapping_workers_wait_for_the_bootstrap_kubeconfig() {
        let mut model = model(ClusterSpec::default(), InstanceGroupRole::Node, Distribution::Debian12);
        model.nodeup_config.use_kops_controller_for_node_bootstrap = true;
        let tasks = run(build, &with_kubelet_asset(model));

        let service = kubelet_service(&tasks);
        let definition = service.definition.as_deref().unwrap();
        let pre = systemd::values(definition, "ExecStartPre");
        assert_eq!(pre.len(), 1);
        assert!(pre[0].contains("while [ ! -f /var/lib/kubelet/bootstrap-kubeconfig ]"));
        assert!(pre[0].contains("if [ $$n -gt 12 ]; then"));
        assert!(pre[0].contains("echo \"waiting for /var/lib/kubelet/bootstrap-kubeconfig\"; sleep 5"));
        assert!(pre[0].ends_with("exit 1; fi; echo \"waiting for /var/lib/kubelet/bootstrap-kubeconfig\"; sleep 5; done'"));
        assert_eq!(service.after_files, vec![BOOTSTRAP_KUBECONFIG_PATH.to_string()]);

        let args = contents(&tasks, SYSCONFIG_PATH);
        assert!(args.contains("--bootstrap-kubeconfig=/var/lib/kubelet/bootstrap-kubeconfig"));
        assert!(!tasks.contains_key(&TaskId::new("File", KUBELET_KUBECONFIG_PATH)));
        assert_eq!(file(&tasks, "/usr/local/bin/kubelet").mode.as_deref(), Some("0755"));
    }

    #[test]
    fn masters_sign_their_own_client_certificate() {
        let model = model(ClusterSpec::default(), InstanceGroupRole::Master, Distribution::Ubuntu2204);
        let tasks = run(build, &with_kubelet_asset(model));
        match tasks.get(&TaskId::new("IssueCert", "kubelet")) {
            Some(Task::IssueCert(cert)) => {
                assert_eq!(cert.subject.common_name, "system:node:ip-10-0-0-1.ec2.internal");
                assert_eq!(cert.subject.organization, vec!["system:nodes".to_string()]);
            }
            other => panic!("no kubelet cert: {:?}", other),
        }
        file(&tasks, "/var/lib/kubelet/kubelet-key.pem");
        let kubeconfig = contents(&tasks, KUBELET_KUBECONFIG_PATH);
        assert!(kubeconfig.contains("/var/lib/kubelet/kubelet.pem"));
        assert!(kubeconfig.contains("https://127.0.0.1"));
        assert!(kubelet_service(&tasks).after_files.is_empty());
        let labels = contents(&tasks, SYSCONFIG_PATH);
        assert!(labels.contains("--register-with-taints=node-role.kubernetes.io/control-plane=:NoSchedule"));
    }

    #[test]
    fn workers_without_bootstrap_need_the_kubelet_keypair() {
        let model = model(ClusterSpec::default(), InstanceGroupRole::Node, Distribution::Debian12);
        let model = with_kubelet_asset(model);
        let mut c = TaskContext::new(model.service_files_root());
        assert_eq!(build(&model, &mut c).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn missing_binary_is_not_found() {
        let model = model(ClusterSpec::default(), InstanceGroupRole::Master, Distribution::Debian12);
        let mut c = TaskContext::new(model.service_files_root());
        assert_eq!(build(&model, &mut c).unwrap_err().kind(), ErrorKind::NotFound);
    }
}
