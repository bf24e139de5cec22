//! etcd-manager static pods, one per etcd cluster on control-plane nodes.

use tracing::{debug, warn};

use crate::api::EtcdClusterSpec;
use crate::error::{Error, Result};
use crate::model::NodeupModelContext;

use super::manifest::StaticPod;
use super::{add_manifest, keystore_pair, static_pod_log, TaskContext};

const DEFAULT_IMAGE: &str = "registry.k8s.io/etcdadm/etcd-manager-slim:v3.0.20221209";

/// The CA keysets each etcd cluster is secured with.
const ETCD_CAS: &[&str] = &["etcd-manager-ca", "etcd-peers-ca", "etcd-clients-ca"];

/// Well-known ports of an etcd cluster.
struct Ports {
    grpc: u16,
    peer: u16,
    client: u16,
    quarantine: u16,
}

fn ports(cluster: &str) -> Result<Ports> {
    let ports = match cluster {
        "main" => Ports { grpc: 3996, peer: 2380, client: 4001, quarantine: 3994 },
        "events" => Ports { grpc: 3997, peer: 2381, client: 4002, quarantine: 3995 },
        "cilium" => Ports { grpc: 3998, peer: 2382, client: 4003, quarantine: 3992 },
        other => return Err(Error::config(format!("unknown etcd cluster {}", other))),
    };
    Ok(ports)
}

/// Directory holding the CA material of one etcd cluster.
fn pki_dir(cluster: &str) -> String {
    format!("/etc/kubernetes/pki/etcd-manager-{}", cluster)
}

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    if !model.is_master() {
        return Ok(());
    }
    let wanted = &model.nodeup_config.etcd_cluster_names;
    for etcd in &model.cluster.spec.etcd_clusters {
        if !wanted.is_empty() && !wanted.contains(&etcd.name) {
            debug!(etcd = %etcd.name, "etcd cluster not hosted on this node");
            continue;
        }
        if !etcd.uses_manager() {
            warn!(etcd = %etcd.name, "legacy etcd provider is not supported; skipping");
            continue;
        }
        build_cluster(model, etcd, c)?;
    }
    Ok(())
}

fn build_cluster(model: &NodeupModelContext, etcd: &EtcdClusterSpec, c: &mut TaskContext) -> Result<()> {
    let ports = ports(&etcd.name)?;
    let dir = pki_dir(&etcd.name);
    for ca in ETCD_CAS {
        let keyset = format!("{}-{}", ca, etcd.name);
        let (certificate, key) = keystore_pair(model, &keyset, &dir, ca)?;
        c.add_task(certificate)?;
        c.add_task(key)?;
    }

    let log = format!("etcd-{}", etcd.name);
    static_pod_log(c, &log)?;

    let manager = etcd.manager.clone().unwrap_or_default();
    let image = if manager.image.is_empty() {
        DEFAULT_IMAGE
    } else {
        manager.image.as_str()
    };
    let mut args = vec![
        "--containerized=true".to_string(),
        format!("--cluster-name={}", etcd.name),
        format!("--dns-suffix=.internal.{}", model.cluster_name()),
        format!("--grpc-port={}", ports.grpc),
        format!("--peer-urls=https://__name__:{}", ports.peer),
        format!("--client-urls=https://__name__:{}", ports.client),
        format!("--quarantine-client-urls=https://__name__:{}", ports.quarantine),
        format!("--etcd-version={}", etcd.version),
        format!("--pki-dir={}", dir),
    ];
    args.push(format!("--v={}", manager.log_level.unwrap_or(6)));
    args.sort();

    let name = format!("etcd-manager-{}", etcd.name);
    let mut pod = StaticPod::new(&name, image);
    pod.command_with_log("/etcd-manager", args, &log)
        .host_path("pki", &dir, false)
        .host_path("varlibetcd", &format!("/var/lib/etcd-{}", etcd.name), false)
        .requests(
            etcd.cpu_request.as_deref(),
            "200m",
            Some(etcd.memory_request.as_deref().unwrap_or("100Mi")),
        );
    add_manifest(c, &format!("etcd-{}", etcd.name), pod.to_yaml()?)
}

#[cfg(test)]
mod test {
    use std::rc::Rc;

    use super::*;
    use crate::api::{ClusterSpec, EtcdManagerSpec, InstanceGroupRole};
    use crate::builders::test::{contents, file, run};
    use crate::distro::Distribution;
    use crate::error::ErrorKind;
    use crate::model::test::model;
    use crate::model::KUBERNETES_CA;
    use crate::pki::{test_ca, InMemoryKeystore, Keyset};

    fn etcd(name: &str) -> EtcdClusterSpec {
        EtcdClusterSpec {
            name: name.to_string(),
            version: "3.5.4".to_string(),
            manager: Some(EtcdManagerSpec::default()),
            ..Default::default()
        }
    }

    fn master(clusters: &[&str]) -> NodeupModelContext {
        let spec = ClusterSpec {
            etcd_clusters: clusters.iter().map(|n| etcd(n)).collect(),
            ..Default::default()
        };
        let mut model = model(spec, InstanceGroupRole::Master, Distribution::Ubuntu2204);
        let mut keystore = InMemoryKeystore::new();
        keystore.insert_keyset(KUBERNETES_CA, Keyset::single(test_ca("1")));
        for cluster in clusters {
            for ca in ETCD_CAS {
                keystore.insert_keyset(format!("{}-{}", ca, cluster), Keyset::single(test_ca("1")));
            }
        }
        model.keystore = Rc::new(keystore);
        model
    }

    #[test]
    fn every_cluster_gets_pki_log_and_manifest() {
        let tasks = run(build, &master(&["main", "events"]));
        assert_eq!(tasks.len(), 2 * (6 + 2));
        for cluster in &["main", "events"] {
            for ca in ETCD_CAS {
                file(&tasks, &format!("/etc/kubernetes/pki/etcd-manager-{}/{}.crt", cluster, ca));
                let key = file(&tasks, &format!("/etc/kubernetes/pki/etcd-manager-{}/{}.key", cluster, ca));
                assert_eq!(key.mode.as_deref(), Some("0600"));
            }
            assert!(file(&tasks, &format!("/var/log/etcd-{}.log", cluster)).if_not_exists);
        }
        let manifest = contents(&tasks, "/etc/kubernetes/manifests/etcd-events.manifest");
        assert!(manifest.contains("--grpc-port=3997"));
        assert!(manifest.contains("--client-urls=https://__name__:4002"));
    }

    #[test]
    fn missing_ca_is_not_found() {
        let mut model = master(&["main"]);
        model.keystore = crate::model::test::keystore();
        let mut c = TaskContext::new(model.service_files_root());
        assert_eq!(build(&model, &mut c).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn unknown_cluster_names_are_rejected() {
        let model = master(&["audit"]);
        let mut c = TaskContext::new(model.service_files_root());
        assert_eq!(build(&model, &mut c).unwrap_err().kind(), ErrorKind::Configuration);
    }

    #[test]
    fn only_hosted_clusters_are_built() {
        let mut model = master(&["main", "events"]);
        model.nodeup_config.etcd_cluster_names = vec!["main".to_string()];
        let tasks = run(build, &model);
        assert!(tasks.keys().all(|id| !id.as_str().contains("events")));
    }
}
