//! The kube-apiserver static pod and the credentials it serves with.

use std::net::IpAddr;

use crate::error::{Error, Result};
use crate::kubeconfig::{ClusterEntry, Kubeconfig, UserEntry};
use crate::model::{NodeupModelContext, CLOUD_CONFIG_PATH, KUBERNETES_CA};
use crate::pki::{CertType, Subject};
use crate::resource::Resource;
use crate::tasks::{File, IssueCert, User};

use super::manifest::StaticPod;
use super::{add_manifest, kubernetes_ca_file, static_pod_log, TaskContext};

const AUTHN_CONFIG_PATH: &str = "/etc/kubernetes/authn.config";
const IAM_AUTHENTICATOR: &str = "aws-iam-authenticator";
const IAM_AUTHENTICATOR_UID: u32 = 10000;
const DEFAULT_SECURE_PORT: i32 = 443;
/// Keyset signing the client certificates of the main and events etcd clusters.
const ETCD_CLIENTS_CA: &str = "etcd-clients-ca";

pub(super) fn build(model: &NodeupModelContext, c: &mut TaskContext) -> Result<()> {
    if !model.is_api_server() {
        return Ok(());
    }
    let srv = model.path_srv_kubernetes();
    let mut flags = model
        .cluster
        .spec
        .kube_api_server
        .clone()
        .unwrap_or_default()
        .flags();

    c.ensure_task(kubernetes_ca_file(model)?)?;
    flags
        .set("client-ca-file", format!("{}/ca.crt", srv))
        .set("service-account-key-file", format!("{}/service-account.crt", srv))
        .set("service-account-signing-key-file", format!("{}/service-account.key", srv))
        .set("service-account-issuer", format!("https://{}", model.api_internal_name()));

    let signer = model.signer(KUBERNETES_CA)?;
    let server = IssueCert::new(
        "master",
        KUBERNETES_CA,
        CertType::Server,
        Subject::common_name("kubernetes-master"),
        srv,
    )
    .with_alternate_names(alternate_names(model)?)
    .signed_by(signer.clone());
    flags
        .set("tls-cert-file", server.certificate_path())
        .set("tls-private-key-file", server.key_path());
    c.add_issued_cert(server)?;

    let kubelet_api = IssueCert::new(
        "kubelet-api",
        KUBERNETES_CA,
        CertType::Client,
        Subject::common_name("kubelet-api"),
        srv,
    )
    .signed_by(signer);
    flags
        .set("kubelet-client-certificate", kubelet_api.certificate_path())
        .set("kubelet-client-key", kubelet_api.key_path());
    c.add_issued_cert(kubelet_api)?;

    if model.cluster.spec.encryption_config == Some(true) {
        let path = format!("{}/encryptionconfig.yaml", srv);
        let secret = model
            .keystore
            .secret("encryptionconfig")?
            .ok_or_else(|| Error::not_found("secret", "encryptionconfig"))?;
        c.add_task(File::file(path.as_str(), Resource::bytes(secret), Some("0600")))?;
        flags.set("encryption-provider-config", path);
    }

    let authn = add_authentication(model, c)?;
    if authn {
        flags.set("authentication-token-webhook-config-file", AUTHN_CONFIG_PATH);
    }
    let config = model.cluster.spec.kube_api_server.clone().unwrap_or_default();
    if config.etcd_servers.is_empty() {
        flags
            .set("etcd-servers", "https://127.0.0.1:4001")
            .set("etcd-servers-overrides", "/events#https://127.0.0.1:4002");
    }
    if model.uses_etcd_tls() {
        let ca = format!("{}/etcd-ca.crt", srv);
        c.add_task(File::file(ca.as_str(), model.ca_certificate(ETCD_CLIENTS_CA)?, Some("0644")))?;
        let client = IssueCert::new(
            "etcd-client",
            ETCD_CLIENTS_CA,
            CertType::Client,
            Subject::common_name("kube-apiserver"),
            srv,
        )
        .signed_by(model.signer(ETCD_CLIENTS_CA)?);
        flags
            .set("etcd-cafile", ca)
            .set("etcd-certfile", client.certificate_path())
            .set("etcd-keyfile", client.key_path());
        c.add_issued_cert(client)?;
    }
    if model.cluster.spec.cloud_config.is_some() {
        flags.set("cloud-config", CLOUD_CONFIG_PATH);
    }

    static_pod_log(c, "kube-apiserver")?;

    let image = if config.image.is_empty() {
        format!("registry.k8s.io/kube-apiserver:v{}", model.kubernetes_version())
    } else {
        config.image.clone()
    };
    let secure_port = config.secure_port.unwrap_or(DEFAULT_SECURE_PORT);
    let mut pod = StaticPod::new("kube-apiserver", &image);
    pod.command_with_log("/usr/local/bin/kube-apiserver", flags.build(), "kube-apiserver")
        .host_path("srvkube", srv, true)
        .port("https", secure_port)
        .liveness("/livez", secure_port, "HTTPS")
        .requests(config.cpu_request.as_deref(), "150m", config.memory_request.as_deref())
        .annotate("dns.alpha.kubernetes.io/internal", &model.api_internal_name());
    pod.read_only_paths(&model.ssl_host_paths());
    if model.cluster.spec.cloud_config.is_some() {
        pod.host_path("cloudconfig", CLOUD_CONFIG_PATH, true);
    }
    if authn {
        pod.host_path("authn-config", AUTHN_CONFIG_PATH, true);
    }
    add_manifest(c, "kube-apiserver", pod.to_yaml()?)
}

/// Writes the webhook authentication config, returning whether one is used.
fn add_authentication(model: &NodeupModelContext, c: &mut TaskContext) -> Result<bool> {
    let authentication = match &model.cluster.spec.authentication {
        Some(a) => a,
        None => return Ok(false),
    };
    if authentication.kopeio.is_some() {
        let kubeconfig = Kubeconfig::new(
            "webhook",
            "http://127.0.0.1:9001/hooks/authn",
            ClusterEntry {
                server: String::new(),
                certificate_authority_data: None,
                certificate_authority: None,
            },
            UserEntry::default(),
        );
        c.add_task(File::file(AUTHN_CONFIG_PATH, kubeconfig.to_yaml()?, Some("0600")))?;
        return Ok(true);
    }
    if authentication.aws.is_none() {
        return Ok(false);
    }

    let home = format!("/srv/kubernetes/{}", IAM_AUTHENTICATOR);
    let ca = model.ca_certificate(KUBERNETES_CA)?;
    let kubeconfig = Kubeconfig::new(
        IAM_AUTHENTICATOR,
        "https://127.0.0.1:21362/authenticate",
        ClusterEntry {
            server: String::new(),
            certificate_authority_data: Some(base64::encode(ca)),
            certificate_authority: None,
        },
        UserEntry::default(),
    );
    c.add_task(File::file(AUTHN_CONFIG_PATH, kubeconfig.to_yaml()?, Some("0600")))?;
    c.add_task(User::system(IAM_AUTHENTICATOR, Some(IAM_AUTHENTICATOR_UID), &home))?;

    let certificate = model
        .keystore
        .find_cert(IAM_AUTHENTICATOR)?
        .ok_or_else(|| Error::not_found("certificate", IAM_AUTHENTICATOR))?;
    let key = model
        .keystore
        .find_private_key(IAM_AUTHENTICATOR)?
        .ok_or_else(|| Error::not_found("private key", IAM_AUTHENTICATOR))?;
    for (name, contents) in [("cert.pem", certificate), ("key.pem", key)] {
        c.add_task(
            File::file(format!("{}/{}", home, name), contents, Some("0600"))
                .owned_by(IAM_AUTHENTICATOR, IAM_AUTHENTICATOR),
        )?;
    }
    Ok(true)
}

/// Names the API server certificate must be valid for.
fn alternate_names(model: &NodeupModelContext) -> Result<Vec<String>> {
    let spec = &model.cluster.spec;
    let domain = if spec.cluster_dns_domain.is_empty() {
        "cluster.local"
    } else {
        spec.cluster_dns_domain.as_str()
    };
    let mut names = vec![
        "kubernetes".to_string(),
        "kubernetes.default".to_string(),
        "kubernetes.default.svc".to_string(),
        format!("kubernetes.default.svc.{}", domain),
        model.api_internal_name(),
        "127.0.0.1".to_string(),
    ];
    if !spec.master_public_name.is_empty() {
        names.push(spec.master_public_name.clone());
    }
    if !spec.service_cluster_ip_range.is_empty() {
        names.push(first_service_ip(&spec.service_cluster_ip_range)?.to_string());
    }
    names.sort();
    names.dedup();
    Ok(names)
}

/// The address of the `kubernetes` service: the first host of the service range.
fn first_service_ip(cidr: &str) -> Result<IpAddr> {
    let bad = || Error::config(format!("invalid service cluster ip range {:?}", cidr));
    let network = cidr.split('/').next().ok_or_else(bad)?;
    match network.parse::<IpAddr>().map_err(|_| bad())? {
        IpAddr::V4(v4) => Ok(IpAddr::from((u32::from(v4) + 1).to_be_bytes())),
        IpAddr::V6(v6) => Ok(IpAddr::from((u128::from(v6) + 1).to_be_bytes())),
    }
}
