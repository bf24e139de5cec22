//! Static pod manifests for control-plane components.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HTTPGetAction, HostPathVolumeSource, Pod, PodSpec, Probe,
    ResourceRequirements, SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::error::{Error, Result};

/// A host-network pod in `kube-system` running one container.
pub(crate) struct StaticPod {
    pod: Pod,
    container: Container,
}

impl StaticPod {
    pub(crate) fn new(name: &str, image: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("k8s-app".to_string(), name.to_string());
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("kube-system".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                host_network: Some(true),
                priority_class_name: Some("system-cluster-critical".to_string()),
                tolerations: Some(vec![Toleration {
                    key: Some("CriticalAddonsOnly".to_string()),
                    operator: Some("Exists".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let container = Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            ..Default::default()
        };
        StaticPod { pod, container }
    }

    /// Runs `binary` with `args`, logging to `/var/log/<log>.log`.
    pub(crate) fn command_with_log(&mut self, binary: &str, args: Vec<String>, log: &str) -> &mut Self {
        let log_file = format!("/var/log/{}.log", log);
        let mut command = vec![
            "/go-runner".to_string(),
            "--redirect-stderr".to_string(),
            format!("--log-file={}", log_file),
            "--also-stdout".to_string(),
            binary.to_string(),
        ];
        command.extend(args);
        self.container.command = Some(command);
        self.host_path("logfile", &log_file, false)
    }

    /// Runs `command` as is.
    pub(crate) fn command(&mut self, command: Vec<String>) -> &mut Self {
        self.container.command = Some(command);
        self
    }

    /// Mounts a host path at the same location in the container.
    pub(crate) fn host_path(&mut self, name: &str, path: &str, read_only: bool) -> &mut Self {
        self.container
            .volume_mounts
            .get_or_insert_with(Vec::new)
            .push(VolumeMount {
                name: name.to_string(),
                mount_path: path.to_string(),
                read_only: Some(read_only).filter(|r| *r),
                ..Default::default()
            });
        if let Some(spec) = self.pod.spec.as_mut() {
            spec.volumes.get_or_insert_with(Vec::new).push(Volume {
                name: name.to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: path.to_string(),
                    type_: None,
                }),
                ..Default::default()
            });
        }
        self
    }

    /// Mounts each host path read-only, naming the volume after the path.
    pub(crate) fn read_only_paths(&mut self, paths: &[&str]) -> &mut Self {
        for path in paths {
            self.host_path(&path.trim_matches('/').replace('/', "-"), path, true);
        }
        self
    }

    /// Sets resource requests, defaulting the CPU request.
    pub(crate) fn requests(&mut self, cpu: Option<&str>, default_cpu: &str, memory: Option<&str>) -> &mut Self {
        let mut requests = BTreeMap::new();
        requests.insert(
            "cpu".to_string(),
            Quantity(cpu.unwrap_or(default_cpu).to_string()),
        );
        if let Some(memory) = memory {
            requests.insert("memory".to_string(), Quantity(memory.to_string()));
        }
        self.container.resources = Some(ResourceRequirements {
            requests: Some(requests),
            ..Default::default()
        });
        self
    }

    /// Probes `path` on the local host.
    pub(crate) fn liveness(&mut self, path: &str, port: i32, scheme: &str) -> &mut Self {
        self.container.liveness_probe = Some(Probe {
            http_get: Some(HTTPGetAction {
                host: Some("127.0.0.1".to_string()),
                path: Some(path.to_string()),
                port: IntOrString::Int(port),
                scheme: Some(scheme.to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(15),
            timeout_seconds: Some(15),
            ..Default::default()
        });
        self
    }

    /// Runs the container privileged.
    pub(crate) fn privileged(&mut self) -> &mut Self {
        self.container.security_context = Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        });
        self
    }

    /// Exposes a host port.
    pub(crate) fn port(&mut self, name: &str, port: i32) -> &mut Self {
        self.container
            .ports
            .get_or_insert_with(Vec::new)
            .push(ContainerPort {
                name: Some(name.to_string()),
                container_port: port,
                host_port: Some(port),
                ..Default::default()
            });
        self
    }

    /// Adds an annotation.
    pub(crate) fn annotate(&mut self, key: &str, value: &str) -> &mut Self {
        self.pod
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Serializes the pod.
    pub(crate) fn to_yaml(&self) -> Result<String> {
        let mut pod = self.pod.clone();
        if let Some(spec) = pod.spec.as_mut() {
            spec.containers = vec![self.container.clone()];
        }
        serde_yaml::to_string(&pod).map_err(|e| {
            Error::config(format!(
                "unable to serialize manifest for {}: {}",
                self.container.name, e
            ))
        })
    }
}
