//! Orders tasks into an executable plan.
//!
//! Edges come from explicit task fields, `afterFiles` references, resources
//! produced by other tasks, parent directories, file ownership and the
//! blanket rule that services start after everything they might read.
//! Within the same dependency depth tasks are ordered by identity, so equal
//! inputs always produce the same plan.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use petgraph::algo::{is_cyclic_directed, tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::error::{Error, Result};
use crate::tasks::{File, Task, TaskId, TaskSet};

/// Directories every supported distribution ships with.
const OS_DIRECTORIES: &[&str] = &[
    "/",
    "/bin",
    "/etc",
    "/etc/default",
    "/etc/logrotate.d",
    "/etc/modules-load.d",
    "/etc/sysconfig",
    "/etc/sysctl.d",
    "/etc/systemd",
    "/etc/systemd/system",
    "/home",
    "/lib",
    "/lib/systemd",
    "/lib/systemd/system",
    "/opt",
    "/root",
    "/run",
    "/sbin",
    "/srv",
    "/tmp",
    "/usr",
    "/usr/bin",
    "/usr/lib",
    "/usr/lib/systemd",
    "/usr/lib/systemd/system",
    "/usr/local",
    "/usr/local/bin",
    "/usr/local/sbin",
    "/usr/sbin",
    "/var",
    "/var/cache",
    "/var/lib",
    "/var/log",
];

/// Whether `path` is a directory the OS provides.
pub fn is_os_directory(path: &str) -> bool {
    OS_DIRECTORIES.contains(&path)
}

/// Service start waits for these kinds of tasks.
const SERVICE_PREREQUISITES: &[&str] = &["File", "Package", "User", "Group", "Chattr", "BindMount", "Archive"];

/// Tasks in execution order, with the edges that produced it.
#[derive(Debug)]
pub struct Plan {
    steps: Vec<Task>,
    edges: BTreeSet<(TaskId, TaskId)>,
}

impl Plan {
    /// Tasks in execution order.
    pub fn tasks(&self) -> &[Task] {
        &self.steps
    }

    /// Identities in execution order.
    pub fn ids(&self) -> Vec<TaskId> {
        self.steps.iter().map(Task::id).collect()
    }

    /// Every `(dependency, dependent)` pair.
    pub fn edges(&self) -> &BTreeSet<(TaskId, TaskId)> {
        &self.edges
    }

    /// The task with identity `id`.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.steps.iter().find(|t| t.id().as_str() == id)
    }
}

/// Adds directory tasks for parents no task creates, up to an OS directory.
fn synthesize_parents(tasks: &mut TaskSet) {
    let existing: BTreeSet<String> = tasks
        .values()
        .filter_map(|t| t.produced_path().map(String::from))
        .collect();
    let mut missing = BTreeSet::new();
    for path in &existing {
        let mut current = Path::new(path).parent();
        while let Some(dir) = current {
            let dir_str = dir.to_string_lossy().into_owned();
            if is_os_directory(&dir_str) || existing.contains(&dir_str) {
                break;
            }
            missing.insert(dir_str);
            current = dir.parent();
        }
    }
    // The bootstrap kubeconfig holds a bearer token; its directory is not
    // world readable.
    let restricted: BTreeSet<String> = tasks
        .values()
        .filter_map(|t| match t {
            Task::KubeletBootstrapKubeconfig(k) => Path::new(&k.path)
                .parent()
                .map(|p| p.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    for dir in missing {
        let mode = if restricted.contains(&dir) { "0770" } else { "0755" };
        debug!(path = %dir, mode, "synthesizing parent directory");
        let task: Task = File::directory(dir, Some(mode)).into();
        tasks.insert(task.id(), task);
    }
}

fn ids_of_kind<'a>(tasks: &'a TaskSet, kind: &'a str) -> impl Iterator<Item = TaskId> + 'a {
    tasks.keys().filter(move |id| id.kind() == kind).cloned()
}

fn dependencies(tasks: &TaskSet) -> BTreeSet<(TaskId, TaskId)> {
    let mut producers: HashMap<&str, Vec<TaskId>> = HashMap::new();
    for (id, task) in tasks {
        if let Some(path) = task.produced_path() {
            producers.entry(path).or_default().push(id.clone());
        }
    }
    let mut edges = BTreeSet::new();
    for (id, task) in tasks {
        let mut deps: Vec<TaskId> = task.explicit_dependencies();

        for path in task.after_files() {
            deps.extend(producers.get(path.as_str()).into_iter().flatten().cloned());
        }

        if let Some(path) = task.produced_path() {
            if let Some(parent) = Path::new(path).parent() {
                let parent = parent.to_string_lossy();
                deps.extend(producers.get(&*parent).into_iter().flatten().cloned());
            }
        }

        for service in task.before_services() {
            edges.insert((id.clone(), TaskId::new("Service", service)));
        }

        match task {
            Task::File(f) => {
                if let Some(owner) = &f.owner {
                    deps.push(TaskId::new("User", owner));
                }
                if let Some(group) = &f.group {
                    deps.push(TaskId::new("Group", group));
                }
            }
            Task::Service(s) => {
                for kind in SERVICE_PREREQUISITES {
                    deps.extend(ids_of_kind(tasks, kind));
                }
                if s.name == "kubelet.service" {
                    deps.extend(ids_of_kind(tasks, "KubeletBootstrapKubeconfig"));
                }
            }
            Task::Package(p) if p.source.is_some() => {
                deps.extend(ids_of_kind(tasks, "Package").filter(|other| match tasks.get(other) {
                    Some(Task::Package(o)) => o.source.is_none(),
                    _ => false,
                }));
            }
            _ => {}
        }

        for dep in deps {
            if &dep == id {
                continue;
            }
            if tasks.contains_key(&dep) {
                edges.insert((dep, id.clone()));
            } else {
                debug!(task = %id, dependency = %dep, "ignoring dependency on undeclared task");
            }
        }
    }
    edges.retain(|(from, to)| tasks.contains_key(from) && tasks.contains_key(to));
    edges
}

/// Builds the execution plan for `tasks`.
///
/// Fails with [`Error::CycleDetected`] naming the members of a cycle.
pub fn resolve(mut tasks: TaskSet) -> Result<Plan> {
    synthesize_parents(&mut tasks);
    let edges = dependencies(&tasks);

    let mut graph: DiGraph<TaskId, ()> = DiGraph::new();
    let mut index: BTreeMap<TaskId, NodeIndex> = BTreeMap::new();
    for id in tasks.keys() {
        index.insert(id.clone(), graph.add_node(id.clone()));
    }
    for (from, to) in &edges {
        graph.add_edge(index[from], index[to], ());
    }

    if is_cyclic_directed(&graph) {
        let mut members: Vec<String> = tarjan_scc(&graph)
            .into_iter()
            .find(|scc| scc.len() > 1)
            .unwrap_or_default()
            .into_iter()
            .map(|n| graph[n].to_string())
            .collect();
        members.sort();
        return Err(Error::CycleDetected(members));
    }
    let sorted = toposort(&graph, None).map_err(|c| Error::CycleDetected(vec![graph[c.node_id()].to_string()]))?;

    // Longest path from any root.
    let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
    for node in &sorted {
        let d = graph
            .neighbors_directed(*node, petgraph::Direction::Incoming)
            .map(|pred| depth.get(&pred).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depth.insert(*node, d);
    }

    let mut order: Vec<(usize, TaskId)> = index
        .iter()
        .map(|(id, node)| (depth.get(node).copied().unwrap_or(0), id.clone()))
        .collect();
    order.sort();

    let steps = order
        .into_iter()
        .filter_map(|(_, id)| tasks.remove(&id))
        .collect();
    Ok(Plan { steps, edges })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tasks::{KubeletBootstrapKubeconfig, Package, Service};

    fn set(tasks: Vec<Task>) -> TaskSet {
        tasks.into_iter().map(|t| (t.id(), t)).collect()
    }

    fn position(plan: &Plan, id: &str) -> usize {
        plan.ids().iter().position(|i| i.as_str() == id).unwrap()
    }

    #[test]
    fn synthesizes_missing_parents() {
        let plan = resolve(set(vec![File::file("/etc/kubernetes/pki/ca.crt", "x", None).into()])).unwrap();
        assert_eq!(
            plan.ids().iter().map(|i| i.as_str()).collect::<Vec<_>>(),
            vec![
                "File//etc/kubernetes",
                "File//etc/kubernetes/pki",
                "File//etc/kubernetes/pki/ca.crt"
            ]
        );
        match plan.get("File//etc/kubernetes/pki") {
            Some(Task::File(f)) => assert_eq!(f.mode.as_deref(), Some("0755")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ties_break_by_identity() {
        let plan = resolve(set(vec![
            File::file("/etc/b", "", None).into(),
            File::file("/etc/a", "", None).into(),
            Package::new("zz").into(),
        ]))
        .unwrap();
        assert_eq!(
            plan.ids().iter().map(|i| i.as_str()).collect::<Vec<_>>(),
            vec!["File//etc/a", "File//etc/b", "Package/zz"]
        );
    }

    #[test]
    fn services_follow_files_and_bootstrap() {
        let plan = resolve(set(vec![
            Service::new("kubelet.service", "[Service]\n").into(),
            File::file("/etc/sysconfig/kubelet", "", None).into(),
            KubeletBootstrapKubeconfig {
                path: "/var/lib/kubelet/bootstrap-kubeconfig".into(),
                server_url: String::new(),
                ca_certificate: String::new(),
                client: "kops-controller".into(),
                node_name: "n".into(),
                instance_group: "nodes".into(),
            }
            .into(),
        ]))
        .unwrap();
        let kubelet = position(&plan, "Service/kubelet.service");
        assert!(position(&plan, "File//etc/sysconfig/kubelet") < kubelet);
        assert!(position(&plan, "KubeletBootstrapKubeconfig//var/lib/kubelet/bootstrap-kubeconfig") < kubelet);
        assert!(position(&plan, "File//var/lib/kubelet") < kubelet);
        match plan.get("File//var/lib/kubelet") {
            Some(Task::File(f)) => assert_eq!(f.mode.as_deref(), Some("0770")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn after_files_cycle_is_reported() {
        let plan = resolve(set(vec![
            File::file("/etc/a", "", None).after("/etc/b").into(),
            File::file("/etc/b", "", None).after("/etc/a").into(),
        ]));
        match plan {
            Err(Error::CycleDetected(members)) => assert_eq!(members, vec!["File//etc/a", "File//etc/b"]),
            other => panic!("expected a cycle, got {:?}", other.map(|p| p.ids())),
        }
    }

    #[test]
    fn sourced_packages_follow_repository_packages() {
        let mut sourced = Package::new("containerd");
        sourced.source = Some("https://example.com/containerd.deb".into());
        let plan = resolve(set(vec![sourced.into(), Package::new("zlib").into()])).unwrap();
        assert!(position(&plan, "Package/zlib") < position(&plan, "Package/containerd"));
    }
}
