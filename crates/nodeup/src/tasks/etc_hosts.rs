use async_trait::async_trait;
use tracing::info;

use super::Delta;
use crate::error::{Error, Result};
use crate::target::{write_atomic, LocalTarget};

const HOSTS: &str = "/etc/hosts";

/// Addresses for one hostname.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostRecord {
    /// Hostname
    pub hostname: String,
    /// Addresses, in order
    pub addresses: Vec<String>,
}

/// A named block of records merged into `/etc/hosts`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateEtcHosts {
    /// Owner of the block
    pub name: String,
    /// Records; hostnames without addresses are omitted
    pub records: Vec<HostRecord>,
}

impl UpdateEtcHosts {
    fn begin_marker(&self) -> String {
        format!("# Begin host entries managed by nodeup - {}", self.name)
    }

    fn end_marker(&self) -> String {
        format!("# End host entries managed by nodeup - {}", self.name)
    }

    fn desired(&self) -> Vec<HostRecord> {
        self.records
            .iter()
            .filter(|r| !r.addresses.is_empty())
            .cloned()
            .collect()
    }

    /// Splits `hosts` into lines outside this task's block and the records inside it.
    fn split(&self, hosts: &str) -> (Vec<String>, Option<Vec<HostRecord>>) {
        let (begin, end) = (self.begin_marker(), self.end_marker());
        let mut outside = Vec::new();
        let mut managed: Option<Vec<HostRecord>> = None;
        let mut inside = false;
        for line in hosts.lines() {
            if line.trim() == begin {
                inside = true;
                managed.get_or_insert_with(Vec::new);
                continue;
            }
            if line.trim() == end {
                inside = false;
                continue;
            }
            if !inside {
                outside.push(line.to_string());
                continue;
            }
            let mut fields = line.split_whitespace();
            if let (Some(address), Some(hostname)) = (fields.next(), fields.next()) {
                let records = managed.get_or_insert_with(Vec::new);
                match records.iter_mut().find(|r| r.hostname == hostname) {
                    Some(r) => r.addresses.push(address.to_string()),
                    None => records.push(HostRecord {
                        hostname: hostname.to_string(),
                        addresses: vec![address.to_string()],
                    }),
                }
            }
        }
        (outside, managed)
    }
}

#[async_trait(?Send)]
impl Delta for UpdateEtcHosts {
    type Actual = Vec<HostRecord>;

    async fn find(&self, target: &LocalTarget) -> Result<Option<Vec<HostRecord>>> {
        let path = target.path(HOSTS);
        match std::fs::read_to_string(&path) {
            Ok(hosts) => Ok(self.split(&hosts).1),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    async fn render(&self, target: &mut LocalTarget, actual: Option<&Vec<HostRecord>>) -> Result<bool> {
        let desired = self.desired();
        if actual.map(|a| a == &desired).unwrap_or(desired.is_empty()) {
            return Ok(false);
        }
        let path = target.path(HOSTS);
        let current = match std::fs::read_to_string(&path) {
            Ok(hosts) => hosts,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(Error::io(&path, e)),
        };
        let (mut lines, _) = self.split(&current);
        while lines.last().map_or(false, |l| l.trim().is_empty()) {
            lines.pop();
        }
        if !desired.is_empty() {
            lines.push(String::new());
            lines.push(self.begin_marker());
            for record in &desired {
                for address in &record.addresses {
                    lines.push(format!("{}\t{}", address, record.hostname));
                }
            }
            lines.push(self.end_marker());
        }
        let mut contents = lines.join("\n");
        contents.push('\n');
        info!(block = %self.name, records = desired.len(), "updating /etc/hosts");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        write_atomic(&path, contents.as_bytes(), 0o644)?;
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::distro::Distribution;
    use crate::tasks::test::scratch_target;
    use crate::tasks::Task;

    fn api_records(addresses: &[&str]) -> Task {
        UpdateEtcHosts {
            name: "api".into(),
            records: vec![HostRecord {
                hostname: "api.internal.example".into(),
                addresses: addresses.iter().map(|s| s.to_string()).collect(),
            }],
        }
        .into()
    }

    #[tokio::test]
    async fn merges_block_and_replaces_previous() {
        let (_dir, mut target, _log) = scratch_target(Distribution::Debian12);
        std::fs::create_dir_all(target.path("/etc")).unwrap();
        std::fs::write(target.path("/etc/hosts"), "127.0.0.1\tlocalhost\n").unwrap();

        assert!(api_records(&["10.0.0.1", "10.0.0.2"]).apply(&mut target).await.unwrap());
        assert!(!api_records(&["10.0.0.1", "10.0.0.2"]).apply(&mut target).await.unwrap());
        assert!(api_records(&["10.0.0.3"]).apply(&mut target).await.unwrap());

        let hosts = std::fs::read_to_string(target.path("/etc/hosts")).unwrap();
        assert_eq!(
            hosts,
            "127.0.0.1\tlocalhost\n\n\
             # Begin host entries managed by nodeup - api\n\
             10.0.0.3\tapi.internal.example\n\
             # End host entries managed by nodeup - api\n"
        );
    }

    #[tokio::test]
    async fn other_blocks_are_untouched() {
        let (_dir, mut target, _log) = scratch_target(Distribution::Debian12);
        std::fs::create_dir_all(target.path("/etc")).unwrap();
        std::fs::write(
            target.path("/etc/hosts"),
            "# Begin host entries managed by nodeup - gossip\n10.1.1.1\tetcd-a\n# End host entries managed by nodeup - gossip\n",
        )
        .unwrap();
        assert!(api_records(&["10.0.0.1"]).apply(&mut target).await.unwrap());
        let hosts = std::fs::read_to_string(target.path("/etc/hosts")).unwrap();
        assert!(hosts.starts_with("# Begin host entries managed by nodeup - gossip\n10.1.1.1\tetcd-a\n"));
        assert!(hosts.contains("10.0.0.1\tapi.internal.example"));
    }
}
