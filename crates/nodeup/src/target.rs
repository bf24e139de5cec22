//! The machine tasks are applied to.
//!
//! [`LocalTarget`] bundles everything a task touches outside its own fields:
//! the filesystem (relative to a root, `/` in production), the command runner
//! used for package managers and systemd, the cloud metadata client and the
//! node identity used for bootstrap requests.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use bootstrap_client::Authenticator;
use tracing::{debug, info};

use crate::distro::Distribution;
use crate::error::{Error, Result};
use crate::metadata::MetadataClient;

/// What a command printed and how it exited.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandOutput {
    /// Whether the command exited with status 0
    pub success: bool,
    /// Exit code, if it exited normally
    pub code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// A successful run printing `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        CommandOutput {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed run with exit code `code`.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        CommandOutput {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs OS commands on behalf of tasks.
pub trait CommandRunner {
    /// Runs `argv` to completion. A non-zero exit is reported in the output,
    /// not as an error.
    fn run(&self, argv: &[String]) -> Result<CommandOutput>;

    /// Starts `argv` without waiting for it.
    fn spawn_detached(&self, argv: &[String]) -> Result<()>;
}

/// Runs commands with `std::process`.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        let (program, args) = split_argv(argv)?;
        debug!(command = ?argv, "running command");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::io(program, e))?;
        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn_detached(&self, argv: &[String]) -> Result<()> {
        let (program, args) = split_argv(argv)?;
        info!(command = ?argv, "starting detached command");
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::io(program, e))?;
        Ok(())
    }
}

fn split_argv(argv: &[String]) -> Result<(&str, &[String])> {
    match argv.split_first() {
        Some((program, args)) => Ok((program.as_str(), args)),
        None => Err(Error::config("empty command")),
    }
}

/// Shared view of the commands a [`RecordingRunner`] saw.
#[derive(Clone, Debug, Default)]
pub struct CommandLog {
    calls: Rc<RefCell<Vec<Vec<String>>>>,
    detached: Rc<RefCell<Vec<Vec<String>>>>,
}

impl CommandLog {
    /// Commands run to completion, in order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.borrow().clone()
    }

    /// Commands started detached, in order.
    pub fn detached(&self) -> Vec<Vec<String>> {
        self.detached.borrow().clone()
    }

    /// Completed commands joined with spaces, for easy assertions.
    pub fn lines(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.join(" ")).collect()
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
        self.detached.borrow_mut().clear();
    }
}

/// A runner that records commands instead of executing them.
///
/// Responses are scripted by argv prefix; the most recently added matching
/// prefix wins and unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    log: CommandLog,
    responses: Vec<(Vec<String>, CommandOutput)>,
}

impl RecordingRunner {
    /// A runner with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle onto the recorded commands.
    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }

    /// Scripts the output for commands starting with `prefix`.
    pub fn respond(&mut self, prefix: &[&str], output: CommandOutput) -> &mut Self {
        self.responses
            .push((prefix.iter().map(|s| s.to_string()).collect(), output));
        self
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        self.log.calls.borrow_mut().push(argv.to_vec());
        Ok(self
            .responses
            .iter()
            .rev()
            .find(|(prefix, _)| argv.starts_with(prefix))
            .map(|(_, out)| out.clone())
            .unwrap_or_else(|| CommandOutput::ok("")))
    }

    fn spawn_detached(&self, argv: &[String]) -> Result<()> {
        self.log.detached.borrow_mut().push(argv.to_vec());
        Ok(())
    }
}

/// Settings for bootstrap requests made during a run.
#[derive(Clone)]
pub struct BootstrapSettings {
    /// Proves this node's identity to the controller
    pub authenticator: Arc<dyn Authenticator>,
    /// Controller port
    pub port: u16,
    /// URL scheme; `https` outside of tests
    pub scheme: String,
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Attempts before giving up
    pub max_attempts: u32,
    /// First backoff interval
    pub backoff_base: Duration,
}

impl BootstrapSettings {
    /// Production defaults around `authenticator`.
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        BootstrapSettings {
            authenticator,
            port: bootstrap_client::DEFAULT_PORT,
            scheme: "https".to_string(),
            timeout: Duration::from_secs(60),
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

/// The local machine, as seen by tasks.
pub struct LocalTarget {
    root: PathBuf,
    distribution: Distribution,
    cache_dir: PathBuf,
    runner: Box<dyn CommandRunner>,
    metadata: Option<MetadataClient>,
    bootstrap: Option<BootstrapSettings>,
    bootstrap_clients: HashMap<String, Rc<bootstrap_client::Client>>,
    started_services: HashSet<String>,
}

impl LocalTarget {
    /// A target rooted at `root`, running commands with `runner`.
    pub fn new(
        root: impl Into<PathBuf>,
        distribution: Distribution,
        cache_dir: impl Into<PathBuf>,
        runner: Box<dyn CommandRunner>,
    ) -> Self {
        LocalTarget {
            root: root.into(),
            distribution,
            cache_dir: cache_dir.into(),
            runner,
            metadata: None,
            bootstrap: None,
            bootstrap_clients: HashMap::new(),
            started_services: HashSet::new(),
        }
    }

    /// Attaches the instance metadata client.
    pub fn with_metadata(mut self, metadata: MetadataClient) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Attaches the bootstrap identity.
    pub fn with_bootstrap(mut self, settings: BootstrapSettings) -> Self {
        self.bootstrap = Some(settings);
        self
    }

    /// The filesystem root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The detected distribution.
    pub fn distribution(&self) -> &Distribution {
        &self.distribution
    }

    /// Where downloads are cached.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Maps an absolute node path onto the target root.
    pub fn path(&self, node_path: &str) -> PathBuf {
        self.root.join(node_path.trim_start_matches('/'))
    }

    /// The instance metadata client, if configured.
    pub fn metadata(&self) -> Option<&MetadataClient> {
        self.metadata.as_ref()
    }

    pub(crate) fn bootstrap_settings(&self) -> Option<&BootstrapSettings> {
        self.bootstrap.as_ref()
    }

    pub(crate) fn register_bootstrap_client(&mut self, name: &str, client: bootstrap_client::Client) {
        self.bootstrap_clients
            .insert(name.to_string(), Rc::new(client));
    }

    pub(crate) fn bootstrap_client(&self, name: &str) -> Option<Rc<bootstrap_client::Client>> {
        self.bootstrap_clients.get(name).cloned()
    }

    pub(crate) fn mark_started(&mut self, service: &str) {
        self.started_services.insert(service.to_string());
    }

    /// Whether `service` was started or restarted earlier in this run.
    pub fn was_started(&self, service: &str) -> bool {
        self.started_services.contains(service)
    }

    /// Runs a command and returns its output whatever the exit status.
    pub fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        self.runner.run(argv)
    }

    /// Runs a command and fails unless it exits successfully.
    pub fn run_checked(&self, argv: &[String]) -> Result<CommandOutput> {
        let output = self.runner.run(argv)?;
        if !output.success {
            return Err(Error::Command {
                command: argv.to_vec(),
                status: output
                    .code
                    .map(|c| format!("exit status {}", c))
                    .unwrap_or_else(|| "terminated by signal".to_string()),
                output: format!("{}{}", output.stdout, output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Starts a command without waiting for it.
    pub fn spawn_detached(&self, argv: &[String]) -> Result<()> {
        self.runner.spawn_detached(argv)
    }

    /// Looks up a uid by account name in the target's `/etc/passwd`.
    pub fn lookup_uid(&self, user: &str) -> Result<Option<u32>> {
        self.lookup_id("etc/passwd", user)
    }

    /// Looks up a gid by group name in the target's `/etc/group`.
    pub fn lookup_gid(&self, group: &str) -> Result<Option<u32>> {
        self.lookup_id("etc/group", group)
    }

    fn lookup_id(&self, database: &str, name: &str) -> Result<Option<u32>> {
        Ok(self
            .account_record(database, name)?
            .and_then(|fields| fields.get(2).and_then(|id| id.parse().ok())))
    }

    /// The colon separated record for `name` in an account database such as
    /// `etc/passwd`.
    pub(crate) fn account_record(&self, database: &str, name: &str) -> Result<Option<Vec<String>>> {
        let path = self.path(database);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(&path, e)),
        };
        Ok(contents
            .lines()
            .map(|l| l.split(':').map(String::from).collect::<Vec<_>>())
            .find(|fields| fields.first().map(String::as_str) == Some(name)))
    }
}

/// Converts an argv given as string slices.
pub fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Writes `data` to `path` so that readers see either the old or the new
/// contents, never a partial file.
pub fn write_atomic(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::config(format!("{} has no parent directory", path.display())))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".nodeup-")
        .tempfile_in(parent)
        .map_err(|e| Error::io(parent, e))?;
    temp.write_all(data).map_err(|e| Error::io(path, e))?;
    temp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(mode))
        .map_err(|e| Error::io(path, e))?;
    temp.as_file().sync_all().map_err(|e| Error::io(path, e))?;
    temp.persist(path).map_err(|e| Error::io(path, e.error))?;
    Ok(())
}

/// Parses an octal mode string such as `0644`.
pub fn parse_mode(mode: &str) -> Result<u32> {
    u32::from_str_radix(mode.trim_start_matches("0o"), 8)
        .map_err(|_| Error::config(format!("invalid file mode {:?}", mode)))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn atomic_write_replaces_contents_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        write_atomic(&path, b"one", 0o600).unwrap();
        write_atomic(&path, b"two", 0o640).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o640);
        // No temp files left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn recording_runner_scripts_by_prefix() {
        let mut runner = RecordingRunner::new();
        runner.respond(&["systemctl", "show"], CommandOutput::ok("ActiveState=active\n"));
        runner.respond(&["systemctl", "show", "--all", "missing.service"], CommandOutput::failed(1, "no"));
        let log = runner.log();
        let out = runner
            .run(&argv(&["systemctl", "show", "--all", "kubelet.service"]))
            .unwrap();
        assert!(out.stdout.contains("active"));
        let out = runner
            .run(&argv(&["systemctl", "show", "--all", "missing.service"]))
            .unwrap();
        assert!(!out.success);
        runner.spawn_detached(&argv(&["sleep", "1"])).unwrap();
        assert_eq!(log.calls().len(), 2);
        assert_eq!(log.detached(), vec![argv(&["sleep", "1"])]);
    }

    #[test]
    fn ids_come_from_target_databases() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(
            dir.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/bash\netcd:x:998:998::/var/lib/etcd:/sbin/nologin\n",
        )
        .unwrap();
        let target = LocalTarget::new(
            dir.path(),
            Distribution::Debian12,
            dir.path().join("cache"),
            Box::new(RecordingRunner::new()),
        );
        assert_eq!(target.lookup_uid("etcd").unwrap(), Some(998));
        assert_eq!(target.lookup_uid("nobody").unwrap(), None);
        assert_eq!(target.lookup_gid("etcd").unwrap(), None);
        assert_eq!(target.path("/etc/hosts"), dir.path().join("etc/hosts"));
        assert_eq!(parse_mode("0755").unwrap(), 0o755);
    }
}
