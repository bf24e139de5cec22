use async_trait::async_trait;
use tracing::info;

use super::{os_path, Delta, TaskId};
use crate::error::{Error, Result};
use crate::target::LocalTarget;

/// Extended attribute flags on a file, e.g. `+i` to make it immutable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chattr {
    /// Absolute path
    pub file: String,
    /// `+flags` or `-flags`
    pub mode: String,
    /// Tasks that must run first, usually whatever writes `file`
    pub deps: Vec<TaskId>,
}

impl Chattr {
    /// Marks `file` immutable once `dep` has run.
    pub fn immutable(file: &str, dep: TaskId) -> Self {
        Chattr {
            file: file.to_string(),
            mode: "+i".to_string(),
            deps: vec![dep],
        }
    }

    fn parse_mode(&self) -> Option<(bool, &str)> {
        let (add, flags) = match self.mode.split_at(1) {
            ("+", flags) => (true, flags),
            ("-", flags) => (false, flags),
            _ => return None,
        };
        if flags.is_empty() || !flags.chars().all(|c| c.is_ascii_lowercase()) {
            return None;
        }
        Some((add, flags))
    }
}

#[async_trait(?Send)]
impl Delta for Chattr {
    /// Flags reported by `lsattr`
    type Actual = String;

    async fn find(&self, target: &LocalTarget) -> Result<Option<String>> {
        if !target.path(&self.file).exists() {
            return Ok(None);
        }
        let output = target.run(&["lsattr".to_string(), "-d".to_string(), os_path(target, &self.file)])?;
        if !output.success {
            return Ok(None);
        }
        Ok(output.stdout.split_whitespace().next().map(String::from))
    }

    fn check_changes(&self, id: &TaskId, _actual: Option<&String>) -> Result<()> {
        match self.parse_mode() {
            Some(_) => Ok(()),
            None => Err(Error::config(format!("{}: invalid chattr mode {:?}", id, self.mode))),
        }
    }

    async fn render(&self, target: &mut LocalTarget, actual: Option<&String>) -> Result<bool> {
        let (add, flags) = self.parse_mode().unwrap_or((true, ""));
        let current = actual.map(String::as_str).unwrap_or_default();
        if flags.chars().all(|f| current.contains(f) == add) {
            return Ok(false);
        }
        let path = os_path(target, &self.file);
        info!(file = %self.file, mode = %self.mode, "changing file attributes");
        target.run_checked(&["chattr".to_string(), self.mode.clone(), path])?;
        Ok(true)
    }
}
