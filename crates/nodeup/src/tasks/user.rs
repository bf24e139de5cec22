use async_trait::async_trait;
use tracing::info;

use super::{Delta, TaskId};
use crate::error::{Error, Result};
use crate::target::LocalTarget;

/// A local system account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    /// Account name
    pub name: String,
    /// Required uid
    pub uid: Option<u32>,
    /// Login shell
    pub shell: String,
    /// Home directory
    pub home: String,
}

impl User {
    /// A system account without a login shell.
    pub fn system(name: &str, uid: Option<u32>, home: &str) -> Self {
        User {
            name: name.to_string(),
            uid,
            shell: "/sbin/nologin".to_string(),
            home: home.to_string(),
        }
    }
}

/// A local group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Group {
    /// Group name
    pub name: String,
    /// Create as a system group
    pub system: bool,
}

impl Group {
    /// A system group.
    pub fn system(name: &str) -> Self {
        Group {
            name: name.to_string(),
            system: true,
        }
    }
}

/// An existing account.
#[derive(Debug)]
pub(crate) struct Account {
    id: Option<u32>,
}

#[async_trait(?Send)]
impl Delta for User {
    type Actual = Account;

    async fn find(&self, target: &LocalTarget) -> Result<Option<Account>> {
        Ok(target.account_record("/etc/passwd", &self.name)?.map(|fields| Account {
            id: fields.get(2).and_then(|uid| uid.parse().ok()),
        }))
    }

    fn check_changes(&self, _id: &TaskId, actual: Option<&Account>) -> Result<()> {
        if let (Some(expected), Some(Account { id: Some(actual) })) = (self.uid, actual) {
            if expected != *actual {
                return Err(Error::UidConflict {
                    user: self.name.clone(),
                    expected,
                    actual: *actual,
                });
            }
        }
        Ok(())
    }

    async fn render(&self, target: &mut LocalTarget, actual: Option<&Account>) -> Result<bool> {
        if actual.is_some() {
            return Ok(false);
        }
        let mut args = vec![
            "useradd".to_string(),
            "--system".to_string(),
            "--shell".to_string(),
            self.shell.clone(),
            "--home-dir".to_string(),
            self.home.clone(),
            "--no-create-home".to_string(),
        ];
        if let Some(uid) = self.uid {
            args.push("--uid".to_string());
            args.push(uid.to_string());
        }
        args.push(self.name.clone());
        info!(user = %self.name, uid = ?self.uid, "creating user");
        target.run_checked(&args)?;
        Ok(true)
    }
}

#[async_trait(?Send)]
impl Delta for Group {
    type Actual = Account;

    async fn find(&self, target: &LocalTarget) -> Result<Option<Account>> {
        Ok(target.account_record("/etc/group", &self.name)?.map(|fields| Account {
            id: fields.get(2).and_then(|gid| gid.parse().ok()),
        }))
    }

    async fn render(&self, target: &mut LocalTarget, actual: Option<&Account>) -> Result<bool> {
        if actual.is_some() {
            return Ok(false);
        }
        let mut args = vec!["groupadd".to_string()];
        if self.system {
            args.push("--system".to_string());
        }
        args.push(self.name.clone());
        info!(group = %self.name, "creating group");
        target.run_checked(&args)?;
        Ok(true)
    }
}
