use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::Delta;
use crate::error::{Error, Result};
use crate::target::LocalTarget;

/// Waits for the IPv6 prefix delegated to the primary interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prefix {
    /// Task name
    pub name: String,
    /// Time between metadata polls
    pub poll_interval: Duration,
    /// Polls before giving up
    pub max_attempts: u32,
}

impl Prefix {
    /// Polls every ten seconds for five minutes.
    pub fn new(name: &str) -> Self {
        Prefix {
            name: name.to_string(),
            poll_interval: Duration::from_secs(10),
            max_attempts: 30,
        }
    }
}

#[async_trait(?Send)]
impl Delta for Prefix {
    /// The assigned prefix
    type Actual = String;

    async fn find(&self, target: &LocalTarget) -> Result<Option<String>> {
        match target.metadata() {
            Some(metadata) => metadata.ipv6_prefix().await,
            None => Err(Error::config("IPv6 prefix requested but no instance metadata is available")),
        }
    }

    async fn render(&self, target: &mut LocalTarget, actual: Option<&String>) -> Result<bool> {
        if let Some(prefix) = actual {
            debug!(prefix = %prefix, "IPv6 prefix already assigned");
            return Ok(false);
        }
        for attempt in 1..=self.max_attempts {
            tokio::time::sleep(self.poll_interval).await;
            if let Some(prefix) = self.find(target).await? {
                info!(prefix = %prefix, attempt, "IPv6 prefix assigned");
                return Ok(true);
            }
        }
        Err(Error::Timeout {
            operation: "waiting for IPv6 prefix".to_string(),
            after: self.poll_interval * self.max_attempts,
        })
    }
}
