use tracing::{debug, warn};

use crate::command::Executor;
use crate::error::Result;

/// A named network namespace managed through `ip netns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetNs {
    name: String,
}

impl NetNs {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Exact-name lookup in `ip netns list`. Lines look like `h1 (id: 3)`.
    pub async fn exists(&self, executor: &dyn Executor) -> Result<bool> {
        let listing = executor.run("ip", &["netns", "list"]).await?;
        Ok(listing
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .any(|name| name == self.name))
    }

    pub async fn create(&self, executor: &dyn Executor) -> Result<()> {
        executor.run("ip", &["netns", "add", &self.name]).await?;
        debug!(netns = %self.name, "namespace created");
        Ok(())
    }

    /// Create the namespace unless it is already present.
    pub async fn ensure(&self, executor: &dyn Executor) -> Result<()> {
        if self.exists(executor).await? {
            debug!(netns = %self.name, "namespace already present");
            return Ok(());
        }
        self.create(executor).await
    }

    /// Delete the namespace. Failures are logged, not returned.
    pub async fn release(&self, executor: &dyn Executor) {
        if let Err(e) = executor.run("ip", &["netns", "del", &self.name]).await {
            warn!(netns = %self.name, error = %e, "failed to delete namespace");
        }
    }
}

/// Namespace a process lives in, or an empty string when it has none or the
/// lookup fails.
pub async fn identify(executor: &dyn Executor, pid: u32) -> String {
    let pid = pid.to_string();
    executor
        .run("ip", &["netns", "identify", &pid])
        .await
        .unwrap_or_default()
}
