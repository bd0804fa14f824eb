use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::Executor;
use crate::error::Result;
use crate::link::{Link, LinkState};
use crate::node::{Node, NodeKind};

/// An Open vSwitch bridge. Its ports live in the root namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Switch {
    pub name: String,
    pub ports: Vec<Link>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
}

impl Switch {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub async fn exists(&self, executor: &dyn Executor) -> bool {
        executor
            .run("ovs-vsctl", &["br-exists", &self.name])
            .await
            .is_ok()
    }

    pub async fn create(&self, executor: &dyn Executor) -> Result<()> {
        executor.run("ovs-vsctl", &["add-br", &self.name]).await?;
        info!(switch = %self.name, "bridge created");
        Ok(())
    }

    /// Create the bridge when missing and point it at its controller.
    pub async fn ensure(&self, executor: &dyn Executor) -> Result<()> {
        if self.exists(executor).await {
            debug!(switch = %self.name, "bridge already present");
        } else {
            self.create(executor).await?;
        }

        if let Some(addr) = self.controller.as_deref().filter(|a| !a.is_empty()) {
            self.set_controller(executor, addr).await?;
        }
        Ok(())
    }

    pub async fn set_controller(&self, executor: &dyn Executor, addr: &str) -> Result<()> {
        executor
            .run("ovs-vsctl", &["set-controller", &self.name, addr])
            .await?;
        debug!(switch = %self.name, controller = %addr, "controller set");
        Ok(())
    }

    /// Whether the bridge already carries a port named `port`.
    pub async fn has_port(&self, executor: &dyn Executor, port: &str) -> Result<bool> {
        let listing = executor
            .run("ovs-vsctl", &["list-ports", &self.name])
            .await?;
        Ok(listing.lines().any(|line| line.trim() == port))
    }

    /// Record `link` as a port, replacing an entry with the same name.
    pub fn register(&mut self, link: Link) {
        match self.ports.iter_mut().find(|p| p.name == link.name) {
            Some(existing) => *existing = link,
            None => self.ports.push(link),
        }
    }

    async fn attach_port(&self, executor: &dyn Executor, port: &str) -> Result<()> {
        executor
            .run("ovs-vsctl", &["add-port", &self.name, port])
            .await?;
        Ok(())
    }

    /// Attach a veth end to the bridge and record it.
    pub async fn add_port(&mut self, executor: &dyn Executor, link: Link) -> Result<()> {
        self.attach_port(executor, &link.name).await?;
        debug!(switch = %self.name, port = %link.name, "port added");
        self.register(link);
        Ok(())
    }

    /// Add an internal patch port peered with another switch's patch port.
    pub async fn add_patch_port(&mut self, executor: &dyn Executor, mut link: Link) -> Result<()> {
        self.attach_port(executor, &link.name).await?;
        executor
            .run("ovs-vsctl", &["set", "interface", &link.name, "type=patch"])
            .await?;
        let peer = format!("options:peer={}", link.peer.name);
        executor
            .run("ovs-vsctl", &["set", "interface", &link.name, &peer])
            .await?;

        link.state = LinkState::Up;
        debug!(switch = %self.name, port = %link.name, peer = %link.peer.name, "patch port added");
        self.register(link);
        Ok(())
    }

    pub async fn add_link(&mut self, executor: &dyn Executor, link: Link) -> Result<()> {
        if link.is_patch() {
            self.add_patch_port(executor, link).await
        } else {
            self.add_port(executor, link).await
        }
    }
}

#[async_trait]
impl Node for Switch {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Switch
    }

    fn netns(&self) -> Option<&str> {
        None
    }

    fn links(&self) -> &[Link] {
        &self.ports
    }

    async fn release(&self, executor: &dyn Executor) {
        if let Err(e) = executor.run("ovs-vsctl", &["del-br", &self.name]).await {
            warn!(switch = %self.name, error = %e, "failed to delete bridge");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeExecutor;
    use crate::link::Pair;
    use crate::pool::AddressPool;

    #[tokio::test]
    async fn ensure_creates_bridge_once_and_sets_controller() {
        let fake = FakeExecutor::new();
        let mut s1 = Switch::new("s1");
        s1.controller = Some("tcp:127.0.0.1:6653".into());

        s1.ensure(&fake).await.unwrap();
        s1.ensure(&fake).await.unwrap();

        let calls = fake.calls();
        assert_eq!(calls.iter().filter(|c| c.as_str() == "ovs-vsctl add-br s1").count(), 1);
        assert!(calls.contains(&"ovs-vsctl set-controller s1 tcp:127.0.0.1:6653".to_string()));
        assert!(s1.exists(&fake).await);
    }

    #[tokio::test]
    async fn patch_ports_are_typed_and_peered() {
        let fake = FakeExecutor::new();
        let pool = AddressPool::new();
        let mut s1 = Switch::new("s1");
        let mut s2 = Switch::new("s2");
        s1.ensure(&fake).await.unwrap();
        s2.ensure(&fake).await.unwrap();

        let pair = Pair::new(&s1, &s2, &pool).unwrap();
        s1.add_link(&fake, pair.left.clone()).await.unwrap();
        s2.add_link(&fake, pair.right.clone()).await.unwrap();

        assert!(s1.has_port(&fake, "s1-pp0").await.unwrap());
        assert!(s2.has_port(&fake, "s2-pp0").await.unwrap());
        assert_eq!(s1.ports[0].state, LinkState::Up);
        let calls = fake.calls();
        assert!(calls.contains(&"ovs-vsctl set interface s1-pp0 type=patch".to_string()));
        assert!(calls.contains(&"ovs-vsctl set interface s1-pp0 options:peer=s2-pp0".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("ip link add")));
    }

    #[tokio::test]
    async fn register_replaces_same_named_port() {
        let fake = FakeExecutor::new();
        let mut s1 = Switch::new("s1");
        s1.ensure(&fake).await.unwrap();
        s1.add_port(&fake, Link::named("s1-eth0")).await.unwrap();

        let mut updated = Link::named("s1-eth0");
        updated.state = LinkState::Up;
        s1.register(updated);
        assert_eq!(s1.ports.len(), 1);
        assert_eq!(s1.ports[0].state, LinkState::Up);
    }

    #[tokio::test]
    async fn add_port_fails_without_bridge() {
        let fake = FakeExecutor::new();
        let mut s1 = Switch::new("s1");
        assert!(s1.add_port(&fake, Link::named("s1-eth0")).await.is_err());
        assert!(s1.ports.is_empty());
    }

    #[tokio::test]
    async fn release_deletes_bridge_best_effort() {
        let fake = FakeExecutor::new();
        let s1 = Switch::new("s1");
        s1.ensure(&fake).await.unwrap();
        s1.release(&fake).await;
        assert!(!s1.exists(&fake).await);
        s1.release(&fake).await;
    }
}
