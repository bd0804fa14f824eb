use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{NetError, Result};
use crate::host::Host;
use crate::link::{Link, Pair};
use crate::node::{Node, NodeKind, NodeRef};
use crate::switch::Switch;

/// Declarative description of a topology, and the engine that reconciles it
/// against the kernel.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Scheme {
    pub switches: Vec<Switch>,
    pub hosts: Vec<Host>,
    /// Dedup keys of connections materialized (or found) during this session.
    #[serde(skip)]
    pairs: HashSet<String>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a persisted topology.
    pub fn from_json(json: &str) -> Result<Self> {
        let scheme: Self =
            serde_json::from_str(json).map_err(|e| NetError::InvalidScheme(e.to_string()))?;
        scheme.validate()?;
        Ok(scheme)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    pub fn export(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| NetError::InvalidScheme(e.to_string()))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let json = self.export()?;
        tokio::fs::write(path, json).await?;
        debug!(path = %path.display(), "topology saved");
        Ok(())
    }

    /// Node names must be non-empty and unique across hosts and switches.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let names = self
            .switches
            .iter()
            .map(|s| s.name.as_str())
            .chain(self.hosts.iter().map(|h| h.name.as_str()));
        for name in names {
            if name.is_empty() {
                return Err(NetError::InvalidScheme("node with empty name".into()));
            }
            if !seen.insert(name) {
                return Err(NetError::InvalidScheme(format!("duplicate node name {name}")));
            }
        }
        Ok(())
    }

    pub fn add_host(&mut self, host: Host) -> Result<()> {
        if self.node(&host.name).is_some() {
            return Err(NetError::InvalidScheme(format!("duplicate node name {}", host.name)));
        }
        self.hosts.push(host);
        Ok(())
    }

    pub fn add_switch(&mut self, switch: Switch) -> Result<()> {
        if self.node(&switch.name).is_some() {
            return Err(NetError::InvalidScheme(format!(
                "duplicate node name {}",
                switch.name
            )));
        }
        self.switches.push(switch);
        Ok(())
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.name == name)
    }

    pub fn host_mut(&mut self, name: &str) -> Option<&mut Host> {
        self.hosts.iter_mut().find(|h| h.name == name)
    }

    pub fn switch(&self, name: &str) -> Option<&Switch> {
        self.switches.iter().find(|s| s.name == name)
    }

    pub fn switch_mut(&mut self, name: &str) -> Option<&mut Switch> {
        self.switches.iter_mut().find(|s| s.name == name)
    }

    /// Resolve a node by name. Hosts are searched first.
    pub fn node(&self, name: &str) -> Option<NodeRef<'_>> {
        self.host(name)
            .map(NodeRef::Host)
            .or_else(|| self.switch(name).map(NodeRef::Switch))
    }

    /// Every node, switches first.
    pub fn nodes(&self) -> Vec<NodeRef<'_>> {
        self.switches
            .iter()
            .map(NodeRef::Switch)
            .chain(self.hosts.iter().map(NodeRef::Host))
            .collect()
    }

    /// Keys of the connections recorded so far.
    pub fn pairs(&self) -> &HashSet<String> {
        &self.pairs
    }

    /// External programs reconciling this topology needs.
    pub fn required_commands(&self) -> Vec<&'static str> {
        let mut commands = vec!["ip", "ps", "kill"];
        if !self.switches.is_empty() {
            commands.push("ovs-vsctl");
        }
        if self.hosts.iter().any(|h| h.links.len() > 1) {
            commands.push("sysctl");
        }
        let cgroups = self
            .hosts
            .iter()
            .filter_map(|h| h.cgroup.as_ref())
            .any(|cg| !cg.controllers.is_empty());
        if cgroups {
            commands.extend_from_slice(&["cgcreate", "cgset", "cgdelete", "cgexec"]);
        }
        commands
    }

    /// Store a materialized link on whichever node owns it.
    fn register_link(&mut self, link: &Link) {
        if let Some(host) = self.host_mut(&link.node_name) {
            host.register(link.clone());
        } else if let Some(switch) = self.switch_mut(&link.node_name) {
            switch.register(link.clone());
        }
    }

    /// Connect two declared nodes with freshly derived links.
    pub async fn connect(&mut self, ctx: &Context, left: &str, right: &str) -> Result<Pair> {
        self.connect_with(ctx, left, right, Link::default(), Link::default())
            .await
    }

    /// Connect two declared nodes; non-empty fields of the given links win.
    pub async fn connect_with(
        &mut self,
        ctx: &Context,
        left: &str,
        right: &str,
        left_link: Link,
        right_link: Link,
    ) -> Result<Pair> {
        let exec = ctx.exec();
        let (mut pair, left_kind, right_kind) = {
            let left_node = self
                .node(left)
                .ok_or_else(|| NetError::PeerNotFound(left.to_string()))?;
            let right_node = self
                .node(right)
                .ok_or_else(|| NetError::PeerNotFound(right.to_string()))?;
            let pair = Pair::with_overrides(
                left_node.as_node(),
                right_node.as_node(),
                left_link,
                right_link,
                ctx.pool(),
            )?;
            (pair, left_node.kind(), right_node.kind())
        };

        let key = pair.dedup_key();
        if self.pairs.contains(&key) {
            return Err(NetError::DuplicatePair(key));
        }

        if pair.is_patch() {
            if let Some(switch) = self.switch_mut(left) {
                switch.add_patch_port(exec, pair.left.clone()).await?;
            }
            if let Some(switch) = self.switch_mut(right) {
                switch.add_patch_port(exec, pair.right.clone()).await?;
            }
        } else {
            pair.create(exec).await?;
            if left_kind == NodeKind::Switch
                && let Some(switch) = self.switch_mut(left)
            {
                switch.add_port(exec, pair.left.clone()).await?;
            }
            if right_kind == NodeKind::Switch
                && let Some(switch) = self.switch_mut(right)
            {
                switch.add_port(exec, pair.right.clone()).await?;
            }
            pair.up(exec).await?;
            self.register_link(&pair.left);
            self.register_link(&pair.right);
        }

        info!(left = %left, right = %right, key = %key, "nodes connected");
        self.pairs.insert(key);
        Ok(pair)
    }

    /// Bring the kernel in line with the declared topology.
    ///
    /// Idempotent: objects that already exist are recognised and left alone,
    /// and each logical connection is materialized at most once.
    pub async fn recover(&mut self, ctx: &Context) -> Result<()> {
        info!(
            switches = self.switches.len(),
            hosts = self.hosts.len(),
            "recovering topology"
        );

        self.prepare(ctx).await?;

        let switch_names: Vec<String> = self.switches.iter().map(|s| s.name.clone()).collect();
        for name in &switch_names {
            let ports = self
                .switch(name)
                .map(|s| s.ports.clone())
                .unwrap_or_default();
            for port in ports {
                self.recover_port(ctx, name, port).await?;
            }
        }

        let host_names: Vec<String> = self.hosts.iter().map(|h| h.name.clone()).collect();
        for name in &host_names {
            let links = self
                .host(name)
                .map(|h| h.links.clone())
                .unwrap_or_default();
            for link in links {
                self.recover_host_link(ctx, link).await?;
            }
        }

        let mut first_err = None;
        for host in &self.hosts {
            if let Err(e) = host.recover_procs(ctx).await {
                warn!(host = %host.name, error = %e, "process recovery failed");
                first_err.get_or_insert(e);
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }

        info!(pairs = self.pairs.len(), "topology recovered");
        Ok(())
    }

    /// Reserve declared addresses, make bridges exist and provision hosts.
    async fn prepare(&self, ctx: &Context) -> Result<()> {
        let declared = self
            .switches
            .iter()
            .flat_map(|s| s.ports.iter())
            .chain(self.hosts.iter().flat_map(|h| h.links.iter()));
        for link in declared {
            if !link.cidr.is_empty() {
                ctx.pool().claim(&link.cidr);
            }
            if !link.hw_addr.is_empty() {
                ctx.pool().claim_mac(&link.hw_addr);
            }
        }

        for switch in &self.switches {
            switch.ensure(ctx.exec()).await?;
        }
        for host in &self.hosts {
            host.provision(ctx.exec()).await?;
        }
        Ok(())
    }

    async fn recover_port(&mut self, ctx: &Context, switch_name: &str, port: Link) -> Result<()> {
        let exec = ctx.exec();
        let Some(switch) = self.switch(switch_name) else {
            return Ok(());
        };
        if port.exists(exec).await || switch.has_port(exec, &port.name).await? {
            debug!(switch = %switch_name, port = %port.name, "port present");
            return Ok(());
        }

        let peer_name = port.peer.node_name.clone();
        let (peer_link, peer_kind) = {
            let peer = self.node(&peer_name).ok_or_else(|| {
                NetError::PeerNotFound(format!("{switch_name}/{}: node {peer_name}", port.name))
            })?;
            let link = peer.as_node().link_by_peer(&port.peer).cloned().ok_or_else(|| {
                NetError::PeerNotFound(format!(
                    "{switch_name}/{}: link {}/{}",
                    port.name, peer_name, port.peer.if_name
                ))
            })?;
            (link, peer.kind())
        };

        let mut pair = Pair::from_links(port, peer_link);
        let key = pair.dedup_key();
        if self.pairs.contains(&key) {
            let dup = NetError::DuplicatePair(key);
            warn!(switch = %switch_name, error = %dup, "skipping");
            return Ok(());
        }

        if peer_kind == NodeKind::Switch {
            if let Some(switch) = self.switch_mut(switch_name) {
                switch.add_patch_port(exec, pair.left.clone()).await?;
            }
            if let Some(peer) = self.switch_mut(&peer_name) {
                peer.add_patch_port(exec, pair.right.clone()).await?;
            }
        } else {
            pair.create(exec).await?;
            if let Some(switch) = self.switch_mut(switch_name) {
                switch.add_port(exec, pair.left.clone()).await?;
            }
            pair.up(exec).await?;
            self.register_link(&pair.left);
            self.register_link(&pair.right);
        }

        self.pairs.insert(key);
        Ok(())
    }

    async fn recover_host_link(&mut self, ctx: &Context, link: Link) -> Result<()> {
        let exec = ctx.exec();
        let Some(peer_link) = self
            .host(&link.peer.node_name)
            .and_then(|peer| peer.link_by_peer(&link.peer))
            .cloned()
        else {
            return Ok(());
        };

        let mut pair = Pair::from_links(link, peer_link);
        let key = pair.dedup_key();
        if self.pairs.contains(&key) {
            return Ok(());
        }
        if pair.left.exists(exec).await {
            debug!(key = %key, "link present");
            self.pairs.insert(key);
            return Ok(());
        }

        pair.create(exec).await?;
        pair.up(exec).await?;
        self.register_link(&pair.left);
        self.register_link(&pair.right);
        self.pairs.insert(key);
        Ok(())
    }

    /// Tear down every node, best-effort, and forget recorded connections.
    pub async fn release(&mut self, ctx: &Context) {
        for node in self.nodes() {
            node.as_node().release(ctx.exec()).await;
        }
        self.pairs.clear();
        info!("topology released");
    }
}
