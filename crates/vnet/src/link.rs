use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use tracing::{info, trace, warn};

use crate::command::Executor;
use crate::error::Result;
use crate::node::{Node, NodeKind};
use crate::pool::AddressPool;

/// Name prefix for root-namespace interfaces of host-involving links.
const ETH_PREFIX: &str = "eth";
/// Name prefix for switch-to-switch patch ports.
const PATCH_PREFIX: &str = "pp";
/// Namespace override forcing an interface to stay in the root namespace.
const ROOT_NETNS: &str = "root";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LinkState {
    #[default]
    Down,
    Up,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Down => f.write_str("DOWN"),
            Self::Up => f.write_str("UP"),
        }
    }
}

/// Static route installed on a link's namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Route {
    pub dst: String,
    pub gw: String,
}

/// Lookup key for the other end of a link: node name plus interface name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Peer {
    pub name: String,
    pub if_name: String,
    pub node_name: String,
}

/// One endpoint of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Link {
    pub cidr: String,
    pub hw_addr: String,
    pub name: String,
    pub node_name: String,
    pub net_ns: String,
    pub state: LinkState,
    pub routes: Vec<Route>,
    pub peer_name: String,
    pub peer: Peer,
    #[serde(skip_serializing_if = "is_false")]
    patch: bool,
    /// Keep a switch-to-switch connection as a real veth pair.
    #[serde(skip)]
    pub force_root: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Arguments for `ip`, wrapped in `ip netns exec <ns> ip` when `netns` is set.
pub(crate) fn ip_args<'a>(netns: &'a str, args: &[&'a str]) -> Vec<&'a str> {
    let mut full = Vec::with_capacity(args.len() + 4);
    if !netns.is_empty() {
        full.extend_from_slice(&["netns", "exec", netns, "ip"]);
    }
    full.extend_from_slice(args);
    full
}

impl Link {
    /// A link with only its name set; everything else is derived on pairing.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn is_patch(&self) -> bool {
        self.patch
    }

    /// Address part of the link's CIDR, if it has one.
    pub fn ip(&self) -> Option<Ipv4Addr> {
        Ipv4Network::from_str(&self.cidr).ok().map(|n| n.ip())
    }

    fn fill_cidr(&mut self, pool: &AddressPool) -> Result<()> {
        if self.cidr.is_empty() {
            self.cidr = pool.next_cidr(None)?;
        }
        Ok(())
    }

    fn fill_hw_addr(&mut self, pool: &AddressPool) -> Result<()> {
        if self.hw_addr.is_empty() {
            self.hw_addr = pool.next_mac(pool.mac_seed())?;
        }
        Ok(())
    }

    fn fill_net_ns(&mut self, node: &dyn Node) {
        if self.net_ns == ROOT_NETNS {
            self.net_ns.clear();
            return;
        }
        if self.net_ns.is_empty()
            && let Some(netns) = node.netns()
        {
            self.net_ns = netns.to_string();
        }
    }

    /// Namespaced links are `veth<N>`; root links are `<node>-<prefix><N>`,
    /// where `N` is the owner's current link count.
    fn fill_name(&mut self, node: &dyn Node, prefix: &str) {
        if !self.name.is_empty() {
            return;
        }
        let index = node.links_count();
        self.name = if self.net_ns.is_empty() {
            format!("{}-{prefix}{index}", node.name())
        } else {
            format!("veth{index}")
        };
    }

    fn fill_node_name(&mut self, node: &dyn Node) {
        if self.node_name.is_empty() {
            self.node_name = node.name().to_string();
        }
    }

    fn point_at(&mut self, other: &Link) {
        self.peer = Peer {
            name: other.name.clone(),
            if_name: other.name.clone(),
            node_name: other.node_name.clone(),
        };
    }

    /// Whether the interface is present in its namespace.
    pub async fn exists(&self, executor: &dyn Executor) -> bool {
        let args = ip_args(&self.net_ns, &["link", "show", &self.name]);
        executor.run("ip", &args).await.is_ok()
    }

    pub async fn up(&self, executor: &dyn Executor) -> Result<()> {
        let args = ip_args(&self.net_ns, &["link", "set", &self.name, "up"]);
        executor.run("ip", &args).await?;
        Ok(())
    }

    /// Assign the link's CIDR. A CIDR that does not parse means "no address".
    pub async fn apply_cidr(&self, executor: &dyn Executor) -> Result<()> {
        if Ipv4Network::from_str(&self.cidr).is_err() {
            trace!(link = %self.name, cidr = %self.cidr, "no usable address, skipping");
            return Ok(());
        }
        let args = ip_args(&self.net_ns, &["addr", "add", &self.cidr, "dev", &self.name]);
        executor.run("ip", &args).await?;
        Ok(())
    }

    pub async fn apply_routes(&self, executor: &dyn Executor) -> Result<()> {
        for route in &self.routes {
            let args = ip_args(&self.net_ns, &["route", "add", &route.dst, "via", &route.gw]);
            executor.run("ip", &args).await?;
        }
        Ok(())
    }

    pub async fn move_to_ns(&self, executor: &dyn Executor, netns: &str) -> Result<()> {
        executor
            .run("ip", &["link", "set", &self.name, "netns", netns])
            .await?;
        Ok(())
    }

    /// Delete the interface. Failures are logged, not returned.
    pub async fn release(&self, executor: &dyn Executor) {
        let args = ip_args(&self.net_ns, &["link", "delete", &self.name]);
        if let Err(e) = executor.run("ip", &args).await {
            warn!(link = %self.name, node = %self.node_name, error = %e, "failed to delete link");
        }
    }
}

/// Both endpoints of one logical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub left: Link,
    pub right: Link,
}

impl Pair {
    /// Build a pair between two nodes with every field derived.
    pub fn new(left: &dyn Node, right: &dyn Node, pool: &AddressPool) -> Result<Self> {
        Self::with_overrides(left, right, Link::default(), Link::default(), pool)
    }

    /// Build a pair from partial links; empty fields are derived.
    ///
    /// Two switches get patch links without addressing. Anything involving a
    /// host gets an address, a MAC, the node's namespace and state `DOWN`.
    pub fn with_overrides(
        left: &dyn Node,
        right: &dyn Node,
        mut left_link: Link,
        mut right_link: Link,
        pool: &AddressPool,
    ) -> Result<Self> {
        let switches = left.kind() == NodeKind::Switch && right.kind() == NodeKind::Switch;

        for (link, node) in [(&mut left_link, left), (&mut right_link, right)] {
            if switches {
                link.fill_node_name(node);
                link.fill_name(node, PATCH_PREFIX);
                if !link.force_root {
                    link.patch = true;
                }
            } else {
                link.fill_cidr(pool)?;
                link.fill_hw_addr(pool)?;
                link.fill_net_ns(node);
                link.fill_name(node, ETH_PREFIX);
                link.fill_node_name(node);
                link.state = LinkState::Down;
            }
        }

        left_link.point_at(&right_link);
        right_link.point_at(&left_link);

        Ok(Self {
            left: left_link,
            right: right_link,
        })
    }

    /// Pair two already-declared links.
    pub fn from_links(left: Link, right: Link) -> Self {
        Self { left, right }
    }

    pub fn is_patch(&self) -> bool {
        self.left.patch
    }

    /// The side owned by `node_name` (the right side when neither matches).
    pub fn by_node_name(&self, node_name: &str) -> &Link {
        if self.left.node_name == node_name {
            &self.left
        } else {
            &self.right
        }
    }

    /// Key identifying the connection regardless of direction.
    pub fn dedup_key(&self) -> String {
        let left = format!("{}:{}", self.left.node_name, self.left.name);
        let right = format!("{}:{}", self.right.node_name, self.right.name);
        if left <= right {
            format!("{left}|{right}")
        } else {
            format!("{right}|{left}")
        }
    }

    /// Create the veth pair. The right side is created directly in its
    /// namespace; the left side is moved afterwards.
    pub async fn create(&self, executor: &dyn Executor) -> Result<()> {
        let mut args: Vec<&str> = vec!["link", "add", "name", &self.left.name];
        if !self.left.hw_addr.is_empty() {
            args.extend_from_slice(&["address", &self.left.hw_addr]);
        }
        args.extend_from_slice(&["type", "veth", "peer", "name", &self.right.name]);
        if !self.right.hw_addr.is_empty() {
            args.extend_from_slice(&["address", &self.right.hw_addr]);
        }
        if !self.right.net_ns.is_empty() {
            args.extend_from_slice(&["netns", &self.right.net_ns]);
        }
        executor.run("ip", &args).await?;

        if !self.left.net_ns.is_empty() {
            self.left.move_to_ns(executor, &self.left.net_ns).await?;
        }
        Ok(())
    }

    /// Address both sides, bring them up and install the right side's routes.
    /// Patch pairs come up with the switch fabric and are left untouched.
    pub async fn up(&mut self, executor: &dyn Executor) -> Result<()> {
        if self.is_patch() {
            return Ok(());
        }

        self.left.apply_cidr(executor).await?;
        self.right.apply_cidr(executor).await?;
        self.left.up(executor).await?;
        self.right.up(executor).await?;
        self.right.apply_routes(executor).await?;

        self.left.state = LinkState::Up;
        self.right.state = LinkState::Up;

        info!(
            left = %format_args!("{}/{}", self.left.node_name, self.left.name),
            left_cidr = %self.left.cidr,
            right = %format_args!("{}/{}", self.right.node_name, self.right.name),
            right_cidr = %self.right.cidr,
            "link up"
        );
        Ok(())
    }

    /// Delete both interfaces, best-effort.
    pub async fn release(&self, executor: &dyn Executor) {
        self.left.release(executor).await;
        self.right.release(executor).await;
    }
}
