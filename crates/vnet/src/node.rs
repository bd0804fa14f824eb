use async_trait::async_trait;

use crate::command::Executor;
use crate::host::Host;
use crate::link::{Link, Peer};
use crate::switch::Switch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Host,
    Switch,
}

/// Capabilities shared by every element of a topology.
#[async_trait]
pub trait Node: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> NodeKind;

    /// Namespace the node's interfaces live in, `None` for the root namespace.
    fn netns(&self) -> Option<&str>;

    /// Declared links (host) or ports (switch), in declaration order.
    fn links(&self) -> &[Link];

    fn links_count(&self) -> usize {
        self.links().len()
    }

    /// The link a peer reference points at.
    fn link_by_peer(&self, peer: &Peer) -> Option<&Link> {
        self.links()
            .iter()
            .find(|link| link.node_name == peer.node_name && link.name == peer.if_name)
    }

    /// Tear down every OS object the node owns. Never fails; problems are logged.
    async fn release(&self, executor: &dyn Executor);
}

/// Borrowed node resolved from a scheme by name.
#[derive(Clone, Copy)]
pub enum NodeRef<'a> {
    Host(&'a Host),
    Switch(&'a Switch),
}

impl<'a> NodeRef<'a> {
    pub fn as_node(&self) -> &'a dyn Node {
        match *self {
            Self::Host(host) => host,
            Self::Switch(switch) => switch,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.as_node().kind()
    }
}
