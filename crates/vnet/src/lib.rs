mod cgroup;
mod command;
mod context;
mod error;
mod host;
mod link;
mod netns;
mod node;
mod pool;
mod prerequisites;
mod process;
mod scheme;
mod switch;

#[cfg(test)]
#[allow(dead_code)]
#[path = "../tests/common/fake.rs"]
mod fake;

pub use cgroup::{Cgroup, Controller, Param, ParamValue};
pub use command::{CommandError, Executor, Privilege, Spawned, SystemExecutor, exec};
pub use context::Context;
pub use error::{NetError, Result};
pub use host::Host;
pub use link::{Link, LinkState, Pair, Peer, Route};
pub use netns::{NetNs, identify};
pub use node::{Node, NodeKind, NodeRef};
pub use pool::{AddressPool, hardware_seed};
pub use prerequisites::check_prerequisites;
pub use process::Process;
pub use scheme::Scheme;
pub use switch::Switch;
