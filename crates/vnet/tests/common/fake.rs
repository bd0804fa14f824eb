//! In-memory stand-in for the kernel and Open vSwitch.
//!
//! Shared between the library's unit tests and the integration tests; it only
//! relies on the executor types re-exported by its parent module.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use super::{CommandError, Executor, Spawned};

const FIRST_PID: u32 = 4000;

#[derive(Default)]
struct State {
    calls: Vec<String>,
    spawned: Vec<String>,
    netns: BTreeSet<String>,
    /// (namespace, interface); the root namespace is "".
    links: BTreeSet<(String, String)>,
    bridges: BTreeMap<String, Vec<String>>,
    /// pid -> (namespace, command line)
    procs: BTreeMap<u32, (String, String)>,
    exits: HashMap<u32, oneshot::Sender<String>>,
    next_pid: u32,
    fail_on: Vec<String>,
    hidden: HashSet<String>,
}

pub struct FakeExecutor {
    state: Mutex<State>,
}

fn fail(command: &str, detail: &str) -> CommandError {
    CommandError {
        command: command.to_string(),
        detail: detail.to_string(),
    }
}

fn basename(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_pid: FIRST_PID,
                ..State::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every `run` invocation so far, as `program arg...`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Every `spawn` invocation so far, as `argv...`.
    pub fn spawned(&self) -> Vec<String> {
        self.state().spawned.clone()
    }

    pub fn add_netns(&self, name: &str) {
        self.state().netns.insert(name.to_string());
    }

    pub fn has_link(&self, netns: &str, name: &str) -> bool {
        self.state()
            .links
            .contains(&(netns.to_string(), name.to_string()))
    }

    pub fn link_count(&self) -> usize {
        self.state().links.len()
    }

    /// Pretend a process is already running in `netns`.
    pub fn add_process(&self, netns: &str, cmdline: &str) -> u32 {
        let mut state = self.state();
        let pid = state.next_pid;
        state.next_pid += 1;
        state
            .procs
            .insert(pid, (netns.to_string(), cmdline.to_string()));
        pid
    }

    pub fn process_alive(&self, pid: u32) -> bool {
        self.state().procs.contains_key(&pid)
    }

    /// Make the spawned process `pid` exit.
    pub fn finish(&self, pid: u32) {
        let mut state = self.state();
        state.procs.remove(&pid);
        if let Some(tx) = state.exits.remove(&pid) {
            let _ = tx.send("exit status: 0".to_string());
        }
    }

    /// Fail every command or spawn whose rendered line contains `needle`.
    pub fn fail_on(&self, needle: &str) {
        self.state().fail_on.push(needle.to_string());
    }

    /// Make `resolve` report `program` as missing.
    pub fn hide_binary(&self, program: &str) {
        self.state().hidden.insert(program.to_string());
    }
}

impl Default for FakeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn ip(&mut self, line: &str, netns: &str, args: &[&str]) -> Result<String, CommandError> {
        let ns = netns.to_string();
        match args {
            ["netns", "list"] => Ok(self
                .netns
                .iter()
                .enumerate()
                .map(|(id, name)| format!("{name} (id: {id})"))
                .collect::<Vec<_>>()
                .join("\n")),
            ["netns", "add", name] => {
                if self.netns.insert(name.to_string()) {
                    Ok(String::new())
                } else {
                    Err(fail(line, "File exists"))
                }
            }
            ["netns", "del", name] => {
                if !self.netns.remove(*name) {
                    return Err(fail(line, "No such file or directory"));
                }
                self.links.retain(|(owner, _)| owner.as_str() != *name);
                Ok(String::new())
            }
            ["netns", "identify", pid] => {
                let pid: u32 = pid.parse().map_err(|_| fail(line, "bad pid"))?;
                self.procs
                    .get(&pid)
                    .map(|(ns, _)| ns.clone())
                    .ok_or_else(|| fail(line, "No such process"))
            }
            ["netns", "exec", target, rest @ ..] => {
                if !self.netns.contains(*target) {
                    return Err(fail(line, "Cannot open network namespace"));
                }
                match rest.split_first() {
                    Some((program, inner)) if basename(program) == "ip" => {
                        self.ip(line, target, inner)
                    }
                    _ => Ok(String::new()),
                }
            }
            ["link", "show", name] => {
                if self.links.contains(&(ns, name.to_string())) {
                    Ok(format!("1: {name}: <BROADCAST,MULTICAST> mtu 1500"))
                } else {
                    Err(fail(line, "Device does not exist."))
                }
            }
            ["link", "add", "name", left, rest @ ..] => {
                let peer_at = rest
                    .iter()
                    .position(|a| *a == "peer")
                    .ok_or_else(|| fail(line, "missing peer"))?;
                let peer_args = rest.get(peer_at + 1..).unwrap_or_default();
                let right = match peer_args {
                    ["name", right, ..] => right.to_string(),
                    _ => return Err(fail(line, "missing peer name")),
                };
                let right_ns = match peer_args.iter().position(|a| *a == "netns") {
                    Some(at) => peer_args
                        .get(at + 1)
                        .map(|n| n.to_string())
                        .ok_or_else(|| fail(line, "missing netns"))?,
                    None => ns.clone(),
                };
                if !right_ns.is_empty() && !self.netns.contains(&right_ns) {
                    return Err(fail(line, "Cannot open network namespace"));
                }
                let left = (ns, left.to_string());
                let right = (right_ns, right);
                if self.links.contains(&left) || self.links.contains(&right) {
                    return Err(fail(line, "RTNETLINK answers: File exists"));
                }
                self.links.insert(left);
                self.links.insert(right);
                Ok(String::new())
            }
            ["link", "set", name, "netns", target] => {
                if !self.netns.contains(*target) {
                    return Err(fail(line, "Cannot open network namespace"));
                }
                if !self.links.remove(&(ns, name.to_string())) {
                    return Err(fail(line, "Cannot find device"));
                }
                self.links.insert((target.to_string(), name.to_string()));
                Ok(String::new())
            }
            ["link", "delete", name] => {
                if self.links.remove(&(ns, name.to_string())) {
                    Ok(String::new())
                } else {
                    Err(fail(line, "Cannot find device"))
                }
            }
            _ => Ok(String::new()),
        }
    }

    fn ovs(&mut self, line: &str, args: &[&str]) -> Result<String, CommandError> {
        match args {
            ["br-exists", bridge] => {
                if self.bridges.contains_key(*bridge) {
                    Ok(String::new())
                } else {
                    Err(fail(line, ""))
                }
            }
            ["add-br", bridge] => {
                if self.bridges.contains_key(*bridge) {
                    return Err(fail(line, "bridge already exists"));
                }
                self.bridges.insert(bridge.to_string(), Vec::new());
                Ok(String::new())
            }
            ["del-br", bridge] => match self.bridges.remove(*bridge) {
                Some(_) => Ok(String::new()),
                None => Err(fail(line, "no bridge named")),
            },
            ["add-port", bridge, port] => {
                let ports = self
                    .bridges
                    .get_mut(*bridge)
                    .ok_or_else(|| fail(line, "no bridge named"))?;
                if ports.iter().any(|p| p == port) {
                    return Err(fail(line, "already exists on bridge"));
                }
                ports.push(port.to_string());
                Ok(String::new())
            }
            ["list-ports", bridge] => self
                .bridges
                .get(*bridge)
                .map(|ports| ports.join("\n"))
                .ok_or_else(|| fail(line, "no bridge named")),
            ["set-controller", bridge, _] => {
                if self.bridges.contains_key(*bridge) {
                    Ok(String::new())
                } else {
                    Err(fail(line, "no bridge named"))
                }
            }
            _ => Ok(String::new()),
        }
    }

    fn ps(&self) -> String {
        let mut out = vec!["    PID,COMMAND".to_string()];
        out.extend(
            self.procs
                .iter()
                .map(|(pid, (_, cmdline))| format!("{pid:>7},{cmdline}")),
        );
        out.join("\n")
    }

    fn kill(&mut self, line: &str, args: &[&str]) -> Result<String, CommandError> {
        let pid = match args {
            [_, pid] | [pid] => pid.parse::<u32>().map_err(|_| fail(line, "bad pid"))?,
            _ => return Err(fail(line, "usage")),
        };
        if self.procs.remove(&pid).is_none() {
            return Err(fail(line, "No such process"));
        }
        if let Some(tx) = self.exits.remove(&pid) {
            let _ = tx.send("signal: 2 (SIGINT)".to_string());
        }
        Ok(String::new())
    }
}

#[async_trait::async_trait]
impl Executor for FakeExecutor {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        let line = std::iter::once(program)
            .chain(args.iter().copied())
            .collect::<Vec<_>>()
            .join(" ");
        let mut state = self.state();
        state.calls.push(line.clone());

        if state.fail_on.iter().any(|needle| line.contains(needle.as_str())) {
            return Err(fail(&line, "injected failure"));
        }

        match basename(program) {
            "ip" => state.ip(&line, "", args),
            "ovs-vsctl" => state.ovs(&line, args),
            "ps" => Ok(state.ps()),
            "kill" => state.kill(&line, args),
            _ => Ok(String::new()),
        }
    }

    async fn spawn(&self, argv: &[String], _output: &Path) -> Result<Spawned, CommandError> {
        let line = argv.join(" ");
        let mut state = self.state();
        state.spawned.push(line.clone());

        if state.fail_on.iter().any(|needle| line.contains(needle.as_str())) {
            return Err(fail(&line, "injected failure"));
        }

        let exec_at = argv
            .windows(2)
            .position(|w| matches!(w, [a, b] if a == "netns" && b == "exec"));
        let (netns, cmdline) = match exec_at {
            Some(at) => (
                argv.get(at + 2).cloned().unwrap_or_default(),
                argv.get(at + 3..).unwrap_or_default().join(" "),
            ),
            None => (String::new(), line.clone()),
        };
        if !netns.is_empty() && !state.netns.contains(&netns) {
            return Err(fail(&line, "Cannot open network namespace"));
        }

        let pid = state.next_pid;
        state.next_pid += 1;
        state.procs.insert(pid, (netns, cmdline));
        let (tx, exited) = oneshot::channel();
        state.exits.insert(pid, tx);
        Ok(Spawned { pid, exited })
    }

    fn resolve(&self, program: &str) -> Option<PathBuf> {
        if self.state().hidden.contains(program) {
            None
        } else {
            Some(Path::new("/usr/sbin").join(program))
        }
    }
}
