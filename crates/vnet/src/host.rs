use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cgroup::Cgroup;
use crate::command::{Executor, run_best_effort};
use crate::context::Context;
use crate::error::{NetError, Result};
use crate::link::Link;
use crate::netns::NetNs;
use crate::node::{Node, NodeKind};
use crate::process::Process;

/// An emulated machine: a namespace named after the host, its links, its
/// supervised processes and an optional cgroup.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Host {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroup: Option<Cgroup>,
    pub name: String,
    pub links: Vec<Link>,
    /// Shared with exit watchers, which clear the pid of finished children.
    procs: Arc<Mutex<Vec<Process>>>,
}

impl Host {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn netns_handle(&self) -> NetNs {
        NetNs::new(&self.name)
    }

    fn lock_procs(&self) -> MutexGuard<'_, Vec<Process>> {
        self.procs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the supervised processes.
    pub fn procs(&self) -> Vec<Process> {
        self.lock_procs().clone()
    }

    /// Declare a process without starting it. `recover` launches it.
    pub fn declare_process(&self, process: Process) {
        self.lock_procs().push(process);
    }

    /// Record `link`, replacing an entry with the same name.
    pub fn register(&mut self, link: Link) {
        match self.links.iter_mut().find(|l| l.name == link.name) {
            Some(existing) => *existing = link,
            None => self.links.push(link),
        }
    }

    /// Bring the host's OS objects into existence: namespace, loopback,
    /// cgroup, and forwarding when the host routes between several links.
    pub async fn provision(&self, executor: &dyn Executor) -> Result<()> {
        self.netns_handle().ensure(executor).await?;
        run_best_effort(
            executor,
            "ip",
            &["netns", "exec", &self.name, "ip", "link", "set", "lo", "up"],
        )
        .await;

        if let Some(cgroup) = &self.cgroup {
            cgroup.create(executor).await?;
        }

        if self.links.len() > 1
            && let Err(e) = self.enable_forwarding(executor).await
        {
            warn!(host = %self.name, error = %e, "failed to enable forwarding");
        }
        debug!(host = %self.name, links = self.links.len(), "host provisioned");
        Ok(())
    }

    pub async fn enable_forwarding(&self, executor: &dyn Executor) -> Result<()> {
        self.run_command(executor, &["sysctl", "-w", "net.ipv4.ip_forward=1"])
            .await?;
        Ok(())
    }

    /// `cgexec` prefix (when a cgroup is set) followed by `ip netns exec <host>`.
    pub fn command_prefix(&self, executor: &dyn Executor) -> Result<Vec<String>> {
        let ip = executor
            .resolve("ip")
            .ok_or_else(|| NetError::PreconditionMissing("ip not found in PATH".into()))?;

        let mut prefix = self
            .cgroup
            .as_ref()
            .map(Cgroup::exec_prefix)
            .unwrap_or_default();
        prefix.extend([
            ip.display().to_string(),
            "netns".to_string(),
            "exec".to_string(),
            self.name.clone(),
        ]);
        Ok(prefix)
    }

    /// Run a short command inside the host and return its output.
    pub async fn run_command(&self, executor: &dyn Executor, argv: &[&str]) -> Result<String> {
        let prefix = self.command_prefix(executor)?;
        let mut full: Vec<&str> = prefix.iter().map(String::as_str).collect();
        full.extend_from_slice(argv);
        let Some((&program, args)) = full.split_first() else {
            return Err(NetError::InvalidScheme("empty command".into()));
        };
        Ok(executor.run(program, args).await?)
    }

    /// Launch `argv` inside the host under supervision and return its pid.
    pub async fn run_process(&self, ctx: &Context, argv: &[String]) -> Result<u32> {
        let Some((command, args)) = argv.split_first() else {
            return Err(NetError::InvalidScheme(format!(
                "empty command for host {}",
                self.name
            )));
        };
        let process = Process {
            command: command.clone(),
            args: args.to_vec(),
            ..Process::default()
        };
        self.launch(ctx, process, None).await
    }

    /// Start `process` and store it at `slot` (or append it), then watch it.
    async fn launch(&self, ctx: &Context, mut process: Process, slot: Option<usize>) -> Result<u32> {
        let mut argv = self.command_prefix(ctx.exec())?;
        argv.extend(process.argv());

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let output = ctx.output_dir().join(format!("{}-{stamp}.out", self.name));

        let spawned = ctx.exec().spawn(&argv, &output).await?;
        let pid = spawned.pid;
        process.pid = Some(pid);
        process.output = output.display().to_string();
        let command_line = process.command_line();

        {
            let mut procs = self.lock_procs();
            match slot.and_then(|index| procs.get_mut(index)) {
                Some(existing) => *existing = process,
                None => procs.push(process),
            }
        }

        info!(
            host = %self.name,
            pid,
            command = %command_line,
            output = %output.display(),
            "process started"
        );

        let procs = Arc::clone(&self.procs);
        let host = self.name.clone();
        let exited = spawned.exited;
        tokio::spawn(async move {
            let status = exited.await.unwrap_or_else(|_| "unknown".to_string());
            procs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter_mut()
                .filter(|p| p.pid == Some(pid))
                .for_each(|p| p.pid = None);
            info!(host = %host, pid, command = %command_line, status = %status, "process exited");
        });

        Ok(pid)
    }

    /// Attach pids to declared processes that are running in the host's
    /// namespace but are not tracked by this handle.
    async fn rediscover_procs(&self, executor: &dyn Executor) {
        for (index, process) in self.procs().into_iter().enumerate() {
            if process.is_running() {
                continue;
            }
            match process.find_running(executor, &self.name).await {
                Ok(Some(pid)) => {
                    if let Some(existing) = self.lock_procs().get_mut(index) {
                        existing.pid = Some(pid);
                    }
                    debug!(host = %self.name, pid, command = %process.command_line(), "process found");
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(host = %self.name, command = %process.command_line(), error = %e, "failed to look up process");
                }
            }
        }
    }

    /// Re-attach every declared process that is still running in the host's
    /// namespace and relaunch the rest.
    pub async fn recover_procs(&self, ctx: &Context) -> Result<()> {
        for (index, process) in self.procs().into_iter().enumerate() {
            let running = process.find_running(ctx.exec(), &self.name).await?;
            match running {
                Some(pid) => {
                    if let Some(existing) = self.lock_procs().get_mut(index) {
                        existing.pid = Some(pid);
                    }
                    info!(host = %self.name, pid, command = %process.command_line(), "process re-attached");
                }
                None => {
                    let missing = NetError::ProcessNotRunning(process.command_line());
                    warn!(host = %self.name, error = %missing, "relaunching");
                    self.launch(ctx, process, Some(index)).await?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Node for Host {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Host
    }

    fn netns(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn links(&self) -> &[Link] {
        &self.links
    }

    async fn release(&self, executor: &dyn Executor) {
        // Pids are not persisted; find them while the namespace still has a name.
        self.rediscover_procs(executor).await;

        self.netns_handle().release(executor).await;

        for link in &self.links {
            link.release(executor).await;
        }

        for process in self.procs().iter().filter(|p| p.is_running()) {
            if let Err(e) = process.stop(executor).await {
                warn!(host = %self.name, command = %process.command_line(), error = %e, "failed to stop process");
            }
        }

        if let Some(cgroup) = &self.cgroup {
            cgroup.release(executor).await;
        }
    }
}
