use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::command::Executor;
use crate::error::{NetError, Result};
use crate::netns;

/// A long-running command supervised inside a host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Process {
    pub command: String,
    pub args: Vec<String>,
    pub output: String,
    #[serde(skip)]
    pub pid: Option<u32>,
}

impl Process {
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }

    /// The command line as `ps` prints it.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.command.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    /// Send `SIGINT` to the process.
    pub async fn stop(&self, executor: &dyn Executor) -> Result<()> {
        let Some(pid) = self.pid else {
            return Err(NetError::ProcessNotRunning(self.command_line()));
        };
        let pid = pid.to_string();
        executor.run("kill", &["-INT", &pid]).await?;
        debug!(pid = %pid, command = %self.command_line(), "interrupt sent");
        Ok(())
    }

    /// Pid of a process with exactly this command line running in `netns`.
    pub async fn find_running(&self, executor: &dyn Executor, netns: &str) -> Result<Option<u32>> {
        let listing = executor.run("ps", &["-A", "-o", "%p,%a"]).await?;
        let wanted = self.command_line();

        for line in listing.lines() {
            let Some((pid, cmdline)) = line.split_once(',') else {
                continue;
            };
            let Ok(pid) = pid.trim().parse::<u32>() else {
                continue;
            };
            if cmdline.trim() != wanted {
                continue;
            }
            let found_in = netns::identify(executor, pid).await;
            trace!(pid, netns = %found_in, command = %wanted, "candidate process");
            if found_in == netns {
                return Ok(Some(pid));
            }
        }
        Ok(None)
    }
}
