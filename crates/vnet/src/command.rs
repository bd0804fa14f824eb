use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{trace, warn};

/// Error from a failed command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// How a command should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Prefix with `sudo`.
    Sudo,
    /// Run as the current user.
    User,
}

/// A long-running child started through [`Executor::spawn`].
///
/// `exited` resolves with a human-readable exit status once the child is gone.
#[derive(Debug)]
pub struct Spawned {
    pub pid: u32,
    pub exited: oneshot::Receiver<String>,
}

/// Every OS mutation the topology engine performs goes through this seam.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run `program` to completion. Returns trimmed stdout on success.
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError>;

    /// Start `argv` in the background with stdout and stderr sent to `output`.
    async fn spawn(&self, argv: &[String], output: &Path) -> Result<Spawned, CommandError>;

    /// Full path of `program` on the resolvable command path.
    fn resolve(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

/// Executor backed by real processes.
#[derive(Debug, Clone, Copy)]
pub struct SystemExecutor {
    privilege: Privilege,
}

impl SystemExecutor {
    pub fn new(privilege: Privilege) -> Self {
        Self { privilege }
    }
}

#[async_trait]
impl Executor for SystemExecutor {
    async fn run(&self, program: &str, args: &[&str]) -> Result<String, CommandError> {
        exec(program, args, self.privilege).await
    }

    async fn spawn(&self, argv: &[String], output: &Path) -> Result<Spawned, CommandError> {
        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        let Some((&program, rest)) = args.split_first() else {
            return Err(CommandError {
                command: String::new(),
                detail: "empty command line".into(),
            });
        };
        let cmd_display = format_command_display(program, rest, self.privilege);
        trace!(command = %cmd_display, output = %output.display(), "spawn");

        let fail = |detail: String| CommandError {
            command: cmd_display.clone(),
            detail,
        };

        let stdout = std::fs::File::create(output)
            .map_err(|e| fail(format!("create {}: {e}", output.display())))?;
        let stderr = stdout
            .try_clone()
            .map_err(|e| fail(format!("clone {}: {e}", output.display())))?;

        let mut command = match self.privilege {
            Privilege::Sudo => {
                let mut c = Command::new("sudo");
                c.args(&args);
                c
            }
            Privilege::User => {
                let mut c = Command::new(program);
                c.args(rest);
                c
            }
        };

        let mut child = command
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| fail(e.to_string()))?;

        let pid = child
            .id()
            .ok_or_else(|| fail("child exited before its pid was read".into()))?;

        let (tx, exited) = oneshot::channel();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => {
                    warn!(pid, error = %e, "failed to wait for child");
                    format!("wait failed: {e}")
                }
            };
            let _ = tx.send(status);
        });

        Ok(Spawned { pid, exited })
    }
}

/// Format a human-readable display string for a direct command invocation.
pub(crate) fn format_command_display(program: &str, args: &[&str], privilege: Privilege) -> String {
    let mut parts = Vec::with_capacity(args.len() + 2);
    if matches!(privilege, Privilege::Sudo) {
        parts.push("sudo");
    }
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

/// Execute a command.
///
/// Invokes the program binary directly with the given arguments.
/// Returns trimmed stdout on success; on failure the error carries stderr
/// followed by stdout, since tools like `ovs-vsctl` report on either.
pub async fn exec(
    program: &str,
    args: &[&str],
    privilege: Privilege,
) -> Result<String, CommandError> {
    let cmd_display = format_command_display(program, args, privilege);
    trace!(command = %cmd_display, "exec");

    let output = match privilege {
        Privilege::Sudo => {
            let mut sudo_args = vec![program];
            sudo_args.extend_from_slice(args);
            Command::new("sudo").args(&sudo_args).output().await
        }
        Privilege::User => Command::new(program).args(args).output().await,
    };

    let output = output.map_err(|e| CommandError {
        command: cmd_display.clone(),
        detail: e.to_string(),
    })?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = [stderr.trim(), stdout.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        Err(CommandError {
            command: cmd_display,
            detail,
        })
    }
}

/// Run a command through `executor`, logging instead of returning failures.
///
/// Used on teardown paths where every step must run regardless of earlier
/// failures.
pub async fn run_best_effort(executor: &dyn Executor, program: &str, args: &[&str]) {
    if let Err(e) = executor.run(program, args).await {
        warn!(command = %e.command, detail = %e.detail, "command failed (ignored)");
    }
}
