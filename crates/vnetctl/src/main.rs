mod cmd;
mod config;
mod error;
mod lock;
#[cfg(test)]
mod testing;

use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::fmt::time::FormatTime;
use vnet::{Privilege, SystemExecutor};

use crate::config::VnetConfig;
use crate::error::CtlResult;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "vnetctl", version, about = "Emulated network topologies on one Linux host")]
struct Cli {
    /// YAML config file
    #[arg(long, short, env = "VNET_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or repair every namespace, bridge, link and process in the state file
    Up,
    /// Remove every namespace, bridge and link in the state file
    Down,
    /// Declare a host
    AddHost { name: String },
    /// Declare an Open vSwitch bridge
    AddSwitch {
        name: String,
        /// OpenFlow controller, e.g. tcp:127.0.0.1:6653
        #[arg(long)]
        controller: Option<String>,
    },
    /// Connect two declared nodes with a new link
    Connect { left: String, right: String },
    /// Start a supervised process inside a host
    Run {
        host: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true, num_args = 1..)]
        argv: Vec<String>,
    },
    /// Print the state file
    Show,
}

fn privilege(config: &VnetConfig) -> Privilege {
    match config.sudo {
        Some(true) => Privilege::Sudo,
        Some(false) => Privilege::User,
        None if nix::unistd::getuid().is_root() => Privilege::User,
        None => Privilege::Sudo,
    }
}

async fn run(cli: Cli) -> CtlResult<()> {
    let config = match &cli.config {
        Some(path) => config::load(path).await?,
        None => VnetConfig::default(),
    };
    let privilege = privilege(&config);
    let session = cmd::Session::new(config, Arc::new(SystemExecutor::new(privilege)), privilege)?;

    match cli.command {
        Command::Up => session.up().await,
        Command::Down => session.down().await,
        Command::AddHost { name } => session.add_host(&name).await,
        Command::AddSwitch { name, controller } => session.add_switch(&name, controller).await,
        Command::Connect { left, right } => {
            let pair = session.connect(&left, &right).await?;
            println!(
                "{}/{} ({}) <-> {}/{} ({})",
                pair.left.node_name,
                pair.left.name,
                pair.left.cidr,
                pair.right.node_name,
                pair.right.name,
                pair.right.cidr
            );
            Ok(())
        }
        Command::Run { host, argv } => {
            let (pid, output) = session.run(&host, &argv).await?;
            println!("{pid} {output}");
            Ok(())
        }
        Command::Show => {
            println!("{}", session.show().await?);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
