use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "overseer", about = "A privileged process supervisor", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the supervisor (must be root)
    Daemon {
        /// Directory of service files
        #[arg(long)]
        config_dir: Option<PathBuf>,
    },
    /// Start a stopped or failed service
    Start { name: String },
    /// Stop a running service
    Stop { name: String },
    /// Stop a running service, then start it again
    Restart { name: String },
    /// List all services and their status
    List,
    /// Follow a running service's output
    Log { name: String },
}

impl Command {
    /// The argv sent to the daemon, or `None` for commands run locally.
    pub fn to_args(&self) -> Option<Vec<String>> {
        let (cmd, name) = match self {
            Command::Daemon { .. } => return None,
            Command::Start { name } => ("start", Some(name)),
            Command::Stop { name } => ("stop", Some(name)),
            Command::Restart { name } => ("restart", Some(name)),
            Command::List => ("list", None),
            Command::Log { name } => ("log", Some(name)),
        };
        let mut args = vec![cmd.to_string()];
        args.extend(name.cloned());
        Some(args)
    }
}
