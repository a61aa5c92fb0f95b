use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "foreman",
    about = "Issue-resolution daemon that dispatches coding agents against tracked issues",
    version
)]
pub struct Cli {
    #[arg(
        long,
        env = "FOREMAN_CONFIG",
        default_value = "foreman.toml",
        global = true,
        help = "Path to the TOML configuration file. A missing file means all defaults."
    )]
    pub config: PathBuf,

    #[arg(
        long = "state-dir",
        env = "FOREMAN_STATE_DIR",
        global = true,
        help = "Overrides state_dir from the configuration file."
    )]
    pub state_dir: Option<PathBuf>,

    #[arg(
        long = "stop-grace-secs",
        default_value_t = 10,
        global = true,
        help = "Seconds to wait after SIGTERM before the daemon is killed."
    )]
    pub stop_grace_secs: u64,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum CliCommand {
    /// Run the daemon in the foreground.
    Run,
    /// Start the daemon in the background.
    Start,
    /// Stop the background daemon.
    Stop,
    /// Stop then start the background daemon.
    Restart,
    /// Dump active sessions and per-issue states.
    Status,
    /// Force an immediate wake.
    Poll,
    /// Liveness check.
    Health,
    /// Cancel the active agent session for an issue.
    Cancel {
        #[arg(help = "Issue number")]
        issue: u64,
    },
}
