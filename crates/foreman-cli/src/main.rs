mod bootstrap_helpers;
mod cli_args;
mod control_client;

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use foreman_runtime::{
    inspect_daemon, render_daemon_status_report, run_foreground_daemon, spawn_detached_daemon,
    stop_daemon, wait_for_daemon_start, ForemanConfig,
};
use serde_json::Value;
use tracing::info;

use crate::bootstrap_helpers::init_tracing;
use crate::cli_args::{Cli, CliCommand};
use crate::control_client::ControlClient;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
const START_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let config = load_config(&cli)?;

    match &cli.command {
        CliCommand::Run => run_foreground_daemon(config).await,
        CliCommand::Start => start_background(&cli, &config).await,
        CliCommand::Stop => stop_background(&cli, &config).await,
        CliCommand::Restart => {
            if inspect_daemon(&config.state_dir)?.running {
                stop_background(&cli, &config).await?;
            }
            start_background(&cli, &config).await
        }
        CliCommand::Status => {
            let report = inspect_daemon(&config.state_dir)?;
            println!("{}", render_daemon_status_report(&report));
            if !report.running {
                bail!("foreman daemon is not running");
            }
            let status = control_client(&config)?.get("/status").await?;
            print_json(&status)
        }
        CliCommand::Poll => {
            let response = control_client(&config)?.post("/poll").await?;
            print_json(&response)
        }
        CliCommand::Health => {
            let response = control_client(&config)?.get("/health").await?;
            print_json(&response)
        }
        CliCommand::Cancel { issue } => {
            let response = control_client(&config)?
                .post(&format!("/issues/{issue}/cancel"))
                .await?;
            print_json(&response)
        }
    }
}

fn load_config(cli: &Cli) -> Result<ForemanConfig> {
    let mut config = ForemanConfig::load(&cli.config)?;
    if let Some(state_dir) = &cli.state_dir {
        config.state_dir = state_dir.clone();
    }
    Ok(config)
}

/// The running daemon's recorded bind wins over the local configuration.
fn control_client(config: &ForemanConfig) -> Result<ControlClient> {
    let bind = inspect_daemon(&config.state_dir)
        .ok()
        .and_then(|report| report.control_bind)
        .unwrap_or_else(|| config.control.bind.clone());
    ControlClient::new(&bind, CONTROL_TIMEOUT)
}

async fn start_background(cli: &Cli, config: &ForemanConfig) -> Result<()> {
    config.validate()?;
    let pid = spawn_detached_daemon(&config.state_dir, &cli.config)?;
    info!(pid, "foreman daemon launched");
    let report = wait_for_daemon_start(&config.state_dir, START_TIMEOUT).await?;
    println!("{}", render_daemon_status_report(&report));
    if !report.running {
        bail!(
            "foreman daemon did not report running within {}s; see {}",
            START_TIMEOUT.as_secs(),
            daemon_log_path(&config.state_dir).display()
        );
    }
    Ok(())
}

async fn stop_background(cli: &Cli, config: &ForemanConfig) -> Result<()> {
    let report = stop_daemon(
        &config.state_dir,
        Duration::from_secs(cli.stop_grace_secs),
    )
    .await?;
    println!("{}", render_daemon_status_report(&report));
    Ok(())
}

fn daemon_log_path(state_dir: &Path) -> std::path::PathBuf {
    state_dir.join("logs").join("daemon.log")
}

fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render control response")?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;
    use tempfile::tempdir;

    use super::load_config;
    use crate::cli_args::{Cli, CliCommand};

    #[test]
    fn unit_cli_parses_subcommands_and_global_flags() {
        let cli = Cli::try_parse_from([
            "foreman",
            "cancel",
            "42",
            "--config",
            "/etc/foreman.toml",
            "--state-dir",
            "/var/lib/foreman",
        ])
        .expect("parse");
        assert_eq!(cli.command, CliCommand::Cancel { issue: 42 });
        assert_eq!(cli.config, PathBuf::from("/etc/foreman.toml"));
        assert_eq!(cli.state_dir, Some(PathBuf::from("/var/lib/foreman")));
        assert_eq!(cli.stop_grace_secs, 10);

        assert!(Cli::try_parse_from(["foreman", "cancel", "abc"]).is_err());
        assert!(Cli::try_parse_from(["foreman"]).is_err());
    }

    #[test]
    fn functional_state_dir_flag_overrides_config_file() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("foreman.toml");
        std::fs::write(
            &config_path,
            "state_dir = \"/srv/foreman\"\n\n[polling]\nidle_interval_secs = 120\n",
        )
        .expect("config");

        let cli = Cli::try_parse_from(["foreman", "--config", config_path.to_str().expect("utf8"), "status"])
            .expect("parse");
        let config = load_config(&cli).expect("load");
        assert_eq!(config.state_dir, PathBuf::from("/srv/foreman"));
        assert_eq!(config.polling.idle_interval_secs, 120);

        let override_dir = temp.path().join("state");
        let cli = Cli::try_parse_from([
            "foreman",
            "--config",
            config_path.to_str().expect("utf8"),
            "--state-dir",
            override_dir.to_str().expect("utf8"),
            "run",
        ])
        .expect("parse");
        assert_eq!(load_config(&cli).expect("load").state_dir, override_dir);
    }
}
