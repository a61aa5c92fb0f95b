//! Daemon runtime for foreman: configuration, routing, budget, workspaces,
//! agent supervision, the polling scheduler and the local control surface.

pub mod agent_prompt;
pub mod agent_report;
pub mod budget;
pub mod config;
pub mod control;
pub mod daemon;
pub mod failure;
pub mod process;
pub mod router;
pub mod scheduler;
pub mod session_outcome;
pub mod supervisor;
pub mod turn_tracking;
pub mod workspace;

use std::sync::Arc;

use anyhow::{Context, Result};
use foreman_tracker::{GithubTracker, RepoRef};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

pub use config::ForemanConfig;
pub use control::ControlHandle;
pub use daemon::{
    inspect_daemon, record_daemon_start, record_daemon_stop, render_daemon_status_report,
    spawn_detached_daemon, stop_daemon, wait_for_daemon_start, DaemonStatusReport,
};
pub use scheduler::{Scheduler, SchedulerContext, WakeReport};
pub use workspace::{CheckoutBackend, GitWorktreeBackend};

/// Runs the scheduler and the control surface in the foreground until Ctrl-C
/// or SIGTERM.
pub async fn run_foreground_daemon(config: ForemanConfig) -> Result<()> {
    config.validate()?;
    let token = std::env::var(&config.tracker.token_env).with_context(|| {
        format!(
            "tracker token environment variable '{}' is not set",
            config.tracker.token_env
        )
    })?;
    let repo = RepoRef::parse(&config.tracker.repo)?;
    let tracker = GithubTracker::new(
        config.tracker.api_base.clone(),
        token,
        repo,
        config.tracker.request_timeout_ms,
        config.tracker.retry_max_attempts,
        config.tracker.retry_base_delay_ms,
    )?;
    let backend = GitWorktreeBackend::new(config.workspace.repo_root.clone());

    let listener = TcpListener::bind(&config.control.bind)
        .await
        .with_context(|| format!("failed to bind control surface on {}", config.control.bind))?;
    let state_dir = config.state_dir.clone();
    let bind = config.control.bind.clone();
    let ctx = SchedulerContext::new(config, Arc::new(tracker), Arc::new(backend))?;
    let control = ControlHandle::new();
    let scheduler = Scheduler::new(ctx, control.clone());

    let report = record_daemon_start(&state_dir, &bind)?;
    info!(
        pid = ?report.pid,
        bind = %bind,
        state_dir = %state_dir.display(),
        "foreman daemon started"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(control::serve_control_surface(
        listener,
        control,
        shutdown_rx.clone(),
    ));
    let signals = tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let run_result = scheduler.run(shutdown_rx).await;
    signals.abort();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(error = %format!("{error:#}"), "control surface stopped with error"),
        Err(error) => warn!(error = %error, "control surface task failed"),
    }

    let stop_reason = if run_result.is_ok() { "signal" } else { "scheduler_error" };
    if let Err(error) = record_daemon_stop(&state_dir, Some(stop_reason)) {
        warn!(error = %format!("{error:#}"), "failed to record daemon stop");
    }
    run_result
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(error) => {
                warn!(error = %error, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
