//! Daemon pid/state files and the detached start/stop lifecycle.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use foreman_core::{current_unix_timestamp_ms, write_text_atomic};
use serde::{Deserialize, Serialize};

use crate::process::{process_alive, terminate_gracefully};

const DAEMON_STATE_SCHEMA_VERSION: u32 = 1;
const DAEMON_STATE_FILE_NAME: &str = "daemon-state.json";
const DAEMON_PID_FILE_NAME: &str = "daemon.pid";
const DAEMON_LOG_FILE_NAME: &str = "daemon.log";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DaemonStatusReport {
    pub schema_version: u32,
    pub state_path: String,
    pub running: bool,
    pub pid_file_path: String,
    pub pid_file_exists: bool,
    pub pid: Option<u32>,
    pub control_bind: Option<String>,
    pub state_dir_writable: bool,
    pub last_start_unix_ms: Option<u64>,
    pub last_stop_unix_ms: Option<u64>,
    pub last_stop_reason: Option<String>,
    pub start_count: u64,
    pub stop_count: u64,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DaemonLifecycleState {
    schema_version: u32,
    running: bool,
    pid: Option<u32>,
    control_bind: Option<String>,
    last_start_unix_ms: Option<u64>,
    last_stop_unix_ms: Option<u64>,
    last_stop_reason: Option<String>,
    start_count: u64,
    stop_count: u64,
}

impl Default for DaemonLifecycleState {
    fn default() -> Self {
        Self {
            schema_version: DAEMON_STATE_SCHEMA_VERSION,
            running: false,
            pid: None,
            control_bind: None,
            last_start_unix_ms: None,
            last_stop_unix_ms: None,
            last_stop_reason: None,
            start_count: 0,
            stop_count: 0,
        }
    }
}

/// Records the current process as the running daemon.
pub fn record_daemon_start(state_dir: &Path, control_bind: &str) -> Result<DaemonStatusReport> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create {}", state_dir.display()))?;
    let state_path = daemon_state_path(state_dir);
    let pid_path = daemon_pid_path(state_dir);
    let mut state = load_daemon_state(&state_path)?;

    let pid = std::process::id();
    write_text_atomic(&pid_path, format!("{pid}\n").as_str())
        .with_context(|| format!("failed to write daemon pid file {}", pid_path.display()))?;
    state.running = true;
    state.pid = Some(pid);
    state.control_bind = Some(control_bind.to_string());
    state.last_start_unix_ms = Some(current_unix_timestamp_ms());
    state.last_stop_reason = None;
    state.start_count = state.start_count.saturating_add(1);
    save_daemon_state(&state_path, &state)?;

    inspect_daemon(state_dir)
}

pub fn record_daemon_stop(state_dir: &Path, reason: Option<&str>) -> Result<DaemonStatusReport> {
    let state_path = daemon_state_path(state_dir);
    let pid_path = daemon_pid_path(state_dir);
    let mut state = load_daemon_state(&state_path)?;

    if pid_path.exists() {
        std::fs::remove_file(&pid_path)
            .with_context(|| format!("failed to remove daemon pid file {}", pid_path.display()))?;
    }
    state.running = false;
    state.pid = None;
    state.last_stop_unix_ms = Some(current_unix_timestamp_ms());
    state.stop_count = state.stop_count.saturating_add(1);
    state.last_stop_reason = reason
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| Some("daemon_stop".to_string()));
    save_daemon_state(&state_path, &state)?;

    inspect_daemon(state_dir)
}

/// Reports whether a daemon is running. A daemon counts as running only when
/// the state, the pid file and a live process all agree.
pub fn inspect_daemon(state_dir: &Path) -> Result<DaemonStatusReport> {
    let state_path = daemon_state_path(state_dir);
    let pid_path = daemon_pid_path(state_dir);
    let state = load_daemon_state(&state_path)?;
    let pid_file_pid = read_pid_file(&pid_path);
    let pid_file_exists = pid_path.exists();
    let state_dir_writable = state_dir_accepts_writes(state_dir);
    let pid = pid_file_pid.or(state.pid);
    let process_running = pid.is_some_and(process_alive);

    let mut diagnostics = Vec::new();
    if state.running && !pid_file_exists {
        diagnostics.push("pid_file_missing_for_running_state".to_string());
    }
    if pid_file_exists && !process_running {
        diagnostics.push("stale_pid_file".to_string());
    }
    if !state_dir_writable {
        diagnostics.push("state_dir_not_writable".to_string());
    }

    Ok(DaemonStatusReport {
        schema_version: DAEMON_STATE_SCHEMA_VERSION,
        state_path: state_path.display().to_string(),
        running: state.running && pid_file_exists && process_running,
        pid_file_path: pid_path.display().to_string(),
        pid_file_exists,
        pid: if pid_file_exists { pid } else { None },
        control_bind: state.control_bind,
        state_dir_writable,
        last_start_unix_ms: state.last_start_unix_ms,
        last_stop_unix_ms: state.last_stop_unix_ms,
        last_stop_reason: state.last_stop_reason,
        start_count: state.start_count,
        stop_count: state.stop_count,
        diagnostics,
    })
}

pub fn render_daemon_status_report(report: &DaemonStatusReport) -> String {
    format!(
        "foreman daemon status: state_path={} running={} pid_file={} pid_file_exists={} pid={} control_bind={} state_dir_writable={} start_count={} stop_count={} last_start_unix_ms={} last_stop_unix_ms={} last_stop_reason={} diagnostics={}",
        report.state_path,
        report.running,
        report.pid_file_path,
        report.pid_file_exists,
        render_optional(report.pid),
        report.control_bind.as_deref().unwrap_or("none"),
        report.state_dir_writable,
        report.start_count,
        report.stop_count,
        render_optional(report.last_start_unix_ms),
        render_optional(report.last_stop_unix_ms),
        report
            .last_stop_reason
            .as_deref()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or("none"),
        if report.diagnostics.is_empty() {
            "none".to_string()
        } else {
            report.diagnostics.join(",")
        },
    )
}

fn render_optional<T: ToString>(value: Option<T>) -> String {
    value
        .map(|value| value.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Launches `foreman run` in its own process group with output appended to
/// `<state_dir>/logs/daemon.log`. Returns the child pid.
pub fn spawn_detached_daemon(state_dir: &Path, config_path: &Path) -> Result<u32> {
    let report = inspect_daemon(state_dir)?;
    if report.running {
        bail!(
            "foreman daemon already running with pid {}",
            render_optional(report.pid)
        );
    }
    let log_dir = state_dir.join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;
    let log_path = log_dir.join(DAEMON_LOG_FILE_NAME);
    let stdout = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open daemon log {}", log_path.display()))?;
    let stderr = stdout
        .try_clone()
        .with_context(|| format!("failed to clone daemon log {}", log_path.display()))?;

    let executable = std::env::current_exe().context("failed to resolve foreman executable")?;
    let mut command = Command::new(executable);
    command
        .arg("--config")
        .arg(config_path)
        .arg("--state-dir")
        .arg(state_dir)
        .arg("run")
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    let child = command.spawn().context("failed to spawn foreman daemon")?;
    Ok(child.id())
}

/// Terminates the recorded daemon: SIGTERM, then SIGKILL after `grace`.
pub async fn stop_daemon(state_dir: &Path, grace: Duration) -> Result<DaemonStatusReport> {
    let report = inspect_daemon(state_dir)?;
    let Some(pid) = report.pid.filter(|_| report.running) else {
        if report.pid_file_exists {
            return record_daemon_stop(state_dir, Some("stale_pid_file_cleared"));
        }
        bail!("foreman daemon is not running in '{}'", state_dir.display());
    };
    let graceful = terminate_gracefully(pid, grace).await?;
    if !graceful || daemon_pid_path(state_dir).exists() {
        let reason = if graceful { "daemon_stop" } else { "daemon_killed" };
        return record_daemon_stop(state_dir, Some(reason));
    }
    inspect_daemon(state_dir)
}

/// Waits until the daemon's control surface has had time to come up.
pub async fn wait_for_daemon_start(state_dir: &Path, timeout: Duration) -> Result<DaemonStatusReport> {
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    loop {
        let report = inspect_daemon(state_dir)?;
        if report.running || waited >= timeout {
            return Ok(report);
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
}

fn daemon_state_path(state_dir: &Path) -> PathBuf {
    state_dir.join(DAEMON_STATE_FILE_NAME)
}

fn daemon_pid_path(state_dir: &Path) -> PathBuf {
    state_dir.join(DAEMON_PID_FILE_NAME)
}

fn read_pid_file(pid_path: &Path) -> Option<u32> {
    std::fs::read_to_string(pid_path)
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok())
}

fn load_daemon_state(state_path: &Path) -> Result<DaemonLifecycleState> {
    if !state_path.exists() {
        return Ok(DaemonLifecycleState::default());
    }
    let raw = std::fs::read_to_string(state_path)
        .with_context(|| format!("failed to read daemon state {}", state_path.display()))?;
    let state = serde_json::from_str::<DaemonLifecycleState>(&raw)
        .with_context(|| format!("failed to parse daemon state {}", state_path.display()))?;
    if state.schema_version != DAEMON_STATE_SCHEMA_VERSION {
        bail!(
            "unsupported daemon state schema version {} (expected {})",
            state.schema_version,
            DAEMON_STATE_SCHEMA_VERSION
        );
    }
    Ok(state)
}

fn save_daemon_state(state_path: &Path, state: &DaemonLifecycleState) -> Result<()> {
    write_text_atomic(
        state_path,
        serde_json::to_string_pretty(state)
            .context("failed to serialize daemon state")?
            .as_str(),
    )
    .with_context(|| format!("failed to persist daemon state {}", state_path.display()))
}

fn state_dir_accepts_writes(state_dir: &Path) -> bool {
    if std::fs::create_dir_all(state_dir).is_err() {
        return false;
    }
    let marker = state_dir.join(".daemon-write-check");
    if std::fs::write(&marker, "check").is_err() {
        return false;
    }
    let _ = std::fs::remove_file(&marker);
    true
}
