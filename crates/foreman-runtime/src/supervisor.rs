//! Agent process supervision.
//!
//! Each session is a small state machine (`Spawned -> Running -> {Exited,
//! Crashed, TimedOut, Cancelled}`) advanced only by [`ProcessSupervisor::poll_all`],
//! which never blocks on a child. Output goes straight to the per-session log
//! file, so a session survives a daemon restart and can be adopted by pid.

use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use foreman_core::{session_log_path, ActiveAgentSession, AgentRole, IssueId};
use foreman_store::{SqliteStateStore, StateStoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::AgentCommand;
use crate::failure::DispatchFailure;
use crate::process::{process_alive, signal_process_group, StopSignal};

const LOG_TAIL_LINES: usize = 40;
/// Time between SIGTERM to an agent's process group and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(3);
const SECTION_RULE: &str = "============================================================";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SessionPhase {
    Spawned,
    Running,
    Exited { code: Option<i32> },
    Crashed { reason: String },
    TimedOut,
    Cancelled,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawned => "spawned",
            Self::Running => "running",
            Self::Exited { .. } => "exited",
            Self::Crashed { .. } => "crashed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Spawned | Self::Running)
    }
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("all {0} agent session slots are in use")]
    NoSlot(usize),
    #[error("issue {0} already has an active agent session")]
    AlreadyActive(IssueId),
    #[error("failed to launch agent: {0:#}")]
    Launch(anyhow::Error),
}

/// Everything needed to start one agent session.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub issue_id: IssueId,
    pub role: AgentRole,
    pub command: AgentCommand,
    pub prompt: String,
    pub workspace_path: PathBuf,
    pub ship_requested: bool,
    pub estimated_cost_usd: f64,
}

/// A session that reached a terminal phase during a poll.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session: ActiveAgentSession,
    pub phase: SessionPhase,
    /// Agent output captured after the log header.
    pub output: String,
    pub log_tail: String,
    /// True when the session was inherited from a previous daemon.
    pub adopted: bool,
}

/// Summary of a live session for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub issue_id: IssueId,
    pub session_ref: String,
    pub role: AgentRole,
    pub pid: Option<u32>,
    pub phase: String,
    pub started_at: DateTime<Utc>,
    pub log_path: PathBuf,
    pub adopted: bool,
    pub cancel_requested: bool,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileReport {
    pub adopted: Vec<ActiveAgentSession>,
    pub stale: Vec<ActiveAgentSession>,
}

enum SessionProcess {
    Owned(Child),
    Adopted { pid: u32 },
}

struct SupervisedSession {
    session: ActiveAgentSession,
    process: SessionProcess,
    phase: SessionPhase,
    cancel_requested: bool,
    stop_reason: Option<SessionPhase>,
    kill_deadline: Option<Instant>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl SupervisedSession {
    fn adopted(&self) -> bool {
        matches!(self.process, SessionProcess::Adopted { .. })
    }

    /// Agents lead their own process group, so the leader pid is the pgid.
    fn process_group(&self) -> Option<u32> {
        match &self.process {
            SessionProcess::Owned(child) => child.id().or(self.session.pid),
            SessionProcess::Adopted { pid } => Some(*pid),
        }
    }
}

/// Sole owner of agent processes and of the global concurrency slots.
pub struct ProcessSupervisor {
    store: SqliteStateStore,
    log_dir: PathBuf,
    wall_clock_timeout: Duration,
    max_sessions: usize,
    slots: Arc<Semaphore>,
    sessions: HashMap<IssueId, SupervisedSession>,
}

impl ProcessSupervisor {
    pub fn new(
        store: SqliteStateStore,
        log_dir: impl Into<PathBuf>,
        max_sessions: usize,
        wall_clock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            log_dir: log_dir.into(),
            wall_clock_timeout,
            max_sessions,
            slots: Arc::new(Semaphore::new(max_sessions)),
            sessions: HashMap::new(),
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, issue_id: IssueId) -> bool {
        self.sessions.contains_key(&issue_id)
    }

    pub fn session(&self, issue_id: IssueId) -> Option<&ActiveAgentSession> {
        self.sessions.get(&issue_id).map(|entry| &entry.session)
    }

    /// Issues with a live session.
    pub fn active_issue_ids(&self) -> HashSet<IssueId> {
        self.sessions.keys().copied().collect()
    }

    pub fn session_views(&self) -> Vec<SessionView> {
        let mut views = self
            .sessions
            .values()
            .map(|entry| SessionView {
                issue_id: entry.session.issue_id,
                session_ref: entry.session.session_ref.clone(),
                role: entry.session.role,
                pid: entry.session.pid,
                phase: entry.phase.as_str().to_string(),
                started_at: entry.session.started_at,
                log_path: entry.session.log_path.clone(),
                adopted: entry.adopted(),
                cancel_requested: entry.cancel_requested,
            })
            .collect::<Vec<_>>();
        views.sort_by_key(|view| (view.started_at, view.issue_id));
        views
    }

    /// Acquires a slot and launches the agent. The slot is held until the
    /// session is reaped by `poll_all`.
    pub fn spawn(&mut self, request: SpawnRequest) -> Result<ActiveAgentSession, SpawnError> {
        if self.sessions.contains_key(&request.issue_id) {
            return Err(SpawnError::AlreadyActive(request.issue_id));
        }
        let permit = Arc::clone(&self.slots)
            .try_acquire_owned()
            .map_err(|_| SpawnError::NoSlot(self.max_sessions))?;

        let started_at = Utc::now();
        let log_path = session_log_path(&self.log_dir, request.issue_id, started_at);
        let output_offset = write_log_header(&log_path, &request, started_at)
            .map_err(SpawnError::Launch)?;
        let prompt_path = prompt_path_for(&log_path);
        std::fs::write(&prompt_path, request.prompt.as_bytes())
            .with_context(|| format!("failed to write prompt {}", prompt_path.display()))
            .map_err(SpawnError::Launch)?;

        let mut session = ActiveAgentSession {
            session_ref: ActiveAgentSession::session_ref_for(
                request.issue_id,
                request.role,
                started_at,
            ),
            issue_id: request.issue_id,
            role: request.role,
            pid: None,
            started_at,
            log_path,
            output_offset,
            workspace_path: request.workspace_path.clone(),
            ship_requested: request.ship_requested,
            estimated_cost_usd: request.estimated_cost_usd,
        };

        match self.store.register_session(&session) {
            Ok(()) => {}
            Err(StateStoreError::SessionAlreadyRegistered(issue_id)) => {
                let _ = std::fs::remove_file(&prompt_path);
                return Err(SpawnError::AlreadyActive(issue_id));
            }
            Err(error) => {
                let _ = std::fs::remove_file(&prompt_path);
                return Err(SpawnError::Launch(
                    anyhow::Error::new(error).context("failed to register agent session"),
                ));
            }
        }

        let child = match launch_agent(&request, &session, &prompt_path) {
            Ok(child) => child,
            Err(error) => {
                let _ = self.store.remove_session(session.issue_id);
                let _ = std::fs::remove_file(&prompt_path);
                return Err(SpawnError::Launch(error));
            }
        };
        session.pid = child.id();
        if let Err(error) = self.store.update_session_pid(session.issue_id, session.pid) {
            warn!(
                issue_id = session.issue_id.get(),
                error = %error,
                "failed to persist agent pid"
            );
        }

        info!(
            issue_id = session.issue_id.get(),
            role = session.role.as_str(),
            session_ref = %session.session_ref,
            pid = ?session.pid,
            log_path = %session.log_path.display(),
            "agent session spawned"
        );
        self.sessions.insert(
            session.issue_id,
            SupervisedSession {
                session: session.clone(),
                process: SessionProcess::Owned(child),
                phase: SessionPhase::Spawned,
                cancel_requested: false,
                stop_reason: None,
                kill_deadline: None,
                _permit: Some(permit),
            },
        );
        Ok(session)
    }

    /// Checks the issue's session without waiting on it. An exited process
    /// stays registered until the next `poll_all` collects its outcome.
    pub fn poll_liveness(&mut self, issue_id: IssueId) -> bool {
        let Some(entry) = self.sessions.get_mut(&issue_id) else {
            return false;
        };
        match check_exit(&mut entry.process) {
            Some(phase) => {
                entry.phase = entry.stop_reason.clone().unwrap_or(phase);
                false
            }
            None => {
                entry.phase = SessionPhase::Running;
                true
            }
        }
    }

    /// Flags the session for termination at the next liveness check.
    pub fn request_cancel(&mut self, issue_id: IssueId) -> bool {
        match self.sessions.get_mut(&issue_id) {
            Some(entry) => {
                entry.cancel_requested = true;
                true
            }
            None => false,
        }
    }

    /// Non-blocking liveness check for every session. Returns the sessions
    /// that finished and releases their slots.
    pub fn poll_all(&mut self) -> Vec<SessionOutcome> {
        let now = Utc::now();
        let mut finished = Vec::new();
        let mut issue_ids = self.sessions.keys().copied().collect::<Vec<_>>();
        issue_ids.sort();

        for issue_id in issue_ids {
            let Some(entry) = self.sessions.get_mut(&issue_id) else {
                continue;
            };
            if entry.stop_reason.is_none() {
                let elapsed = now
                    .signed_duration_since(entry.session.started_at)
                    .to_std()
                    .unwrap_or_default();
                if elapsed >= self.wall_clock_timeout {
                    warn!(
                        issue_id = issue_id.get(),
                        elapsed_secs = elapsed.as_secs(),
                        "agent session exceeded wall-clock timeout; terminating"
                    );
                    entry.stop_reason = Some(SessionPhase::TimedOut);
                    request_stop(entry);
                } else if entry.cancel_requested {
                    info!(issue_id = issue_id.get(), "cancelling agent session");
                    entry.stop_reason = Some(SessionPhase::Cancelled);
                    request_stop(entry);
                }
            } else if entry
                .kill_deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
            {
                warn!(
                    issue_id = issue_id.get(),
                    grace_secs = STOP_GRACE.as_secs(),
                    "agent process group ignored SIGTERM; killing"
                );
                kill_tree(entry);
                entry.kill_deadline = None;
            }

            match check_exit(&mut entry.process) {
                Some(phase) => {
                    if entry.stop_reason.is_some() {
                        // The leader is gone but its descendants may not be.
                        kill_tree(entry);
                    }
                    entry.phase = entry.stop_reason.clone().unwrap_or(phase);
                }
                None => {
                    entry.phase = SessionPhase::Running;
                    continue;
                }
            }

            if let Some(entry) = self.sessions.remove(&issue_id) {
                finished.push(self.finish(entry));
            }
        }
        finished
    }

    fn finish(&self, entry: SupervisedSession) -> SessionOutcome {
        let adopted = entry.adopted();
        let session = entry.session;
        let output = read_output(&session.log_path, session.output_offset).unwrap_or_else(|error| {
            warn!(
                issue_id = session.issue_id.get(),
                error = %error,
                "failed to read agent output"
            );
            String::new()
        });
        if let Err(error) = self.store.remove_session(session.issue_id) {
            warn!(
                issue_id = session.issue_id.get(),
                error = %error,
                "failed to remove agent session from registry"
            );
        }
        let _ = std::fs::remove_file(prompt_path_for(&session.log_path));
        info!(
            issue_id = session.issue_id.get(),
            role = session.role.as_str(),
            session_ref = %session.session_ref,
            phase = entry.phase.as_str(),
            adopted,
            "agent session finished"
        );
        SessionOutcome {
            log_tail: tail_lines(&output, LOG_TAIL_LINES),
            output,
            phase: entry.phase,
            session,
            adopted,
        }
    }

    /// Startup reconciliation against the persisted registry. Sessions whose
    /// process is gone are dropped; live ones are adopted.
    pub fn reconcile_registry(&mut self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let persisted = self
            .store
            .list_sessions()
            .context("failed to load agent session registry")?;
        for session in persisted {
            if self.sessions.contains_key(&session.issue_id) {
                continue;
            }
            match session.pid.filter(|pid| process_alive(*pid)) {
                Some(pid) => {
                    let permit = Arc::clone(&self.slots).try_acquire_owned().ok();
                    info!(
                        issue_id = session.issue_id.get(),
                        pid,
                        session_ref = %session.session_ref,
                        "adopted live agent session"
                    );
                    self.sessions.insert(
                        session.issue_id,
                        SupervisedSession {
                            session: session.clone(),
                            process: SessionProcess::Adopted { pid },
                            phase: SessionPhase::Running,
                            cancel_requested: false,
                            stop_reason: None,
                            kill_deadline: None,
                            _permit: permit,
                        },
                    );
                    report.adopted.push(session);
                }
                None => {
                    self.store
                        .remove_session(session.issue_id)
                        .context("failed to remove stale agent session")?;
                    let _ = std::fs::remove_file(prompt_path_for(&session.log_path));
                    debug!(
                        issue_id = session.issue_id.get(),
                        session_ref = %session.session_ref,
                        reason = DispatchFailure::StaleSession.reason_code(),
                        "reconciled stale agent session"
                    );
                    report.stale.push(session);
                }
            }
        }
        Ok(report)
    }
}

/// SIGTERM to the whole agent tree. `poll_all` escalates to SIGKILL once
/// the grace period passes.
fn request_stop(entry: &mut SupervisedSession) {
    entry.kill_deadline = Some(Instant::now() + STOP_GRACE);
    match entry.process_group() {
        Some(pgid) => {
            if let Err(error) = signal_process_group(pgid, StopSignal::Terminate) {
                warn!(
                    issue_id = entry.session.issue_id.get(),
                    pgid,
                    error = %error,
                    "failed to signal agent process group"
                );
                kill_tree(entry);
            }
        }
        None => kill_tree(entry),
    }
}

fn kill_tree(entry: &mut SupervisedSession) {
    if let Some(pgid) = entry.process_group() {
        if let Err(error) = signal_process_group(pgid, StopSignal::Kill) {
            warn!(
                issue_id = entry.session.issue_id.get(),
                pgid,
                error = %error,
                "failed to kill agent process group"
            );
        }
    }
    if let SessionProcess::Owned(child) = &mut entry.process {
        if let Err(error) = child.start_kill() {
            debug!(
                issue_id = entry.session.issue_id.get(),
                error = %error,
                "agent leader already exited"
            );
        }
    }
}

/// Non-blocking exit check. `None` means the process is still running.
fn check_exit(process: &mut SessionProcess) -> Option<SessionPhase> {
    match process {
        SessionProcess::Owned(child) => match child.try_wait() {
            Ok(Some(status)) => Some(if status.success() {
                SessionPhase::Exited {
                    code: status.code(),
                }
            } else {
                SessionPhase::Crashed {
                    reason: match status.code() {
                        Some(code) => format!("agent exited with status {code}"),
                        None => "agent terminated by signal".to_string(),
                    },
                }
            }),
            Ok(None) => None,
            Err(error) => Some(SessionPhase::Crashed {
                reason: format!("failed to check agent process: {error}"),
            }),
        },
        SessionProcess::Adopted { pid } => {
            (!process_alive(*pid)).then_some(SessionPhase::Exited { code: None })
        }
    }
}

fn prompt_path_for(log_path: &Path) -> PathBuf {
    log_path.with_extension("prompt")
}

fn write_log_header(
    log_path: &Path,
    request: &SpawnRequest,
    started_at: DateTime<Utc>,
) -> Result<u64> {
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("failed to open session log {}", log_path.display()))?;
    let header = format!(
        "{SECTION_RULE}\nforeman agent session - issue #{}\nrole: {}\nstarted: {}\n{SECTION_RULE}\n\nPROMPT:\n{}\n\n{SECTION_RULE}\nAGENT OUTPUT:\n{SECTION_RULE}\n\n",
        request.issue_id,
        request.role.as_str(),
        started_at.to_rfc3339(),
        request.prompt
    );
    file.write_all(header.as_bytes())
        .with_context(|| format!("failed to write session log {}", log_path.display()))?;
    file.flush()?;
    let offset = file
        .metadata()
        .with_context(|| format!("failed to stat session log {}", log_path.display()))?
        .len();
    Ok(offset)
}

fn launch_agent(
    request: &SpawnRequest,
    session: &ActiveAgentSession,
    prompt_path: &Path,
) -> Result<Child> {
    let prompt_file = std::fs::File::open(prompt_path)
        .with_context(|| format!("failed to open {}", prompt_path.display()))?;
    let stdout_file = OpenOptions::new()
        .append(true)
        .open(&session.log_path)
        .with_context(|| format!("failed to open {}", session.log_path.display()))?;
    let stderr_file = stdout_file
        .try_clone()
        .with_context(|| format!("failed to clone {}", session.log_path.display()))?;

    let mut command = Command::new(request.command.program.as_str());
    command.args(&request.command.args);
    command.current_dir(&request.workspace_path);
    command.stdin(Stdio::from(prompt_file));
    command.stdout(Stdio::from(stdout_file));
    command.stderr(Stdio::from(stderr_file));
    command.env("ISSUE_NUMBER", request.issue_id.to_string());
    command.env("FOREMAN_ISSUE_ID", request.issue_id.to_string());
    command.env("FOREMAN_ROLE", request.role.as_str());
    command.env("FOREMAN_SESSION_REF", session.session_ref.as_str());
    #[cfg(unix)]
    command.process_group(0);

    command.spawn().with_context(|| {
        format!(
            "failed to spawn {} agent '{}'",
            request.role.as_str(),
            request.command.program
        )
    })
}

fn read_output(log_path: &Path, offset: u64) -> Result<String> {
    let mut file = std::fs::File::open(log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;
    let length = file.metadata()?.len();
    file.seek(SeekFrom::Start(offset.min(length)))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines = text.lines().collect::<Vec<_>>();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
