//! Agent roles and the persisted registry entry for live agent processes.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::automation::IssueId;

/// Which agent role a session runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Slow, deliberate role that produces or revises the plan.
    Planner,
    /// Fast role that implements and iterates on an accepted plan.
    Executor,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Executor => "executor",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "planner" => Some(Self::Planner),
            "executor" => Some(Self::Executor),
            _ => None,
        }
    }
}

/// Registry entry for an agent process. The live process handle stays with the
/// supervisor; this is what survives a daemon restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveAgentSession {
    pub session_ref: String,
    pub issue_id: IssueId,
    pub role: AgentRole,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub log_path: PathBuf,
    /// Byte offset in `log_path` where agent output begins.
    pub output_offset: u64,
    pub workspace_path: PathBuf,
    pub ship_requested: bool,
    pub estimated_cost_usd: f64,
}

impl ActiveAgentSession {
    pub fn session_ref_for(issue_id: IssueId, role: AgentRole, started_at: DateTime<Utc>) -> String {
        format!(
            "{}-{}-{}",
            role.as_str(),
            issue_id,
            started_at.timestamp_millis()
        )
    }
}

/// Deterministic per-session log path derived from issue id and start time.
pub fn session_log_path(log_dir: &Path, issue_id: IssueId, started_at: DateTime<Utc>) -> PathBuf {
    log_dir.join(format!(
        "issue-{}-{}.log",
        issue_id,
        started_at.format("%Y%m%d_%H%M%S")
    ))
}
