//! Foundational domain types and low-level utilities shared across foreman crates.
//!
//! Holds the per-issue automation record and its transition rules, the agent
//! session registry entry, workspace naming, plus atomic file writes and time
//! helpers used by the store and runtime.

pub mod atomic_io;
pub mod automation;
pub mod session;
pub mod time_utils;
pub mod workspace;

pub use atomic_io::write_text_atomic;
pub use automation::{
    AutomationRecord, AutomationStatus, IssueId, TransitionError, TurnActor,
};
pub use session::{session_log_path, ActiveAgentSession, AgentRole};
pub use time_utils::current_unix_timestamp_ms;
pub use workspace::{workspace_branch_name, workspace_dir_name, WorkspaceHandle, WorkspaceLifecycle};
