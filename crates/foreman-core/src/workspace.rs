use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::automation::IssueId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceLifecycle {
    Created,
    InUse,
    Removable,
}

impl WorkspaceLifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::InUse => "in_use",
            Self::Removable => "removable",
        }
    }
}

/// Isolated branch-scoped working copy owned by exactly one issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceHandle {
    pub issue_id: IssueId,
    pub path: PathBuf,
    pub branch_name: String,
    pub lifecycle: WorkspaceLifecycle,
}

/// Branch name for an issue. Stable across restarts so re-entry finds the
/// existing workspace.
pub fn workspace_branch_name(prefix: &str, issue_id: IssueId) -> String {
    let prefix = prefix.trim().trim_matches('/');
    if prefix.is_empty() {
        format!("issue-{issue_id}")
    } else {
        format!("{prefix}/issue-{issue_id}")
    }
}

pub fn workspace_dir_name(issue_id: IssueId) -> String {
    format!("issue-{issue_id}")
}
