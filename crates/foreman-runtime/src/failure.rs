//! Issue-level failure taxonomy and its stable reason codes.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchFailure {
    /// Checkout or branch conflict while preparing the workspace.
    WorkspaceError,
    /// Non-zero exit, launch failure, or output without a report.
    ProcessCrash,
    BudgetExceeded,
    /// Registered session whose process is gone.
    StaleSession,
    Timeout,
    Cancelled,
}

impl DispatchFailure {
    pub fn reason_code(self) -> &'static str {
        match self {
            Self::WorkspaceError => "workspace_error",
            Self::ProcessCrash => "process_crash",
            Self::BudgetExceeded => "budget_exceeded",
            Self::StaleSession => "stale_session",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the failure ends automation for the issue.
    pub fn is_issue_fatal(self) -> bool {
        !matches!(self, Self::BudgetExceeded | Self::StaleSession)
    }

    /// Whether the user is told about it via a tracker comment.
    pub fn is_user_visible(self) -> bool {
        !matches!(self, Self::StaleSession)
    }
}
