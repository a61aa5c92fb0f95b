//! Per-issue automation record and its status transition rules.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tracker-assigned issue number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueId(pub u64);

impl IssueId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states of an [`AutomationRecord`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    /// Trigger observed, nothing dispatched yet.
    Triggered,
    /// A planner session is (or was last) dispatched.
    Planning,
    /// An executor session is (or was last) dispatched.
    Executing,
    /// The agent holds the last turn and the daemon awaits the user.
    WaitingForUser,
    /// Work shipped or the issue was closed.
    Completed,
    /// Issue-fatal error; retained for audit.
    Failed,
}

impl AutomationStatus {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Triggered => "triggered",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::WaitingForUser => "waiting_for_user",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "triggered" => Some(Self::Triggered),
            "planning" => Some(Self::Planning),
            "executing" => Some(Self::Executing),
            "waiting_for_user" => Some(Self::WaitingForUser),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns true when the record cannot transition any further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Conversational ownership of an issue thread.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TurnActor {
    User,
    Agent,
}

impl TurnActor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("issue {issue_id} is {status:?}; terminal records cannot transition")]
    Terminal {
        issue_id: IssueId,
        status: AutomationStatus,
    },
    #[error("issue {issue_id} cannot re-enter {to:?}")]
    NotReenterable {
        issue_id: IssueId,
        to: AutomationStatus,
    },
    #[error("issue {issue_id} cannot wait for the user while the user holds the turn")]
    UserHoldsTurn { issue_id: IssueId },
}

/// One automation record per tracked issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationRecord {
    pub issue_id: IssueId,
    pub title: String,
    pub status: AutomationStatus,
    pub has_plan: bool,
    pub plan_summary: Option<String>,
    pub last_turn_actor: TurnActor,
    /// Latest user request not yet served by an agent.
    pub pending_request: Option<String>,
    /// Highest tracker comment id already consumed.
    pub last_seen_comment_id: Option<u64>,
    pub active_session_ref: Option<String>,
    pub spend_usd: f64,
    pub note: Option<String>,
    pub pull_request_url: Option<String>,
    /// Rendered comment whose delivery to the tracker is still outstanding.
    pub undelivered_comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationRecord {
    /// Creates the record for a freshly observed trigger. The issue body is the
    /// user's opening turn.
    pub fn triggered(
        issue_id: IssueId,
        title: &str,
        opening_request: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            issue_id,
            title: title.trim().to_string(),
            status: AutomationStatus::Triggered,
            has_plan: false,
            plan_summary: None,
            last_turn_actor: TurnActor::User,
            pending_request: opening_request,
            last_seen_comment_id: None,
            active_session_ref: None,
            spend_usd: 0.0,
            note: None,
            pull_request_url: None,
            undelivered_comment: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a status change after validating it against the transition rules.
    pub fn transition_to(
        &mut self,
        next: AutomationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                issue_id: self.issue_id,
                status: self.status,
            });
        }
        if next == AutomationStatus::Triggered && self.status != AutomationStatus::Triggered {
            return Err(TransitionError::NotReenterable {
                issue_id: self.issue_id,
                to: next,
            });
        }
        if next == AutomationStatus::WaitingForUser && self.last_turn_actor != TurnActor::Agent {
            return Err(TransitionError::UserHoldsTurn {
                issue_id: self.issue_id,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Records a turn taken by the daemon and parks the record for the user.
    pub fn hand_turn_to_user(
        &mut self,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                issue_id: self.issue_id,
                status: self.status,
            });
        }
        self.last_turn_actor = TurnActor::Agent;
        self.pending_request = None;
        self.note = note;
        self.transition_to(AutomationStatus::WaitingForUser, now)
    }

    /// Moves the record to `Failed` with a diagnostic note.
    pub fn fail(&mut self, note: String, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.note = Some(note);
        self.active_session_ref = None;
        self.transition_to(AutomationStatus::Failed, now)
    }

    pub fn is_idle(&self) -> bool {
        self.active_session_ref.is_none()
    }
}
