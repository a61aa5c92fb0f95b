//! Issue tracker contract consumed by the foreman daemon.
//!
//! Provides the [`IssueTracker`] trait, a GitHub REST implementation with
//! bounded timeouts and retry-with-backoff, trigger-label filtering, agent
//! authorship detection, and rendering of daemon-authored comments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use foreman_core::IssueId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod authorship;
pub mod comment_render;
pub mod github_client;
pub mod issue_filter;
pub mod retry;

pub use authorship::{AgentAuthorshipPolicy, AGENT_TURN_MARKER};
pub use github_client::{GithubTracker, RepoRef};

/// Result type for tracker operations.
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Errors returned by tracker implementations.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker {operation} request failed: {source}")]
    Transport {
        operation: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("tracker {operation} failed with status {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },
    #[error("failed to decode tracker {operation}: {message}")]
    Decode { operation: String, message: String },
    #[error("invalid tracker configuration: {0}")]
    InvalidConfig(String),
    #[error("issue {0} not found")]
    NotFound(IssueId),
}

impl TrackerError {
    /// True for failures worth retrying on a later wake.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => retry::should_retry_status(*status),
            Self::Decode { .. } | Self::InvalidConfig(_) | Self::NotFound(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerIssue {
    pub id: IssueId,
    pub title: String,
    pub body: String,
    pub state: IssueState,
    pub labels: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorKind {
    User,
    Bot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentAuthor {
    pub login: String,
    pub kind: AuthorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerComment {
    pub id: u64,
    pub issue_id: IssueId,
    pub body: String,
    pub author: CommentAuthor,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedComment {
    pub id: u64,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestDraft {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: String,
}

/// Combined CI status for a git ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    Pending,
    Success,
    Failure,
    Unknown,
}

impl CiStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_combined_state(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "success" => Self::Success,
            "failure" | "error" => Self::Failure,
            _ => Self::Unknown,
        }
    }
}

/// Remote issue tracker consumed by the scheduler and supervisor.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Open issues carrying `label`, in discovery order.
    async fn list_triggered_issues(&self, label: &str) -> TrackerResult<Vec<TrackerIssue>>;
    async fn read_issue(&self, issue_id: IssueId) -> TrackerResult<TrackerIssue>;
    /// Comments oldest-first, optionally only those created at or after `since`.
    async fn list_comments(
        &self,
        issue_id: IssueId,
        since: Option<DateTime<Utc>>,
    ) -> TrackerResult<Vec<TrackerComment>>;
    async fn post_comment(&self, issue_id: IssueId, body: &str) -> TrackerResult<PostedComment>;
    async fn create_pull_request(&self, draft: &PullRequestDraft)
        -> TrackerResult<PullRequestRef>;
    async fn get_ci_status(&self, git_ref: &str) -> TrackerResult<CiStatus>;
}

#[cfg(test)]
mod tests {
    use super::{CiStatus, TrackerError};

    #[test]
    fn unit_ci_status_maps_combined_states() {
        assert_eq!(CiStatus::from_combined_state("success"), CiStatus::Success);
        assert_eq!(CiStatus::from_combined_state("ERROR"), CiStatus::Failure);
        assert_eq!(CiStatus::from_combined_state("pending"), CiStatus::Pending);
        assert_eq!(CiStatus::from_combined_state(""), CiStatus::Unknown);
    }

    #[test]
    fn unit_tracker_error_transience_follows_status_class() {
        let rate_limited = TrackerError::Status {
            operation: "list issues".to_string(),
            status: 429,
            body: String::new(),
        };
        let forbidden = TrackerError::Status {
            operation: "list issues".to_string(),
            status: 403,
            body: String::new(),
        };
        assert!(rate_limited.is_transient());
        assert!(!forbidden.is_transient());
        assert!(!TrackerError::InvalidConfig("repo".to_string()).is_transient());
    }
}
