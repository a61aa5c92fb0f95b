#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use foreman_core::{AutomationRecord, IssueId};
use foreman_runtime::workspace::WorkspaceError;
use foreman_runtime::{CheckoutBackend, ControlHandle, ForemanConfig, Scheduler, SchedulerContext, WakeReport};
use foreman_store::SqliteStateStore;
use foreman_tracker::{
    AuthorKind, CiStatus, CommentAuthor, IssueState, IssueTracker, PostedComment, PullRequestDraft,
    PullRequestRef, TrackerComment, TrackerError, TrackerIssue, TrackerResult,
};
use tempfile::TempDir;
use tokio::sync::Mutex as AsyncMutex;

pub const TRIGGER_LABEL: &str = "foreman-auto";
pub const MAINTAINER: &str = "maintainer";

pub fn planner_script(plan: &str) -> String {
    format!("sh -c 'cat > /dev/null; echo FOREMAN_REPORT_BEGIN; echo \"{plan}\"; echo FOREMAN_REPORT_END'")
}

pub fn slow_planner_script(sleep_secs: u64) -> String {
    format!(
        "sh -c 'cat > /dev/null; sleep {sleep_secs}; echo FOREMAN_REPORT_BEGIN; echo \"1. do the work\"; echo FOREMAN_REPORT_END'"
    )
}

pub fn executor_script(pull_request_url: Option<&str>) -> String {
    let pr_line = pull_request_url
        .map(|url| format!(" echo \"PULL_REQUEST: {url}\";"))
        .unwrap_or_default();
    format!(
        "sh -c 'cat > /dev/null; echo FOREMAN_REPORT_BEGIN; echo \"Implemented the exporter.\";{pr_line} echo FOREMAN_REPORT_END'"
    )
}

pub fn crashing_script(exit_code: i32) -> String {
    format!("sh -c 'cat > /dev/null; echo \"panicked at src/lib.rs\" >&2; exit {exit_code}'")
}

#[derive(Default)]
struct TrackerState {
    issues: Vec<TrackerIssue>,
    comments: Vec<TrackerComment>,
    posted: Vec<(IssueId, String)>,
    pull_requests: Vec<PullRequestDraft>,
    failing_posts: usize,
    listing_reads: usize,
    next_comment_id: u64,
}

impl TrackerState {
    /// Commenting bumps the issue's `updated_at`, as on GitHub.
    fn touch(&mut self, issue_id: IssueId) {
        if let Some(issue) = self.issues.iter_mut().find(|issue| issue.id == issue_id) {
            issue.updated_at = Utc::now();
        }
    }
}

/// In-memory tracker. Comments the daemon posts are written back to the
/// thread as the maintainer account, the same way a personal token would.
pub struct ScriptedTracker {
    state: AsyncMutex<TrackerState>,
}

impl ScriptedTracker {
    pub fn new() -> Self {
        Self {
            state: AsyncMutex::new(TrackerState {
                next_comment_id: 1_000,
                ..TrackerState::default()
            }),
        }
    }

    pub async fn open_issue(&self, id: u64, title: &str, body: &str) {
        let mut state = self.state.lock().await;
        state.issues.retain(|issue| issue.id != IssueId(id));
        state.issues.push(TrackerIssue {
            id: IssueId(id),
            title: title.to_string(),
            body: body.to_string(),
            state: IssueState::Open,
            labels: vec![TRIGGER_LABEL.to_string()],
            updated_at: Utc::now() - ChronoDuration::hours(2),
        });
    }

    pub async fn close_issue(&self, id: u64) {
        let mut state = self.state.lock().await;
        if let Some(issue) = state.issues.iter_mut().find(|issue| issue.id == IssueId(id)) {
            issue.state = IssueState::Closed;
        }
    }

    pub async fn user_comment(&self, issue: u64, body: &str) -> u64 {
        let mut state = self.state.lock().await;
        state.next_comment_id += 1;
        let id = state.next_comment_id;
        state.comments.push(TrackerComment {
            id,
            issue_id: IssueId(issue),
            body: body.to_string(),
            author: CommentAuthor {
                login: MAINTAINER.to_string(),
                kind: AuthorKind::User,
            },
            created_at: Utc::now(),
        });
        state.touch(IssueId(issue));
        id
    }

    pub async fn fail_next_posts(&self, count: usize) {
        self.state.lock().await.failing_posts = count;
    }

    pub async fn posted_to(&self, issue: u64) -> Vec<String> {
        self.state
            .lock()
            .await
            .posted
            .iter()
            .filter(|(issue_id, _)| *issue_id == IssueId(issue))
            .map(|(_, body)| body.clone())
            .collect()
    }

    pub async fn pull_requests(&self) -> Vec<PullRequestDraft> {
        self.state.lock().await.pull_requests.clone()
    }

    pub async fn listing_reads(&self) -> usize {
        self.state.lock().await.listing_reads
    }
}

#[async_trait]
impl IssueTracker for ScriptedTracker {
    async fn list_triggered_issues(&self, label: &str) -> TrackerResult<Vec<TrackerIssue>> {
        let mut state = self.state.lock().await;
        state.listing_reads += 1;
        Ok(state
            .issues
            .iter()
            .filter(|issue| issue.state == IssueState::Open)
            .filter(|issue| issue.labels.iter().any(|candidate| candidate == label))
            .cloned()
            .collect())
    }

    async fn read_issue(&self, issue_id: IssueId) -> TrackerResult<TrackerIssue> {
        self.state
            .lock()
            .await
            .issues
            .iter()
            .find(|issue| issue.id == issue_id)
            .cloned()
            .ok_or(TrackerError::NotFound(issue_id))
    }

    async fn list_comments(
        &self,
        issue_id: IssueId,
        since: Option<DateTime<Utc>>,
    ) -> TrackerResult<Vec<TrackerComment>> {
        Ok(self
            .state
            .lock()
            .await
            .comments
            .iter()
            .filter(|comment| comment.issue_id == issue_id)
            .filter(|comment| since.map_or(true, |since| comment.created_at >= since))
            .cloned()
            .collect())
    }

    async fn post_comment(&self, issue_id: IssueId, body: &str) -> TrackerResult<PostedComment> {
        let mut state = self.state.lock().await;
        if state.failing_posts > 0 {
            state.failing_posts -= 1;
            return Err(TrackerError::Status {
                operation: "post comment".to_string(),
                status: 502,
                body: "bad gateway".to_string(),
            });
        }
        state.next_comment_id += 1;
        let id = state.next_comment_id;
        state.posted.push((issue_id, body.to_string()));
        state.comments.push(TrackerComment {
            id,
            issue_id,
            body: body.to_string(),
            author: CommentAuthor {
                login: MAINTAINER.to_string(),
                kind: AuthorKind::User,
            },
            created_at: Utc::now(),
        });
        state.touch(issue_id);
        Ok(PostedComment { id, url: None })
    }

    async fn create_pull_request(&self, draft: &PullRequestDraft) -> TrackerResult<PullRequestRef> {
        let mut state = self.state.lock().await;
        state.pull_requests.push(draft.clone());
        let number = 100 + state.pull_requests.len() as u64;
        Ok(PullRequestRef {
            number,
            url: format!("https://github.com/acme/widgets/pull/{number}"),
        })
    }

    async fn get_ci_status(&self, _git_ref: &str) -> TrackerResult<CiStatus> {
        Ok(CiStatus::Pending)
    }
}

/// Materializes a checkout as a bare directory with a `.git` marker.
#[derive(Default)]
pub struct DirectoryBackend {
    checkouts: AtomicUsize,
    reject_checkouts: AtomicBool,
}

impl DirectoryBackend {
    pub fn checkouts(&self) -> usize {
        self.checkouts.load(Ordering::SeqCst)
    }

    /// Makes every later checkout fail the way a conflicting branch does.
    pub fn reject_checkouts(&self) {
        self.reject_checkouts.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CheckoutBackend for DirectoryBackend {
    async fn checkout(&self, path: &Path, branch: &str, _base: &str) -> Result<(), WorkspaceError> {
        self.checkouts.fetch_add(1, Ordering::SeqCst);
        if self.reject_checkouts.load(Ordering::SeqCst) {
            return Err(WorkspaceError::Git {
                operation: "worktree add",
                path: path.to_path_buf(),
                stderr: format!("fatal: '{branch}' is already checked out"),
            });
        }
        std::fs::create_dir_all(path.join(".git")).map_err(|source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path.join("README.md"), "# widgets\n").map_err(|source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    async fn remove(&self, path: &Path, _branch: &str) -> Result<(), WorkspaceError> {
        if path.exists() {
            std::fs::remove_dir_all(path).map_err(|source| WorkspaceError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }
}

pub struct Harness {
    _temp: TempDir,
    pub root: PathBuf,
    pub config: ForemanConfig,
    pub tracker: Arc<ScriptedTracker>,
    pub backend: Arc<DirectoryBackend>,
}

impl Harness {
    pub fn new(planner_command: String, executor_command: String) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        let mut config = ForemanConfig::default();
        config.state_dir = root.join("state");
        config.tracker.repo = "acme/widgets".to_string();
        config.tracker.trigger_label = TRIGGER_LABEL.to_string();
        config.workspace.repo_root = root.join("repo");
        config.workspace.workspaces_root = Some(root.join("workspaces"));
        config.agents.planner_command = planner_command;
        config.agents.executor_command = executor_command;
        config.agents.agent_wall_clock_timeout_secs = 30;
        Self {
            _temp: temp,
            root,
            config,
            tracker: Arc::new(ScriptedTracker::new()),
            backend: Arc::new(DirectoryBackend::default()),
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        let tracker: Arc<dyn IssueTracker> = self.tracker.clone();
        let backend: Arc<dyn CheckoutBackend> = self.backend.clone();
        let ctx = SchedulerContext::new(self.config.clone(), tracker, backend)
            .expect("scheduler context");
        Scheduler::new(ctx, ControlHandle::new())
    }

    /// Separate connection to the daemon's state database.
    pub fn store(&self) -> SqliteStateStore {
        std::fs::create_dir_all(&self.config.state_dir).expect("state dir");
        SqliteStateStore::new(self.config.state_db_path()).expect("store")
    }
}

pub fn record(store: &SqliteStateStore, issue: u64) -> AutomationRecord {
    store
        .get_record(IssueId(issue))
        .expect("read record")
        .expect("record exists")
}

/// Wakes until `done` holds, returning every report observed on the way.
pub async fn wake_until<F>(scheduler: &mut Scheduler, mut done: F) -> Vec<WakeReport>
where
    F: FnMut(&Scheduler) -> bool,
{
    let mut reports = Vec::new();
    for _ in 0..200 {
        reports.push(scheduler.wake().await.expect("wake"));
        if done(scheduler) {
            return reports;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached after {} wakes", reports.len());
}
