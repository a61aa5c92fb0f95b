//! Per-issue isolated checkouts backed by `git worktree`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use foreman_core::{
    workspace_branch_name, workspace_dir_name, AutomationRecord, AutomationStatus, IssueId,
    WorkspaceHandle, WorkspaceLifecycle,
};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ForemanConfig;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git {operation} failed for {path}: {stderr}")]
    Git {
        operation: &'static str,
        path: PathBuf,
        stderr: String,
    },
    #[error("failed to prepare workspace {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// How a workspace checkout is materialized on disk.
#[async_trait]
pub trait CheckoutBackend: Send + Sync {
    /// Creates a checkout of `branch` at `path`, creating the branch from `base`
    /// when it does not exist yet.
    async fn checkout(&self, path: &Path, branch: &str, base: &str) -> Result<(), WorkspaceError>;

    /// Removes the checkout at `path` and deletes `branch`.
    async fn remove(&self, path: &Path, branch: &str) -> Result<(), WorkspaceError>;

    fn is_valid_checkout(&self, path: &Path) -> bool {
        path.join(".git").exists()
    }
}

/// Runs `git worktree` against the configured repository.
#[derive(Debug, Clone)]
pub struct GitWorktreeBackend {
    repo_root: PathBuf,
}

impl GitWorktreeBackend {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    async fn git(&self, operation: &'static str, path: &Path, args: &[&str]) -> Result<String, WorkspaceError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| WorkspaceError::Io {
                path: self.repo_root.clone(),
                source,
            })?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }
        Err(WorkspaceError::Git {
            operation,
            path: path.to_path_buf(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn branch_exists(&self, branch: &str) -> bool {
        let reference = format!("refs/heads/{branch}");
        self.git(
            "rev-parse",
            &self.repo_root,
            &["rev-parse", "--verify", "--quiet", reference.as_str()],
        )
        .await
        .is_ok()
    }
}

#[async_trait]
impl CheckoutBackend for GitWorktreeBackend {
    async fn checkout(&self, path: &Path, branch: &str, base: &str) -> Result<(), WorkspaceError> {
        let _ = self.git("worktree prune", path, &["worktree", "prune"]).await;
        let target = path.display().to_string();
        if self.branch_exists(branch).await {
            self.git(
                "worktree add",
                path,
                &["worktree", "add", target.as_str(), branch],
            )
            .await?;
        } else {
            self.git(
                "worktree add",
                path,
                &["worktree", "add", "-b", branch, target.as_str(), base],
            )
            .await?;
        }
        Ok(())
    }

    async fn remove(&self, path: &Path, branch: &str) -> Result<(), WorkspaceError> {
        let target = path.display().to_string();
        if let Err(error) = self
            .git(
                "worktree remove",
                path,
                &["worktree", "remove", "--force", target.as_str()],
            )
            .await
        {
            debug!(path = %path.display(), error = %error, "worktree remove failed; deleting directory");
            if path.exists() {
                std::fs::remove_dir_all(path).map_err(|source| WorkspaceError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
            let _ = self.git("worktree prune", path, &["worktree", "prune"]).await;
        }
        if self.branch_exists(branch).await {
            self.git("branch delete", path, &["branch", "-D", branch]).await?;
        }
        Ok(())
    }
}

/// Owns every workspace the daemon has materialized.
pub struct WorkspaceManager {
    root: PathBuf,
    branch_prefix: String,
    base_branch: String,
    idle_ttl: ChronoDuration,
    backend: Arc<dyn CheckoutBackend>,
    handles: HashMap<IssueId, WorkspaceHandle>,
    untrusted: HashSet<IssueId>,
}

impl WorkspaceManager {
    pub fn new(
        root: impl Into<PathBuf>,
        branch_prefix: &str,
        base_branch: &str,
        idle_ttl_secs: u64,
        backend: Arc<dyn CheckoutBackend>,
    ) -> Self {
        Self {
            root: root.into(),
            branch_prefix: branch_prefix.to_string(),
            base_branch: base_branch.to_string(),
            idle_ttl: ChronoDuration::seconds(i64::try_from(idle_ttl_secs).unwrap_or(i64::MAX)),
            backend,
            handles: HashMap::new(),
            untrusted: HashSet::new(),
        }
    }

    pub fn from_config(config: &ForemanConfig, backend: Arc<dyn CheckoutBackend>) -> Self {
        Self::new(
            config.workspaces_root(),
            &config.workspace.branch_prefix,
            &config.workspace.base_branch,
            config.workspace.idle_ttl_secs,
            backend,
        )
    }

    pub fn workspace_path(&self, issue_id: IssueId) -> PathBuf {
        self.root.join(workspace_dir_name(issue_id))
    }

    pub fn branch_name(&self, issue_id: IssueId) -> String {
        workspace_branch_name(&self.branch_prefix, issue_id)
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    /// Returns the issue's workspace, creating it when missing. A valid
    /// existing checkout is reused without touching the backend. Checkout is
    /// attempted at most twice.
    pub async fn ensure(&mut self, issue_id: IssueId) -> Result<WorkspaceHandle, WorkspaceError> {
        let path = self.workspace_path(issue_id);
        let branch_name = self.branch_name(issue_id);

        if self.untrusted.remove(&issue_id) {
            info!(issue_id = issue_id.get(), path = %path.display(), "discarding untrusted workspace");
            self.backend.remove(&path, &branch_name).await?;
            self.handles.remove(&issue_id);
        }

        if self.backend.is_valid_checkout(&path) {
            let handle = self
                .handles
                .entry(issue_id)
                .or_insert_with(|| WorkspaceHandle {
                    issue_id,
                    path: path.clone(),
                    branch_name: branch_name.clone(),
                    lifecycle: WorkspaceLifecycle::Created,
                });
            return Ok(handle.clone());
        }

        std::fs::create_dir_all(&self.root).map_err(|source| WorkspaceError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut attempt = 0_u8;
        loop {
            attempt = attempt.saturating_add(1);
            discard_partial_checkout(&path)?;
            match self
                .backend
                .checkout(&path, &branch_name, &self.base_branch)
                .await
            {
                Ok(()) => break,
                Err(error) if attempt < 2 => {
                    warn!(
                        issue_id = issue_id.get(),
                        error = %error,
                        "workspace checkout failed; retrying once"
                    );
                }
                Err(error) => return Err(error),
            }
        }

        info!(
            issue_id = issue_id.get(),
            branch = %branch_name,
            path = %path.display(),
            "workspace created"
        );
        let handle = WorkspaceHandle {
            issue_id,
            path,
            branch_name,
            lifecycle: WorkspaceLifecycle::Created,
        };
        self.handles.insert(issue_id, handle.clone());
        Ok(handle)
    }

    pub fn set_lifecycle(&mut self, issue_id: IssueId, lifecycle: WorkspaceLifecycle) {
        if let Some(handle) = self.handles.get_mut(&issue_id) {
            handle.lifecycle = lifecycle;
        }
    }

    /// Marks the workspace untrusted; the next `ensure` rebuilds it.
    pub fn invalidate(&mut self, issue_id: IssueId) {
        self.untrusted.insert(issue_id);
        self.set_lifecycle(issue_id, WorkspaceLifecycle::Removable);
    }

    /// Removes the workspace and its branch. Returns false when nothing existed.
    pub async fn reap(&mut self, issue_id: IssueId) -> Result<bool, WorkspaceError> {
        let path = self.workspace_path(issue_id);
        let existed = path.exists() || self.handles.contains_key(&issue_id);
        self.handles.remove(&issue_id);
        self.untrusted.remove(&issue_id);
        if !existed {
            return Ok(false);
        }
        self.backend.remove(&path, &self.branch_name(issue_id)).await?;
        info!(issue_id = issue_id.get(), path = %path.display(), "workspace reaped");
        Ok(true)
    }

    /// Issues with a workspace directory under the root.
    pub fn existing_workspaces(&self) -> Vec<IssueId> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut issues = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix("issue-"))
                    .and_then(|raw| raw.parse::<u64>().ok())
                    .map(IssueId)
            })
            .collect::<Vec<_>>();
        issues.sort();
        issues
    }

    /// Workspaces that should be removed now.
    pub fn reap_due(&self, records: &[AutomationRecord], now: DateTime<Utc>) -> Vec<IssueId> {
        let existing = self.existing_workspaces();
        reap_due(records, &existing, now, self.idle_ttl)
    }
}

fn discard_partial_checkout(path: &Path) -> Result<(), WorkspaceError> {
    if path.exists() {
        std::fs::remove_dir_all(path).map_err(|source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Terminal records lose their workspace immediately; idle records lose it
/// once `idle_ttl` has passed since their last update.
pub fn reap_due(
    records: &[AutomationRecord],
    existing: &[IssueId],
    now: DateTime<Utc>,
    idle_ttl: ChronoDuration,
) -> Vec<IssueId> {
    records
        .iter()
        .filter(|record| existing.contains(&record.issue_id))
        .filter(|record| record.is_idle())
        .filter(|record| {
            record.status.is_terminal()
                || (matches!(
                    record.status,
                    AutomationStatus::WaitingForUser | AutomationStatus::Triggered
                ) && now.signed_duration_since(record.updated_at) >= idle_ttl)
        })
        .map(|record| record.issue_id)
        .collect()
}
