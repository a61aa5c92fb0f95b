//! GitHub REST implementation of [`IssueTracker`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use foreman_core::IssueId;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::comment_render::truncate_for_error;
use crate::issue_filter::{carries_trigger_label, TriggerLabel};
use crate::retry::{parse_retry_after_ms, retry_delay, RetryPolicy};
use crate::{
    AuthorKind, CiStatus, CommentAuthor, IssueState, IssueTracker, PostedComment,
    PullRequestDraft, PullRequestRef, TrackerComment, TrackerError, TrackerIssue, TrackerResult,
};

const GITHUB_PAGE_SIZE: usize = 100;
const RETRY_ATTEMPT_HEADER: &str = "x-foreman-retry-attempt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn parse(raw: &str) -> TrackerResult<Self> {
        let trimmed = raw.trim();
        let (owner, name) = trimmed.split_once('/').ok_or_else(|| {
            TrackerError::InvalidConfig(format!(
                "invalid repository '{raw}', expected owner/repo"
            ))
        })?;
        let owner = owner.trim();
        let name = name.trim();
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(TrackerError::InvalidConfig(format!(
                "invalid repository '{raw}', expected owner/repo"
            )));
        }
        Ok(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn as_slug(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GithubUser {
    login: String,
    #[serde(rename = "type", default)]
    account_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GithubIssueLabel {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GithubIssue {
    number: u64,
    title: String,
    body: Option<String>,
    #[serde(default)]
    state: Option<String>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    labels: Vec<GithubIssueLabel>,
    #[serde(default)]
    pull_request: Option<Value>,
}

impl GithubIssue {
    fn into_tracker_issue(self) -> TrackerIssue {
        let state = match self.state.as_deref().map(str::trim) {
            Some(state) if state.eq_ignore_ascii_case("closed") => IssueState::Closed,
            _ => IssueState::Open,
        };
        TrackerIssue {
            id: IssueId(self.number),
            title: self.title,
            body: self.body.unwrap_or_default(),
            state,
            labels: self.labels.into_iter().map(|label| label.name).collect(),
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GithubIssueComment {
    id: u64,
    body: Option<String>,
    created_at: DateTime<Utc>,
    user: GithubUser,
}

#[derive(Debug, Clone, Deserialize)]
struct GithubCommentCreateResponse {
    id: u64,
    html_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GithubPullCreateResponse {
    number: u64,
    html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GithubCombinedStatus {
    state: String,
}

#[derive(Clone)]
pub struct GithubTracker {
    http: reqwest::Client,
    api_base: String,
    repo: RepoRef,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl GithubTracker {
    pub fn new(
        api_base: String,
        token: String,
        repo: RepoRef,
        request_timeout_ms: u64,
        retry_max_attempts: usize,
        retry_base_delay_ms: u64,
    ) -> TrackerResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("foreman-daemon"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            reqwest::header::HeaderValue::from_static("2022-11-28"),
        );
        let auth_header = format!("Bearer {}", token.trim());
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&auth_header).map_err(|_| {
                TrackerError::InvalidConfig("invalid github authorization header".to_string())
            })?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .map_err(|error| {
                TrackerError::InvalidConfig(format!("failed to create github client: {error}"))
            })?;
        Ok(Self {
            http: client,
            api_base: api_base.trim_end_matches('/').to_string(),
            repo,
            retry_max_attempts: retry_max_attempts.max(1),
            retry_base_delay_ms: retry_base_delay_ms.max(1),
        })
    }

    pub fn repo(&self) -> &RepoRef {
        &self.repo
    }

    fn repo_url(&self, suffix: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_base, self.repo.owner, self.repo.name, suffix
        )
    }

    async fn list_paginated<T, F>(&self, operation: &str, mut request_builder: F) -> TrackerResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: FnMut(&str) -> reqwest::RequestBuilder,
    {
        let mut page = 1_u32;
        let mut rows = Vec::new();
        loop {
            let page_value = page.to_string();
            let chunk: Vec<T> = self
                .request_json(operation, RetryPolicy::Idempotent, || {
                    request_builder(page_value.as_str())
                })
                .await?;
            let chunk_len = chunk.len();
            rows.extend(chunk);
            if chunk_len < GITHUB_PAGE_SIZE {
                break;
            }
            page = page.saturating_add(1);
        }
        Ok(rows)
    }

    async fn request_json<T, F>(
        &self,
        operation: &str,
        policy: RetryPolicy,
        mut request_builder: F,
    ) -> TrackerResult<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = request_builder()
                .header(RETRY_ATTEMPT_HEADER, attempt.saturating_sub(1).to_string())
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<T>().await.map_err(|error| {
                            TrackerError::Decode {
                                operation: operation.to_string(),
                                message: error.to_string(),
                            }
                        });
                    }

                    let retry_after = parse_retry_after_ms(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if attempt < self.retry_max_attempts && policy.retries_status(status.as_u16()) {
                        tracing::debug!(
                            operation,
                            status = status.as_u16(),
                            attempt,
                            "retrying github request"
                        );
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            operation,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }

                    return Err(TrackerError::Status {
                        operation: operation.to_string(),
                        status: status.as_u16(),
                        body: truncate_for_error(&body, 800),
                    });
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts && policy.retries_transport(&error) {
                        tracing::debug!(operation, attempt, error = %error, "retrying github transport error");
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            operation,
                            None,
                        ))
                        .await;
                        continue;
                    }
                    return Err(TrackerError::Transport {
                        operation: operation.to_string(),
                        source: error,
                    });
                }
            }
        }
    }
}

fn comment_author(user: GithubUser) -> CommentAuthor {
    let is_bot = user
        .account_type
        .as_deref()
        .is_some_and(|kind| kind.trim().eq_ignore_ascii_case("bot"));
    CommentAuthor {
        login: user.login,
        kind: if is_bot { AuthorKind::Bot } else { AuthorKind::User },
    }
}

#[async_trait]
impl IssueTracker for GithubTracker {
    async fn list_triggered_issues(&self, label: &str) -> TrackerResult<Vec<TrackerIssue>> {
        let url = self.repo_url("issues");
        let rows: Vec<GithubIssue> = self
            .list_paginated("list triggered issues", |page| {
                self.http.get(url.as_str()).query(&[
                    ("state", "open"),
                    ("labels", label),
                    ("sort", "created"),
                    ("direction", "asc"),
                    ("per_page", "100"),
                    ("page", page),
                ])
            })
            .await?;
        let trigger = TriggerLabel::parse(label);
        Ok(rows
            .into_iter()
            .filter(|issue| issue.pull_request.is_none())
            .filter(|issue| {
                carries_trigger_label(
                    trigger.as_ref(),
                    issue.labels.iter().map(|label| label.name.as_str()),
                )
            })
            .map(GithubIssue::into_tracker_issue)
            .collect())
    }

    async fn read_issue(&self, issue_id: IssueId) -> TrackerResult<TrackerIssue> {
        let url = self.repo_url(&format!("issues/{issue_id}"));
        let result: TrackerResult<GithubIssue> = self
            .request_json("read issue", RetryPolicy::Idempotent, || self.http.get(url.as_str()))
            .await;
        match result {
            Ok(issue) => Ok(issue.into_tracker_issue()),
            Err(TrackerError::Status { status: 404, .. }) => Err(TrackerError::NotFound(issue_id)),
            Err(error) => Err(error),
        }
    }

    async fn list_comments(
        &self,
        issue_id: IssueId,
        since: Option<DateTime<Utc>>,
    ) -> TrackerResult<Vec<TrackerComment>> {
        let url = self.repo_url(&format!("issues/{issue_id}/comments"));
        let since_value = since.map(|value| value.to_rfc3339_opts(SecondsFormat::Secs, true));
        let rows: Vec<GithubIssueComment> = self
            .list_paginated("list issue comments", |page| {
                let mut request = self.http.get(url.as_str()).query(&[
                    ("sort", "created"),
                    ("direction", "asc"),
                    ("per_page", "100"),
                    ("page", page),
                ]);
                if let Some(since_value) = since_value.as_deref() {
                    request = request.query(&[("since", since_value)]);
                }
                request
            })
            .await?;
        let mut comments = rows
            .into_iter()
            .map(|comment| TrackerComment {
                id: comment.id,
                issue_id,
                body: comment.body.unwrap_or_default(),
                author: comment_author(comment.user),
                created_at: comment.created_at,
            })
            .collect::<Vec<_>>();
        comments.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(comments)
    }

    async fn post_comment(&self, issue_id: IssueId, body: &str) -> TrackerResult<PostedComment> {
        let url = self.repo_url(&format!("issues/{issue_id}/comments"));
        let payload = json!({ "body": body });
        let created: GithubCommentCreateResponse = self
            .request_json("create issue comment", RetryPolicy::SingleDelivery, || {
                self.http.post(url.as_str()).json(&payload)
            })
            .await?;
        Ok(PostedComment {
            id: created.id,
            url: created.html_url,
        })
    }

    async fn create_pull_request(
        &self,
        draft: &PullRequestDraft,
    ) -> TrackerResult<PullRequestRef> {
        let url = self.repo_url("pulls");
        let payload = json!({
            "title": draft.title,
            "body": draft.body,
            "head": draft.head,
            "base": draft.base,
        });
        let created: GithubPullCreateResponse = self
            .request_json("create pull request", RetryPolicy::SingleDelivery, || {
                self.http.post(url.as_str()).json(&payload)
            })
            .await?;
        Ok(PullRequestRef {
            number: created.number,
            url: created.html_url,
        })
    }

    async fn get_ci_status(&self, git_ref: &str) -> TrackerResult<CiStatus> {
        let url = self.repo_url(&format!("commits/{}/status", git_ref.trim()));
        let combined: GithubCombinedStatus = self
            .request_json("get ci status", RetryPolicy::Idempotent, || self.http.get(url.as_str()))
            .await?;
        Ok(CiStatus::from_combined_state(&combined.state))
    }
}
