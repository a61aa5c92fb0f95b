//! Local HTTP control surface: status, health, forced polls and cancellation.
//!
//! The scheduler publishes a [`StatusSnapshot`] after every wake; handlers
//! only read that snapshot or queue requests, so they never touch the store
//! or the supervisor directly.

use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use foreman_core::{AutomationRecord, AutomationStatus, IssueId, TurnActor};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tracing::info;

use crate::scheduler::{ActivityState, SchedulerContext, WakeReport};
use crate::supervisor::SessionView;

pub const HEALTH_ENDPOINT: &str = "/health";
pub const STATUS_ENDPOINT: &str = "/status";
pub const POLL_ENDPOINT: &str = "/poll";
pub const CANCEL_ENDPOINT: &str = "/issues/{issue_id}/cancel";

/// Per-issue view exposed on `/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordView {
    pub issue_id: IssueId,
    pub title: String,
    pub status: AutomationStatus,
    pub has_plan: bool,
    pub last_turn_actor: TurnActor,
    pub active_session_ref: Option<String>,
    pub spend_usd: f64,
    pub note: Option<String>,
    pub pull_request_url: Option<String>,
    pub comment_queued: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<&AutomationRecord> for RecordView {
    fn from(record: &AutomationRecord) -> Self {
        Self {
            issue_id: record.issue_id,
            title: record.title.clone(),
            status: record.status,
            has_plan: record.has_plan,
            last_turn_actor: record.last_turn_actor,
            active_session_ref: record.active_session_ref.clone(),
            spend_usd: record.spend_usd,
            note: record.note.clone(),
            pull_request_url: record.pull_request_url.clone(),
            comment_queued: record.undelivered_comment.is_some(),
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    pub generated_at: Option<DateTime<Utc>>,
    pub wakes: u64,
    pub activity_state: ActivityState,
    pub next_interval_secs: u64,
    pub max_sessions: usize,
    pub available_slots: usize,
    pub sessions: Vec<SessionView>,
    pub records: Vec<RecordView>,
    pub daily_spend_usd: f64,
    pub reserved_usd: f64,
    pub last_wake: Option<WakeReport>,
}

impl StatusSnapshot {
    pub(crate) fn capture(
        ctx: &SchedulerContext,
        records: &[AutomationRecord],
        daily_spend_usd: f64,
        last_wake: WakeReport,
    ) -> Self {
        Self {
            generated_at: Some(Utc::now()),
            wakes: last_wake.wake,
            activity_state: last_wake.activity_state,
            next_interval_secs: last_wake.next_interval_secs,
            max_sessions: ctx.supervisor().max_sessions(),
            available_slots: ctx.supervisor().available_slots(),
            sessions: ctx.supervisor().session_views(),
            records: records.iter().map(RecordView::from).collect(),
            daily_spend_usd,
            reserved_usd: ctx.budget().reserved_usd(),
            last_wake: Some(last_wake),
        }
    }

    pub fn has_session(&self, issue_id: IssueId) -> bool {
        self.sessions.iter().any(|session| session.issue_id == issue_id)
    }
}

struct ControlShared {
    started_at: DateTime<Utc>,
    poll: Notify,
    cancels: Mutex<Vec<IssueId>>,
    snapshot: RwLock<StatusSnapshot>,
}

/// Cheap-to-clone channel between the HTTP handlers and the scheduler.
#[derive(Clone)]
pub struct ControlHandle {
    inner: Arc<ControlShared>,
}

impl Default for ControlHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ControlShared {
                started_at: Utc::now(),
                poll: Notify::new(),
                cancels: Mutex::new(Vec::new()),
                snapshot: RwLock::new(StatusSnapshot::default()),
            }),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Wakes the scheduler early. A request made mid-wake triggers the next
    /// wake immediately after the current one.
    pub fn request_poll(&self) {
        self.inner.poll.notify_one();
    }

    pub async fn poll_requested(&self) {
        self.inner.poll.notified().await;
    }

    pub fn queue_cancel(&self, issue_id: IssueId) {
        let mut cancels = self
            .inner
            .cancels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !cancels.contains(&issue_id) {
            cancels.push(issue_id);
        }
    }

    pub fn take_cancel_requests(&self) -> Vec<IssueId> {
        let mut cancels = self
            .inner
            .cancels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *cancels)
    }

    pub fn publish(&self, snapshot: StatusSnapshot) {
        let mut current = self
            .inner
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = snapshot;
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

pub fn build_control_router(handle: ControlHandle) -> Router {
    Router::new()
        .route(HEALTH_ENDPOINT, get(handle_health))
        .route(STATUS_ENDPOINT, get(handle_status))
        .route(POLL_ENDPOINT, post(handle_poll))
        .route(CANCEL_ENDPOINT, post(handle_cancel))
        .with_state(handle)
}

/// Serves the control surface on `listener` until `shutdown` flips to true.
pub async fn serve_control_surface(
    listener: TcpListener,
    handle: ControlHandle,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local_addr = listener
        .local_addr()
        .context("failed to resolve control surface address")?;
    info!(addr = %local_addr, "control surface listening");
    axum::serve(listener, build_control_router(handle))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .context("control surface exited unexpectedly")
}

async fn handle_health(State(handle): State<ControlHandle>) -> Response {
    let snapshot = handle.snapshot();
    let now = Utc::now();
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "pid": std::process::id(),
            "started_at": handle.started_at(),
            "uptime_secs": now.signed_duration_since(handle.started_at()).num_seconds().max(0),
            "wakes": snapshot.wakes,
            "last_wake_at": snapshot.generated_at,
            "activity_state": snapshot.activity_state,
            "active_sessions": snapshot.sessions.len(),
        })),
    )
        .into_response()
}

async fn handle_status(State(handle): State<ControlHandle>) -> Response {
    (StatusCode::OK, Json(handle.snapshot())).into_response()
}

async fn handle_poll(State(handle): State<ControlHandle>) -> Response {
    handle.request_poll();
    (StatusCode::ACCEPTED, Json(json!({ "status": "queued" }))).into_response()
}

async fn handle_cancel(
    State(handle): State<ControlHandle>,
    AxumPath(raw_issue_id): AxumPath<String>,
) -> Response {
    let Ok(issue_id) = raw_issue_id.trim().trim_start_matches('#').parse::<u64>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "invalid_issue_id",
                "message": format!("'{raw_issue_id}' is not an issue number"),
            })),
        )
            .into_response();
    };
    let issue_id = IssueId(issue_id);
    if !handle.snapshot().has_session(issue_id) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "no_active_session",
                "issue_id": issue_id,
            })),
        )
            .into_response();
    }
    handle.queue_cancel(issue_id);
    handle.request_poll();
    info!(issue_id = issue_id.get(), "cancel queued via control surface");
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "cancel_queued", "issue_id": issue_id })),
    )
        .into_response()
}
