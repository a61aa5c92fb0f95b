//! Polling scheduler: adaptive cadence plus the per-wake orchestration of
//! discovery, routing, budget checks, workspaces and agent sessions.
//!
//! All subsystems live in one owned [`SchedulerContext`]. A wake is a bounded
//! sequence of tracker calls and local decisions; the only suspension point
//! between wakes is the cadence sleep.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use foreman_core::{AgentRole, AutomationRecord, AutomationStatus, IssueId, WorkspaceLifecycle};
use foreman_store::SqliteStateStore;
use foreman_tracker::{AgentAuthorshipPolicy, IssueState, IssueTracker, TrackerError, TrackerIssue};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent_prompt::{list_workspace_files, render_agent_prompt, truncate_prompt, PromptContext};
use crate::budget::{BudgetGuard, BudgetVerdict};
use crate::config::{ForemanConfig, PollingConfig};
use crate::control::{ControlHandle, StatusSnapshot};
use crate::failure::DispatchFailure;
use crate::router::{AgentRouter, RouteOutcome};
use crate::session_outcome::OutcomeDisposition;
use crate::supervisor::{ProcessSupervisor, ReconcileReport, SpawnError, SpawnRequest};
use crate::turn_tracking::{ingest_comments, opening_request, seed_seen_comments};
use crate::workspace::{CheckoutBackend, WorkspaceManager};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    #[default]
    Idle,
    Active,
    VeryActive,
}

impl ActivityState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::VeryActive => "very_active",
        }
    }
}

/// Maps activity recency onto one of three polling intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingCadence {
    idle: Duration,
    active: Duration,
    very_active: Duration,
    very_active_window: ChronoDuration,
    active_window: ChronoDuration,
}

impl PollingCadence {
    pub fn from_config(config: &PollingConfig) -> Self {
        Self {
            idle: Duration::from_secs(config.idle_interval_secs),
            active: Duration::from_secs(config.active_interval_secs),
            very_active: Duration::from_secs(config.very_active_interval_secs),
            very_active_window: seconds(config.very_active_window_secs),
            active_window: seconds(config.active_window_secs),
        }
    }

    pub fn classify(&self, latest_activity: Option<DateTime<Utc>>, now: DateTime<Utc>) -> ActivityState {
        let Some(latest_activity) = latest_activity else {
            return ActivityState::Idle;
        };
        let elapsed = now
            .signed_duration_since(latest_activity)
            .max(ChronoDuration::zero());
        if elapsed < self.very_active_window {
            ActivityState::VeryActive
        } else if elapsed < self.active_window {
            ActivityState::Active
        } else {
            ActivityState::Idle
        }
    }

    pub fn interval(&self, state: ActivityState) -> Duration {
        match state {
            ActivityState::Idle => self.idle,
            ActivityState::Active => self.active,
            ActivityState::VeryActive => self.very_active,
        }
    }
}

fn seconds(value: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(value).unwrap_or(i64::MAX))
}

/// Most recent observed activity per issue. Derived state; never persisted.
#[derive(Debug, Default, Clone)]
pub struct ActivityWindow {
    latest: HashMap<IssueId, DateTime<Utc>>,
}

impl ActivityWindow {
    pub fn observe(&mut self, issue_id: IssueId, at: DateTime<Utc>) {
        let entry = self.latest.entry(issue_id).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }

    pub fn forget(&mut self, issue_id: IssueId) {
        self.latest.remove(&issue_id);
    }

    pub fn most_recent(&self) -> Option<DateTime<Utc>> {
        self.latest.values().copied().max()
    }
}

/// Counters for one wake, also published on the status surface.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct WakeReport {
    pub wake: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub discovered: usize,
    pub created: usize,
    pub dispatched: usize,
    pub deferred: usize,
    pub budget_refused: usize,
    pub failed: usize,
    pub completed: usize,
    pub outcomes: usize,
    pub comments_redelivered: usize,
    pub reaped: usize,
    pub tracker_errors: usize,
    pub activity_state: ActivityState,
    pub next_interval_secs: u64,
}

/// Owned state threaded through every subsystem call.
pub struct SchedulerContext {
    pub(crate) config: ForemanConfig,
    pub(crate) store: SqliteStateStore,
    pub(crate) tracker: Arc<dyn IssueTracker>,
    pub(crate) router: AgentRouter,
    pub(crate) budget: BudgetGuard,
    pub(crate) workspaces: WorkspaceManager,
    pub(crate) supervisor: ProcessSupervisor,
    pub(crate) authorship: AgentAuthorshipPolicy,
}

impl SchedulerContext {
    pub fn new(
        config: ForemanConfig,
        tracker: Arc<dyn IssueTracker>,
        backend: Arc<dyn CheckoutBackend>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir)
            .with_context(|| format!("failed to create state dir {}", config.state_dir.display()))?;
        let state_db_path = config.state_db_path();
        let store = SqliteStateStore::new(&state_db_path)
            .with_context(|| format!("failed to open state store {}", state_db_path.display()))?;
        let router = AgentRouter::from_config(&config.routing)?;
        let budget = BudgetGuard::new(config.budget.clone());
        let workspaces = WorkspaceManager::from_config(&config, backend);
        let supervisor = ProcessSupervisor::new(
            store.clone(),
            config.log_dir(),
            config.agents.max_concurrent_sessions,
            config.agents.wall_clock_timeout(),
        );
        let authorship = AgentAuthorshipPolicy::new(
            config.tracker.bot_login.clone(),
            config.routing.agent_signatures.clone(),
        );
        Ok(Self {
            config,
            store,
            tracker,
            router,
            budget,
            workspaces,
            supervisor,
            authorship,
        })
    }

    pub fn config(&self) -> &ForemanConfig {
        &self.config
    }

    pub fn store(&self) -> &SqliteStateStore {
        &self.store
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn budget(&self) -> &BudgetGuard {
        &self.budget
    }

    pub fn workspaces_mut(&mut self) -> &mut WorkspaceManager {
        &mut self.workspaces
    }
}

pub struct Scheduler {
    ctx: SchedulerContext,
    cadence: PollingCadence,
    activity: ActivityWindow,
    control: ControlHandle,
    wakes: u64,
    started: bool,
    current_interval: Duration,
}

impl Scheduler {
    pub fn new(ctx: SchedulerContext, control: ControlHandle) -> Self {
        let cadence = PollingCadence::from_config(&ctx.config.polling);
        let current_interval = cadence.interval(ActivityState::Idle);
        Self {
            ctx,
            cadence,
            activity: ActivityWindow::default(),
            control,
            wakes: 0,
            started: false,
            current_interval,
        }
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut SchedulerContext {
        &mut self.ctx
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    pub fn wakes(&self) -> u64 {
        self.wakes
    }

    /// Reconciles the persisted session registry. Runs once, before the first wake.
    pub fn startup(&mut self) -> Result<ReconcileReport> {
        let report = self.ctx.supervisor.reconcile_registry()?;
        for session in &report.adopted {
            self.ctx.budget.reserve(session.estimated_cost_usd);
            self.activity.observe(session.issue_id, session.started_at);
        }

        let now = Utc::now();
        let live = self.ctx.supervisor.active_issue_ids();
        for mut record in self.ctx.store.list_open_records()? {
            if record.active_session_ref.is_none() || live.contains(&record.issue_id) {
                continue;
            }
            let failure = DispatchFailure::StaleSession;
            debug!(
                issue_id = record.issue_id.get(),
                session_ref = ?record.active_session_ref,
                reason = failure.reason_code(),
                "clearing stale session reference; issue will be re-evaluated"
            );
            record.note = record.active_session_ref.take().map(|session_ref| {
                format!("{}: {session_ref} was not running at startup", failure.reason_code())
            });
            record.updated_at = now;
            self.ctx.store.upsert_record(&record)?;
        }

        info!(
            adopted = report.adopted.len(),
            stale = report.stale.len(),
            available_slots = self.ctx.supervisor.available_slots(),
            "session registry reconciled"
        );
        self.started = true;
        Ok(report)
    }

    /// One polling pass. Per-issue failures are logged and never abort it;
    /// an `Err` means the state store itself is unusable.
    pub async fn wake(&mut self) -> Result<WakeReport> {
        if !self.started {
            self.startup()?;
        }
        let now = Utc::now();
        let mut report = WakeReport {
            wake: self.wakes.saturating_add(1),
            started_at: Some(now),
            ..WakeReport::default()
        };

        for issue_id in self.control.take_cancel_requests() {
            if self.ctx.supervisor.poll_liveness(issue_id) {
                self.ctx.supervisor.request_cancel(issue_id);
            } else {
                debug!(issue_id = issue_id.get(), "cancel requested for issue without a live session");
            }
        }
        self.collect_outcomes(now, &mut report).await?;

        match self.ctx.flush_outbox().await {
            Ok(delivered) => report.comments_redelivered = delivered,
            Err(error) => warn!(error = %format!("{error:#}"), "outbox delivery failed"),
        }

        let candidates = self.discover(now, &mut report).await?;
        for issue_id in candidates {
            if let Err(error) = self.dispatch(issue_id, now, &mut report).await {
                warn!(
                    issue_id = issue_id.get(),
                    error = %format!("{error:#}"),
                    "dispatch attempt failed"
                );
            }
        }

        self.reap_workspaces(now, &mut report).await?;

        let state = self.cadence.classify(self.activity.most_recent(), now);
        self.current_interval = self.cadence.interval(state);
        report.activity_state = state;
        report.next_interval_secs = self.current_interval.as_secs();
        self.wakes = report.wake;

        self.publish_snapshot(&report);
        let every = self.ctx.config.polling.status_log_every_wakes;
        if every > 0 && self.wakes % every == 0 {
            self.log_status_summary();
        }
        debug!(
            wake = report.wake,
            discovered = report.discovered,
            dispatched = report.dispatched,
            deferred = report.deferred,
            activity = state.as_str(),
            next_interval_secs = report.next_interval_secs,
            "wake complete"
        );
        Ok(report)
    }

    /// Wakes until `shutdown` flips. Agent sessions are left running so the
    /// next daemon can adopt them.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.startup()?;
        let control = self.control.clone();
        loop {
            if let Err(error) = self.wake().await {
                warn!(
                    error = %format!("{error:#}"),
                    retry_in_secs = self.current_interval.as_secs(),
                    "wake failed; retrying next interval"
                );
            }
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.current_interval) => {}
                _ = control.poll_requested() => {
                    debug!("immediate wake requested");
                }
            }
        }
        info!(
            wakes = self.wakes,
            active_sessions = self.ctx.supervisor.active_count(),
            "scheduler stopped"
        );
        Ok(())
    }

    async fn collect_outcomes(&mut self, now: DateTime<Utc>, report: &mut WakeReport) -> Result<()> {
        for outcome in self.ctx.supervisor.poll_all() {
            let issue_id = outcome.session.issue_id;
            report.outcomes += 1;
            match self.ctx.apply_session_outcome(outcome).await {
                Ok(OutcomeDisposition::Shipped) => {
                    report.completed += 1;
                    self.activity.forget(issue_id);
                }
                Ok(OutcomeDisposition::Failed(_)) => report.failed += 1,
                Ok(_) => {}
                Err(error) => warn!(
                    issue_id = issue_id.get(),
                    error = %format!("{error:#}"),
                    "failed to apply session outcome"
                ),
            }
        }
        Ok(())
    }

    /// Refreshes every triggered issue and returns dispatch candidates in
    /// discovery (record creation) order.
    async fn discover(&mut self, now: DateTime<Utc>, report: &mut WakeReport) -> Result<Vec<IssueId>> {
        let label = self.ctx.config.tracker.trigger_label.clone();
        let issues = match self.ctx.tracker.list_triggered_issues(&label).await {
            Ok(issues) => issues,
            Err(error) => {
                report.tracker_errors += 1;
                warn!(
                    error = %error,
                    transient = error.is_transient(),
                    "failed to list triggered issues; skipping discovery this wake"
                );
                return Ok(Vec::new());
            }
        };
        report.discovered = issues.len();

        let mut listed = HashSet::new();
        let mut candidates = Vec::new();
        for issue in &issues {
            listed.insert(issue.id);
            match self.refresh_issue(issue, now, report).await {
                Ok(Some(created_at)) => candidates.push((created_at, issue.id)),
                Ok(None) => {}
                Err(error) => {
                    report.tracker_errors += 1;
                    warn!(
                        issue_id = issue.id.get(),
                        error = %format!("{error:#}"),
                        "failed to refresh issue; retrying next wake"
                    );
                }
            }
        }
        self.detect_closed(&listed, now, report).await?;

        candidates.sort();
        Ok(candidates.into_iter().map(|(_, issue_id)| issue_id).collect())
    }

    /// Creates or updates the issue's record. Returns its creation time when
    /// the issue may be routed this wake.
    async fn refresh_issue(
        &mut self,
        issue: &TrackerIssue,
        now: DateTime<Utc>,
        report: &mut WakeReport,
    ) -> Result<Option<DateTime<Utc>>> {
        let Some(mut record) = self.ctx.store.get_record(issue.id)? else {
            let history = self.ctx.tracker.list_comments(issue.id, None).await?;
            let mut record =
                AutomationRecord::triggered(issue.id, &issue.title, opening_request(issue), now);
            seed_seen_comments(&mut record, &history);
            self.ctx.store.upsert_record(&record)?;
            self.activity.observe(issue.id, now);
            report.created += 1;
            info!(
                issue_id = issue.id.get(),
                title = %record.title,
                "tracking newly triggered issue"
            );
            return Ok(Some(record.created_at));
        };

        if record.status.is_terminal() {
            self.activity.forget(issue.id);
            return Ok(None);
        }
        if self.ctx.supervisor.has_session(issue.id) {
            return Ok(None);
        }

        let comments = self
            .ctx
            .tracker
            .list_comments(issue.id, Some(record.created_at))
            .await?;
        let summary = ingest_comments(&mut record, &comments, &self.ctx.authorship, now);
        if let Some(at) = summary.latest_activity_at {
            self.activity.observe(issue.id, at);
        }
        if summary.changed() {
            debug!(
                issue_id = issue.id.get(),
                new_comments = summary.new_comments,
                user_comments = summary.user_comments,
                agent_comments = summary.agent_comments,
                turn = record.last_turn_actor.as_str(),
                "ingested issue comments"
            );
            self.ctx.store.upsert_record(&record)?;
        }
        Ok(Some(record.created_at))
    }

    /// Completes tracked records whose issue was closed on the tracker.
    async fn detect_closed(
        &mut self,
        listed: &HashSet<IssueId>,
        now: DateTime<Utc>,
        report: &mut WakeReport,
    ) -> Result<()> {
        for mut record in self.ctx.store.list_open_records()? {
            let issue_id = record.issue_id;
            if listed.contains(&issue_id) || self.ctx.supervisor.has_session(issue_id) {
                continue;
            }
            let closed = match self.ctx.tracker.read_issue(issue_id).await {
                Ok(issue) => issue.state == IssueState::Closed,
                Err(TrackerError::NotFound(_)) => true,
                Err(error) => {
                    report.tracker_errors += 1;
                    debug!(issue_id = issue_id.get(), error = %error, "failed to read issue state");
                    false
                }
            };
            if !closed {
                continue;
            }
            record.active_session_ref = None;
            record.note = Some("issue closed on the tracker".to_string());
            if let Err(error) = record.transition_to(AutomationStatus::Completed, now) {
                warn!(issue_id = issue_id.get(), error = %error, "closed issue could not complete");
                continue;
            }
            self.ctx.store.upsert_record(&record)?;
            self.activity.forget(issue_id);
            report.completed += 1;
            info!(issue_id = issue_id.get(), "issue closed; automation completed");
            match self.ctx.workspaces.reap(issue_id).await {
                Ok(true) => report.reaped += 1,
                Ok(false) => {}
                Err(error) => warn!(issue_id = issue_id.get(), error = %error, "failed to reap workspace"),
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, issue_id: IssueId, now: DateTime<Utc>, report: &mut WakeReport) -> Result<()> {
        let Some(mut record) = self.ctx.store.get_record(issue_id)? else {
            return Ok(());
        };
        if record.status.is_terminal() || self.ctx.supervisor.has_session(issue_id) {
            return Ok(());
        }

        let decision = self.ctx.router.route(&record, record.pending_request.as_deref());
        let role = match decision.outcome {
            RouteOutcome::NoAction => return Ok(()),
            RouteOutcome::DispatchPlanner | RouteOutcome::Escalate => AgentRole::Planner,
            RouteOutcome::DispatchExecutor => AgentRole::Executor,
        };

        if self.ctx.supervisor.available_slots() == 0 {
            report.deferred += 1;
            debug!(
                issue_id = issue_id.get(),
                role = role.as_str(),
                "concurrency cap reached; deferring to next wake"
            );
            return Ok(());
        }

        let daily_spend = self
            .ctx
            .store
            .daily_spend(now.date_naive())
            .context("failed to read daily spend")?;
        let estimate_usd = match self.ctx.budget.check(&record, role, daily_spend) {
            BudgetVerdict::Allowed { estimate_usd } => estimate_usd,
            BudgetVerdict::Refused(refusal) => {
                report.budget_refused += 1;
                warn!(
                    issue_id = issue_id.get(),
                    role = role.as_str(),
                    scope = refusal.scope.as_str(),
                    projected_usd = refusal.projected_usd,
                    limit_usd = refusal.limit_usd,
                    "dispatch refused by budget guard"
                );
                self.ctx
                    .record_failure(&mut record, refusal.failure(), &refusal.detail(), None)
                    .await;
                self.ctx.store.upsert_record(&record)?;
                return Ok(());
            }
        };

        let workspace = match self.ctx.workspaces.ensure(issue_id).await {
            Ok(workspace) => workspace,
            Err(error) => {
                report.failed += 1;
                self.ctx
                    .record_failure(&mut record, DispatchFailure::WorkspaceError, &error.to_string(), None)
                    .await;
                self.ctx.store.upsert_record(&record)?;
                return Ok(());
            }
        };

        let escalate = decision.outcome == RouteOutcome::Escalate;
        let ship_requested = role == AgentRole::Executor
            && record
                .pending_request
                .as_deref()
                .is_some_and(|request| self.ctx.router.is_ship_instruction(request));
        let prompt = render_agent_prompt(&PromptContext {
            issue_id,
            title: record.title.clone(),
            role,
            plan_summary: if escalate { None } else { record.plan_summary.clone() },
            request: record.pending_request.clone(),
            workspace_path: workspace.path.clone(),
            branch_name: workspace.branch_name.clone(),
            ship_requested,
            files: list_workspace_files(&workspace.path),
        });
        let request = SpawnRequest {
            issue_id,
            role,
            command: self.ctx.config.agents.command_for(role)?,
            prompt: truncate_prompt(&prompt, self.ctx.config.agents.max_prompt_bytes),
            workspace_path: workspace.path.clone(),
            ship_requested,
            estimated_cost_usd: estimate_usd,
        };

        match self.ctx.supervisor.spawn(request) {
            Ok(session) => {
                self.ctx.budget.reserve(estimate_usd);
                self.ctx.workspaces.set_lifecycle(issue_id, WorkspaceLifecycle::InUse);
                if escalate {
                    record.has_plan = false;
                    record.plan_summary = None;
                }
                record.active_session_ref = Some(session.session_ref.clone());
                record.note = None;
                let next = match role {
                    AgentRole::Planner => AutomationStatus::Planning,
                    AgentRole::Executor => AutomationStatus::Executing,
                };
                if let Err(error) = record.transition_to(next, now) {
                    warn!(issue_id = issue_id.get(), error = %error, "dispatch transition rejected");
                }
                self.ctx.store.upsert_record(&record)?;
                self.activity.observe(issue_id, now);
                report.dispatched += 1;
                info!(
                    issue_id = issue_id.get(),
                    role = role.as_str(),
                    rule = decision.rule,
                    outcome = decision.outcome.as_str(),
                    session_ref = %session.session_ref,
                    ship_requested,
                    estimated_usd = estimate_usd,
                    "agent dispatched"
                );
            }
            Err(SpawnError::NoSlot(max_sessions)) => {
                report.deferred += 1;
                debug!(issue_id = issue_id.get(), max_sessions, "no free session slot; deferring");
            }
            Err(SpawnError::AlreadyActive(_)) => {
                debug!(issue_id = issue_id.get(), "issue already has a session");
            }
            Err(SpawnError::Launch(error)) => {
                report.failed += 1;
                let message = format!("{error:#}");
                self.ctx
                    .record_failure(&mut record, DispatchFailure::ProcessCrash, &message, None)
                    .await;
                self.ctx.store.upsert_record(&record)?;
            }
        }
        Ok(())
    }

    async fn reap_workspaces(&mut self, now: DateTime<Utc>, report: &mut WakeReport) -> Result<()> {
        let records = self.ctx.store.list_records()?;
        let live = self.ctx.supervisor.active_issue_ids();
        for issue_id in self.ctx.workspaces.reap_due(&records, now) {
            if live.contains(&issue_id) {
                continue;
            }
            match self.ctx.workspaces.reap(issue_id).await {
                Ok(true) => report.reaped += 1,
                Ok(false) => {}
                Err(error) => warn!(issue_id = issue_id.get(), error = %error, "failed to reap workspace"),
            }
        }
        Ok(())
    }

    fn publish_snapshot(&self, report: &WakeReport) {
        let records = match self.ctx.store.list_records() {
            Ok(records) => records,
            Err(error) => {
                warn!(error = %error, "failed to load records for status snapshot");
                return;
            }
        };
        let daily_spend_usd = self
            .ctx
            .store
            .daily_spend(Utc::now().date_naive())
            .unwrap_or_default();
        self.control.publish(StatusSnapshot::capture(
            &self.ctx,
            &records,
            daily_spend_usd,
            report.clone(),
        ));
    }

    fn log_status_summary(&self) {
        let counts = match self.ctx.store.count_records_by_status() {
            Ok(counts) => counts
                .iter()
                .map(|count| format!("{}={}", count.status.as_str(), count.count))
                .collect::<Vec<_>>()
                .join(","),
            Err(error) => format!("unavailable ({error})"),
        };
        info!(
            wakes = self.wakes,
            active_sessions = self.ctx.supervisor.active_count(),
            available_slots = self.ctx.supervisor.available_slots(),
            reserved_usd = self.ctx.budget.reserved_usd(),
            records = %counts,
            "scheduler status"
        );
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use foreman_core::IssueId;
    use std::time::Duration;

    use super::{ActivityState, ActivityWindow, PollingCadence};
    use crate::config::PollingConfig;

    #[test]
    fn unit_cadence_classifies_recency_into_three_states() {
        let cadence = PollingCadence::from_config(&PollingConfig::default());
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).single().expect("timestamp");
        assert_eq!(cadence.classify(None, now), ActivityState::Idle);
        assert_eq!(
            cadence.classify(Some(now - ChronoDuration::seconds(30)), now),
            ActivityState::VeryActive
        );
        assert_eq!(
            cadence.classify(Some(now - ChronoDuration::seconds(120)), now),
            ActivityState::Active
        );
        assert_eq!(
            cadence.classify(Some(now - ChronoDuration::seconds(599)), now),
            ActivityState::Active
        );
        assert_eq!(
            cadence.classify(Some(now - ChronoDuration::minutes(10)), now),
            ActivityState::Idle
        );
    }

    #[test]
    fn regression_future_activity_counts_as_very_active() {
        let cadence = PollingCadence::from_config(&PollingConfig::default());
        let now = Utc::now();
        assert_eq!(
            cadence.classify(Some(now + ChronoDuration::seconds(90)), now),
            ActivityState::VeryActive
        );
    }

    #[test]
    fn unit_cadence_intervals_follow_config() {
        let cadence = PollingCadence::from_config(&PollingConfig {
            idle_interval_secs: 90,
            active_interval_secs: 20,
            very_active_interval_secs: 3,
            ..PollingConfig::default()
        });
        assert_eq!(cadence.interval(ActivityState::Idle), Duration::from_secs(90));
        assert_eq!(cadence.interval(ActivityState::Active), Duration::from_secs(20));
        assert_eq!(cadence.interval(ActivityState::VeryActive), Duration::from_secs(3));
    }

    #[test]
    fn unit_activity_window_tracks_latest_per_issue() {
        let base = Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).single().expect("timestamp");
        let mut window = ActivityWindow::default();
        assert!(window.most_recent().is_none());
        window.observe(IssueId(1), base);
        window.observe(IssueId(1), base - ChronoDuration::minutes(5));
        window.observe(IssueId(2), base + ChronoDuration::minutes(1));
        assert_eq!(window.most_recent(), Some(base + ChronoDuration::minutes(1)));
        window.forget(IssueId(2));
        assert_eq!(window.most_recent(), Some(base));
    }
}
