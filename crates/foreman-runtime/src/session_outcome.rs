//! Applies a finished agent session to its automation record.

use anyhow::{Context, Result};
use chrono::Utc;
use foreman_core::{AgentRole, AutomationRecord, AutomationStatus, TurnActor};
use foreman_tracker::comment_render::{
    render_agent_report_comment, render_budget_refusal_comment, render_failure_comment,
    truncate_for_error,
};
use foreman_tracker::{CiStatus, PullRequestDraft};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agent_report::{parse_completion_report, reported_cost_usd, CompletionReport};
use crate::failure::DispatchFailure;
use crate::scheduler::SchedulerContext;
use crate::supervisor::{SessionOutcome, SessionPhase};

const PLAN_SUMMARY_MAX_CHARS: usize = 4_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "disposition", content = "reason")]
pub enum OutcomeDisposition {
    Planned,
    Executed,
    Shipped,
    Failed(DispatchFailure),
    /// Adopted session ended without a report; the record is re-routed.
    Reconciled,
    /// No record exists for the session's issue.
    Orphaned,
}

impl SchedulerContext {
    pub(crate) async fn apply_session_outcome(
        &mut self,
        outcome: SessionOutcome,
    ) -> Result<OutcomeDisposition> {
        let session = &outcome.session;
        let issue_id = session.issue_id;
        let Some(mut record) = self
            .store
            .get_record(issue_id)
            .with_context(|| format!("failed to load record for issue {issue_id}"))?
        else {
            warn!(issue_id = issue_id.get(), "finished session has no automation record");
            self.budget.release(session.estimated_cost_usd);
            return Ok(OutcomeDisposition::Orphaned);
        };

        let report = match outcome.phase {
            SessionPhase::Exited { .. } => parse_completion_report(&outcome.output),
            _ => None,
        };
        let reported = report
            .as_ref()
            .and_then(|report| report.reported_cost_usd)
            .or_else(|| reported_cost_usd(&outcome.output));
        let cost_usd = self.budget.settle(session.estimated_cost_usd, reported);
        record.spend_usd += cost_usd;
        record.active_session_ref = None;
        self.store
            .add_daily_spend(Utc::now().date_naive(), cost_usd)
            .context("failed to record daily spend")?;
        debug!(
            issue_id = issue_id.get(),
            estimated_usd = session.estimated_cost_usd,
            recorded_usd = cost_usd,
            "agent spend reconciled"
        );

        let disposition = match (&outcome.phase, report) {
            (SessionPhase::Exited { .. }, Some(report)) => {
                self.complete_turn(&mut record, &outcome, report, cost_usd).await
            }
            (SessionPhase::Exited { code: None }, None) if outcome.adopted => {
                info!(
                    issue_id = issue_id.get(),
                    session_ref = %session.session_ref,
                    "adopted session ended without a report; re-evaluating issue"
                );
                record.updated_at = Utc::now();
                OutcomeDisposition::Reconciled
            }
            (SessionPhase::Exited { .. }, None) => {
                self.record_failure(
                    &mut record,
                    DispatchFailure::ProcessCrash,
                    "agent output contained no completion report",
                    Some(&outcome.log_tail),
                )
                .await;
                OutcomeDisposition::Failed(DispatchFailure::ProcessCrash)
            }
            (SessionPhase::Crashed { reason }, _) => {
                self.record_failure(
                    &mut record,
                    DispatchFailure::ProcessCrash,
                    reason,
                    Some(&outcome.log_tail),
                )
                .await;
                OutcomeDisposition::Failed(DispatchFailure::ProcessCrash)
            }
            (SessionPhase::TimedOut, _) => {
                self.workspaces.invalidate(issue_id);
                let message = format!(
                    "agent exceeded the wall-clock budget of {}s and was terminated",
                    self.config.agents.agent_wall_clock_timeout_secs
                );
                self.record_failure(
                    &mut record,
                    DispatchFailure::Timeout,
                    &message,
                    Some(&outcome.log_tail),
                )
                .await;
                OutcomeDisposition::Failed(DispatchFailure::Timeout)
            }
            (SessionPhase::Cancelled, _) => {
                self.record_failure(
                    &mut record,
                    DispatchFailure::Cancelled,
                    "agent session cancelled by operator request",
                    None,
                )
                .await;
                OutcomeDisposition::Failed(DispatchFailure::Cancelled)
            }
            (SessionPhase::Spawned | SessionPhase::Running, _) => {
                warn!(issue_id = issue_id.get(), "ignoring non-terminal session outcome");
                OutcomeDisposition::Reconciled
            }
        };

        self.store
            .upsert_record(&record)
            .with_context(|| format!("failed to persist record for issue {issue_id}"))?;

        if record.status == AutomationStatus::Completed {
            if let Err(error) = self.workspaces.reap(issue_id).await {
                warn!(issue_id = issue_id.get(), error = %error, "failed to reap workspace");
            }
        }
        Ok(disposition)
    }

    async fn complete_turn(
        &mut self,
        record: &mut AutomationRecord,
        outcome: &SessionOutcome,
        report: CompletionReport,
        cost_usd: f64,
    ) -> OutcomeDisposition {
        let session = &outcome.session;
        let now = Utc::now();
        match session.role {
            AgentRole::Planner => {
                record.has_plan = true;
                record.plan_summary = Some(truncate_for_error(&report.body, PLAN_SUMMARY_MAX_CHARS));
                let body = render_agent_report_comment(
                    AgentRole::Planner,
                    &report.body,
                    &session.session_ref,
                    cost_usd,
                    None,
                    None,
                );
                self.deliver_comment(record, body).await;
                self.hand_turn_to_user(record, None);
                info!(issue_id = record.issue_id.get(), "plan posted; waiting for user");
                OutcomeDisposition::Planned
            }
            AgentRole::Executor if session.ship_requested => {
                let branch = self.workspaces.branch_name(record.issue_id);
                let pull_request_url = match report.pull_request_url.clone() {
                    Some(url) => Some(url),
                    None => self.open_pull_request(record, &branch, &report.body).await,
                };
                let Some(url) = pull_request_url else {
                    let body = render_agent_report_comment(
                        AgentRole::Executor,
                        &report.body,
                        &session.session_ref,
                        cost_usd,
                        None,
                        None,
                    );
                    self.deliver_comment(record, body).await;
                    self.hand_turn_to_user(
                        record,
                        Some("pull request could not be opened; reply to retry".to_string()),
                    );
                    return OutcomeDisposition::Executed;
                };
                let ci_status = match self.tracker.get_ci_status(&branch).await {
                    Ok(status) => Some(status),
                    Err(error) => {
                        debug!(issue_id = record.issue_id.get(), error = %error, "ci status unavailable");
                        None
                    }
                };
                let body = render_agent_report_comment(
                    AgentRole::Executor,
                    &report.body,
                    &session.session_ref,
                    cost_usd,
                    ci_status,
                    Some(&url),
                );
                self.deliver_comment(record, body).await;
                record.pull_request_url = Some(url.clone());
                record.last_turn_actor = TurnActor::Agent;
                record.pending_request = None;
                record.note = Some(format!(
                    "shipped as {url} (ci {})",
                    ci_status.unwrap_or(CiStatus::Unknown).as_str()
                ));
                if let Err(error) = record.transition_to(AutomationStatus::Completed, now) {
                    warn!(issue_id = record.issue_id.get(), error = %error, "completion rejected");
                }
                info!(issue_id = record.issue_id.get(), pull_request = %url, "issue completed");
                OutcomeDisposition::Shipped
            }
            AgentRole::Executor => {
                let body = render_agent_report_comment(
                    AgentRole::Executor,
                    &report.body,
                    &session.session_ref,
                    cost_usd,
                    None,
                    report.pull_request_url.as_deref(),
                );
                self.deliver_comment(record, body).await;
                if report.pull_request_url.is_some() {
                    record.pull_request_url = report.pull_request_url.clone();
                }
                self.hand_turn_to_user(record, None);
                info!(issue_id = record.issue_id.get(), "execution report posted; waiting for user");
                OutcomeDisposition::Executed
            }
        }
    }

    async fn open_pull_request(
        &self,
        record: &AutomationRecord,
        branch: &str,
        report: &str,
    ) -> Option<String> {
        let draft = PullRequestDraft {
            title: format!("{} (#{})", record.title, record.issue_id),
            body: format!("Resolves #{}\n\n{}", record.issue_id, report.trim()),
            head: branch.to_string(),
            base: self.workspaces.base_branch().to_string(),
        };
        match self.tracker.create_pull_request(&draft).await {
            Ok(pull_request) => {
                info!(
                    issue_id = record.issue_id.get(),
                    number = pull_request.number,
                    "pull request opened"
                );
                Some(pull_request.url)
            }
            Err(error) => {
                warn!(issue_id = record.issue_id.get(), error = %error, "failed to open pull request");
                None
            }
        }
    }

    pub(crate) fn hand_turn_to_user(&self, record: &mut AutomationRecord, note: Option<String>) {
        if let Err(error) = record.hand_turn_to_user(note, Utc::now()) {
            warn!(issue_id = record.issue_id.get(), error = %error, "could not hand turn to user");
        }
    }

    /// Fatal failures move the record to `Failed`; recoverable ones hand the
    /// turn back to the user. Either way the note carries the reason code.
    pub(crate) async fn record_failure(
        &mut self,
        record: &mut AutomationRecord,
        failure: DispatchFailure,
        message: &str,
        log_tail: Option<&str>,
    ) {
        let note = format!("{}: {}", failure.reason_code(), truncate_for_error(message, 600));
        if failure.is_issue_fatal() {
            warn!(
                issue_id = record.issue_id.get(),
                reason = failure.reason_code(),
                message,
                "issue automation failed"
            );
            if let Err(error) = record.fail(note.clone(), Utc::now()) {
                warn!(issue_id = record.issue_id.get(), error = %error, "failure transition rejected");
            }
        } else {
            info!(
                issue_id = record.issue_id.get(),
                reason = failure.reason_code(),
                message,
                "dispatch refused; waiting for the user"
            );
            self.hand_turn_to_user(record, Some(note.clone()));
        }
        if failure.is_user_visible() {
            let body = match failure {
                DispatchFailure::BudgetExceeded => render_budget_refusal_comment(&note),
                _ => render_failure_comment(failure.reason_code(), message, log_tail),
            };
            self.deliver_comment(record, body).await;
        }
    }

    /// Posts `body`, or queues it on the record when the tracker is unavailable
    /// or earlier comments are still queued.
    pub(crate) async fn deliver_comment(&self, record: &mut AutomationRecord, body: String) {
        if let Some(queued) = record.undelivered_comment.take() {
            record.undelivered_comment = Some(format!("{queued}\n\n{body}"));
            return;
        }
        if let Err(error) = self.tracker.post_comment(record.issue_id, &body).await {
            warn!(
                issue_id = record.issue_id.get(),
                error = %error,
                transient = error.is_transient(),
                "comment delivery failed; queued for retry"
            );
            record.undelivered_comment = Some(body);
        }
    }

    /// Retries queued comments. Returns how many were delivered.
    pub(crate) async fn flush_outbox(&self) -> Result<usize> {
        let mut delivered = 0;
        for mut record in self.store.list_records()? {
            let Some(body) = record.undelivered_comment.clone() else {
                continue;
            };
            match self.tracker.post_comment(record.issue_id, &body).await {
                Ok(_) => {
                    record.undelivered_comment = None;
                    self.store.upsert_record(&record)?;
                    delivered += 1;
                }
                Err(error) => {
                    debug!(issue_id = record.issue_id.get(), error = %error, "outbox delivery deferred");
                }
            }
        }
        Ok(delivered)
    }
}
