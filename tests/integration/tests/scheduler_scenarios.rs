#![cfg(unix)]

mod support;

use chrono::{Duration as ChronoDuration, Utc};
use foreman_core::{ActiveAgentSession, AgentRole, AutomationRecord, AutomationStatus, IssueId, TurnActor};
use foreman_runtime::config::RoutingConfig;
use foreman_runtime::router::{AgentRouter, RouteOutcome};
use foreman_runtime::scheduler::ActivityState;
use foreman_tracker::AGENT_TURN_MARKER;

use support::{executor_script, planner_script, record, slow_planner_script, wake_until, Harness};

fn stalled_executor_script() -> String {
    "sh -c 'cat > /dev/null; sleep 30'".to_string()
}

fn planned_record(issue: u64, title: &str) -> AutomationRecord {
    let created_at = Utc::now() - ChronoDuration::hours(1);
    let mut record = AutomationRecord::triggered(IssueId(issue), title, None, created_at);
    record.has_plan = true;
    record.plan_summary = Some("1. add a csv writer\n2. wire the export button".to_string());
    record.last_turn_actor = TurnActor::Agent;
    record.status = AutomationStatus::WaitingForUser;
    record
}

#[tokio::test]
async fn integration_newly_labeled_issue_dispatches_planner_and_awaits_user() {
    let harness = Harness::new(
        planner_script("1. add a csv writer"),
        executor_script(None),
    );
    harness
        .tracker
        .open_issue(7, "Add CSV export", "Exports should support CSV.")
        .await;

    let fresh = AutomationRecord::triggered(IssueId(7), "Add CSV export", Some("csv".to_string()), Utc::now());
    let router = AgentRouter::from_config(&RoutingConfig::default()).expect("router");
    assert_eq!(router.route(&fresh, None).outcome, RouteOutcome::DispatchPlanner);

    let mut scheduler = harness.scheduler();
    let first = scheduler.wake().await.expect("wake");
    assert_eq!(first.created, 1);
    assert_eq!(first.dispatched, 1);

    let store = harness.store();
    let dispatched = record(&store, 7);
    assert_eq!(dispatched.status, AutomationStatus::Planning);
    assert!(!dispatched.has_plan);
    assert!(dispatched.active_session_ref.is_some());
    let session = scheduler
        .context()
        .supervisor()
        .session(IssueId(7))
        .expect("planner session")
        .clone();
    assert_eq!(session.role, AgentRole::Planner);

    wake_until(&mut scheduler, |scheduler| !scheduler.context().supervisor().has_session(IssueId(7))).await;

    let planned = record(&store, 7);
    assert_eq!(planned.status, AutomationStatus::WaitingForUser);
    assert_eq!(planned.last_turn_actor, TurnActor::Agent);
    assert!(planned.has_plan);
    assert!(planned
        .plan_summary
        .as_deref()
        .is_some_and(|plan| plan.contains("add a csv writer")));
    assert!(planned.active_session_ref.is_none());

    let posted = harness.tracker.posted_to(7).await;
    assert_eq!(posted.len(), 1);
    assert!(posted[0].contains("## Plan"));

    let idle = scheduler.wake().await.expect("wake");
    assert_eq!(idle.dispatched, 0);
    assert_eq!(record(&store, 7).status, AutomationStatus::WaitingForUser);
}

#[tokio::test]
async fn integration_ship_instruction_runs_executor_and_completes_with_reported_pull_request() {
    let harness = Harness::new(
        planner_script("unused"),
        executor_script(Some("https://github.com/acme/widgets/pull/77")),
    );
    harness.tracker.open_issue(7, "Add CSV export", "Exports should support CSV.").await;
    let store = harness.store();
    store.upsert_record(&planned_record(7, "Add CSV export")).expect("seed record");
    harness.tracker.user_comment(7, "Looks good, ship it").await;

    let mut scheduler = harness.scheduler();
    let first = scheduler.wake().await.expect("wake");
    assert_eq!(first.dispatched, 1);
    assert_eq!(record(&store, 7).status, AutomationStatus::Executing);
    let session = scheduler
        .context()
        .supervisor()
        .session(IssueId(7))
        .expect("executor session")
        .clone();
    assert_eq!(session.role, AgentRole::Executor);
    assert!(session.ship_requested);

    let reports = wake_until(&mut scheduler, |scheduler| {
        !scheduler.context().supervisor().has_session(IssueId(7))
    })
    .await;
    assert_eq!(reports.iter().map(|report| report.completed).sum::<usize>(), 1);

    let shipped = record(&store, 7);
    assert_eq!(shipped.status, AutomationStatus::Completed);
    assert_eq!(
        shipped.pull_request_url.as_deref(),
        Some("https://github.com/acme/widgets/pull/77")
    );
    assert!(harness.tracker.pull_requests().await.is_empty());
    let posted = harness.tracker.posted_to(7).await;
    assert!(posted
        .iter()
        .any(|body| body.contains("## Execution Report") && body.contains("pull/77")));
}

#[tokio::test]
async fn integration_ship_without_reported_pull_request_opens_one_from_the_branch() {
    let harness = Harness::new(planner_script("unused"), executor_script(None));
    harness.tracker.open_issue(9, "Fix pagination", "Page two repeats page one.").await;
    let store = harness.store();
    store.upsert_record(&planned_record(9, "Fix pagination")).expect("seed record");
    harness.tracker.user_comment(9, "please open a pr when done").await;

    let mut scheduler = harness.scheduler();
    wake_until(&mut scheduler, |scheduler| {
        scheduler
            .context()
            .store()
            .get_record(IssueId(9))
            .ok()
            .flatten()
            .is_some_and(|record| record.status.is_terminal())
    })
    .await;

    let drafts = harness.tracker.pull_requests().await;
    assert_eq!(drafts.len(), 1);
    assert!(drafts[0].title.contains("#9"));
    assert!(drafts[0].body.contains("Resolves #9"));
    assert_eq!(drafts[0].base, "main");
    assert!(drafts[0].head.contains('9'));

    let shipped = record(&store, 9);
    assert_eq!(shipped.status, AutomationStatus::Completed);
    assert_eq!(
        shipped.pull_request_url.as_deref(),
        Some("https://github.com/acme/widgets/pull/101")
    );
}

#[tokio::test]
async fn integration_concurrency_cap_defers_fourth_issue_to_a_later_wake() {
    let mut harness = Harness::new(slow_planner_script(1), executor_script(None));
    harness.config.agents.max_concurrent_sessions = 3;
    for issue in 1..=4 {
        harness
            .tracker
            .open_issue(issue, &format!("Issue {issue}"), "needs a plan")
            .await;
    }

    let mut scheduler = harness.scheduler();
    let first = scheduler.wake().await.expect("wake");
    assert_eq!(first.created, 4);
    assert_eq!(first.dispatched, 3);
    assert_eq!(first.deferred, 1);
    assert_eq!(scheduler.context().supervisor().active_count(), 3);
    assert!(!scheduler.context().supervisor().has_session(IssueId(4)));

    let store = harness.store();
    assert_eq!(record(&store, 4).status, AutomationStatus::Triggered);

    let reports = wake_until(&mut scheduler, |scheduler| {
        assert!(scheduler.context().supervisor().active_count() <= 3);
        scheduler
            .context()
            .store()
            .get_record(IssueId(4))
            .ok()
            .flatten()
            .is_some_and(|record| record.status == AutomationStatus::WaitingForUser)
    })
    .await;
    assert!(reports.iter().all(|report| report.tracker_errors == 0));
    assert_eq!(reports.iter().map(|report| report.dispatched).sum::<usize>(), 1);

    for issue in 1..=4 {
        assert_eq!(record(&store, issue).status, AutomationStatus::WaitingForUser);
        assert_eq!(harness.tracker.posted_to(issue).await.len(), 1);
    }
}

#[tokio::test]
async fn integration_restart_clears_dead_session_and_redispatches_exactly_once() {
    let harness = Harness::new(planner_script("1. retry the plan"), executor_script(None));
    harness.tracker.open_issue(12, "Flaky upload", "Uploads time out.").await;
    let store = harness.store();

    let mut dead = std::process::Command::new("true").spawn().expect("spawn");
    let dead_pid = dead.id();
    dead.wait().expect("wait");

    let started_at = Utc::now() - ChronoDuration::minutes(5);
    let mut stale = AutomationRecord::triggered(
        IssueId(12),
        "Flaky upload",
        Some("Uploads time out.".to_string()),
        started_at,
    );
    let session_ref = ActiveAgentSession::session_ref_for(IssueId(12), AgentRole::Planner, started_at);
    stale.status = AutomationStatus::Planning;
    stale.active_session_ref = Some(session_ref.clone());
    store.upsert_record(&stale).expect("seed record");
    store
        .register_session(&ActiveAgentSession {
            session_ref,
            issue_id: IssueId(12),
            role: AgentRole::Planner,
            pid: Some(dead_pid),
            started_at,
            log_path: harness.root.join("state/logs/issue-12-stale.log"),
            output_offset: 0,
            workspace_path: harness.root.join("workspaces/issue-12"),
            ship_requested: false,
            estimated_cost_usd: 2.0,
        })
        .expect("seed session");

    let mut scheduler = harness.scheduler();
    let reconcile = scheduler.startup().expect("startup");
    assert_eq!(reconcile.stale.len(), 1);
    assert!(reconcile.adopted.is_empty());
    let cleared = record(&store, 12);
    assert!(cleared.active_session_ref.is_none());
    assert!(cleared
        .note
        .as_deref()
        .is_some_and(|note| note.starts_with("stale_session")));
    assert_eq!(cleared.status, AutomationStatus::Planning);

    let mut reports = vec![scheduler.wake().await.expect("wake")];
    assert_eq!(reports[0].dispatched, 1);
    let sessions = store.list_sessions().expect("sessions");
    assert_eq!(sessions.len(), 1);
    assert_ne!(sessions[0].pid, Some(dead_pid));

    reports.extend(
        wake_until(&mut scheduler, |scheduler| {
            !scheduler.context().supervisor().has_session(IssueId(12))
        })
        .await,
    );
    reports.push(scheduler.wake().await.expect("wake"));
    assert_eq!(reports.iter().map(|report| report.dispatched).sum::<usize>(), 1);
    assert_eq!(record(&store, 12).status, AutomationStatus::WaitingForUser);
    assert_eq!(harness.tracker.posted_to(12).await.len(), 1);
}

#[tokio::test]
async fn integration_budget_guard_refuses_executor_over_daily_limit() {
    let harness = Harness::new(planner_script("unused"), executor_script(None));
    harness.tracker.open_issue(5, "Dark mode", "Add a dark theme.").await;
    let store = harness.store();
    store.upsert_record(&planned_record(5, "Dark mode")).expect("seed record");
    store
        .add_daily_spend(Utc::now().date_naive(), 19.5)
        .expect("seed spend");
    harness.tracker.user_comment(5, "implement it").await;

    let mut scheduler = harness.scheduler();
    let report = scheduler.wake().await.expect("wake");
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.budget_refused, 1);
    assert_eq!(scheduler.context().supervisor().active_count(), 0);
    assert!(store.list_sessions().expect("sessions").is_empty());

    let refused = record(&store, 5);
    assert_eq!(refused.status, AutomationStatus::WaitingForUser);
    assert_eq!(refused.last_turn_actor, TurnActor::Agent);
    assert!(refused
        .note
        .as_deref()
        .is_some_and(|note| note.starts_with("budget_exceeded") && note.contains("daily")));
    let posted = harness.tracker.posted_to(5).await;
    assert_eq!(posted.len(), 1);
    assert!(posted[0].contains("refused by the budget guard"));

    let quiet = scheduler.wake().await.expect("wake");
    assert_eq!(quiet.budget_refused, 0);
    assert_eq!(harness.tracker.posted_to(5).await.len(), 1);
}

#[tokio::test]
async fn integration_per_issue_budget_refusal_waits_for_user_and_never_fails() {
    let harness = Harness::new(planner_script("unused"), executor_script(None));
    harness.tracker.open_issue(6, "Bulk import", "Import thousands of rows.").await;
    let store = harness.store();
    let mut seeded = planned_record(6, "Bulk import");
    seeded.spend_usd = 9.5;
    store.upsert_record(&seeded).expect("seed record");
    harness.tracker.user_comment(6, "implement it").await;

    let mut scheduler = harness.scheduler();
    let first = scheduler.wake().await.expect("wake");
    assert_eq!(first.budget_refused, 1);
    assert_eq!(first.dispatched, 0);
    assert_eq!(first.failed, 0);
    let refused = record(&store, 6);
    assert_eq!(refused.status, AutomationStatus::WaitingForUser);
    assert_eq!(refused.last_turn_actor, TurnActor::Agent);
    assert!(refused
        .note
        .as_deref()
        .is_some_and(|note| note.starts_with("budget_exceeded") && note.contains("per-issue")));

    harness.tracker.user_comment(6, "limits should be fine now, go ahead").await;
    let second = scheduler.wake().await.expect("wake");
    assert_eq!(second.budget_refused, 1);
    assert_eq!(record(&store, 6).status, AutomationStatus::WaitingForUser);
    assert!(store.list_sessions().expect("sessions").is_empty());
    let posted = harness.tracker.posted_to(6).await;
    assert_eq!(posted.len(), 2);
    assert!(posted.iter().all(|body| body.contains("refused by the budget guard")));
    assert!(posted.iter().all(|body| !body.contains("Automation stopped")));
}

#[tokio::test]
async fn integration_escalation_discards_plan_and_redispatches_planner() {
    let harness = Harness::new(planner_script("1. store exports as parquet instead"), executor_script(None));
    harness.tracker.open_issue(13, "Add CSV export", "Exports should support CSV.").await;
    let store = harness.store();
    store.upsert_record(&planned_record(13, "Add CSV export")).expect("seed record");
    harness
        .tracker
        .user_comment(13, "CSV is a dead end, we need a different approach")
        .await;

    let mut scheduler = harness.scheduler();
    let first = scheduler.wake().await.expect("wake");
    assert_eq!(first.dispatched, 1);
    let session = scheduler
        .context()
        .supervisor()
        .session(IssueId(13))
        .expect("planner session")
        .clone();
    assert_eq!(session.role, AgentRole::Planner);
    assert!(!session.ship_requested);
    let replanning = record(&store, 13);
    assert_eq!(replanning.status, AutomationStatus::Planning);
    assert!(!replanning.has_plan);
    assert!(replanning.plan_summary.is_none());

    wake_until(&mut scheduler, |scheduler| {
        !scheduler.context().supervisor().has_session(IssueId(13))
    })
    .await;
    let replanned = record(&store, 13);
    assert_eq!(replanned.status, AutomationStatus::WaitingForUser);
    assert!(replanned.has_plan);
    assert!(replanned
        .plan_summary
        .as_deref()
        .is_some_and(|plan| plan.contains("parquet") && !plan.contains("csv writer")));
    let posted = harness.tracker.posted_to(13).await;
    assert_eq!(posted.len(), 1);
    assert!(posted[0].contains("## Plan"));
}

#[tokio::test]
async fn regression_timed_out_session_workspace_is_discarded_and_rebuilt_fresh() {
    let mut harness = Harness::new(planner_script("unused"), stalled_executor_script());
    harness.config.agents.agent_wall_clock_timeout_secs = 1;
    harness.tracker.open_issue(14, "Cache warmup", "Warm the cache on boot.").await;
    let store = harness.store();
    store.upsert_record(&planned_record(14, "Cache warmup")).expect("seed record");
    harness.tracker.user_comment(14, "implement it").await;

    let mut scheduler = harness.scheduler();
    let first = scheduler.wake().await.expect("wake");
    assert_eq!(first.dispatched, 1);
    assert_eq!(harness.backend.checkouts(), 1);
    let workspace = harness
        .config
        .workspaces_root()
        .join(foreman_core::workspace_dir_name(IssueId(14)));
    let leftover = workspace.join("half-applied.patch");
    std::fs::write(&leftover, "partial edit").expect("write leftover");

    wake_until(&mut scheduler, |scheduler| {
        !scheduler.context().supervisor().has_session(IssueId(14))
    })
    .await;
    let timed_out = record(&store, 14);
    assert_eq!(timed_out.status, AutomationStatus::Failed);
    assert!(timed_out
        .note
        .as_deref()
        .is_some_and(|note| note.starts_with("timeout")));
    assert!(harness.tracker.posted_to(14).await[0].contains("`timeout`"));

    let rebuilt = scheduler
        .context_mut()
        .workspaces_mut()
        .ensure(IssueId(14))
        .await
        .expect("ensure");
    assert_eq!(rebuilt.path, workspace);
    assert_eq!(harness.backend.checkouts(), 2);
    assert!(!leftover.exists());
    assert!(workspace.join("README.md").exists());
}

#[tokio::test]
async fn functional_checkout_failure_fails_issue_once_without_redispatch() {
    let harness = Harness::new(planner_script("unused"), executor_script(None));
    harness.backend.reject_checkouts();
    harness.tracker.open_issue(17, "Rename crate", "Rename the crate to widgets-core.").await;

    let mut scheduler = harness.scheduler();
    let first = scheduler.wake().await.expect("wake");
    assert_eq!(first.dispatched, 0);
    assert_eq!(first.failed, 1);
    assert_eq!(harness.backend.checkouts(), 2);

    let store = harness.store();
    let failed = record(&store, 17);
    assert_eq!(failed.status, AutomationStatus::Failed);
    assert!(failed
        .note
        .as_deref()
        .is_some_and(|note| note.starts_with("workspace_error") && note.contains("already checked out")));
    let posted = harness.tracker.posted_to(17).await;
    assert_eq!(posted.len(), 1);
    assert!(posted[0].contains("workspace_error"));

    harness.tracker.user_comment(17, "try again please").await;
    let after = scheduler.wake().await.expect("wake");
    assert_eq!(after.dispatched, 0);
    assert_eq!(after.failed, 0);
    assert_eq!(harness.backend.checkouts(), 2);
}

#[tokio::test]
async fn regression_daemon_comments_do_not_count_as_activity() {
    let harness = Harness::new(planner_script("1. refine"), executor_script(None));
    harness.tracker.open_issue(18, "Theme picker", "Let users pick a theme.").await;
    let store = harness.store();
    store.upsert_record(&planned_record(18, "Theme picker")).expect("seed record");
    harness
        .tracker
        .user_comment(18, &format!("## Plan\n\n1. add a picker\n\n{AGENT_TURN_MARKER}"))
        .await;

    let mut scheduler = harness.scheduler();
    let quiet = scheduler.wake().await.expect("wake");
    assert_eq!(quiet.dispatched, 0);
    assert_eq!(quiet.activity_state, ActivityState::Idle);
    assert_eq!(record(&store, 18).status, AutomationStatus::WaitingForUser);

    harness.tracker.user_comment(18, "could the picker live in settings?").await;
    let busy = scheduler.wake().await.expect("wake");
    assert_eq!(busy.activity_state, ActivityState::VeryActive);
}
