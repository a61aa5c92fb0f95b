#![cfg(unix)]

mod support;

use foreman_core::{AutomationStatus, IssueId};

use support::{crashing_script, executor_script, planner_script, record, slow_planner_script, wake_until, Harness};

#[tokio::test]
async fn regression_failed_comment_is_queued_and_redelivered_next_wake() {
    let harness = Harness::new(planner_script("1. split the parser"), executor_script(None));
    harness.tracker.open_issue(3, "Parser rewrite", "The parser is too slow.").await;
    harness.tracker.fail_next_posts(2).await;

    let mut scheduler = harness.scheduler();
    wake_until(&mut scheduler, |scheduler| {
        !scheduler.context().supervisor().has_session(IssueId(3))
            && scheduler.wakes() > 0
    })
    .await;

    let store = harness.store();
    let queued = record(&store, 3);
    assert_eq!(queued.status, AutomationStatus::WaitingForUser);
    assert!(queued
        .undelivered_comment
        .as_deref()
        .is_some_and(|body| body.contains("split the parser")));
    assert!(harness.tracker.posted_to(3).await.is_empty());

    let report = scheduler.wake().await.expect("wake");
    assert_eq!(report.comments_redelivered, 1);
    assert!(record(&store, 3).undelivered_comment.is_none());
    let posted = harness.tracker.posted_to(3).await;
    assert_eq!(posted.len(), 1);
    assert!(posted[0].contains("## Plan"));

    let quiet = scheduler.wake().await.expect("wake");
    assert_eq!(quiet.comments_redelivered, 0);
    assert_eq!(quiet.dispatched, 0);
}

#[tokio::test]
async fn functional_closed_issue_completes_record_and_reaps_workspace() {
    let harness = Harness::new(planner_script("1. profile first"), executor_script(None));
    harness.tracker.open_issue(4, "Slow startup", "Startup takes ten seconds.").await;

    let mut scheduler = harness.scheduler();
    wake_until(&mut scheduler, |scheduler| {
        !scheduler.context().supervisor().has_session(IssueId(4)) && scheduler.wakes() > 0
    })
    .await;
    let workspace = harness.config.workspaces_root().join(foreman_core::workspace_dir_name(IssueId(4)));
    assert!(workspace.exists());

    harness.tracker.close_issue(4).await;
    let report = scheduler.wake().await.expect("wake");
    assert_eq!(report.completed, 1);
    assert_eq!(report.dispatched, 0);

    let store = harness.store();
    let closed = record(&store, 4);
    assert_eq!(closed.status, AutomationStatus::Completed);
    assert!(closed.note.as_deref().is_some_and(|note| note.contains("closed")));
    assert!(!workspace.exists());

    harness.tracker.open_issue(4, "Slow startup", "Reopened.").await;
    let reopened = scheduler.wake().await.expect("wake");
    assert_eq!(reopened.dispatched, 0);
    assert_eq!(record(&store, 4).status, AutomationStatus::Completed);
}

#[tokio::test]
async fn functional_agent_exit_without_report_fails_issue_with_log_tail() {
    let harness = Harness::new(crashing_script(3), executor_script(None));
    harness.tracker.open_issue(8, "Crash on save", "Saving panics.").await;

    let mut scheduler = harness.scheduler();
    let reports = wake_until(&mut scheduler, |scheduler| {
        scheduler
            .context()
            .store()
            .get_record(IssueId(8))
            .ok()
            .flatten()
            .is_some_and(|record| record.status.is_terminal())
    })
    .await;
    assert_eq!(reports.iter().map(|report| report.failed).sum::<usize>(), 1);

    let store = harness.store();
    let failed = record(&store, 8);
    assert_eq!(failed.status, AutomationStatus::Failed);
    assert!(failed
        .note
        .as_deref()
        .is_some_and(|note| note.starts_with("process_crash")));
    assert!(failed.active_session_ref.is_none());

    let posted = harness.tracker.posted_to(8).await;
    assert_eq!(posted.len(), 1);
    assert!(posted[0].contains("process_crash"));
    assert!(posted[0].contains("panicked at src/lib.rs"));

    harness.tracker.user_comment(8, "please try again").await;
    let after = scheduler.wake().await.expect("wake");
    assert_eq!(after.dispatched, 0);
}

#[tokio::test]
async fn functional_operator_cancel_stops_session_and_fails_issue() {
    let harness = Harness::new(slow_planner_script(30), executor_script(None));
    harness.tracker.open_issue(11, "Long analysis", "Investigate memory growth.").await;

    let mut scheduler = harness.scheduler();
    let first = scheduler.wake().await.expect("wake");
    assert_eq!(first.dispatched, 1);
    assert!(scheduler.context().supervisor().has_session(IssueId(11)));

    scheduler.control().queue_cancel(IssueId(11));
    wake_until(&mut scheduler, |scheduler| {
        !scheduler.context().supervisor().has_session(IssueId(11))
    })
    .await;

    let store = harness.store();
    let cancelled = record(&store, 11);
    assert_eq!(cancelled.status, AutomationStatus::Failed);
    assert!(cancelled
        .note
        .as_deref()
        .is_some_and(|note| note.starts_with("cancelled")));
    assert!(store.list_sessions().expect("sessions").is_empty());
    assert_eq!(scheduler.context().supervisor().available_slots(), 3);
}

#[tokio::test]
async fn integration_status_snapshot_tracks_sessions_between_wakes() {
    let harness = Harness::new(slow_planner_script(1), executor_script(None));
    harness.tracker.open_issue(21, "Docs refresh", "README is stale.").await;

    let mut scheduler = harness.scheduler();
    scheduler.wake().await.expect("wake");
    let snapshot = scheduler.control().snapshot();
    assert_eq!(snapshot.wakes, 1);
    assert!(snapshot.has_session(IssueId(21)));
    assert_eq!(snapshot.available_slots, 2);
    assert_eq!(snapshot.records.len(), 1);
    assert_eq!(snapshot.reserved_usd, 2.0);

    wake_until(&mut scheduler, |scheduler| {
        !scheduler.context().supervisor().has_session(IssueId(21))
    })
    .await;
    let settled = scheduler.control().snapshot();
    assert!(!settled.has_session(IssueId(21)));
    assert_eq!(settled.reserved_usd, 0.0);
    assert_eq!(settled.daily_spend_usd, 2.0);
    assert!(harness.tracker.listing_reads().await >= 2);
}
