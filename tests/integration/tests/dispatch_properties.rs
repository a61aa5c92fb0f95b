#![cfg(unix)]

mod support;

use std::collections::HashSet;
use std::time::Duration;

use foreman_core::IssueId;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

use support::{crashing_script, executor_script, planner_script, slow_planner_script, Harness};

const ISSUES: [u64; 3] = [31, 32, 33];

#[derive(Debug, Clone)]
enum Step {
    Wake,
    Comment { issue: u64, body: &'static str },
    Pause { millis: u64 },
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => Just(Step::Wake),
        2 => (
            prop::sample::select(ISSUES.to_vec()),
            prop::sample::select(vec![
                "looks good, ship it",
                "please refine step two",
                "we need a different approach",
                "implement it",
            ]),
        )
            .prop_map(|(issue, body)| Step::Comment { issue, body }),
        1 => (0_u64..150).prop_map(|millis| Step::Pause { millis }),
    ]
}

fn planner_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(planner_script("1. do the thing")),
        Just(slow_planner_script(0)),
        Just(crashing_script(2)),
    ]
}

/// Registry, records and supervisor must agree on exactly one session per
/// busy issue.
fn check_single_session_per_issue(
    harness: &Harness,
    scheduler: &foreman_runtime::Scheduler,
) -> Result<(), TestCaseError> {
    let store = harness.store();
    let sessions = store.list_sessions().expect("sessions");
    let distinct = sessions
        .iter()
        .map(|session| session.issue_id)
        .collect::<HashSet<_>>();
    prop_assert_eq!(distinct.len(), sessions.len());
    prop_assert!(sessions.len() <= 3);

    let supervisor = scheduler.context().supervisor();
    for issue in ISSUES {
        let registered = sessions.iter().find(|session| session.issue_id == IssueId(issue));
        let record = store.get_record(IssueId(issue)).expect("record");
        if let Some(session) = registered {
            prop_assert!(supervisor.has_session(IssueId(issue)));
            let active_ref = record.as_ref().and_then(|record| record.active_session_ref.clone());
            prop_assert_eq!(active_ref.as_deref(), Some(session.session_ref.as_str()));
        }
        if let Some(record) = record {
            if record.status.is_terminal() {
                prop_assert!(registered.is_none());
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn property_random_wakes_comments_and_exits_keep_one_session_per_issue(
        planner in planner_strategy(),
        steps in prop::collection::vec(step_strategy(), 1..14),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let outcome: Result<(), TestCaseError> = runtime.block_on(async move {
            let harness = Harness::new(planner, executor_script(None));
            for issue in ISSUES {
                harness
                    .tracker
                    .open_issue(issue, &format!("Issue {issue}"), "needs work")
                    .await;
            }
            let mut scheduler = harness.scheduler();
            let mut dispatched = 0_usize;
            let mut finished = 0_usize;
            for step in steps {
                match step {
                    Step::Wake => {
                        let before = scheduler.context().supervisor().active_count();
                        let report = scheduler.wake().await.expect("wake");
                        prop_assert!(report.dispatched <= ISSUES.len());
                        prop_assert!(before + report.dispatched <= ISSUES.len() + report.outcomes);
                        dispatched += report.dispatched;
                        finished += report.outcomes;
                    }
                    Step::Comment { issue, body } => {
                        harness.tracker.user_comment(issue, body).await;
                    }
                    Step::Pause { millis } => {
                        tokio::time::sleep(Duration::from_millis(millis)).await;
                    }
                }
                check_single_session_per_issue(&harness, &scheduler)?;
            }
            prop_assert_eq!(
                dispatched,
                finished + scheduler.context().supervisor().active_count()
            );
            Ok(())
        });
        outcome?;
    }
}
