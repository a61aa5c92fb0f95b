//! Folds new tracker comments into an automation record's turn state.

use chrono::{DateTime, Utc};
use foreman_core::{AutomationRecord, TurnActor};
use foreman_tracker::{AgentAuthorshipPolicy, TrackerComment, TrackerIssue, AGENT_TURN_MARKER};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub new_comments: usize,
    pub user_comments: usize,
    pub agent_comments: usize,
    /// Newest user comment. Agent and daemon comments are not activity.
    pub latest_activity_at: Option<DateTime<Utc>>,
}

impl IngestSummary {
    pub fn changed(&self) -> bool {
        self.new_comments > 0
    }
}

/// Opening request for a freshly triggered issue: its title and body.
pub fn opening_request(issue: &TrackerIssue) -> Option<String> {
    let title = issue.title.trim();
    let body = issue.body.trim();
    match (title.is_empty(), body.is_empty()) {
        (true, true) => None,
        (false, true) => Some(title.to_string()),
        (true, false) => Some(body.to_string()),
        (false, false) => Some(format!("{title}\n\n{body}")),
    }
}

/// Marks every existing comment as already consumed. Used when a record is
/// created so history predating the trigger is never routed.
pub fn seed_seen_comments(record: &mut AutomationRecord, comments: &[TrackerComment]) {
    let highest = comments.iter().map(|comment| comment.id).max();
    if highest > record.last_seen_comment_id {
        record.last_seen_comment_id = highest;
    }
}

/// Applies comments newer than `last_seen_comment_id` in id order. Comments
/// carrying the daemon's own marker only advance the cursor; the turn they
/// represent was recorded when they were posted.
pub fn ingest_comments(
    record: &mut AutomationRecord,
    comments: &[TrackerComment],
    policy: &AgentAuthorshipPolicy,
    now: DateTime<Utc>,
) -> IngestSummary {
    let mut fresh = comments
        .iter()
        .filter(|comment| {
            record
                .last_seen_comment_id
                .map_or(true, |seen| comment.id > seen)
        })
        .collect::<Vec<_>>();
    fresh.sort_by_key(|comment| comment.id);

    let mut summary = IngestSummary::default();
    for comment in fresh {
        summary.new_comments += 1;
        record.last_seen_comment_id = Some(comment.id);

        if comment.body.contains(AGENT_TURN_MARKER) {
            continue;
        }
        if policy.is_agent_comment(comment) {
            summary.agent_comments += 1;
            record.last_turn_actor = TurnActor::Agent;
            record.pending_request = None;
        } else {
            summary.user_comments += 1;
            record.last_turn_actor = TurnActor::User;
            record.pending_request = Some(comment.body.trim().to_string());
            if summary
                .latest_activity_at
                .map_or(true, |latest| comment.created_at > latest)
            {
                summary.latest_activity_at = Some(comment.created_at);
            }
        }
    }
    if summary.changed() {
        record.updated_at = now;
    }
    summary
}
