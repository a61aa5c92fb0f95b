//! Rendering for comments the daemon posts back to the tracker.

use foreman_core::AgentRole;

use crate::authorship::AGENT_TURN_MARKER;
use crate::CiStatus;

/// Truncates `text` to at most `max_chars` characters, appending `...` when cut.
pub fn truncate_for_error(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated = text.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}

fn with_footer(body: String, footer: &str) -> String {
    format!("{body}\n\n---\n_{footer}_\n{AGENT_TURN_MARKER}")
}

/// Renders the report produced by a successful agent session.
pub fn render_agent_report_comment(
    role: AgentRole,
    report: &str,
    session_ref: &str,
    cost_usd: f64,
    ci_status: Option<CiStatus>,
    pull_request_url: Option<&str>,
) -> String {
    let heading = match role {
        AgentRole::Planner => "## Plan",
        AgentRole::Executor => "## Execution Report",
    };
    let mut body = format!("{heading}\n\n{}", report.trim());
    if let Some(url) = pull_request_url {
        body.push_str(&format!("\n\nPull request: {url}"));
    }
    if let Some(status) = ci_status {
        body.push_str(&format!("\n\nCI status: `{}`", status.as_str()));
    }
    with_footer(
        body,
        &format!(
            "foreman {} session `{session_ref}` | cost `${cost_usd:.2}`",
            role.as_str()
        ),
    )
}

/// Renders an issue-fatal failure with the captured log tail.
pub fn render_failure_comment(reason_code: &str, message: &str, log_tail: Option<&str>) -> String {
    let mut body = format!(
        "Automation stopped for this issue.\n\nReason: `{reason_code}`\n\nError: `{}`",
        truncate_for_error(message, 600)
    );
    if let Some(tail) = log_tail.map(str::trim).filter(|tail| !tail.is_empty()) {
        body.push_str(&format!(
            "\n\n<details><summary>Log tail</summary>\n\n```\n{}\n```\n</details>",
            truncate_for_error(tail, 4_000)
        ));
    }
    with_footer(body, &format!("foreman | status `failed` | reason `{reason_code}`"))
}

/// Renders the note posted when the budget guard refuses a dispatch.
pub fn render_budget_refusal_comment(note: &str) -> String {
    with_footer(
        format!(
            "Dispatch was refused by the budget guard.\n\n{note}\n\nReply on this issue once limits have been raised or reset to retry."
        ),
        "foreman | status `waiting_for_user` | reason `budget_exceeded`",
    )
}
