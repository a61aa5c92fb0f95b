//! Role-specific prompts handed to agent processes on stdin.

use std::path::{Path, PathBuf};

use foreman_core::{AgentRole, IssueId};

pub const REPORT_BEGIN_MARKER: &str = "FOREMAN_REPORT_BEGIN";
pub const REPORT_END_MARKER: &str = "FOREMAN_REPORT_END";
pub const TRUNCATED_PREFIX: &str = "...[truncated]\n\n";

const FILE_LIST_MAX_ENTRIES: usize = 200;
const FILE_LIST_MAX_DEPTH: usize = 3;
const SKIPPED_DIRS: &[&str] = &[".git", "target", "node_modules", ".foreman"];

/// Minimal context an agent session receives.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptContext {
    pub issue_id: IssueId,
    pub title: String,
    pub role: AgentRole,
    pub plan_summary: Option<String>,
    pub request: Option<String>,
    pub workspace_path: PathBuf,
    pub branch_name: String,
    pub ship_requested: bool,
    pub files: Vec<String>,
}

pub fn render_agent_prompt(context: &PromptContext) -> String {
    let mut parts = Vec::new();
    let role_line = match context.role {
        AgentRole::Planner => {
            "You are the planning agent. Study the repository and produce a concrete, numbered implementation plan. Do not modify files."
        }
        AgentRole::Executor => {
            "You are the execution agent. Implement the accepted plan in this workspace, run the relevant checks, and commit your changes to the current branch."
        }
    };
    parts.push(format!(
        "# Issue #{}: {}\n\n{role_line}\n",
        context.issue_id,
        context.title.trim()
    ));
    parts.push(format!(
        "## Workspace\nPath: {}\nBranch: {}\n",
        context.workspace_path.display(),
        context.branch_name
    ));

    if let Some(plan) = context
        .plan_summary
        .as_deref()
        .map(str::trim)
        .filter(|plan| !plan.is_empty())
    {
        parts.push(format!("## Current plan\n{plan}\n"));
    }
    if let Some(request) = context
        .request
        .as_deref()
        .map(str::trim)
        .filter(|request| !request.is_empty())
    {
        parts.push(format!("## Latest request\n{request}\n"));
    }
    if context.ship_requested {
        parts.push(
            "## Shipping\nThe user asked to ship. Push the branch and, if you open a pull request yourself, print its URL on a line starting with `PULL_REQUEST:`.\n"
                .to_string(),
        );
    }
    if !context.files.is_empty() {
        parts.push(format!(
            "## Files\n{}\n",
            context
                .files
                .iter()
                .map(|file| format!("- {file}"))
                .collect::<Vec<_>>()
                .join("\n")
        ));
    }
    parts.push(format!(
        "## Report\nWhen finished, print your report for the issue thread between a line containing only `{REPORT_BEGIN_MARKER}` and a line containing only `{REPORT_END_MARKER}`. Do not post to the issue yourself.\n"
    ));
    parts.join("\n")
}

/// Keeps the last `max_bytes` bytes of `prompt`, cut on a char boundary.
pub fn truncate_prompt(prompt: &str, max_bytes: usize) -> String {
    if prompt.len() <= max_bytes {
        return prompt.to_string();
    }
    let mut start = prompt.len() - max_bytes;
    while !prompt.is_char_boundary(start) {
        start += 1;
    }
    format!("{TRUNCATED_PREFIX}{}", &prompt[start..])
}

/// Relative file paths under `root`, depth- and count-limited, sorted.
pub fn list_workspace_files(root: &Path) -> Vec<String> {
    let mut files = Vec::new();
    collect_files(root, root, 0, &mut files);
    files.sort();
    files.truncate(FILE_LIST_MAX_ENTRIES);
    files
}

fn collect_files(root: &Path, dir: &Path, depth: usize, files: &mut Vec<String>) {
    if depth > FILE_LIST_MAX_DEPTH || files.len() >= FILE_LIST_MAX_ENTRIES * 2 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path.is_dir() {
            if SKIPPED_DIRS.contains(&name.as_ref()) {
                continue;
            }
            collect_files(root, &path, depth + 1, files);
        } else if let Ok(relative) = path.strip_prefix(root) {
            files.push(relative.display().to_string());
        }
    }
}
