//! Extraction of the completion report from captured agent output.

use std::sync::OnceLock;

use regex::Regex;

use crate::agent_prompt::{REPORT_BEGIN_MARKER, REPORT_END_MARKER};

const PULL_REQUEST_LINE_PREFIX: &str = "PULL_REQUEST:";

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionReport {
    pub body: String,
    pub pull_request_url: Option<String>,
    pub reported_cost_usd: Option<f64>,
}

fn pull_request_url_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"https?://[^\s)\]>]+/pull/\d+").ok())
        .as_ref()
}

fn cost_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r#""?total_cost_usd"?\s*[:=]\s*([0-9]+(?:\.[0-9]+)?)"#).ok())
        .as_ref()
}

/// Returns the last well-formed report block in `output`, or `None` when the
/// output holds no usable report.
pub fn parse_completion_report(output: &str) -> Option<CompletionReport> {
    let lines = output.lines().collect::<Vec<_>>();
    let end = lines
        .iter()
        .rposition(|line| line.trim() == REPORT_END_MARKER)?;
    let begin = lines[..end]
        .iter()
        .rposition(|line| line.trim() == REPORT_BEGIN_MARKER)?;
    let body = lines[begin + 1..end].join("\n").trim().to_string();
    if body.is_empty() {
        return None;
    }

    let pull_request_url = explicit_pull_request_url(output).or_else(|| {
        pull_request_url_pattern()
            .and_then(|pattern| pattern.find(&body))
            .map(|found| found.as_str().to_string())
    });

    Some(CompletionReport {
        body,
        pull_request_url,
        reported_cost_usd: reported_cost_usd(output),
    })
}

fn explicit_pull_request_url(output: &str) -> Option<String> {
    output
        .lines()
        .rev()
        .filter_map(|line| line.trim().strip_prefix(PULL_REQUEST_LINE_PREFIX))
        .map(str::trim)
        .find(|url| url.starts_with("http"))
        .map(str::to_string)
}

/// Last `total_cost_usd` figure printed anywhere in the output.
pub fn reported_cost_usd(output: &str) -> Option<f64> {
    cost_pattern()?
        .captures_iter(output)
        .filter_map(|captures| captures.get(1))
        .filter_map(|value| value.as_str().parse::<f64>().ok())
        .last()
}

#[cfg(test)]
mod tests {
    use super::{parse_completion_report, reported_cost_usd};

    #[test]
    fn unit_parse_completion_report_extracts_block_body() {
        let output = "thinking...\nFOREMAN_REPORT_BEGIN\n1. add exporter\n2. add tests\nFOREMAN_REPORT_END\n";
        let report = parse_completion_report(output).expect("report");
        assert_eq!(report.body, "1. add exporter\n2. add tests");
        assert!(report.pull_request_url.is_none());
        assert!(report.reported_cost_usd.is_none());
    }

    #[test]
    fn functional_pull_request_url_prefers_explicit_line() {
        let output = "FOREMAN_REPORT_BEGIN\nSee https://github.com/acme/widgets/pull/3 for the old one\nFOREMAN_REPORT_END\nPULL_REQUEST: https://github.com/acme/widgets/pull/12\n";
        let report = parse_completion_report(output).expect("report");
        assert_eq!(
            report.pull_request_url.as_deref(),
            Some("https://github.com/acme/widgets/pull/12")
        );

        let inline = "FOREMAN_REPORT_BEGIN\nOpened https://github.com/acme/widgets/pull/4.\nFOREMAN_REPORT_END";
        assert_eq!(
            parse_completion_report(inline)
                .and_then(|report| report.pull_request_url)
                .as_deref(),
            Some("https://github.com/acme/widgets/pull/4")
        );
    }

    #[test]
    fn regression_missing_or_empty_block_is_unparsable() {
        assert!(parse_completion_report("no markers here").is_none());
        assert!(parse_completion_report("FOREMAN_REPORT_BEGIN\nunterminated").is_none());
        assert!(parse_completion_report("FOREMAN_REPORT_BEGIN\n  \nFOREMAN_REPORT_END").is_none());
        assert!(parse_completion_report("FOREMAN_REPORT_END\nFOREMAN_REPORT_BEGIN").is_none());
    }

    #[test]
    fn unit_reported_cost_reads_last_json_or_key_value_figure() {
        assert_eq!(
            reported_cost_usd(r#"{"type":"result","total_cost_usd":0.125}"#),
            Some(0.125)
        );
        assert_eq!(reported_cost_usd("total_cost_usd=1\ntotal_cost_usd = 2.5"), Some(2.5));
        assert_eq!(reported_cost_usd("cost unknown"), None);
    }
}
