//! Trigger-label matching. GitHub labels compare case-insensitively and
//! users routinely pad them with whitespace in configuration.

/// A normalized, non-empty trigger label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerLabel(String);

impl TriggerLabel {
    /// Returns `None` for a blank label, which matches every issue.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        (!normalized.is_empty()).then_some(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches<'a>(&self, labels: impl IntoIterator<Item = &'a str>) -> bool {
        labels
            .into_iter()
            .any(|label| label.trim().eq_ignore_ascii_case(&self.0))
    }
}

/// Applies an optional trigger label to an issue's label names.
pub fn carries_trigger_label<'a>(
    trigger: Option<&TriggerLabel>,
    labels: impl IntoIterator<Item = &'a str>,
) -> bool {
    trigger.map_or(true, |trigger| trigger.matches(labels))
}
