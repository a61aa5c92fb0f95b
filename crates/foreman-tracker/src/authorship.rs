//! Decides whether a tracker comment belongs to the agent turn.

use crate::{AuthorKind, TrackerComment};

/// Hidden marker appended to every comment the daemon posts.
pub const AGENT_TURN_MARKER: &str = "<!-- foreman:agent-turn -->";

pub const DEFAULT_AGENT_SIGNATURES: &[&str] = &[
    "## Re-Planning",
    "## Execution Complete",
    "## Execution Summary",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentAuthorshipPolicy {
    /// Login the daemon posts as, when it differs from the maintainer.
    pub bot_login: Option<String>,
    pub signatures: Vec<String>,
}

impl AgentAuthorshipPolicy {
    pub fn new(bot_login: Option<String>, signatures: Vec<String>) -> Self {
        Self {
            bot_login: bot_login
                .map(|login| login.trim().to_string())
                .filter(|login| !login.is_empty()),
            signatures: signatures
                .into_iter()
                .map(|signature| signature.trim().to_string())
                .filter(|signature| !signature.is_empty())
                .collect(),
        }
    }

    pub fn is_agent_comment(&self, comment: &TrackerComment) -> bool {
        if comment.author.kind == AuthorKind::Bot {
            return true;
        }
        let login = comment.author.login.trim();
        if login.to_ascii_lowercase().ends_with("[bot]") {
            return true;
        }
        if self
            .bot_login
            .as_deref()
            .is_some_and(|bot_login| bot_login.eq_ignore_ascii_case(login))
        {
            return true;
        }
        if comment.body.contains(AGENT_TURN_MARKER) {
            return true;
        }
        self.signatures
            .iter()
            .any(|signature| comment.body.contains(signature.as_str()))
    }
}
