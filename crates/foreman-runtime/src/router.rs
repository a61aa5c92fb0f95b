//! Agent routing: an ordered `(condition -> outcome)` rule table.
//!
//! [`AgentRouter::route`] is pure. It never mutates the record; the scheduler
//! applies state changes only after a dispatch has actually started.

use anyhow::{Context, Result};
use foreman_core::{AutomationRecord, TurnActor};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::RoutingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOutcome {
    NoAction,
    DispatchPlanner,
    DispatchExecutor,
    /// Dispatch the planner after discarding the current plan.
    Escalate,
}

impl RouteOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoAction => "no_action",
            Self::DispatchPlanner => "dispatch_planner",
            Self::DispatchExecutor => "dispatch_executor",
            Self::Escalate => "escalate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexiconKind {
    Escalation,
    Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteCondition {
    LastTurnIsAgent,
    NoPlan,
    Matches(LexiconKind),
    MatchesOrHasPlan(LexiconKind),
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RouteRule {
    name: &'static str,
    condition: RouteCondition,
    outcome: RouteOutcome,
}

const ROUTE_RULES: &[RouteRule] = &[
    RouteRule {
        name: "await_user_turn",
        condition: RouteCondition::LastTurnIsAgent,
        outcome: RouteOutcome::NoAction,
    },
    RouteRule {
        name: "plan_missing",
        condition: RouteCondition::NoPlan,
        outcome: RouteOutcome::DispatchPlanner,
    },
    RouteRule {
        name: "escalation_requested",
        condition: RouteCondition::Matches(LexiconKind::Escalation),
        outcome: RouteOutcome::Escalate,
    },
    RouteRule {
        name: "execute_plan",
        condition: RouteCondition::MatchesOrHasPlan(LexiconKind::Action),
        outcome: RouteOutcome::DispatchExecutor,
    },
    RouteRule {
        name: "fallthrough",
        condition: RouteCondition::Always,
        outcome: RouteOutcome::NoAction,
    },
];

/// The outcome plus the name of the rule that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteDecision {
    pub outcome: RouteOutcome,
    pub rule: &'static str,
}

/// Case-insensitive whole-phrase matcher over a list of terms.
#[derive(Debug, Clone)]
pub struct Lexicon {
    pattern: Option<Regex>,
}

impl Lexicon {
    pub fn compile(terms: &[String]) -> Result<Self> {
        let alternatives = terms
            .iter()
            .map(|term| term.trim())
            .filter(|term| !term.is_empty())
            .map(regex::escape)
            .collect::<Vec<_>>();
        if alternatives.is_empty() {
            return Ok(Self { pattern: None });
        }
        let source = format!(r"(?i)(?:^|[^\w])(?:{})(?:$|[^\w])", alternatives.join("|"));
        let pattern = Regex::new(&source)
            .with_context(|| format!("failed to compile lexicon pattern '{source}'"))?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }

    pub fn matches(&self, text: &str) -> bool {
        self.pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(text))
    }
}

#[derive(Debug, Clone)]
pub struct AgentRouter {
    escalation: Lexicon,
    action: Lexicon,
    ship: Lexicon,
}

impl AgentRouter {
    pub fn from_config(config: &RoutingConfig) -> Result<Self> {
        Ok(Self {
            escalation: Lexicon::compile(&config.escalation_lexicon)
                .context("invalid routing.escalation_lexicon")?,
            action: Lexicon::compile(&config.action_lexicon)
                .context("invalid routing.action_lexicon")?,
            ship: Lexicon::compile(&config.ship_lexicon).context("invalid routing.ship_lexicon")?,
        })
    }

    /// Chooses the next action for `record` given the latest user comment.
    pub fn route(&self, record: &AutomationRecord, latest_comment: Option<&str>) -> RouteDecision {
        let comment = latest_comment.unwrap_or_default();
        for rule in ROUTE_RULES {
            if self.condition_holds(rule.condition, record, comment) {
                return RouteDecision {
                    outcome: rule.outcome,
                    rule: rule.name,
                };
            }
        }
        RouteDecision {
            outcome: RouteOutcome::NoAction,
            rule: "fallthrough",
        }
    }

    /// True when `comment` asks for the work to be shipped as a pull request.
    pub fn is_ship_instruction(&self, comment: &str) -> bool {
        self.ship.matches(comment)
    }

    fn condition_holds(
        &self,
        condition: RouteCondition,
        record: &AutomationRecord,
        comment: &str,
    ) -> bool {
        match condition {
            RouteCondition::LastTurnIsAgent => record.last_turn_actor == TurnActor::Agent,
            RouteCondition::NoPlan => !record.has_plan,
            RouteCondition::Matches(kind) => self.lexicon(kind).matches(comment),
            RouteCondition::MatchesOrHasPlan(kind) => {
                record.has_plan || self.lexicon(kind).matches(comment)
            }
            RouteCondition::Always => true,
        }
    }

    fn lexicon(&self, kind: LexiconKind) -> &Lexicon {
        match kind {
            LexiconKind::Escalation => &self.escalation,
            LexiconKind::Action => &self.action,
        }
    }
}
