//! Spend ceilings checked before every dispatch.

use foreman_core::{AgentRole, AutomationRecord};
use serde::Serialize;

use crate::config::BudgetConfig;
use crate::failure::DispatchFailure;

const SPEND_EPSILON_USD: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    PerIssue,
    Daily,
}

impl BudgetScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerIssue => "per_issue",
            Self::Daily => "daily",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetRefusal {
    pub scope: BudgetScope,
    pub role: AgentRole,
    pub estimate_usd: f64,
    pub projected_usd: f64,
    pub limit_usd: f64,
}

impl BudgetRefusal {
    pub fn failure(&self) -> DispatchFailure {
        DispatchFailure::BudgetExceeded
    }

    /// Human-readable explanation; the failure's reason code is prefixed
    /// when it is stored on the record.
    pub fn detail(&self) -> String {
        let scope = match self.scope {
            BudgetScope::PerIssue => "per-issue cost limit",
            BudgetScope::Daily => "daily cost limit",
        };
        format!(
            "{} dispatch (estimated ${:.2}) would bring spend to ${:.2}, above the {scope} of ${:.2}",
            self.role.as_str(),
            self.estimate_usd,
            self.projected_usd,
            self.limit_usd
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BudgetVerdict {
    Allowed { estimate_usd: f64 },
    Refused(BudgetRefusal),
}

/// Tracks in-flight estimates so concurrent sessions cannot jointly overshoot
/// the daily limit before any of them reports.
#[derive(Debug, Clone)]
pub struct BudgetGuard {
    config: BudgetConfig,
    reserved_usd: f64,
}

impl BudgetGuard {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            reserved_usd: 0.0,
        }
    }

    pub fn estimated_cost(&self, role: AgentRole) -> f64 {
        self.config.estimated_cost(role)
    }

    pub fn reserved_usd(&self) -> f64 {
        self.reserved_usd
    }

    /// Checks both ceilings; `daily_spend_usd` is the settled total for today.
    pub fn check(
        &self,
        record: &AutomationRecord,
        role: AgentRole,
        daily_spend_usd: f64,
    ) -> BudgetVerdict {
        let estimate_usd = self.estimated_cost(role);

        let projected_issue = record.spend_usd + estimate_usd;
        if projected_issue > self.config.max_cost_per_issue_usd + SPEND_EPSILON_USD {
            return BudgetVerdict::Refused(BudgetRefusal {
                scope: BudgetScope::PerIssue,
                role,
                estimate_usd,
                projected_usd: projected_issue,
                limit_usd: self.config.max_cost_per_issue_usd,
            });
        }

        let projected_daily = daily_spend_usd + self.reserved_usd + estimate_usd;
        if projected_daily > self.config.daily_cost_limit_usd + SPEND_EPSILON_USD {
            return BudgetVerdict::Refused(BudgetRefusal {
                scope: BudgetScope::Daily,
                role,
                estimate_usd,
                projected_usd: projected_daily,
                limit_usd: self.config.daily_cost_limit_usd,
            });
        }

        BudgetVerdict::Allowed { estimate_usd }
    }

    pub fn reserve(&mut self, amount_usd: f64) {
        self.reserved_usd += amount_usd.max(0.0);
    }

    pub fn release(&mut self, amount_usd: f64) {
        self.reserved_usd = (self.reserved_usd - amount_usd.max(0.0)).max(0.0);
    }

    /// Releases the reservation and returns the spend to record: the reported
    /// figure when the agent produced one, otherwise the estimate.
    pub fn settle(&mut self, estimate_usd: f64, reported_usd: Option<f64>) -> f64 {
        self.release(estimate_usd);
        match reported_usd {
            Some(actual) if actual.is_finite() && actual >= 0.0 => actual,
            _ => estimate_usd.max(0.0),
        }
    }
}
