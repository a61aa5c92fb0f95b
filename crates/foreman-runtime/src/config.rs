//! Daemon configuration loaded from `foreman.toml`.
//!
//! Every section defaults independently, so a missing file or a partial file
//! both resolve to a usable configuration. Call [`ForemanConfig::validate`]
//! before wiring the daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use foreman_core::AgentRole;
use foreman_tracker::RepoRef;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE_NAME: &str = "foreman.toml";
pub const DEFAULT_STATE_DIR: &str = ".foreman";
pub const STATE_DB_FILE_NAME: &str = "foreman.sqlite";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForemanConfig {
    pub state_dir: PathBuf,
    pub tracker: TrackerConfig,
    pub polling: PollingConfig,
    pub agents: AgentsConfig,
    pub budget: BudgetConfig,
    pub routing: RoutingConfig,
    pub workspace: WorkspaceConfig,
    pub control: ControlConfig,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            tracker: TrackerConfig::default(),
            polling: PollingConfig::default(),
            agents: AgentsConfig::default(),
            budget: BudgetConfig::default(),
            routing: RoutingConfig::default(),
            workspace: WorkspaceConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub api_base: String,
    /// `owner/name` slug of the tracked repository.
    pub repo: String,
    /// Environment variable holding the API token.
    pub token_env: String,
    pub trigger_label: String,
    /// Login the daemon posts as, treated as the Agent turn.
    pub bot_login: Option<String>,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            repo: String::new(),
            token_env: "GITHUB_TOKEN".to_string(),
            trigger_label: "foreman-auto".to_string(),
            bot_login: None,
            request_timeout_ms: 10_000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    #[serde(alias = "idle_interval")]
    pub idle_interval_secs: u64,
    #[serde(alias = "active_interval")]
    pub active_interval_secs: u64,
    #[serde(alias = "very_active_interval")]
    pub very_active_interval_secs: u64,
    /// Activity more recent than this selects the very-active cadence.
    pub very_active_window_secs: u64,
    /// Activity more recent than this selects the active cadence.
    pub active_window_secs: u64,
    /// Emit a status summary every this many wakes; 0 disables it.
    pub status_log_every_wakes: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            idle_interval_secs: 60,
            active_interval_secs: 15,
            very_active_interval_secs: 5,
            very_active_window_secs: 120,
            active_window_secs: 600,
            status_log_every_wakes: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub max_concurrent_sessions: usize,
    #[serde(alias = "agent_wall_clock_timeout")]
    pub agent_wall_clock_timeout_secs: u64,
    /// Planner command line; the prompt arrives on stdin.
    pub planner_command: String,
    pub executor_command: String,
    /// Session log directory; relative paths resolve under `state_dir`.
    pub log_dir: Option<PathBuf>,
    pub max_prompt_bytes: usize,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 3,
            agent_wall_clock_timeout_secs: 30 * 60,
            planner_command: "claude --model opus --permission-mode bypassPermissions -p -"
                .to_string(),
            executor_command: "claude --model sonnet --permission-mode bypassPermissions -p -"
                .to_string(),
            log_dir: None,
            max_prompt_bytes: 50_000,
        }
    }
}

/// A parsed agent command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl AgentsConfig {
    pub fn command_for(&self, role: AgentRole) -> Result<AgentCommand> {
        let raw = match role {
            AgentRole::Planner => self.planner_command.as_str(),
            AgentRole::Executor => self.executor_command.as_str(),
        };
        let mut words = shell_words::split(raw)
            .with_context(|| format!("failed to parse {} command '{raw}'", role.as_str()))?;
        if words.is_empty() {
            bail!("{} command must not be empty", role.as_str());
        }
        let program = words.remove(0);
        Ok(AgentCommand {
            program,
            args: words,
        })
    }

    pub fn wall_clock_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_wall_clock_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    #[serde(alias = "max_cost_per_issue")]
    pub max_cost_per_issue_usd: f64,
    #[serde(alias = "daily_cost_limit")]
    pub daily_cost_limit_usd: f64,
    pub planner_estimated_cost_usd: f64,
    pub executor_estimated_cost_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_cost_per_issue_usd: 10.0,
            daily_cost_limit_usd: 20.0,
            planner_estimated_cost_usd: 2.0,
            executor_estimated_cost_usd: 1.0,
        }
    }
}

impl BudgetConfig {
    pub fn estimated_cost(&self, role: AgentRole) -> f64 {
        match role {
            AgentRole::Planner => self.planner_estimated_cost_usd,
            AgentRole::Executor => self.executor_estimated_cost_usd,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub escalation_lexicon: Vec<String>,
    pub action_lexicon: Vec<String>,
    /// Phrases that ask the executor to open a pull request when done.
    pub ship_lexicon: Vec<String>,
    /// Body fragments that mark a comment as agent-authored.
    pub agent_signatures: Vec<String>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            escalation_lexicon: strings(&[
                "re-plan",
                "replan",
                "redesign",
                "different approach",
                "rethink",
                "start over",
                "architecture",
                "architectural",
                "overhaul",
                "fundamental",
                "wrong approach",
                "misunderstood",
            ]),
            action_lexicon: strings(&[
                "implement",
                "fix",
                "ship it",
                "go ahead",
                "proceed",
                "approved",
                "lgtm",
                "do it",
            ]),
            ship_lexicon: strings(&[
                "ship it",
                "open a pr",
                "open a pull request",
                "create a pr",
                "create the pr",
                "merge it",
            ]),
            agent_signatures: foreman_tracker::authorship::DEFAULT_AGENT_SIGNATURES
                .iter()
                .map(|value| value.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Git repository the per-issue worktrees branch from.
    pub repo_root: PathBuf,
    /// Relative paths resolve under `state_dir`.
    pub workspaces_root: Option<PathBuf>,
    pub branch_prefix: String,
    pub base_branch: String,
    /// Idle workspaces of waiting records are reaped after this long.
    pub idle_ttl_secs: u64,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            workspaces_root: None,
            branch_prefix: "foreman".to_string(),
            base_branch: "main".to_string(),
            idle_ttl_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub bind: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
        }
    }
}

impl ForemanConfig {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str::<Self>(raw)?)
    }

    pub fn validate(&self) -> Result<()> {
        let polling = &self.polling;
        if polling.idle_interval_secs == 0
            || polling.active_interval_secs == 0
            || polling.very_active_interval_secs == 0
        {
            bail!("polling intervals must be greater than 0");
        }
        if polling.very_active_window_secs > polling.active_window_secs {
            bail!("polling.very_active_window_secs must not exceed polling.active_window_secs");
        }
        if self.agents.max_concurrent_sessions == 0 {
            bail!("agents.max_concurrent_sessions must be greater than 0");
        }
        if self.agents.agent_wall_clock_timeout_secs == 0 {
            bail!("agents.agent_wall_clock_timeout_secs must be greater than 0");
        }
        if self.agents.max_prompt_bytes == 0 {
            bail!("agents.max_prompt_bytes must be greater than 0");
        }
        for role in [AgentRole::Planner, AgentRole::Executor] {
            self.agents.command_for(role)?;
        }
        let budget = &self.budget;
        if !(budget.max_cost_per_issue_usd > 0.0) || !(budget.daily_cost_limit_usd > 0.0) {
            bail!("budget limits must be positive");
        }
        if budget.planner_estimated_cost_usd < 0.0 || budget.executor_estimated_cost_usd < 0.0 {
            bail!("budget cost estimates must not be negative");
        }
        if self.tracker.trigger_label.trim().is_empty() {
            bail!("tracker.trigger_label must not be empty");
        }
        if self.tracker.retry_max_attempts == 0 {
            bail!("tracker.retry_max_attempts must be greater than 0");
        }
        RepoRef::parse(&self.tracker.repo)
            .with_context(|| format!("invalid tracker.repo '{}'", self.tracker.repo))?;
        self.control
            .bind
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("invalid control.bind '{}'", self.control.bind))?;
        Ok(())
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.state_dir.join(STATE_DB_FILE_NAME)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.resolve_under_state_dir(self.agents.log_dir.as_deref(), "logs")
    }

    pub fn workspaces_root(&self) -> PathBuf {
        self.resolve_under_state_dir(self.workspace.workspaces_root.as_deref(), "workspaces")
    }

    fn resolve_under_state_dir(&self, configured: Option<&Path>, fallback: &str) -> PathBuf {
        match configured {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => self.state_dir.join(path),
            None => self.state_dir.join(fallback),
        }
    }
}
