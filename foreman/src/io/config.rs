//! Run configuration stored under `.foreman/config.toml`.
//!
//! The file is intended to be edited by humans; missing fields default to
//! sensible values. CLI flags are merged on top via [`RunConfig::apply`],
//! after which the configuration is immutable for the rest of the run.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Orchestrator operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Implement ready work items end to end.
    Build,
    /// Produce plans without modifying the tree.
    Plan,
}

/// Immutable per-run configuration (TOML file merged with CLI flags).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub mode: Mode,

    /// Stop after this many iterations (0 = unbounded).
    pub max_iterations: u32,

    /// Model identifier passed to the coding agent.
    pub model: String,

    /// Delay between iterations in seconds.
    pub iteration_delay_secs: u64,

    /// Additional agent attempts after a non-zero exit.
    pub max_retries: u32,

    /// Flat wait before an ordinary retry, in seconds.
    pub retry_delay_secs: u64,

    /// Extended wait when a rate-limit signature is found in the agent log.
    pub rate_limit_pause_secs: u64,

    /// Abort the run after this many iteration failures in a row.
    pub consecutive_failure_limit: u32,

    /// Durability knob: checkpoint the session every N iterations in addition
    /// to the per-iteration save.
    pub checkpoint_interval: u32,

    /// Push after each successful iteration.
    pub push_enabled: bool,

    /// Prompt for confirmation before each iteration.
    pub interactive: bool,

    /// Stop with status complete when the ready queue is empty.
    pub auto_stop_on_empty: bool,

    /// Outbound HTTP target for lifecycle events.
    pub webhook_url: Option<String>,

    /// Restrict ready-work selection to children of this epic.
    pub epic: Option<String>,

    /// Derived-cost rate for input tokens, USD per million.
    pub input_cost_per_mtok: f64,

    /// Derived-cost rate for output tokens, USD per million.
    pub output_cost_per_mtok: f64,

    /// Wall-clock budget for a single agent invocation, in seconds.
    pub agent_timeout_secs: u64,

    /// Wall-clock budget for a single review invocation, in seconds.
    pub review_timeout_secs: u64,

    /// Truncate captured subprocess output beyond this many bytes.
    pub output_limit_bytes: usize,

    pub agent: AgentConfig,
    pub review: ReviewConfig,
    pub tracker: TrackerConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Coding-agent command prefix; the model and prompt are appended/piped
    /// by the process runner.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReviewConfig {
    /// Run the independent review pass after each iteration.
    pub enabled: bool,
    /// Model identifier for the review agent.
    pub model: String,
    /// Maximum agent re-invocations per iteration driven by REVISE verdicts.
    pub max_revisions: u32,
    /// Review-agent command prefix (non-interactive mode).
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    /// Issue-tracker CLI command prefix (e.g. `["bd"]`).
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotificationConfig {
    /// Fire desktop notifications at lifecycle points.
    pub enabled: bool,
    /// Play a sound with desktop notifications (macOS only).
    pub sound: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "-p".to_string(),
                "--verbose".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
            ],
        }
    }
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "opus".to_string(),
            max_revisions: 3,
            command: vec!["claude".to_string(), "-p".to_string()],
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            command: vec!["bd".to_string()],
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sound: false,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Build,
            max_iterations: 0,
            model: "sonnet".to_string(),
            iteration_delay_secs: 5,
            max_retries: 3,
            retry_delay_secs: 30,
            rate_limit_pause_secs: 600,
            consecutive_failure_limit: 3,
            checkpoint_interval: 5,
            push_enabled: false,
            interactive: false,
            auto_stop_on_empty: true,
            webhook_url: None,
            epic: None,
            input_cost_per_mtok: 3.0,
            output_cost_per_mtok: 15.0,
            agent_timeout_secs: 60 * 60,
            review_timeout_secs: 15 * 60,
            output_limit_bytes: 1_000_000,
            agent: AgentConfig::default(),
            review: ReviewConfig::default(),
            tracker: TrackerConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

/// CLI-level overrides merged on top of the file configuration.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub mode: Option<Mode>,
    pub max_iterations: Option<u32>,
    pub model: Option<String>,
    pub iteration_delay_secs: Option<u64>,
    pub interactive: Option<bool>,
    pub push_enabled: Option<bool>,
    pub notifications_enabled: Option<bool>,
    pub notifications_sound: Option<bool>,
    pub webhook_url: Option<String>,
    pub review_enabled: Option<bool>,
    pub review_model: Option<String>,
    pub review_max_revisions: Option<u32>,
    pub epic: Option<String>,
}

impl RunConfig {
    /// Merge CLI overrides into the file configuration.
    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(mode) = overrides.mode {
            self.mode = mode;
        }
        if let Some(n) = overrides.max_iterations {
            self.max_iterations = n;
        }
        if let Some(model) = &overrides.model {
            self.model = model.clone();
        }
        if let Some(secs) = overrides.iteration_delay_secs {
            self.iteration_delay_secs = secs;
        }
        if let Some(interactive) = overrides.interactive {
            self.interactive = interactive;
        }
        if let Some(push) = overrides.push_enabled {
            self.push_enabled = push;
        }
        if let Some(enabled) = overrides.notifications_enabled {
            self.notifications.enabled = enabled;
        }
        if let Some(sound) = overrides.notifications_sound {
            self.notifications.sound = sound;
        }
        if let Some(url) = &overrides.webhook_url {
            self.webhook_url = Some(url.clone());
        }
        if let Some(enabled) = overrides.review_enabled {
            self.review.enabled = enabled;
        }
        if let Some(model) = &overrides.review_model {
            self.review.model = model.clone();
        }
        if let Some(n) = overrides.review_max_revisions {
            self.review.max_revisions = n;
        }
        if let Some(epic) = &overrides.epic {
            self.epic = Some(epic.clone());
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent_timeout_secs == 0 {
            return Err(anyhow!("agent_timeout_secs must be > 0"));
        }
        if self.review_timeout_secs == 0 {
            return Err(anyhow!("review_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.consecutive_failure_limit == 0 {
            return Err(anyhow!("consecutive_failure_limit must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.tracker.command.is_empty() || self.tracker.command[0].trim().is_empty() {
            return Err(anyhow!("tracker.command must be a non-empty array"));
        }
        if self.review.enabled {
            if self.review.command.is_empty() || self.review.command[0].trim().is_empty() {
                return Err(anyhow!("review.command must be a non-empty array"));
            }
            if self.review.max_revisions == 0 {
                return Err(anyhow!(
                    "review.max_revisions must be > 0 when review is enabled"
                ));
            }
        }
        if self.input_cost_per_mtok < 0.0 || self.output_cost_per_mtok < 0.0 {
            return Err(anyhow!("token cost rates must not be negative"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    if !path.exists() {
        let cfg = RunConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}
