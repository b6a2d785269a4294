use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PlaitError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub on_workflow_generated: Vec<String>,
    #[serde(default)]
    pub on_step_complete: Vec<String>,
    #[serde(default)]
    pub on_workflow_complete: Vec<String>,
}

impl HooksConfig {
    pub fn is_empty(&self) -> bool {
        self.on_workflow_generated.is_empty()
            && self.on_step_complete.is_empty()
            && self.on_workflow_complete.is_empty()
    }
}

/// Top-level Plait configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub hooks: Option<HooksConfig>,
}

fn default_event_bus_capacity() -> usize { 256 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "anthropic".to_string() }
fn default_max_tokens() -> u32 { 8192 }
fn default_temperature() -> f32 { 0.0 }

impl ModelConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            provider: default_provider(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            retry: None,
        }
    }
}

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Plan generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Retries of the whole streaming call after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay between attempts.
    #[serde(default = "default_plan_retry_delay")]
    pub retry_delay_ms: u64,
    /// Replaces the built-in planning instructions.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Append the current date and time to the user request.
    #[serde(default = "default_include_datetime")]
    pub include_datetime: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_plan_retry_delay(),
            system_prompt: None,
            include_datetime: default_include_datetime(),
        }
    }
}

fn default_plan_retry_delay() -> u64 { 1000 }
fn default_include_datetime() -> bool { true }

/// Workflow execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Run parallel nodes concurrently; overridable per task with the
    /// `agent_parallel` variable.
    #[serde(default)]
    pub agent_parallel: bool,
    /// Ask agents between steps whether the plan should be revised.
    #[serde(default)]
    pub dynamic_replan: bool,
    /// Upper bound on how long a paused executor waits before re-checking state.
    #[serde(default = "default_pause_poll_interval")]
    pub pause_poll_interval_ms: u64,
    /// Cap on `retry` decisions per agent before the failure escalates.
    #[serde(default = "default_max_agent_retries")]
    pub max_agent_retries: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            agent_parallel: false,
            dynamic_replan: false,
            pause_poll_interval_ms: default_pause_poll_interval(),
            max_agent_retries: default_max_agent_retries(),
        }
    }
}

fn default_pause_poll_interval() -> u64 { 500 }
fn default_max_agent_retries() -> usize { 3 }

/// Settings handed to agent runners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Consecutive failed tool calls a runner tolerates before giving up.
    #[serde(default = "default_max_consecutive_tool_errors")]
    pub max_consecutive_tool_errors: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_consecutive_tool_errors: default_max_consecutive_tool_errors(),
        }
    }
}

fn default_max_consecutive_tool_errors() -> usize { 10 }

impl AppConfig {
    /// Config with defaults everywhere except the model.
    pub fn new(model: ModelConfig) -> Self {
        Self {
            model,
            fallback_models: vec![],
            planner: PlannerConfig::default(),
            executor: ExecutorConfig::default(),
            agent: AgentConfig::default(),
            hooks: None,
            event_bus_capacity: default_event_bus_capacity(),
        }
    }

    /// Load config from a TOML file, expanding `${ENV_VAR}` references first.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| PlaitError::ConfigNotFound(path.display().to_string()))?;

        let config: Self = toml::from_str(&expand_env_vars(&content))
            .map_err(|e| PlaitError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.model.model_id.trim().is_empty() {
            return Err(PlaitError::Config("model.model_id must not be empty".into()));
        }
        if self.event_bus_capacity == 0 {
            return Err(PlaitError::Config("event_bus_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Expand `${VAR}` and `${VAR:-fallback}` references. Unset variables without
/// a fallback, and unterminated references, are left as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let body = &rest[start + 2..];
        let Some(end) = body.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        let reference = &body[..end];
        let (name, fallback) = match reference.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (reference, None),
        };
        match (std::env::var(name), fallback) {
            (Ok(value), _) => out.push_str(&value),
            (Err(_), Some(fallback)) => out.push_str(fallback),
            (Err(_), None) => {
                tracing::warn!(var = %name, "Config references unset environment variable");
                out.push_str(&rest[start..start + end + 3]);
            }
        }
        rest = &body[end + 1..];
    }

    out.push_str(rest);
    out
}
