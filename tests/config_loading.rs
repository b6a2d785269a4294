use std::io::Write;

use plait_core::config::AppConfig;
use plait_core::error::PlaitError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
event_bus_capacity = 1024

[model]
provider = "anthropic"
model_id = "claude-sonnet-4-20250514"
api_key = "sk-test-key"
max_tokens = 4096
temperature = 0.5

[model.retry]
max_retries = 5
initial_backoff_ms = 200

[[fallback_models]]
provider = "openai"
model_id = "gpt-4o"

[planner]
max_retries = 2
retry_delay_ms = 250
system_prompt = "Plan in as few steps as possible."
include_datetime = false

[executor]
agent_parallel = true
dynamic_replan = true
pause_poll_interval_ms = 100
max_agent_retries = 1

[agent]
max_consecutive_tool_errors = 4

[hooks]
on_workflow_generated = ["echo planned"]
on_step_complete = []
on_workflow_complete = ["notify-send done"]
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.event_bus_capacity, 1024);
    assert_eq!(config.model.provider, "anthropic");
    assert_eq!(config.model.model_id, "claude-sonnet-4-20250514");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.max_tokens, 4096);

    let retry = config.model.retry.expect("retry present");
    assert_eq!(retry.max_retries, 5);
    assert_eq!(retry.initial_backoff_ms, 200);
    assert_eq!(retry.max_backoff_ms, 30000);

    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].model_id, "gpt-4o");

    assert_eq!(config.planner.max_retries, 2);
    assert_eq!(config.planner.retry_delay_ms, 250);
    assert_eq!(
        config.planner.system_prompt.as_deref(),
        Some("Plan in as few steps as possible.")
    );
    assert!(!config.planner.include_datetime);

    assert!(config.executor.agent_parallel);
    assert!(config.executor.dynamic_replan);
    assert_eq!(config.executor.pause_poll_interval_ms, 100);
    assert_eq!(config.executor.max_agent_retries, 1);
    assert_eq!(config.agent.max_consecutive_tool_errors, 4);

    let hooks = config.hooks.expect("hooks present");
    assert_eq!(hooks.on_workflow_generated, vec!["echo planned"]);
    assert!(hooks.on_step_complete.is_empty());
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("PLAIT_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[model]
model_id = "test-model"
api_key = "${PLAIT_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("PLAIT_TEST_API_KEY");
}

#[test]
fn test_env_var_fallback_and_validation() {
    let toml_content = r#"
event_bus_capacity = 0

[model]
model_id = "${PLAIT_UNSET_MODEL:-llama3.2}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(err.to_string().contains("event_bus_capacity"));

    let fixed = toml_content.replace("event_bus_capacity = 0", "event_bus_capacity = 8");
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(fixed.as_bytes()).expect("write toml");
    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.model_id, "llama3.2");
    assert_eq!(config.event_bus_capacity, 8);
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[model]
model_id = "llama3.2"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "anthropic");
    assert!(config.model.retry.is_none());
    assert!(config.fallback_models.is_empty());
    assert_eq!(config.planner.max_retries, 3);
    assert_eq!(config.executor.pause_poll_interval_ms, 500);
    assert!(!config.executor.agent_parallel);
    assert!(config.hooks.is_none());
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/plait.toml")).unwrap_err();
    assert!(matches!(err, PlaitError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_toml_is_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[executor]\nagent_parallel = \"sometimes\"\n")
        .expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, PlaitError::Config(_)));
}

#[test]
fn test_config_serializes_back_to_toml() {
    let toml_content = r#"
[model]
model_id = "llama3.2"

[executor]
dynamic_replan = true
"#;
    let config: AppConfig = toml::from_str(toml_content).expect("parse");
    let rendered = toml::to_string_pretty(&config).expect("serialize");
    let reparsed: AppConfig = toml::from_str(&rendered).expect("reparse");
    assert_eq!(reparsed.model.model_id, "llama3.2");
    assert!(reparsed.executor.dynamic_replan);
}
