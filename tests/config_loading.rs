use std::io::Write;

use agentflow_core::config::AppConfig;
use agentflow_core::error::AgentflowError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
node_timeout_secs = 30
event_capacity = 64

[sandbox]
timeout_ms = 250
max_operations = 1000000
max_code_length = 4096

[model]
provider = "anthropic"
model_id = "claude-sonnet-4-20250514"
api_key = "sk-test-key"
max_tokens = 4096
temperature = 0.5

[model.extra_headers]
x-team = "flows"

[model.retry]
max_retries = 5
initial_backoff_ms = 10

[store]
path = "/tmp/agentflow-test/store.db"

[log]
log_dir = "/tmp/agentflow-test/logs"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.node_timeout_secs, 30);
    assert_eq!(config.engine.event_capacity, 64);
    assert_eq!(config.sandbox.timeout_ms, 250);
    assert_eq!(config.sandbox.max_operations, 1_000_000);
    assert_eq!(config.sandbox.max_code_length, 4096);
    assert_eq!(config.model.provider, "anthropic");
    assert_eq!(config.model.model_id, "claude-sonnet-4-20250514");
    assert_eq!(config.model.credential(), Some("sk-test-key"));
    assert_eq!(config.model.max_tokens, 4096);
    assert_eq!(config.model.extra_headers["x-team"], "flows");
    assert_eq!(config.model.retry.max_retries, 5);
    assert_eq!(config.model.retry.initial_backoff_ms, 10);
    assert_eq!(config.model.retry.max_backoff_ms, 30_000);
    assert_eq!(
        config.store_path(),
        std::path::PathBuf::from("/tmp/agentflow-test/store.db")
    );
    assert_eq!(
        config.log_dir(),
        Some(std::path::PathBuf::from("/tmp/agentflow-test/logs"))
    );
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("AGENTFLOW_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[model]
model_id = "test-model"
api_key = "${AGENTFLOW_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("AGENTFLOW_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[model]
model_id = "llama3.2"
base_url = "http://localhost:11434/v1"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "openai");
    assert_eq!(config.model.model_id, "llama3.2");
    assert!(config.model.credential().is_none());
    assert_eq!(config.engine.node_timeout_secs, 300);
    assert_eq!(config.sandbox.timeout_ms, 5_000);
    assert!(config.log.is_none());
    assert!(config.log_dir().is_none());
}

#[test]
fn test_disabled_log_section_has_no_log_dir() {
    let config = AppConfig::from_toml("[log]\nenabled = false\nlog_dir = \"/tmp/x\"").unwrap();
    assert!(config.log.is_some());
    assert!(config.log_dir().is_none());
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/agentflow.toml")).unwrap_err();
    assert!(matches!(err, AgentflowError::ConfigNotFound(_)));
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = AppConfig::from_toml("[engine]\nnode_timeout_secs = 7").unwrap();
    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = AppConfig::from_toml(&rendered).unwrap();
    assert_eq!(reparsed.engine.node_timeout_secs, 7);
    assert_eq!(reparsed.model.model_id, config.model.model_id);
}
