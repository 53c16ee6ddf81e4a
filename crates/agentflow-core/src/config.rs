use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AgentflowError, Result};

/// Top-level agentflow configuration (`agentflow.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Outer bound on any single handler call.
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    /// Capacity of the run event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_timeout_secs: default_node_timeout(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_node_timeout() -> u64 { 300 }
fn default_event_capacity() -> usize { 256 }

/// Limits for the user-code sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-clock budget per Function node evaluation.
    #[serde(default = "default_sandbox_timeout_ms")]
    pub timeout_ms: u64,
    /// Interpreter operation budget (0 = unlimited, bounded by time only).
    #[serde(default)]
    pub max_operations: u64,
    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,
    #[serde(default = "default_max_string_size")]
    pub max_string_size: usize,
    #[serde(default = "default_max_collection_size")]
    pub max_array_size: usize,
    #[serde(default = "default_max_collection_size")]
    pub max_map_size: usize,
    #[serde(default = "default_max_code_length")]
    pub max_code_length: usize,
}

fn default_sandbox_timeout_ms() -> u64 { 5_000 }
fn default_max_call_levels() -> usize { 64 }
fn default_max_string_size() -> usize { 1024 * 1024 }
fn default_max_collection_size() -> usize { 100_000 }
fn default_max_code_length() -> usize { 64 * 1024 }

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_sandbox_timeout_ms(),
            max_operations: 0,
            max_call_levels: default_max_call_levels(),
            max_string_size: default_max_string_size(),
            max_array_size: default_max_collection_size(),
            max_map_size: default_max_collection_size(),
            max_code_length: default_max_code_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-attempt bound on a provider request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_provider() -> String { "openai".to_string() }
fn default_model_id() -> String { "gpt-3.5-turbo".to_string() }
fn default_max_tokens() -> u32 { 150 }
fn default_temperature() -> f32 { 0.0 }
fn default_request_timeout() -> u64 { 60 }

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout(),
            extra_headers: HashMap::new(),
            retry: RetryConfig::default(),
        }
    }
}

impl ModelConfig {
    /// The usable API key, if any. A `${VAR}` reference left unexpanded
    /// because the variable is unset counts as missing.
    pub fn credential(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty() && !k.starts_with("${"))
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database holding flows and run records.
    #[serde(default = "default_store_path")]
    pub path: String,
}

fn default_store_path() -> String { "~/.agentflow/agentflow.db".to_string() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.agentflow/logs
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_log_enabled() -> bool { true }

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| AgentflowError::ConfigNotFound(path.display().to_string()))?;

        Self::from_toml(&content)
    }

    /// Parse config from TOML text, expanding `${ENV_VAR}` references first.
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| AgentflowError::Config(e.to_string()))
    }

    pub fn store_path(&self) -> PathBuf {
        expand_home(&self.store.path)
    }

    /// A copy safe to display: the API key is masked.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.model.api_key.is_some() {
            config.model.api_key = Some("***".to_string());
        }
        config
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(
            log.log_dir
                .as_deref()
                .map(expand_home)
                .unwrap_or_else(|| expand_home("~/.agentflow/logs")),
        )
    }
}

/// Resolve a leading `~/` against `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep original if env var not set
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_AGENTFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_AGENTFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_AGENTFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_AGENTFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_AGENTFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.engine.node_timeout_secs, 300);
        assert_eq!(config.sandbox.timeout_ms, 5_000);
        assert_eq!(config.sandbox.max_operations, 0);
        assert_eq!(config.model.provider, "openai");
        assert_eq!(config.model.model_id, "gpt-3.5-turbo");
        assert_eq!(config.model.max_tokens, 150);
        assert_eq!(config.model.retry.max_retries, 3);
        assert!(config.log.is_none());
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn test_unexpanded_key_is_not_a_credential() {
        let config = AppConfig::from_toml(
            r#"
[model]
api_key = "${NONEXISTENT_AGENTFLOW_KEY}"
"#,
        )
        .unwrap();
        assert!(config.model.api_key.is_some());
        assert!(config.model.credential().is_none());

        let config = AppConfig::from_toml("[model]\napi_key = \"sk-test\"").unwrap();
        assert_eq!(config.model.credential(), Some("sk-test"));
    }

    #[test]
    fn test_redacted_masks_api_key() {
        let config = AppConfig::from_toml("[model]\napi_key = \"sk-secret\"").unwrap();
        let shown = toml::to_string_pretty(&config.redacted()).unwrap();
        assert!(!shown.contains("sk-secret"));
        assert!(shown.contains("***"));
        assert_eq!(config.model.credential(), Some("sk-secret"));

        assert!(AppConfig::default().redacted().model.api_key.is_none());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = AppConfig::from_toml("[engine\nnode_timeout_secs = 1").unwrap_err();
        assert!(matches!(err, AgentflowError::Config(_)));
    }
}
