//! TOML-based configuration for Nexen
//!
//! This module provides declarative configuration for the research runtime,
//! the memory workspace, the decomposer and archivist, logging, and the LLM
//! providers/models agents are routed to (`nexen.toml`).
//!
//! Every section has serde defaults, so an empty file is a valid
//! configuration that only lacks providers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure loaded from nexen.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NexenConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub decomposer: DecomposerConfig,

    #[serde(default)]
    pub archivist: ArchivistConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named LLM provider configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Model aliases that reference providers
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

// ============= Runtime Configuration =============

/// Scheduler limits for one research run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Maximum agent executions in flight at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Ceiling for one execution attempt
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Extra attempts on the fallback model after a failed attempt
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// How long in-flight tasks get to wind down after cancellation
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
}

fn default_max_concurrency() -> usize {
    5
}

fn default_task_timeout_secs() -> u64 {
    300
}

fn default_retry_budget() -> u32 {
    1
}

fn default_cancel_grace_secs() -> u64 {
    10
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            task_timeout_secs: default_task_timeout_secs(),
            retry_budget: default_retry_budget(),
            cancel_grace_secs: default_cancel_grace_secs(),
        }
    }
}

impl RuntimeConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

// ============= Memory Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    /// Root directory; each session gets `{workspace}/{session_id}`
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    /// Attempts after the first failed write before giving up
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_workspace() -> PathBuf {
    PathBuf::from("./data/workspaces")
}

fn default_write_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            write_retries: default_write_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

// ============= Decomposer Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecomposerConfig {
    /// Model id used to break the research question down (and for synthesis
    /// when no scribe profile is enabled)
    #[serde(default = "default_decomposer_model")]
    pub model: String,

    #[serde(default = "default_max_subtasks")]
    pub max_subtasks: usize,

    #[serde(default = "default_decomposer_temperature")]
    pub temperature: f32,

    #[serde(default = "default_decomposer_max_tokens")]
    pub max_tokens: u32,
}

fn default_decomposer_model() -> String {
    "openai/gpt-4o".to_string()
}

fn default_max_subtasks() -> usize {
    5
}

fn default_decomposer_temperature() -> f32 {
    0.3
}

fn default_decomposer_max_tokens() -> u32 {
    2000
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        Self {
            model: default_decomposer_model(),
            max_subtasks: default_max_subtasks(),
            temperature: default_decomposer_temperature(),
            max_tokens: default_decomposer_max_tokens(),
        }
    }
}

// ============= Archivist Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArchivistConfig {
    #[serde(default = "default_max_findings")]
    pub max_findings: usize,

    #[serde(default = "default_max_questions")]
    pub max_questions: usize,

    #[serde(default = "default_max_points_per_section")]
    pub max_points_per_section: usize,

    /// Jaccard threshold above which two digest points are the same point
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: f64,
}

fn default_max_findings() -> usize {
    10
}

fn default_max_questions() -> usize {
    10
}

fn default_max_points_per_section() -> usize {
    50
}

fn default_dedup_threshold() -> f64 {
    0.8
}

impl Default for ArchivistConfig {
    fn default() -> Self {
        Self {
            max_findings: default_max_findings(),
            max_questions: default_max_questions(),
            max_points_per_section: default_max_points_per_section(),
            dedup_threshold: default_dedup_threshold(),
        }
    }
}

// ============= Logging Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ============= Provider Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Ollama {
        #[serde(default = "default_ollama_url")]
        base_url: String,
        /// Used when a model id names only the provider
        default_model: Option<String>,
    },
    OpenAI {
        /// Environment variable containing API key
        api_key_env: String,
        #[serde(default = "default_openai_base")]
        api_base: String,
        default_model: Option<String>,
    },
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

// ============= Model Configuration =============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Reference to a provider name defined in [providers]
    pub provider: String,

    /// Model name/identifier to use with the provider
    pub model: String,

    /// Overrides the caller's temperature when set
    pub temperature: Option<f32>,

    /// Caps the caller's max_tokens when set
    pub max_tokens: Option<u32>,

    /// Price per 1000 tokens, in micro-dollars
    #[serde(default)]
    pub cost_per_1k_tokens_micros: u64,
}

// ============= Configuration Loading & Validation =============

/// Errors that can occur during configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Environment variable '{0}' referenced in config is not set")]
    MissingEnvVar(String),

    #[error("Provider '{0}' referenced by model '{1}' does not exist")]
    MissingProvider(String, String),

    #[error("Model '{0}' referenced by '{1}' cannot be resolved")]
    MissingModel(String, String),
}

impl NexenConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: NexenConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate bounds and cross references
    pub fn validate(&self) -> Result<(), ConfigError> {
        let runtime = &self.runtime;
        if runtime.max_concurrency == 0 || runtime.max_concurrency > 64 {
            return Err(ConfigError::ValidationError(format!(
                "runtime.max_concurrency must be in 1..=64, got {}",
                runtime.max_concurrency
            )));
        }
        if runtime.task_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "runtime.task_timeout_secs must be positive".to_string(),
            ));
        }
        if runtime.retry_budget > 5 {
            return Err(ConfigError::ValidationError(format!(
                "runtime.retry_budget must be at most 5, got {}",
                runtime.retry_budget
            )));
        }

        if self.memory.workspace.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "memory.workspace must not be empty".to_string(),
            ));
        }
        if self.memory.write_retries > 10 {
            return Err(ConfigError::ValidationError(format!(
                "memory.write_retries must be at most 10, got {}",
                self.memory.write_retries
            )));
        }

        let decomposer = &self.decomposer;
        if decomposer.max_subtasks == 0 || decomposer.max_subtasks > 20 {
            return Err(ConfigError::ValidationError(format!(
                "decomposer.max_subtasks must be in 1..=20, got {}",
                decomposer.max_subtasks
            )));
        }
        if !(0.0..=2.0).contains(&decomposer.temperature) {
            return Err(ConfigError::ValidationError(format!(
                "decomposer.temperature must be in 0.0..=2.0, got {}",
                decomposer.temperature
            )));
        }

        let archivist = &self.archivist;
        if archivist.max_findings == 0
            || archivist.max_questions == 0
            || archivist.max_points_per_section == 0
        {
            return Err(ConfigError::ValidationError(
                "archivist limits must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&archivist.dedup_threshold) {
            return Err(ConfigError::ValidationError(format!(
                "archivist.dedup_threshold must be in 0.0..=1.0, got {}",
                archivist.dedup_threshold
            )));
        }

        // Validate model -> provider references
        for (model_name, model_config) in &self.models {
            if !self.providers.contains_key(&model_config.provider) {
                return Err(ConfigError::MissingProvider(
                    model_config.provider.clone(),
                    model_name.clone(),
                ));
            }
        }

        // The decomposer model must route somewhere once providers exist
        if !self.providers.is_empty() && !self.can_resolve_model(&decomposer.model) {
            return Err(ConfigError::MissingModel(
                decomposer.model.clone(),
                "decomposer".to_string(),
            ));
        }

        Ok(())
    }

    /// Check that every provider's API key variable is set
    pub fn validate_env(&self) -> Result<(), ConfigError> {
        for provider in self.providers.values() {
            if let ProviderConfig::OpenAI { api_key_env, .. } = provider {
                if std::env::var(api_key_env).is_err() {
                    return Err(ConfigError::MissingEnvVar(api_key_env.clone()));
                }
            }
        }
        Ok(())
    }

    /// A model id resolves through a `[models]` alias or `provider/model` syntax
    pub fn can_resolve_model(&self, model_id: &str) -> bool {
        if self.models.contains_key(model_id) {
            return true;
        }
        match model_id.split_once('/') {
            Some((provider, _)) => self.providers.contains_key(provider),
            None => false,
        }
    }

    pub fn get_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    pub fn get_model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name)
    }

    /// Micro-dollars per 1000 tokens for a model id, 0 when unpriced
    pub fn model_cost(&self, model_id: &str) -> u64 {
        self.models
            .get(model_id)
            .map(|m| m.cost_per_1k_tokens_micros)
            .unwrap_or(0)
    }

    /// Price table for every configured alias
    pub fn cost_table(&self) -> HashMap<String, u64> {
        self.models
            .iter()
            .map(|(name, m)| (name.clone(), m.cost_per_1k_tokens_micros))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> String {
        r#"
[runtime]
max_concurrency = 3
task_timeout_secs = 60

[memory]
workspace = "/tmp/nexen-test"

[decomposer]
model = "planner"

[logging]
level = "debug"

[providers.openai]
type = "openai"
api_key_env = "NEXEN_TEST_OPENAI_KEY"

[providers.local]
type = "ollama"
default_model = "llama3.2:3b"

[models.planner]
provider = "local"
model = "llama3.2:3b"
cost_per_1k_tokens_micros = 0

[models."openai/gpt-4o"]
provider = "openai"
model = "gpt-4o"
cost_per_1k_tokens_micros = 5000
"#
        .to_string()
    }

    #[test]
    fn test_parse_config() {
        let config = NexenConfig::parse(&create_test_config()).expect("config should parse");

        assert_eq!(config.runtime.max_concurrency, 3);
        assert_eq!(config.runtime.retry_budget, 1);
        assert_eq!(config.memory.workspace, PathBuf::from("/tmp/nexen-test"));
        assert_eq!(config.memory.write_retries, 3);
        assert_eq!(config.logging.level, "debug");
        assert!(config.providers.contains_key("local"));
        assert_eq!(config.model_cost("openai/gpt-4o"), 5000);
        assert_eq!(config.model_cost("unknown"), 0);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = NexenConfig::parse("").unwrap();
        assert_eq!(config.runtime.max_concurrency, 5);
        assert_eq!(config.runtime.task_timeout(), Duration::from_secs(300));
        assert_eq!(config.decomposer.max_subtasks, 5);
        assert_eq!(config.archivist.max_findings, 10);
    }

    #[test]
    fn test_validation_missing_provider() {
        let content = r#"
[models.test]
provider = "nonexistent"
model = "test"
"#;
        let result = NexenConfig::parse(content);
        assert!(matches!(result, Err(ConfigError::MissingProvider(_, _))));
    }

    #[test]
    fn test_validation_unresolvable_decomposer_model() {
        let content = r#"
[decomposer]
model = "anthropic/claude"

[providers.local]
type = "ollama"
"#;
        let result = NexenConfig::parse(content);
        assert!(matches!(result, Err(ConfigError::MissingModel(_, _))));
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let result = NexenConfig::parse("[runtime]\nmax_concurrency = 0\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_unknown_runtime_key_is_rejected() {
        let result = NexenConfig::parse("[runtime]\nmax_concurency = 2\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_can_resolve_model() {
        let config = NexenConfig::parse(&create_test_config()).unwrap();
        assert!(config.can_resolve_model("planner"));
        assert!(config.can_resolve_model("openai/gpt-4o-mini"));
        assert!(config.can_resolve_model("local/qwen2.5"));
        assert!(!config.can_resolve_model("google/gemini-2.0-pro"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = NexenConfig::load("/definitely/not/here/nexen.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nexen.toml");
        std::fs::write(&path, create_test_config()).unwrap();
        let config = NexenConfig::load(&path).unwrap();
        assert_eq!(config.decomposer.model, "planner");
    }
}
