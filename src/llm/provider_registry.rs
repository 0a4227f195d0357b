//! Provider Registry for routing model ids to LLM providers
//!
//! Agent profiles name models the way the research UI does
//! (`openai/gpt-4o`, `google/gemini-2.0-pro`). The registry resolves such an
//! id in order:
//!
//! 1. a `[models."<id>"]` alias from `nexen.toml`
//! 2. `provider/model` syntax, where `provider` is a `[providers.<name>]` entry
//! 3. a bare provider name, using that provider's `default_model`
//!
//! The registry is itself an [`LLMClient`], so the orchestrator and executors
//! only ever hold one client.

use crate::llm::client::{Completion, CompletionRequest, LLMClient, Provider};
use crate::types::{AppError, Result};
use crate::utils::toml_config::{ModelConfig, NexenConfig, ProviderConfig};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Where a model id ends up
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedModel {
    pub provider: String,
    /// Model name as the provider knows it
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// Registry for managing multiple named LLM providers
#[derive(Default)]
pub struct ProviderRegistry {
    /// Provider configurations keyed by name
    providers: HashMap<String, ProviderConfig>,
    /// Model aliases keyed by id
    models: HashMap<String, ModelConfig>,
    /// Lazily created (or injected) clients keyed by provider name
    clients: RwLock<HashMap<String, Arc<dyn LLMClient>>>,
}

impl ProviderRegistry {
    /// Create a new empty provider registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider registry from TOML configuration
    pub fn from_config(config: &NexenConfig) -> Self {
        Self {
            providers: config.providers.clone(),
            models: config.models.clone(),
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Register a provider configuration
    pub fn register_provider(&mut self, name: &str, config: ProviderConfig) {
        self.providers.insert(name.to_string(), config);
    }

    /// Register a model alias
    pub fn register_model(&mut self, name: &str, config: ModelConfig) {
        self.models.insert(name.to_string(), config);
    }

    /// Serve a provider name with an existing client
    pub fn register_client(&self, provider: &str, client: Arc<dyn LLMClient>) {
        self.clients.write().insert(provider.to_string(), client);
    }

    /// Get all provider names, sorted
    pub fn provider_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    fn has_provider(&self, name: &str) -> bool {
        self.providers.contains_key(name) || self.clients.read().contains_key(name)
    }

    fn provider_default_model(&self, name: &str) -> Option<String> {
        match self.providers.get(name)? {
            ProviderConfig::Ollama { default_model, .. }
            | ProviderConfig::OpenAI { default_model, .. } => default_model.clone(),
        }
    }

    /// Resolve a model id to a provider and provider-local model name
    pub fn resolve(&self, model_id: &str) -> Result<ResolvedModel> {
        if let Some(alias) = self.models.get(model_id) {
            return Ok(ResolvedModel {
                provider: alias.provider.clone(),
                model: alias.model.clone(),
                temperature: alias.temperature,
                max_tokens: alias.max_tokens,
            });
        }

        if let Some((provider, model)) = model_id.split_once('/') {
            if self.has_provider(provider) && !model.is_empty() {
                return Ok(ResolvedModel {
                    provider: provider.to_string(),
                    model: model.to_string(),
                    temperature: None,
                    max_tokens: None,
                });
            }
        } else if self.has_provider(model_id) {
            let model = self.provider_default_model(model_id).ok_or_else(|| {
                AppError::Configuration(format!(
                    "Provider '{}' has no default_model",
                    model_id
                ))
            })?;
            return Ok(ResolvedModel {
                provider: model_id.to_string(),
                model,
                temperature: None,
                max_tokens: None,
            });
        }

        Err(AppError::LLM(format!(
            "No provider configured for model '{}'",
            model_id
        )))
    }

    fn client_for(&self, provider_name: &str) -> Result<Arc<dyn LLMClient>> {
        if let Some(client) = self.clients.read().get(provider_name) {
            return Ok(Arc::clone(client));
        }

        let config = self.providers.get(provider_name).ok_or_else(|| {
            AppError::Configuration(format!(
                "Provider '{}' not found in configuration",
                provider_name
            ))
        })?;

        let provider = match config {
            ProviderConfig::Ollama { base_url, .. } => Provider::Ollama {
                base_url: base_url.clone(),
            },
            ProviderConfig::OpenAI {
                api_key_env,
                api_base,
                ..
            } => {
                let api_key = std::env::var(api_key_env).map_err(|_| {
                    AppError::Configuration(format!(
                        "Environment variable '{}' for provider '{}' is not set",
                        api_key_env, provider_name
                    ))
                })?;
                Provider::OpenAI {
                    api_key,
                    api_base: api_base.clone(),
                }
            }
        };

        let client = provider.create_client()?;
        debug!(provider = provider_name, kind = provider.name(), "created LLM client");
        self.clients
            .write()
            .entry(provider_name.to_string())
            .or_insert_with(|| Arc::clone(&client));
        Ok(client)
    }
}

#[async_trait]
impl LLMClient for ProviderRegistry {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let resolved = self.resolve(&request.model)?;
        let client = self.client_for(&resolved.provider)?;

        let mut routed = request.clone();
        routed.model = resolved.model;
        if let Some(temperature) = resolved.temperature {
            routed.temperature = temperature;
        }
        if let Some(cap) = resolved.max_tokens {
            routed.max_tokens = routed.max_tokens.min(cap);
        }

        let mut completion = client.complete(&routed).await?;
        // Accounting is keyed by the id the caller used
        completion.model = request.model.clone();
        Ok(completion)
    }

    fn name(&self) -> &str {
        "provider-registry"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoClient;

    #[async_trait]
    impl LLMClient for EchoClient {
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
            Ok(Completion::estimated(
                request,
                format!("{}|{}|{}", request.model, request.temperature, request.max_tokens),
            ))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn registry() -> ProviderRegistry {
        let config = NexenConfig::parse(
            r#"
[providers.local]
type = "ollama"
default_model = "llama3.2:3b"

[models."openai/gpt-4o"]
provider = "local"
model = "qwen2.5:14b"
temperature = 0.2
max_tokens = 1000
"#,
        )
        .unwrap();
        let registry = ProviderRegistry::from_config(&config);
        registry.register_client("local", Arc::new(EchoClient));
        registry
    }

    #[test]
    fn test_resolve_alias_then_prefix_then_default() {
        let registry = registry();

        let alias = registry.resolve("openai/gpt-4o").unwrap();
        assert_eq!(alias.provider, "local");
        assert_eq!(alias.model, "qwen2.5:14b");

        let prefixed = registry.resolve("local/mistral").unwrap();
        assert_eq!(prefixed.model, "mistral");

        let bare = registry.resolve("local").unwrap();
        assert_eq!(bare.model, "llama3.2:3b");

        assert!(registry.resolve("google/gemini-2.0-pro").is_err());
    }

    #[tokio::test]
    async fn test_complete_routes_and_applies_alias_overrides() {
        let registry = registry();
        let completion = registry
            .complete(
                &CompletionRequest::new("openai/gpt-4o", "hi")
                    .with_temperature(0.9)
                    .with_max_tokens(4000),
            )
            .await
            .unwrap();

        assert_eq!(completion.content, "qwen2.5:14b|0.2|1000");
        assert_eq!(completion.model, "openai/gpt-4o");
    }

    #[tokio::test]
    async fn test_unknown_provider_is_llm_error() {
        let registry = registry();
        let err = registry
            .complete(&CompletionRequest::new("anthropic/claude", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::LLM(_)));
    }

    #[test]
    fn test_missing_api_key_env_is_configuration_error() {
        let mut registry = ProviderRegistry::new();
        registry.register_provider(
            "openai",
            ProviderConfig::OpenAI {
                api_key_env: "NEXEN_TEST_KEY_THAT_IS_NEVER_SET".into(),
                api_base: "https://api.openai.com/v1".into(),
                default_model: None,
            },
        );
        let err = registry.client_for("openai").err().unwrap();
        assert!(matches!(err, AppError::Configuration(_)));
    }
}
