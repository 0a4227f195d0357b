//! LLM Client abstractions and provider management
//!
//! Every model call in the pipeline goes through one capability:
//! [`LLMClient::complete`]. The request names the model, so a single client
//! (usually the [`ProviderRegistry`](super::ProviderRegistry)) can serve the
//! primary model, the fallback model and the prompt-refinement models of every
//! agent.

use crate::memory::estimate_tokens;
use crate::types::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// A single completion request
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Model identifier, e.g. `openai/gpt-4o` or a `[models]` alias
    pub model: String,
    /// Optional system prompt
    pub system: Option<String>,
    /// User prompt
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            prompt: prompt.into(),
            temperature: 0.7,
            max_tokens: 4000,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Rough prompt size, used when a provider does not report usage
    pub fn estimated_prompt_tokens(&self) -> u64 {
        let system = self.system.as_deref().map(estimate_tokens).unwrap_or(0);
        (system + estimate_tokens(&self.prompt)) as u64
    }
}

/// The text a model produced plus accounting
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    /// Model that actually answered
    pub model: String,
    /// Total tokens (prompt + completion), reported or estimated
    pub tokens_used: u64,
}

impl Completion {
    /// Build a completion whose usage is estimated from text lengths
    pub fn estimated(request: &CompletionRequest, content: String) -> Self {
        let tokens_used = request.estimated_prompt_tokens() + estimate_tokens(&content) as u64;
        Self {
            content,
            model: request.model.clone(),
            tokens_used,
        }
    }
}

/// Generic LLM client trait for provider abstraction
///
/// All LLM providers implement this trait, allowing for easy swapping
/// between providers without changing application code.
#[async_trait]
pub trait LLMClient: Send + Sync {
    /// Run one completion
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Human-readable client name for logs
    fn name(&self) -> &str;
}

/// Provider enum for runtime selection
///
/// | Provider | Feature | Transport |
/// |----------|---------|-----------|
/// | OpenAI (and compatible) | `openai` | `POST {api_base}/chat/completions` |
/// | Ollama | `ollama` | ollama-rs chat API |
#[derive(Debug, Clone)]
pub enum Provider {
    /// OpenAI API provider (including OpenRouter and other compatible APIs)
    OpenAI { api_key: String, api_base: String },

    /// Ollama local LLM provider
    Ollama { base_url: String },
}

impl Provider {
    /// Create a client instance for this provider
    ///
    /// # Errors
    ///
    /// Returns an error if the provider's feature is not compiled in or its
    /// configuration is unusable.
    pub fn create_client(&self) -> Result<Arc<dyn LLMClient>> {
        match self {
            #[cfg(feature = "openai")]
            Provider::OpenAI { api_key, api_base } => Ok(Arc::new(
                super::openai::OpenAIClient::new(api_key.clone(), api_base.clone())?,
            )),
            #[cfg(not(feature = "openai"))]
            Provider::OpenAI { .. } => Err(crate::types::AppError::Configuration(
                "OpenAI provider requires the 'openai' feature".to_string(),
            )),

            #[cfg(feature = "ollama")]
            Provider::Ollama { base_url } => Ok(Arc::new(super::ollama::OllamaClient::new(
                base_url,
            )?)),
            #[cfg(not(feature = "ollama"))]
            Provider::Ollama { .. } => Err(crate::types::AppError::Configuration(
                "Ollama provider requires the 'ollama' feature".to_string(),
            )),
        }
    }

    /// Get a human-readable name for this provider
    pub fn name(&self) -> &'static str {
        match self {
            Provider::OpenAI { .. } => "OpenAI",
            Provider::Ollama { .. } => "Ollama",
        }
    }
}

/// Strip markdown code fences a model may wrap structured answers in
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Locate a JSON object in a model answer: the body of the first fenced
/// block if there is one, otherwise the span from the first `{` to the last `}`.
pub fn extract_json_object(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```") {
        let fenced = strip_code_fence(&text[start..]);
        let fenced = match fenced.find("```") {
            Some(end) => fenced[..end].trim(),
            None => fenced,
        };
        if fenced.starts_with('{') {
            return Some(fenced);
        }
    }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
