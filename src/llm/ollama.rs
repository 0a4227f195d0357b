use crate::llm::client::{Completion, CompletionRequest, LLMClient};
use crate::types::{AppError, Result};
use async_trait::async_trait;
use ollama_rs::{
    generation::chat::{request::ChatMessageRequest, ChatMessage},
    Ollama,
};

pub struct OllamaClient {
    client: Ollama,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let (host, port) = split_host_port(base_url)?;
        let client = Ollama::new(host, port);

        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Split `http://host:port` into the `(scheme://host, port)` pair ollama-rs expects.
fn split_host_port(base_url: &str) -> Result<(String, u16)> {
    let (scheme, rest) = base_url
        .split_once("://")
        .unwrap_or(("http", base_url));
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(AppError::Configuration(format!(
            "invalid Ollama base_url '{}'",
            base_url
        )));
    }

    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                AppError::Configuration(format!("invalid port in Ollama base_url '{}'", base_url))
            })?;
            Ok((format!("{}://{}", scheme, host), port))
        }
        None => Ok((format!("{}://{}", scheme, rest), 11434)),
    }
}

#[async_trait]
impl LLMClient for OllamaClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.push(ChatMessage::user(request.prompt.clone()));

        let chat = ChatMessageRequest::new(request.model.clone(), messages);

        let response = self
            .client
            .send_chat_messages(chat)
            .await
            .map_err(|e| AppError::LLM(format!("Ollama error: {}", e)))?;

        Ok(Completion::estimated(request, response.message.content))
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
