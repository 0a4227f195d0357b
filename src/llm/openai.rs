//! OpenAI-compatible chat completions client.
//!
//! Talks plain JSON to `POST {api_base}/chat/completions`, so it also works
//! against OpenRouter, vLLM, LiteLLM proxies and Azure-style gateways.

use crate::llm::client::{Completion, CompletionRequest, LLMClient};
use crate::types::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub struct OpenAIClient {
    http: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl OpenAIClient {
    pub fn new(api_key: String, api_base: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Configuration(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            http,
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    total_tokens: u64,
}

#[async_trait]
impl LLMClient for OpenAIClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &request.prompt,
        });

        let body = ChatRequest {
            model: &request.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::LLM(format!("OpenAI request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::LLM(format!(
                "OpenAI API returned {}: {}",
                status, text
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::LLM(format!("Malformed OpenAI response: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::LLM("OpenAI response contained no content".to_string()))?;

        let mut completion = Completion::estimated(request, content);
        if let Some(usage) = parsed.usage {
            completion.tokens_used = usage.total_tokens;
        }
        if let Some(model) = parsed.model {
            completion.model = model;
        }
        Ok(completion)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_complete_parses_content_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "model": "gpt-4o-2024-08-06",
                "choices": [{"message": {"role": "assistant", "content": "hello"}}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
            })))
            .mount(&server)
            .await;

        let client = OpenAIClient::new("sk-test".into(), format!("{}/v1/", server.uri())).unwrap();
        let completion = client
            .complete(&CompletionRequest::new("gpt-4o", "hi").with_system("sys"))
            .await
            .unwrap();

        assert_eq!(completion.content, "hello");
        assert_eq!(completion.tokens_used, 7);
        assert_eq!(completion.model, "gpt-4o-2024-08-06");
    }

    #[tokio::test]
    async fn test_error_status_becomes_llm_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let client = OpenAIClient::new("sk-test".into(), server.uri()).unwrap();
        let err = client
            .complete(&CompletionRequest::new("gpt-4o", "hi"))
            .await
            .unwrap_err();

        match err {
            AppError::LLM(msg) => {
                assert!(msg.contains("429"));
                assert!(msg.contains("rate limited"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_content_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let client = OpenAIClient::new("k".into(), server.uri()).unwrap();
        assert!(client
            .complete(&CompletionRequest::new("gpt-4o", "hi"))
            .await
            .is_err());
    }
}
