//! Provider routing tests against a mock OpenAI-compatible server

#![cfg(feature = "openai")]

mod common;

use common::mocks::{AGENT_ANSWER, REPORT, SYNTHESIS_MARKER, DECOMPOSER_MARKER};
use nexen::agents::ProfileRegistry;
use nexen::db::InMemoryRepository;
use nexen::llm::{CompletionRequest, LLMClient, ProviderRegistry};
use nexen::memory::MemoryStore;
use nexen::research::{ExecuteOptions, Orchestrator};
use nexen::types::{AppError, SessionStatus};
use nexen::utils::toml_config::NexenConfig;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn chat_response(content: &str, tokens: u64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "model": "gpt-4o-mini",
        "choices": [{"message": {"role": "assistant", "content": content}}],
        "usage": {"prompt_tokens": tokens / 2, "completion_tokens": tokens / 2, "total_tokens": tokens}
    }))
}

/// Config routing `openai/*` and the `fast` alias to the mock server
fn config_for(server: &MockServer, key_env: &str) -> NexenConfig {
    std::env::set_var(key_env, "sk-test");
    let text = format!(
        r#"
[providers.openai]
type = "openai"
api_key_env = "{key_env}"
api_base = "{base}/v1"
default_model = "gpt-4o"

[models."openai/gpt-4o"]
provider = "openai"
model = "gpt-4o-mini"
cost_per_1k_tokens_micros = 2000

[models.fast]
provider = "openai"
model = "gpt-3.5-turbo"
temperature = 0.0
max_tokens = 64
"#,
        key_env = key_env,
        base = server.uri(),
    );
    NexenConfig::parse(&text).expect("config parses")
}

#[tokio::test]
async fn test_alias_renames_model_and_overrides_sampling() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-3.5-turbo",
            "temperature": 0.0,
            "max_tokens": 64
        })))
        .respond_with(chat_response("routed", 42))
        .expect(1)
        .mount(&server)
        .await;

    let registry = ProviderRegistry::from_config(&config_for(&server, "NEXEN_IT_KEY_ALIAS"));
    let request = CompletionRequest::new("fast", "ping")
        .with_temperature(0.9)
        .with_max_tokens(2000);
    let completion = registry.complete(&request).await.unwrap();

    assert_eq!(completion.content, "routed");
    assert_eq!(completion.tokens_used, 42);
    // Accounting uses the id the caller asked for
    assert_eq!(completion.model, "fast");
}

#[tokio::test]
async fn test_provider_prefix_routes_to_provider_default() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "gpt-4o"})))
        .respond_with(chat_response("from default", 10))
        .expect(1)
        .mount(&server)
        .await;

    let registry = ProviderRegistry::from_config(&config_for(&server, "NEXEN_IT_KEY_DEFAULT"));
    let completion = registry
        .complete(&CompletionRequest::new("openai", "ping"))
        .await
        .unwrap();
    assert_eq!(completion.content, "from default");
    assert_eq!(completion.model, "openai");
}

#[tokio::test]
async fn test_server_error_becomes_llm_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;

    let registry = ProviderRegistry::from_config(&config_for(&server, "NEXEN_IT_KEY_500"));
    let err = registry
        .complete(&CompletionRequest::new("openai/gpt-4o", "ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::LLM(_)));
    assert!(err.to_string().contains("upstream exploded"));
}

#[tokio::test]
async fn test_unknown_provider_is_rejected_without_a_request() {
    let server = MockServer::start().await;
    let registry = ProviderRegistry::from_config(&config_for(&server, "NEXEN_IT_KEY_UNKNOWN"));

    let err = registry
        .complete(&CompletionRequest::new("anthropic/claude", "ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::LLM(_)));
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[tokio::test]
async fn test_research_session_over_http_provider() {
    let server = MockServer::start().await;
    let plan = json!({"subtasks": [
        {"id": "1", "description": "Survey the literature", "assigned_agent": "explorer"},
        {"id": "2", "description": "Critique the evidence", "assigned_agent": "critic", "depends_on": ["1"]}
    ]})
    .to_string();

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains(DECOMPOSER_MARKER))
        .respond_with(chat_response(&plan, 100))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_string_contains(SYNTHESIS_MARKER))
        .respond_with(chat_response(REPORT, 100))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(chat_response(AGENT_ANSWER, 100))
        .with_priority(10)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = config_for(&server, "NEXEN_IT_KEY_SESSION");
    config.memory.workspace = dir.path().to_path_buf();

    let llm: Arc<dyn LLMClient> = Arc::new(ProviderRegistry::from_config(&config));
    let memory = Arc::new(MemoryStore::from_config(&config.memory));
    let orchestrator = Orchestrator::new(&config, llm, Arc::new(InMemoryRepository::new()), memory);

    let session = orchestrator
        .create_session("local", "SSM survey", "Compare Transformers and state-space models")
        .await
        .unwrap();
    let profiles = ProfileRegistry::with_defaults("local").unwrap().snapshot("local");
    let (session, _events) = orchestrator
        .run_to_completion(&session.id, profiles, ExecuteOptions::default())
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.synthesis.as_deref(), Some(REPORT));

    // Every call is priced through the `openai/gpt-4o` alias
    let calls = server.received_requests().await.unwrap().len() as u64;
    assert_eq!(calls, 4);
    assert_eq!(session.tokens_used, calls * 100);
    assert_eq!(session.cost_micros, calls * 200);
}
