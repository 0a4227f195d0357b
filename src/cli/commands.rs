//! Handlers for the config, research, agents and memory commands.

use super::output::Output;
use crate::agents::{AgentExecutor, Cluster, ProfileRegistry};
use crate::db::InMemoryRepository;
use crate::llm::{LLMClient, ProviderRegistry};
use crate::memory::{MemoryLayer, MemoryStore};
use crate::research::{ExecuteOptions, Orchestrator};
use crate::types::{AppError, ResearchSession, Result, SessionStatus};
use crate::utils::toml_config::{ConfigError, NexenConfig, ProviderConfig};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Load and validate `nexen.toml`
pub fn load_config(path: &Path) -> Result<NexenConfig> {
    NexenConfig::load(path).map_err(|e| match e {
        ConfigError::FileNotFound(p) => AppError::Configuration(format!(
            "{} not found; run `nexen init` to create one",
            p.display()
        )),
        other => AppError::Configuration(other.to_string()),
    })
}

/// `nexen config`
pub fn show_config(path: &Path, full: bool, validate: bool, output: &Output) -> Result<()> {
    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) if validate => {
            output.error(&format!("Configuration is invalid: {}", e));
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    if validate {
        output.success(&format!("{} is valid", path.display()));
        if let Err(e) = config.validate_env() {
            output.warning(&e.to_string());
        }
        return Ok(());
    }

    if full {
        let rendered = toml::to_string_pretty(&config)
            .map_err(|e| AppError::Configuration(format!("cannot render configuration: {}", e)))?;
        println!("{}", rendered);
        return Ok(());
    }

    output.header("Configuration");
    output.kv("file", &path.display().to_string());

    output.subheader("Runtime");
    output.kv("max_concurrency", &config.runtime.max_concurrency.to_string());
    output.kv("task_timeout_secs", &config.runtime.task_timeout_secs.to_string());
    output.kv("retry_budget", &config.runtime.retry_budget.to_string());
    output.kv("cancel_grace_secs", &config.runtime.cancel_grace_secs.to_string());

    output.subheader("Memory");
    output.kv("workspace", &config.memory.workspace.display().to_string());

    output.subheader("Decomposer");
    output.kv("model", &config.decomposer.model);
    output.kv("max_subtasks", &config.decomposer.max_subtasks.to_string());

    output.subheader("Providers");
    let mut providers: Vec<_> = config.providers.iter().collect();
    providers.sort_by(|a, b| a.0.cmp(b.0));
    for (name, provider) in providers {
        let kind = match provider {
            ProviderConfig::Ollama { .. } => "ollama",
            ProviderConfig::OpenAI { .. } => "openai",
        };
        output.list_item(&format!("{} ({})", name, kind));
    }

    output.subheader("Models");
    let mut models: Vec<_> = config.models.iter().collect();
    models.sort_by(|a, b| a.0.cmp(b.0));
    for (id, model) in models {
        output.list_item(&format!("{} -> {}/{}", id, model.provider, model.model));
    }
    Ok(())
}

/// `nexen research`: run one session to the end, printing events as they arrive
pub async fn research(
    config: &NexenConfig,
    task: &str,
    name: &str,
    owner: &str,
    max_agents: usize,
    output: &Output,
) -> Result<ResearchSession> {
    let options = ExecuteOptions::with_max_agents(max_agents)?;
    let llm: Arc<dyn LLMClient> = Arc::new(ProviderRegistry::from_config(config));
    let memory = Arc::new(MemoryStore::from_config(&config.memory));
    let repo = Arc::new(InMemoryRepository::new());
    let orchestrator = Orchestrator::new(config, llm, repo, memory);

    let profiles = ProfileRegistry::with_defaults(owner)?.snapshot(owner);
    let session = orchestrator.create_session(owner, name, task).await?;
    info!(session_id = %session.id, agents = profiles.len(), "starting research");

    output.header(&format!("Research: {}", session.name));
    output.kv("session", &session.id);
    output.kv("workspace", &session.workspace.display().to_string());
    output.newline();

    let mut run = orchestrator.execute(&session.id, profiles, options).await?;
    let cancel = run.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    while let Some(event) = run.next().await {
        output.event(&event);
    }
    interrupt.abort();
    let session = run.join().await?;

    match (&session.status, &session.synthesis) {
        (SessionStatus::Completed, Some(report)) => {
            output.header("Report");
            output.newline();
            output.markdown(report);
            output.complete("Research complete");
        }
        _ => {
            let reason = session.error_message.as_deref().unwrap_or("unknown error");
            if session.was_cancelled() {
                output.warning(&format!("Research cancelled: {}", reason));
            } else {
                output.error(&format!("Research failed: {}", reason));
            }
        }
    }
    output.hint(&format!("Browse memory with: nexen memory ls {}", session.id));
    Ok(session)
}

/// `nexen agents list`
pub fn list_agents(owner: &str, cluster: Option<&str>, output: &Output) -> Result<()> {
    let cluster = cluster.map(str::parse::<Cluster>).transpose()?;
    let registry = ProfileRegistry::with_defaults(owner)?;
    let profiles = registry.list(owner, cluster);

    output.header("Agents");
    output.table_header(&["TYPE", "CLUSTER", "MODEL", "ENABLED"]);
    for profile in &profiles {
        output.table_row(&[
            profile.agent_type.as_str(),
            profile.cluster.as_str(),
            profile.role_model.as_str(),
            if profile.is_enabled { "yes" } else { "no" },
        ]);
    }
    output.newline();
    output.info(&format!("{} agent(s)", profiles.len()));
    Ok(())
}

/// `nexen agents show`
pub fn show_agent(owner: &str, agent_type: &str, output: &Output) -> Result<()> {
    let registry = ProfileRegistry::with_defaults(owner)?;
    let profile = registry
        .get(owner, agent_type)
        .ok_or_else(|| AppError::NotFound(format!("agent '{}'", agent_type)))?;

    output.header(&profile.display_name);
    output.kv("type", &profile.agent_type);
    output.kv("cluster", profile.cluster.as_str());
    output.kv("role_model", &profile.role_model);
    output.kv(
        "fallback_model",
        profile.fallback_model.as_deref().unwrap_or("(none)"),
    );
    output.kv("temperature", &format!("{:.2}", profile.temperature));
    output.kv("max_tokens", &profile.max_tokens.to_string());
    output.kv("token_budget", &profile.pipeline.memory.token_budget.to_string());
    output.kv("enabled", &profile.is_enabled.to_string());

    output.subheader("Traits");
    for (name, level) in &profile.traits {
        output.kv(name, level.as_str());
    }
    output.subheader("Responsibilities");
    for item in &profile.responsibilities {
        output.list_item(item);
    }
    output.subheader("Persona");
    output.markdown(&profile.persona);
    Ok(())
}

/// `nexen agents test`
pub async fn test_agent(
    config: &NexenConfig,
    owner: &str,
    agent_type: &str,
    task: &str,
    output: &Output,
) -> Result<()> {
    let registry = ProfileRegistry::with_defaults(owner)?;
    let profile = registry
        .get(owner, agent_type)
        .ok_or_else(|| AppError::NotFound(format!("agent '{}'", agent_type)))?;

    let llm: Arc<dyn LLMClient> = Arc::new(ProviderRegistry::from_config(config));
    let executor = AgentExecutor::new(llm, Arc::new(MemoryStore::from_config(&config.memory)));
    debug!(agent = agent_type, model = %profile.role_model, "testing agent profile");
    let result = executor.test_profile(&profile, task).await?;

    output.header(&format!("{} on {}", result.agent_type, result.model_used));
    output.newline();
    output.markdown(&result.result);
    output.newline();
    output.kv("tokens", &result.tokens_used.to_string());
    Ok(())
}

/// `nexen memory ls`
pub async fn memory_ls(
    config: &NexenConfig,
    session_id: &str,
    layer: Option<&str>,
    output: &Output,
) -> Result<()> {
    let layers = match layer {
        Some(layer) => vec![layer.parse::<MemoryLayer>()?],
        None => MemoryLayer::ALL.to_vec(),
    };
    let memory = MemoryStore::from_config(&config.memory);
    if !memory.session_dir(session_id).is_dir() {
        return Err(AppError::NotFound(format!("session workspace {}", session_id)));
    }

    output.header(&format!("Memory: {}", session_id));
    for layer in layers {
        let files = memory.list_files(session_id, layer).await?;
        output.subheader(&format!("{} ({})", layer, layer.dir_name()));
        if files.is_empty() {
            output.info("empty");
            continue;
        }
        output.table_header(&["KEY", "AGENT", "BYTES"]);
        for file in &files {
            output.table_row(&[
                file.key.as_str(),
                file.agent.as_deref().unwrap_or("-"),
                file.size.to_string().as_str(),
            ]);
        }
    }
    Ok(())
}

/// `nexen memory cat`
pub async fn memory_cat(config: &NexenConfig, path: &Path) -> Result<()> {
    let memory = MemoryStore::from_config(&config.memory);
    let content = memory.read_path(path).await?;
    print!("{}", content);
    Ok(())
}
