//! # Nexen - multi-agent research orchestration
//!
//! Nexen takes a free-text research question, breaks it into a dependency
//! graph of subtasks, runs specialist agents over that graph with bounded
//! parallelism, files every output in a tiered memory workspace and ends
//! with a synthesized report.
//!
//! ## Overview
//!
//! Nexen can be used in two ways:
//!
//! 1. **As a command-line tool** - Run the `nexen` binary
//! 2. **As a library** - Embed the [`Orchestrator`] in your own Rust project
//!
//! ## Quick Start (Library Usage)
//!
//! ```rust,ignore
//! use nexen::{
//!     ExecuteOptions, InMemoryRepository, MemoryStore, NexenConfig, Orchestrator,
//!     ProfileRegistry, ProviderRegistry,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NexenConfig::load("nexen.toml")?;
//!     let llm = Arc::new(ProviderRegistry::from_config(&config));
//!     let memory = Arc::new(MemoryStore::from_config(&config.memory));
//!     let repo = Arc::new(InMemoryRepository::new());
//!     let orchestrator = Orchestrator::new(&config, llm, repo, memory);
//!
//!     let profiles = ProfileRegistry::with_defaults("local")?.snapshot("local");
//!     let session = orchestrator
//!         .create_session("local", "", "How do state-space models compare to Transformers?")
//!         .await?;
//!     let (session, events) = orchestrator
//!         .run_to_completion(&session.id, profiles, ExecuteOptions::default())
//!         .await?;
//!
//!     println!("{} events", events.len());
//!     println!("{}", session.synthesis.unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `ollama` | Ollama local inference (default) |
//! | `openai` | OpenAI API and compatible endpoints (default) |
//!
//! ## Modules
//!
//! - [`agents`] - Agent profiles, registry and the generic executor
//! - [`db`] - Session, task and execution persistence
//! - [`llm`] - LLM client trait and providers
//! - [`memory`] - Tiered L0/L1/L2 memory and budgeted retrieval
//! - [`research`] - Decomposer, orchestrator, archivist and events
//! - [`types`] - Domain records and error handling
//! - [`utils`] - Configuration and text helpers

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

/// Agent profiles and execution.
pub mod agents;
/// Command-line interface for the `nexen` binary.
pub mod cli;
/// Research state persistence.
pub mod db;
/// LLM provider clients and abstractions.
pub mod llm;
/// Tiered research memory.
pub mod memory;
/// Multi-agent research orchestration.
pub mod research;
/// Core types (sessions, tasks, executions, errors).
pub mod types;
/// Configuration and text utilities.
pub mod utils;

// Re-export commonly used types
pub use agents::{AgentExecutor, AgentProfile, ProfileRegistry, ProfileSet};
pub use db::{InMemoryRepository, ResearchRepository};
pub use llm::{Completion, CompletionRequest, LLMClient, Provider, ProviderRegistry};
pub use memory::{MemoryLayer, MemoryStore};
pub use research::{EventKind, ExecuteOptions, Orchestrator, ResearchEvent, ResearchRun};
pub use types::{AppError, Result};
pub use utils::toml_config::{ConfigError, NexenConfig};
