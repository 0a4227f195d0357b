//! LLM Provider Clients and Abstractions
//!
//! This module provides a unified interface for interacting with Large Language
//! Model (LLM) providers. Every model call in the research pipeline (task
//! decomposition, prompt refinement, agent execution, synthesis) goes through
//! one capability, [`LLMClient::complete`], which is injected into the
//! components that need it. Tests substitute a deterministic fake.
//!
//! # Architecture
//!
//! - [`LLMClient`] - The core trait that all providers implement
//! - [`Provider`] - Runtime provider selection and client construction
//! - [`ProviderRegistry`] - Routes `provider/model` ids and `[models]` aliases
//!
//! # Supported Providers
//!
//! Enable providers via Cargo features:
//! - `openai` - OpenAI API and compatible endpoints
//! - `ollama` - Local Ollama server
//!
//! # Example
//!
//! ```ignore
//! use nexen::llm::{CompletionRequest, LLMClient, ProviderRegistry};
//!
//! let registry = ProviderRegistry::from_config(&config);
//! let completion = registry
//!     .complete(&CompletionRequest::new("openai/gpt-4o", "What is 2+2?"))
//!     .await?;
//! println!("{}", completion.content);
//! ```

/// Core LLM client trait and request/response types.
pub mod client;
/// Registry for routing model ids to providers.
pub mod provider_registry;

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(feature = "openai")]
pub mod openai;

pub use client::{extract_json_object, strip_code_fence, Completion, CompletionRequest, LLMClient, Provider};
pub use provider_registry::{ProviderRegistry, ResolvedModel};
